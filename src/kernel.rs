//! The attention kernel and its process-wide compiled handle.
//!
//! Building the kernel is the expensive part (a dedicated rayon thread pool),
//! so it happens exactly once per [`FlexContext`] behind a `OnceLock`, on the
//! first dispatch. The default process-wide context lives behind a `LazyLock`
//! and is shared by every caller of
//! [`flex_attention_forward`](crate::flex_attention_forward); tests that need
//! isolation construct their own context.

use std::sync::{Arc, LazyLock, OnceLock};

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::attention::GqaPolicy;
use crate::mask::{BlockMask, TileStatus};

const DOT_CHUNK: usize = 4;

#[inline]
fn vec_dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0f32;
    let chunks = a.len() / DOT_CHUNK;
    for i in 0..chunks {
        let i_chunk = i * DOT_CHUNK;
        sum += a[i_chunk] * b[i_chunk]
            + a[i_chunk + 1] * b[i_chunk + 1]
            + a[i_chunk + 2] * b[i_chunk + 2]
            + a[i_chunk + 3] * b[i_chunk + 3];
    }
    for i in (chunks * DOT_CHUNK)..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Additive bias read from a dense 4d mask tensor. Only head slot 0 is ever
/// indexed; the bias broadcasts over heads.
pub(crate) struct DenseBias<'a> {
    pub data: &'a [f32],
    /// Elements per batch row of the source tensor, `heads * q_len * kv_len`.
    pub batch_stride: usize,
    pub kv_len: usize,
}

/// Per-head additive bias, `(batch, heads, 1, 1)` with `heads` either the
/// query head count or 1.
pub(crate) struct HeadBias<'a> {
    pub data: &'a [f32],
    pub heads: usize,
}

/// Score post-processing applied to every `(batch, head, q, kv)` logit before
/// the softmax, in value form rather than as a capturing closure.
pub(crate) struct ScoreMod<'a> {
    pub softcap: Option<f32>,
    pub bias: Option<DenseBias<'a>>,
    pub head_bias: Option<HeadBias<'a>>,
}

impl ScoreMod<'_> {
    #[inline]
    pub(crate) fn apply(&self, score: f32, b: usize, h: usize, q: usize, k: usize) -> f32 {
        let mut score = score;
        if let Some(cap) = self.softcap {
            score = cap * (score / cap).tanh();
        }
        if let Some(bias) = &self.bias {
            score += bias.data[b * bias.batch_stride + q * bias.kv_len + k];
        }
        if let Some(head_bias) = &self.head_bias {
            let h = if head_bias.heads == 1 { 0 } else { h };
            score += head_bias.data[b * head_bias.heads + h];
        }
        score
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelDims {
    pub batch: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub q_len: usize,
    pub kv_len: usize,
    pub head_dim: usize,
}

/// The compiled attention primitive: an online-softmax kernel bound to its
/// own rayon pool. Construction is the one-off cost; `run` borrows `&self`
/// and is safe to invoke concurrently on distinct inputs.
pub struct CompiledFlexAttention {
    pool: ThreadPool,
}

impl CompiledFlexAttention {
    fn compile() -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .build()
            .expect("failed to build the flex-attention thread pool");
        Self { pool }
    }

    /// Batched attention over contiguous f32 buffers.
    ///
    /// Layouts: `q` is `(batch, q_heads, q_len, head_dim)`, `k`/`v` are
    /// `(batch, kv_heads, kv_len, head_dim)` with `q_heads` an integer
    /// multiple of `kv_heads`; query heads fold onto kv heads in groups.
    ///
    /// Returns the attention output `(batch, q_heads, q_len, head_dim)` and
    /// the per-row log-sum-exp `(batch, q_heads, q_len)`, both row-major. The
    /// log-sum-exp is always computed: the online softmax produces it for
    /// free. Rows whose every position is masked out come back as zeros with
    /// a log-sum-exp of `-inf`.
    pub(crate) fn run(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        dims: &KernelDims,
        score_mod: &ScoreMod,
        block_mask: Option<&BlockMask>,
        scale: Option<f32>,
    ) -> (Vec<f32>, Vec<f32>) {
        let KernelDims {
            batch,
            q_heads,
            kv_heads,
            q_len,
            kv_len,
            head_dim,
        } = *dims;
        let group = q_heads / kv_heads;
        let scale = scale.unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());

        let rows = batch * q_heads * q_len;
        let mut out = vec![0f32; rows * head_dim];
        let mut lse = vec![f32::NEG_INFINITY; rows];

        self.pool.install(|| {
            out.par_chunks_mut(head_dim)
                .zip(lse.par_iter_mut())
                .enumerate()
                .for_each(|(row_idx, (out_row, lse_slot))| {
                    let rows_per_batch = q_heads * q_len;
                    let b_i = row_idx / rows_per_batch;
                    let rem = row_idx % rows_per_batch;
                    let h_i = rem / q_len;
                    let q_pos = rem % q_len;
                    let kv_head = h_i / group;

                    let q_base = ((b_i * q_heads + h_i) * q_len + q_pos) * head_dim;
                    let q_row = &q[q_base..q_base + head_dim];

                    let mut acc = vec![0f32; head_dim];
                    let mut s = 0f32;
                    let mut m = f32::NEG_INFINITY;

                    let mut score_one = |kv_pos: usize| {
                        let k_base =
                            ((b_i * kv_heads + kv_head) * kv_len + kv_pos) * head_dim;
                        let k_row = &k[k_base..k_base + head_dim];
                        let mut val = vec_dot(q_row, k_row) * scale;
                        val = score_mod.apply(val, b_i, h_i, q_pos, kv_pos);
                        if val == f32::NEG_INFINITY {
                            return;
                        }

                        // Online softmax: rescale the accumulator whenever a
                        // new running maximum shows up.
                        let m_old = m;
                        let mut ms = 1f32;
                        let mut vs = 1f32;
                        if val > m {
                            m = val;
                            ms = (m_old - m).exp();
                            for a in acc.iter_mut() {
                                *a *= ms;
                            }
                        } else {
                            vs = (val - m).exp();
                        }

                        let v_base =
                            ((b_i * kv_heads + kv_head) * kv_len + kv_pos) * head_dim;
                        for (a, v_val) in acc.iter_mut().zip(&v[v_base..v_base + head_dim]) {
                            *a += v_val * vs;
                        }
                        s = s * ms + vs;
                    };

                    match block_mask {
                        Some(mask) => {
                            let tile_side = mask.block_size();
                            let q_tile = q_pos / tile_side;
                            for kt in 0..mask.k_tiles() {
                                let status = mask.tile(b_i, q_tile, kt);
                                if status == TileStatus::Empty {
                                    continue;
                                }
                                let k_start = kt * tile_side;
                                let k_end = ((kt + 1) * tile_side).min(kv_len);
                                for kv_pos in k_start..k_end {
                                    if status == TileStatus::Partial
                                        && !mask.is_allowed(b_i, q_pos, kv_pos)
                                    {
                                        continue;
                                    }
                                    score_one(kv_pos);
                                }
                            }
                        }
                        None => {
                            for kv_pos in 0..kv_len {
                                score_one(kv_pos);
                            }
                        }
                    }

                    if s > 0f32 {
                        let inv_s = 1.0 / s;
                        for (o, a) in out_row.iter_mut().zip(acc.iter()) {
                            *o = a * inv_s;
                        }
                        *lse_slot = m + s.ln();
                    }
                });
        });

        (out, lse)
    }
}

/// Owner of one lazily-compiled attention kernel plus the grouped-query
/// dispatch policy.
///
/// The kernel is built on first use and then reused for the lifetime of the
/// context; there is no invalidation, a context with a different pool
/// configuration has to be a new context. Construction is race-safe: when
/// several threads hit the first dispatch at once, exactly one kernel is
/// built and all of them observe it.
pub struct FlexContext {
    compiled: OnceLock<Arc<CompiledFlexAttention>>,
    gqa_policy: GqaPolicy,
}

impl FlexContext {
    pub fn new() -> Self {
        Self::with_gqa_policy(GqaPolicy::default())
    }

    pub fn with_gqa_policy(gqa_policy: GqaPolicy) -> Self {
        Self {
            compiled: OnceLock::new(),
            gqa_policy,
        }
    }

    /// The compiled kernel handle, building it on first call. Repeated calls
    /// return the same instance.
    pub fn compiled(&self) -> Arc<CompiledFlexAttention> {
        self.compiled
            .get_or_init(|| Arc::new(CompiledFlexAttention::compile()))
            .clone()
    }

    pub fn gqa_policy(&self) -> GqaPolicy {
        self.gqa_policy
    }
}

impl Default for FlexContext {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_CONTEXT: LazyLock<FlexContext> = LazyLock::new(FlexContext::new);

/// The process-wide [`FlexContext`] used by the free-function entry point.
pub fn global_context() -> &'static FlexContext {
    &GLOBAL_CONTEXT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_handle_is_identity_stable() {
        let ctx = FlexContext::new();
        let a = ctx.compiled();
        let b = ctx.compiled();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn global_context_is_stable() {
        let a = global_context().compiled();
        let b = global_context().compiled();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn fresh_contexts_own_fresh_kernels() {
        let a = FlexContext::new().compiled();
        let b = FlexContext::new().compiled();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn softcap_bounds_and_order() {
        let score_mod = ScoreMod {
            softcap: Some(30.0),
            bias: None,
            head_bias: None,
        };
        let mut prev = f32::NEG_INFINITY;
        for raw in [-240f32, -100.0, -1.0, 0.0, 1.0, 100.0, 240.0] {
            let capped = score_mod.apply(raw, 0, 0, 0, 0);
            assert!(capped > -30.0 && capped < 30.0, "{raw} -> {capped}");
            assert!(capped >= prev, "not monotonic at {raw}");
            prev = capped;
        }
        // f32 tanh saturates for very large arguments; the cap still holds.
        for raw in [-1e9f32, 1e9] {
            let capped = score_mod.apply(raw, 0, 0, 0, 0);
            assert!((-30.0..=30.0).contains(&capped), "{raw} -> {capped}");
        }
    }

    #[test]
    fn head_bias_broadcasts_over_positions() {
        let data = [0.5f32, -0.5];
        let score_mod = ScoreMod {
            softcap: None,
            bias: None,
            head_bias: Some(HeadBias {
                data: &data,
                heads: 2,
            }),
        };
        assert_eq!(score_mod.apply(1.0, 0, 0, 3, 1), 1.5);
        assert_eq!(score_mod.apply(1.0, 0, 1, 0, 7), 0.5);
    }
}
