//! The attention dispatcher: argument normalization, score post-processing
//! assembly, grouped-query head handling, and the single call into the
//! compiled kernel.

use candle::{DType, Tensor};

use crate::error::{Error, Result};
use crate::kernel::{global_context, DenseBias, FlexContext, HeadBias, KernelDims, ScoreMod};
use crate::mask::BlockMask;

/// Attention mask argument of [`flex_attention_forward`].
///
/// `Block` is the sparse predicate path: the compressed mask selects which
/// positions are scored at all. `Dense` is an additive bias: a 4d real tensor
/// whose values are added to the logits before the softmax (`-inf` excludes a
/// position); only head slot 0 is read, the bias broadcasts over heads.
pub enum AttentionMask<'a> {
    Block(&'a BlockMask),
    Dense(&'a Tensor),
}

/// When to rely on the kernel's native grouped-query head folding instead of
/// materializing replicated key/value heads.
///
/// The power-of-two threshold mirrors the shape constraints of the optimized
/// grouped-query path this crate was deployed against (irregular head counts
/// show up under tensor-parallel splits); it is a dispatch policy, not a
/// universal rule. `AlwaysMaterialize` is the correctness fallback for
/// targets without a native grouped-query primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GqaPolicy {
    #[default]
    NativeForPowerOfTwo,
    AlwaysMaterialize,
}

impl GqaPolicy {
    pub fn use_native(&self, query_heads: usize) -> bool {
        match self {
            Self::NativeForPowerOfTwo => query_heads.is_power_of_two(),
            Self::AlwaysMaterialize => false,
        }
    }
}

/// Repeat key/value heads to match the query head count (GQA/MQA).
///
/// Interleaved expand-then-merge, equivalent to `repeat_interleave` over the
/// head dimension: head order goes `[h0, h0, h1, h1]`, not `[h0, h1, h0, h1]`
/// as a plain tile would produce. Input shape `(batch, kv_heads, seq_len,
/// head_dim)`.
pub fn repeat_kv(hidden_states: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(hidden_states.clone());
    }
    let (batch, kv_heads, seq_len, head_dim) = hidden_states.dims4()?;
    let expanded = hidden_states
        .unsqueeze(2)?
        .broadcast_as((batch, kv_heads, n_rep, seq_len, head_dim))?;
    Ok(expanded.reshape((batch, kv_heads * n_rep, seq_len, head_dim))?)
}

fn to_f32_vec(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.to_dtype(DType::F32)?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<f32>()?)
}

impl FlexContext {
    /// See [`flex_attention_forward`]; this variant runs against this
    /// context's kernel and grouped-query policy.
    pub fn attention_forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: AttentionMask,
        scaling: Option<f32>,
        softcap: Option<f32>,
        head_bias: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let span = tracing::span!(tracing::Level::TRACE, "flex-attn");
        let _enter = span.enter();

        let (batch, q_heads, q_len, head_dim) = query.dims4()?;
        let (k_batch, kv_heads, kv_len, k_dim) = key.dims4()?;
        if k_batch != batch || k_dim != head_dim {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: query.shape().clone(),
                rhs: key.shape().clone(),
                op: "flex-attn-qk",
            });
        }
        if value.dims4()? != (batch, kv_heads, kv_len, head_dim) {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: key.shape().clone(),
                rhs: value.shape().clone(),
                op: "flex-attn-kv",
            });
        }
        if kv_heads == 0 || q_heads % kv_heads != 0 {
            return Err(Error::IncompatibleHeadCounts {
                query_heads: q_heads,
                kv_heads,
            });
        }
        if let Some(cap) = softcap {
            if !(cap.is_finite() && cap > 0.0) {
                return Err(Error::InvalidSoftcap(cap));
            }
        }

        // Mask branch selection: a block mask rides along as the sparse
        // predicate, a dense tensor becomes an additive bias on the scores.
        let mut block_mask = None;
        let mut dense_bias = None;
        match attention_mask {
            AttentionMask::Block(mask) => {
                let (mb, _, mq, mk) = mask.dims();
                if (mb, mq, mk) != (batch, q_len, kv_len) {
                    return Err(Error::MaskShapeMismatch {
                        op: "flex-attn-block-mask",
                        expected: (batch, q_len, kv_len),
                        got: (mb, mq, mk),
                    });
                }
                block_mask = Some(mask);
            }
            AttentionMask::Dense(mask) => {
                let (mb, m_heads, mq, mk) = mask.dims4()?;
                if mb != batch || mq < q_len || mk < kv_len {
                    return Err(Error::MaskShapeMismatch {
                        op: "flex-attn-dense-mask",
                        expected: (batch, q_len, kv_len),
                        got: (mb, mq, mk),
                    });
                }
                // Oversized masks are tolerated: the key axis is sliced to
                // kv_len, extra query rows are simply never indexed.
                let mask = if mk > kv_len {
                    mask.narrow(3, 0, kv_len)?
                } else {
                    mask.clone()
                };
                let mask = if mq > q_len {
                    mask.narrow(2, 0, q_len)?
                } else {
                    mask
                };
                dense_bias = Some((to_f32_vec(&mask)?, m_heads * q_len * kv_len));
            }
        }

        let head_bias_data = match head_bias {
            Some(bias) => {
                let dims = bias.dims4()?;
                if dims.0 != batch || dims.2 != 1 || dims.3 != 1 || !(dims.1 == 1 || dims.1 == q_heads) {
                    return Err(Error::InvalidHeadBias(bias.shape().clone()));
                }
                Some((to_f32_vec(bias)?, dims.1))
            }
            None => None,
        };

        // Grouped-query handling: on head counts the policy rejects, the
        // kernel's native query-head folding is off the table, so key/value
        // heads get replicated up front to match the query head axis.
        let group = q_heads / kv_heads;
        let materialize = group > 1 && !self.gqa_policy().use_native(q_heads);
        let (key, value, kv_heads) = if materialize {
            (repeat_kv(key, group)?, repeat_kv(value, group)?, q_heads)
        } else {
            (key.clone(), value.clone(), kv_heads)
        };

        let score_mod = ScoreMod {
            softcap,
            bias: dense_bias.as_ref().map(|(data, batch_stride)| DenseBias {
                data,
                batch_stride: *batch_stride,
                kv_len,
            }),
            head_bias: head_bias_data.as_ref().map(|(data, heads)| HeadBias {
                data,
                heads: *heads,
            }),
        };
        let dims = KernelDims {
            batch,
            q_heads,
            kv_heads,
            q_len,
            kv_len,
            head_dim,
        };

        let q_data = to_f32_vec(query)?;
        let k_data = to_f32_vec(&key)?;
        let v_data = to_f32_vec(&value)?;
        let (out, lse) = self.compiled().run(
            &q_data,
            &k_data,
            &v_data,
            &dims,
            &score_mod,
            block_mask,
            scaling,
        );

        // Sequence axis back in front of the head axis for the caller.
        let attn_output =
            Tensor::from_vec(out, (batch, q_heads, q_len, head_dim), query.device())?
                .to_dtype(query.dtype())?
                .transpose(1, 2)?
                .contiguous()?;
        // The log-sum-exp is accumulated in f32 and narrowed on the way out.
        let attention_weights = Tensor::from_vec(lse, (batch, q_heads, q_len), query.device())?
            .to_dtype(value.dtype())?;

        Ok((attn_output, attention_weights))
    }
}

/// Scaled dot-product attention against a block-causal or dense additive
/// mask, with grouped-query head handling.
///
/// Shapes: `query` is `(batch, q_heads, q_len, head_dim)`, `key` and `value`
/// are `(batch, kv_heads, kv_len, head_dim)` with `q_heads` a multiple of
/// `kv_heads`.
///
/// Score post-processing before the softmax, in order: softcapping
/// (`softcap * tanh(score / softcap)`, bounding logits into `(-cap, cap)`),
/// the dense mask bias when [`AttentionMask::Dense`] is passed, and the
/// optional per-head `head_bias` of shape `(batch, q_heads | 1, 1, 1)`.
///
/// `scaling` defaults to the kernel's `1/sqrt(head_dim)`.
///
/// Returns the attention output as `(batch, q_len, q_heads, head_dim)`
/// (sequence axis first, contiguous, query's dtype) together with the
/// log-sum-exp of the post-processed scores as `(batch, q_heads, q_len)` in
/// value's dtype.
///
/// Uses the process-wide kernel from [`global_context`]; the first call in a
/// process pays the kernel construction cost, later calls reuse it.
pub fn flex_attention_forward(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    attention_mask: AttentionMask,
    scaling: Option<f32>,
    softcap: Option<f32>,
    head_bias: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    global_context().attention_forward(
        query,
        key,
        value,
        attention_mask,
        scaling,
        softcap,
        head_bias,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn gqa_policy_thresholds() {
        let native = GqaPolicy::NativeForPowerOfTwo;
        for heads in [1usize, 2, 4, 8, 16, 32] {
            assert!(native.use_native(heads), "{heads}");
        }
        for heads in [3usize, 5, 6, 7, 12, 24] {
            assert!(!native.use_native(heads), "{heads}");
        }
        assert!(!GqaPolicy::AlwaysMaterialize.use_native(8));
    }

    #[test]
    fn repeat_kv_interleaves_heads() -> Result<()> {
        // Two kv heads with constant rows 1.0 and 2.0: interleaved expansion
        // gives [1, 1, 2, 2] along the head axis.
        let h0 = Tensor::full(1f32, (1, 1, 2, 3), &Device::Cpu)?;
        let h1 = Tensor::full(2f32, (1, 1, 2, 3), &Device::Cpu)?;
        let kv = Tensor::cat(&[&h0, &h1], 1)?;
        let repeated = repeat_kv(&kv, 2)?;
        assert_eq!(repeated.dims4()?, (1, 4, 2, 3));
        let per_head = repeated.sum(3)?.sum(2)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(per_head, vec![6.0, 6.0, 12.0, 12.0]);
        Ok(())
    }

    #[test]
    fn repeat_kv_noop_for_single_rep() -> Result<()> {
        let kv = Tensor::full(1f32, (1, 2, 2, 3), &Device::Cpu)?;
        let repeated = repeat_kv(&kv, 1)?;
        assert_eq!(repeated.dims4()?, (1, 2, 2, 3));
        Ok(())
    }
}
