//! Block-causal flex attention for candle.
//!
//! Two cooperating pieces:
//!
//! - [`make_flex_block_causal_mask`] compresses a 2d padding/packing mask
//!   into a [`BlockMask`], a block-level occupancy table over a causal,
//!   document-aware (or fixed-window chunked) attendance predicate.
//! - [`flex_attention_forward`] runs scaled dot-product attention against
//!   such a mask (or a dense additive one), with softcapping, per-head bias,
//!   and grouped-query head handling, through a process-wide kernel that is
//!   built once and reused.
//!
//! # Usage
//!
//! ```ignore
//! use candle_flex_attn::{make_flex_block_causal_mask, flex_attention_forward, AttentionMask};
//!
//! // Two documents packed into one row of length 4.
//! let mask_2d = Tensor::new(&[[1i64, 1, 2, 2]], &Device::Cpu)?;
//! let block_mask = make_flex_block_causal_mask(&mask_2d, None, 4, 4)?;
//!
//! let (out, lse) = flex_attention_forward(
//!     &q, &k, &v,
//!     AttentionMask::Block(&block_mask),
//!     None, // scaling, defaults to 1/sqrt(head_dim)
//!     None, // softcap
//!     None, // head bias
//! )?;
//! ```

pub mod attention;
pub mod error;
pub mod kernel;
pub mod mask;

pub use attention::{flex_attention_forward, repeat_kv, AttentionMask, GqaPolicy};
pub use error::{Error, Result};
pub use kernel::{global_context, CompiledFlexAttention, FlexContext};
pub use mask::{make_flex_block_causal_mask, BlockMask, DEFAULT_BLOCK_SIZE};
