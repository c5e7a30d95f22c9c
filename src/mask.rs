//! Block-causal document masks for packed and padded sequences.
//!
//! A 2d attention mask describes padding and sample packing at the same time:
//! zeros are padding, distinct positive values within a row are distinct
//! packed documents. E.g.
//!
//! For unpacked sequences:
//! ```text
//! [[1, 1, 1, 1, 0, 0, 0],
//!  [1, 1, 1, 1, 1, 0, 0]]
//! ```
//!
//! For packed sequences:
//! ```text
//! [[1, 1, 1, 2, 2, 2, 0],
//!  [1, 1, 2, 2, 2, 3, 3]]
//! ```
//!
//! [`make_flex_block_causal_mask`] turns such a mask into a [`BlockMask`], a
//! compressed representation of the full block-causal attendance tensor that
//! the attention kernel can consume without ever materializing the dense
//! `(batch, heads, q_len, kv_len)` boolean tensor.

use candle::{DType, Tensor};
use rayon::prelude::*;

use crate::error::{Error, Result};

/// Tile side used when compressing a mask, in positions.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Padded mask and document-id grids, with an explicit evaluation method.
///
/// This is the attendance predicate in value form: rather than a closure
/// capturing tensors, the grids are owned here and queried through
/// [`MaskGrid::is_allowed`].
#[derive(Debug, Clone)]
pub struct MaskGrid {
    batch: usize,
    /// Row width after padding, equals the target key length.
    width: usize,
    doc_ids: Vec<i64>,
    padding: Vec<i64>,
}

impl MaskGrid {
    fn from_mask(
        attention_mask: &Tensor,
        attention_chunk_size: Option<usize>,
        key_length: usize,
    ) -> Result<Self> {
        let (batch, mask_len) = attention_mask.dims2()?;
        if key_length < mask_len {
            return Err(Error::MaskTooShort {
                mask_len,
                key_length,
            });
        }
        let rows = attention_mask.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        let mut padding = Vec::with_capacity(batch * key_length);
        for row in rows.iter() {
            padding.extend_from_slice(row);
            padding.resize(padding.len() + key_length - mask_len, 0);
        }
        let doc_ids = match attention_chunk_size {
            // Chunked attention replaces document identity wholesale: every
            // position belongs to the window `position / chunk_size`, the
            // original packing values are ignored.
            Some(chunk_size) => {
                if chunk_size == 0 {
                    return Err(Error::InvalidChunkSize);
                }
                let mut ids = Vec::with_capacity(batch * key_length);
                for _ in 0..batch {
                    ids.extend((0..key_length).map(|p| (p / chunk_size) as i64));
                }
                ids
            }
            None => padding.clone(),
        };
        Ok(Self {
            batch,
            width: key_length,
            doc_ids,
            padding,
        })
    }

    /// Whether query position `q` may attend to key position `k` in batch row
    /// `b`: causal ordering, same document (or chunk), and `q` is not padding.
    ///
    /// Only the query side is checked for padding. Key-side padding carries
    /// document id 0 and never matches a live document, so it is excluded
    /// transitively; two padding positions do "match" each other but their
    /// rows are already dead via the query-side check.
    #[inline]
    pub fn is_allowed(&self, b: usize, q: usize, k: usize) -> bool {
        let row = b * self.width;
        q >= k && self.doc_ids[row + q] == self.doc_ids[row + k] && self.padding[row + q] > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TileStatus {
    /// No position in the tile may attend, skip it entirely.
    Empty,
    /// Some positions attend, the predicate must be evaluated per position.
    Partial,
    /// Every position in the tile attends, no predicate evaluation needed.
    Full,
}

/// Compressed block-causal attendance mask.
///
/// Logically a `(batch, 1, query_length, key_length)` boolean tensor shared
/// across all attention heads, stored as a per-tile occupancy table over
/// [`MaskGrid`]. Build once per `(batch, query_length, key_length)`
/// configuration and reuse for every head and layer of that shape.
#[derive(Debug, Clone)]
pub struct BlockMask {
    grid: MaskGrid,
    query_length: usize,
    key_length: usize,
    block_size: usize,
    q_tiles: usize,
    k_tiles: usize,
    tiles: Vec<TileStatus>,
}

impl BlockMask {
    fn compress(grid: MaskGrid, query_length: usize, block_size: usize) -> Self {
        let key_length = grid.width;
        let batch = grid.batch;
        let q_tiles = query_length.div_ceil(block_size);
        let k_tiles = key_length.div_ceil(block_size);
        let mut tiles = vec![TileStatus::Empty; batch * q_tiles * k_tiles];
        // Each (batch, q_tile) row of the table is independent.
        tiles
            .par_chunks_mut(k_tiles)
            .enumerate()
            .for_each(|(row_idx, tile_row)| {
                let b = row_idx / q_tiles;
                let qt = row_idx % q_tiles;
                let q_start = qt * block_size;
                let q_end = ((qt + 1) * block_size).min(query_length);
                for (kt, slot) in tile_row.iter_mut().enumerate() {
                    let k_start = kt * block_size;
                    // Tiles strictly above the causal diagonal stay empty.
                    if k_start >= q_end {
                        continue;
                    }
                    let k_end = ((kt + 1) * block_size).min(key_length);
                    let mut allowed = 0usize;
                    for q in q_start..q_end {
                        for k in k_start..k_end {
                            if grid.is_allowed(b, q, k) {
                                allowed += 1;
                            }
                        }
                    }
                    let total = (q_end - q_start) * (k_end - k_start);
                    *slot = if allowed == 0 {
                        TileStatus::Empty
                    } else if allowed == total {
                        TileStatus::Full
                    } else {
                        TileStatus::Partial
                    };
                }
            });
        Self {
            grid,
            query_length,
            key_length,
            block_size,
            q_tiles,
            k_tiles,
            tiles,
        }
    }

    pub(crate) fn with_block_size(
        attention_mask: &Tensor,
        attention_chunk_size: Option<usize>,
        query_length: usize,
        key_length: usize,
        block_size: usize,
    ) -> Result<Self> {
        if query_length > key_length {
            return Err(Error::QueryExceedsKeys {
                query_length,
                key_length,
            });
        }
        let grid = MaskGrid::from_mask(attention_mask, attention_chunk_size, key_length)?;
        Ok(Self::compress(grid, query_length, block_size))
    }

    /// Logical dims of the attendance tensor, `(batch, 1, q_len, kv_len)`.
    /// The head axis is always 1: the mask is broadcast over heads.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.grid.batch, 1, self.query_length, self.key_length)
    }

    /// Per-position attendance, delegates to the underlying [`MaskGrid`].
    #[inline]
    pub fn is_allowed(&self, b: usize, q: usize, k: usize) -> bool {
        self.grid.is_allowed(b, q, k)
    }

    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    pub(crate) fn k_tiles(&self) -> usize {
        self.k_tiles
    }

    #[inline]
    pub(crate) fn tile(&self, b: usize, qt: usize, kt: usize) -> TileStatus {
        self.tiles[(b * self.q_tiles + qt) * self.k_tiles + kt]
    }
}

/// Create a block-causal document mask for a batch of sequences, both packed
/// and unpacked.
///
/// `attention_mask` has shape `(batch, seq_len)`; zeros mark padding and
/// distinct positive values mark distinct packed documents. The mask is
/// right-padded with zeros up to `key_length`, which must be at least
/// `seq_len`.
///
/// When `attention_chunk_size` is set, document boundaries are *redefined* as
/// fixed windows of that many positions (`position / chunk_size`), and the
/// packing values of `attention_mask` only contribute padding information.
/// Chunked attention and packed-sequence boundaries are mutually exclusive;
/// pass `None` to keep packing semantics.
///
/// Position `q` may attend to position `k` iff `q >= k`, both fall in the
/// same document (or chunk), and `q` is not a padding position.
pub fn make_flex_block_causal_mask(
    attention_mask: &Tensor,
    attention_chunk_size: Option<usize>,
    query_length: usize,
    key_length: usize,
) -> Result<BlockMask> {
    let span = tracing::span!(tracing::Level::TRACE, "block-causal-mask");
    let _enter = span.enter();
    BlockMask::with_block_size(
        attention_mask,
        attention_chunk_size,
        query_length,
        key_length,
        DEFAULT_BLOCK_SIZE,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn mask_1x7() -> candle::Result<Tensor> {
        Tensor::new(&[[1i64, 1, 1, 2, 2, 2, 0]], &Device::Cpu)
    }

    #[test]
    fn packed_document_predicate() -> Result<()> {
        let mask = make_flex_block_causal_mask(&mask_1x7()?, None, 7, 7)?;
        // Document 2 starts at position 3: it may not look back into document 1.
        for k in 0..7 {
            assert_eq!(mask.is_allowed(0, 3, k), k == 3, "q=3 k={k}");
        }
        // Position 5 sees its own document, causally.
        for k in 0..7 {
            assert_eq!(mask.is_allowed(0, 5, k), (3..=5).contains(&k), "q=5 k={k}");
        }
        // Document 1 behaves causally within itself.
        assert!(mask.is_allowed(0, 2, 0));
        assert!(!mask.is_allowed(0, 0, 2));
        Ok(())
    }

    #[test]
    fn padding_queries_attend_nowhere() -> Result<()> {
        let mask = make_flex_block_causal_mask(&mask_1x7()?, None, 7, 7)?;
        for k in 0..7 {
            assert!(!mask.is_allowed(0, 6, k), "padding q=6 attends k={k}");
        }
        Ok(())
    }

    #[test]
    fn chunked_ids_override_packing() -> Result<()> {
        // Packing values are ignored once a chunk size is set.
        let raw = Tensor::new(&[[1i64, 1, 2, 2, 3, 3]], &Device::Cpu)?;
        let mask = make_flex_block_causal_mask(&raw, Some(2), 6, 6)?;
        // chunk ids are [0, 0, 1, 1, 2, 2]: position 4 sees only itself
        // (position 5 is in its chunk but in the future).
        for k in 0..6 {
            assert_eq!(mask.is_allowed(0, 4, k), k == 4, "q=4 k={k}");
        }
        // Position 3 sees 2 and 3.
        for k in 0..6 {
            assert_eq!(mask.is_allowed(0, 3, k), (2..=3).contains(&k), "q=3 k={k}");
        }
        Ok(())
    }

    #[test]
    fn end_to_end_allowed_set() -> Result<()> {
        let raw = Tensor::new(&[[1i64, 1, 2, 2]], &Device::Cpu)?;
        let mask = make_flex_block_causal_mask(&raw, None, 4, 4)?;
        let expected = [(0, 0), (1, 0), (1, 1), (2, 2), (3, 2), (3, 3)];
        for q in 0..4 {
            for k in 0..4 {
                assert_eq!(
                    mask.is_allowed(0, q, k),
                    expected.contains(&(q, k)),
                    "q={q} k={k}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn key_padding_right_extends_with_zeros() -> Result<()> {
        // key_length larger than the mask: the extra key positions are
        // padding and never attended by live queries.
        let raw = Tensor::new(&[[1i64, 1, 1]], &Device::Cpu)?;
        let mask = make_flex_block_causal_mask(&raw, None, 3, 5)?;
        assert!(mask.is_allowed(0, 2, 0));
        assert!(!mask.is_allowed(0, 2, 3));
        assert!(!mask.is_allowed(0, 2, 4));
        Ok(())
    }

    #[test]
    fn tile_classification() -> Result<()> {
        // Two documents of 4 positions each, tile side 4: each document only
        // populates its own diagonal tile, the cross-document tile is empty.
        let raw = Tensor::new(&[[1i64, 1, 1, 1, 2, 2, 2, 2]], &Device::Cpu)?;
        let mask = BlockMask::with_block_size(&raw, None, 8, 8, 4)?;
        assert_eq!(mask.tile(0, 0, 0), TileStatus::Partial); // causal triangle
        assert_eq!(mask.tile(0, 0, 1), TileStatus::Empty); // future
        assert_eq!(mask.tile(0, 1, 0), TileStatus::Empty); // other document
        assert_eq!(mask.tile(0, 1, 1), TileStatus::Partial); // causal triangle
        Ok(())
    }

    #[test]
    fn full_tile_below_diagonal() -> Result<()> {
        let raw = Tensor::new(&[[1i64; 8]], &Device::Cpu)?;
        let mask = BlockMask::with_block_size(&raw, None, 8, 8, 2)?;
        assert_eq!(mask.tile(0, 3, 0), TileStatus::Full);
        assert_eq!(mask.tile(0, 3, 3), TileStatus::Partial);
        assert_eq!(mask.tile(0, 1, 3), TileStatus::Empty);
        Ok(())
    }

    #[test]
    fn rejects_short_key_length() -> Result<()> {
        let raw = Tensor::new(&[[1i64, 1, 1, 1]], &Device::Cpu)?;
        let res = make_flex_block_causal_mask(&raw, None, 2, 2);
        assert!(matches!(res, Err(Error::MaskTooShort { .. })));
        let res = make_flex_block_causal_mask(&raw, None, 6, 4);
        assert!(matches!(res, Err(Error::QueryExceedsKeys { .. })));
        Ok(())
    }

    #[test]
    fn rejects_zero_chunk_size() -> Result<()> {
        let raw = Tensor::new(&[[1i64, 1]], &Device::Cpu)?;
        let res = make_flex_block_causal_mask(&raw, Some(0), 2, 2);
        assert!(matches!(res, Err(Error::InvalidChunkSize)));
        Ok(())
    }

    #[test]
    fn dims_broadcast_single_head() -> Result<()> {
        let raw = Tensor::new(&[[1i64, 1, 1], [1, 2, 0]], &Device::Cpu)?;
        let mask = make_flex_block_causal_mask(&raw, None, 3, 3)?;
        assert_eq!(mask.dims(), (2, 1, 3, 3));
        Ok(())
    }
}
