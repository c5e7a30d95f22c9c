use candle::Shape;

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("attention mask of length {mask_len} cannot be padded to key length {key_length}")]
    MaskTooShort { mask_len: usize, key_length: usize },

    #[error("query length {query_length} exceeds key length {key_length}")]
    QueryExceedsKeys {
        query_length: usize,
        key_length: usize,
    },

    #[error("shape mismatch in {op}, lhs: {lhs:?}, rhs: {rhs:?}")]
    ShapeMismatchBinaryOp {
        lhs: Shape,
        rhs: Shape,
        op: &'static str,
    },

    #[error("{op}: expected mask dims {expected:?}, got {got:?}")]
    MaskShapeMismatch {
        op: &'static str,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("query heads {query_heads} is not a multiple of key/value heads {kv_heads}")]
    IncompatibleHeadCounts {
        query_heads: usize,
        kv_heads: usize,
    },

    #[error("attention chunk size must be positive")]
    InvalidChunkSize,

    #[error("softcap must be a positive finite value, got {0}")]
    InvalidSoftcap(f32),

    #[error("head bias must have shape (batch, heads, 1, 1), got {0:?}")]
    InvalidHeadBias(Shape),

    /// Anything that goes wrong inside the tensor engine is passed through
    /// untranslated.
    #[error(transparent)]
    Candle(#[from] candle::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
