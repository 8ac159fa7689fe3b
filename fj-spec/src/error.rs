//! Error types shared across the toolchain's lower layers.

use thiserror::Error;

/// Errors raised while evaluating symbolic expressions.
#[derive(Debug, Error)]
pub enum ExprError {
    /// A label referenced by the expression has no known value.
    #[error("unresolved label: {name}")]
    UnresolvedLabel { name: String },

    /// Division or modulo by zero.
    #[error("division by zero in expression: {expr}")]
    DivisionByZero { expr: String },

    /// Shift amount is negative or does not fit a machine word.
    #[error("bad shift amount in expression: {expr}")]
    BadShift { expr: String },
}

/// Errors raised by the `.fjm` image codec.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The file does not look like a `.fjm` image at all.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// The container version is not one this toolchain reads.
    #[error("unsupported image version {0} (this toolchain reads version {current})", current = crate::VERSION)]
    UnsupportedVersion(u16),

    /// The width is not a positive multiple of 8 up to 64.
    #[error("unsupported memory width {0} (expected a positive multiple of 8, at most 64)")]
    UnsupportedWidth(u32),

    /// The image was built for a different width than the consumer expects.
    #[error("width mismatch: image is {found} bits wide, expected {expected}")]
    WidthMismatch { expected: u32, found: u32 },

    /// A segment start is not aligned to the memory width.
    #[error("segment start {start_bit:#x} is not a multiple of the width {width}")]
    MisalignedSegment { start_bit: u64, width: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
