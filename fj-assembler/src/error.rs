//! Error types for the FlipJump assembler stages.

use thiserror::Error;

use fj_spec::{CodePosition, ExprError, ImageError};

/// Assembler error taxonomy, parse stage through emission.
///
/// The `stack` fields hold the rendered macro-invocation chain that led
/// to the failing item (one line per frame, empty outside macros).
#[derive(Debug, Error)]
pub enum AssemblerError {
    /// Lexical or grammar violation.
    #[error("syntax error at {pos}: {message}")]
    SyntaxError { pos: CodePosition, message: String },

    /// An `include`d file cannot be read.
    #[error("include error at {pos}: can't read {path}: {detail}")]
    IncludeError {
        pos: CodePosition,
        path: String,
        detail: String,
    },

    /// Macro expansion exceeded the depth limit.
    #[error("macro recursion exceeded depth {depth}. call trace:\n{stack}")]
    MacroRecursion { depth: usize, stack: String },

    /// A rep count did not fold to a compile-time constant.
    #[error("rep count at {pos} is not a compile-time constant: {expr}{stack}")]
    UnresolvedRepCount {
        pos: CodePosition,
        expr: String,
        stack: String,
    },

    /// A macro exists under this name, but not at this arity.
    #[error(
        "macro {name} at {pos} called with {given} arguments, \
         but it is defined with {available}{stack}"
    )]
    MacroArityMismatch {
        pos: CodePosition,
        name: String,
        given: usize,
        available: String,
        stack: String,
    },

    /// No macro under this name at all.
    #[error("macro {name} at {pos} is used but never defined{stack}")]
    UndefinedMacro {
        pos: CodePosition,
        name: String,
        stack: String,
    },

    /// Two definitions for the same `(name, arity)`.
    #[error("macro {name} at {pos} is declared twice (also at {previous})")]
    DuplicateMacro {
        pos: CodePosition,
        name: String,
        previous: CodePosition,
    },

    /// Two bindings for the same label.
    #[error("label \"{name}\" at {pos} is declared twice (also at {previous}){stack}")]
    DuplicateLabel {
        pos: CodePosition,
        name: String,
        previous: CodePosition,
        stack: String,
    },

    /// A label needed during resolution has no address.
    #[error("unresolved label \"{name}\" at {pos}{stack}")]
    UnresolvedLabel {
        pos: CodePosition,
        name: String,
        stack: String,
    },

    /// Layout escaped the `2^w`-bit address space.
    #[error("{what} at {pos} exceeds the {width}-bit address space{stack}")]
    AddressOutOfRange {
        pos: CodePosition,
        what: String,
        width: u32,
        stack: String,
    },

    /// Division by zero, bad shift and friends during evaluation.
    #[error("arithmetic error at {pos}: {source}{stack}")]
    Arithmetic {
        pos: CodePosition,
        stack: String,
        #[source]
        source: ExprError,
    },

    /// A `segment`/`reserve` value breaking the op-pair alignment.
    #[error("{what} at {pos} must be op-aligned (a multiple of {alignment} bits), got {value}")]
    MisalignedDirective {
        pos: CodePosition,
        what: String,
        alignment: u64,
        value: String,
    },

    /// Container-level failure while writing the image.
    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for assembler operations.
pub type Result<T> = std::result::Result<T, AssemblerError>;

/// Prefix a rendered macro stack for embedding into an error message.
pub(crate) fn stack_note(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(". macro call trace:\n{}", lines.join("\n"))
    }
}
