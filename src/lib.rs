//! # FlipJump
//!
//! The FlipJump toolchain: a macro assembler for the one-instruction
//! `a;b` language ("flip the bit at `a`, then jump to `b`"), the `.fjm`
//! memory-image container, and a bit-level interpreter.
//!
//! This crate ties the pipeline together; the stages live in their own
//! crates:
//! - [`fj_spec`] — expressions, ops, source traces, the image format
//! - [`fj_assembler`] — lexer, parser, macro preprocessor, assembler
//! - [`fj_runtime`] — sparse bit memory, I/O, breakpoints, the VM
//!
//! ## Example
//!
//! ```rust
//! use flipjump::{assemble_and_run, AssembleOptions, RunConfig, TerminationCause};
//!
//! let program = "\
//! ;code
//! IO:
//!   ;0
//! code:
//!   \"fj\"
//!   stop: ;stop
//! ";
//! let summary = assemble_and_run(
//!     "hello.fj",
//!     program,
//!     b"",
//!     &AssembleOptions::default(),
//!     RunConfig::default(),
//! )
//! .unwrap();
//! assert_eq!(summary.output, b"fj");
//! assert_eq!(summary.cause, TerminationCause::Looping);
//! ```

use thiserror::Error;

pub use fj_assembler::{
    assemble_files, assemble_source, assemble_sources, AssembleOptions, Assembly, AssemblerError,
};
pub use fj_runtime::{
    Breakpoints, InputBuffer, RunConfig, RunOutcome, RuntimeError, TerminationCause, Vm,
};
pub use fj_spec::{DebugInfo, ExprError, Image, ImageError};

/// Any failure across the toolchain.
#[derive(Debug, Error)]
pub enum FlipJumpError {
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub output: Vec<u8>,
    pub cause: TerminationCause,
    pub steps: u64,
}

/// Run an assembled image to completion over a fixed input.
pub fn run_image(
    image: &Image,
    input: &[u8],
    config: RunConfig,
) -> Result<RunSummary, FlipJumpError> {
    let mut vm = Vm::new(image, InputBuffer::new(input), config)?;
    let cause = loop {
        match vm.run()? {
            RunOutcome::Halted(cause) => break cause,
            // No breakpoints were set; resume immediately if the
            // embedder handed us a VM state that has some anyway.
            RunOutcome::Breakpoint { .. } => continue,
        }
    };
    Ok(RunSummary {
        output: vm.take_output(),
        cause,
        steps: vm.steps(),
    })
}

/// Assemble a single source and run it to completion.
pub fn assemble_and_run(
    name: &str,
    source: &str,
    input: &[u8],
    options: &AssembleOptions,
    config: RunConfig,
) -> Result<RunSummary, FlipJumpError> {
    let assembly = assemble_source(name, source, options)?;
    run_image(&assembly.image, input, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_round_trip() {
        let summary = assemble_and_run(
            "loop.fj",
            "stop: ;stop\n",
            b"",
            &AssembleOptions::default(),
            RunConfig::default(),
        )
        .unwrap();
        assert_eq!(summary.cause, TerminationCause::Looping);
        assert_eq!(summary.steps, 1);
        assert!(summary.output.is_empty());
    }

    #[test]
    fn test_facade_propagates_assembler_errors() {
        let err = assemble_and_run(
            "bad.fj",
            ";missing_label\n",
            b"",
            &AssembleOptions::default(),
            RunConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FlipJumpError::Assembler(_)));
    }

    #[test]
    fn test_facade_propagates_runtime_errors() {
        // Two ops past the header bouncing between each other forever.
        let source = ";a\nfiller: ;filler\na: ;b\nb: ;a\n";
        let err = assemble_and_run(
            "spin.fj",
            source,
            b"",
            &AssembleOptions::default(),
            RunConfig {
                step_limit: Some(10),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FlipJumpError::Runtime(RuntimeError::RunTimeExceeded { .. })
        ));
    }
}
