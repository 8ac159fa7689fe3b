//! # FlipJump Runtime
//!
//! Execute assembled `.fjm` images: a sparse bit-addressable memory, a
//! fetch-flip-jump loop with memory-mapped bit I/O, breakpoints and a
//! bounded execution trace.
//!
//! ## Example
//!
//! ```rust
//! use fj_spec::Image;
//! use fj_spec::image::pack_words;
//! use fj_runtime::{InputBuffer, RunConfig, RunOutcome, TerminationCause, Vm};
//!
//! // A single op jumping to itself: the canonical halting program.
//! let mut image = Image::new(64, false).unwrap();
//! image.add_segment(0, 128, pack_words(&[0, 0], 64)).unwrap();
//!
//! let mut vm = Vm::new(&image, InputBuffer::empty(), RunConfig::default()).unwrap();
//! let outcome = vm.run().unwrap();
//! assert_eq!(outcome, RunOutcome::Halted(TerminationCause::Looping));
//! ```

pub mod error;
pub mod memory;
pub mod io;
pub mod breakpoints;
pub mod vm;

pub use error::{Result, RuntimeError};
pub use memory::Memory;
pub use io::{InputBuffer, OutputBuffer};
pub use breakpoints::Breakpoints;
pub use vm::{RunConfig, RunOutcome, TerminationCause, Vm};
