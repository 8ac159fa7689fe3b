//! The FlipJump interpreter.
//!
//! Each step fetches the op pair `a;b` at `ip`, emits an output bit
//! when `a` lands on the IO pair, flips the bit at `a`, and jumps to
//! `b`. A self-loop (`b == ip`) is the normal halt; a jump into the
//! `2w`-bit header terminates with `NullIp`. When the op window at the
//! new `ip` covers the input bit address, one input bit is written
//! there before the next fetch, so programs branch on input by jumping
//! through the IO op.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fj_spec::{
    address_mask, input_address, op_size, output_address, validate_width, BitAddr, Image,
    DEFAULT_TRACE_LENGTH,
};

use crate::breakpoints::Breakpoints;
use crate::error::{Result, RuntimeError};
use crate::io::{InputBuffer, OutputBuffer};
use crate::memory::Memory;

/// How often the cancellation flag is polled, in steps.
const CANCEL_POLL_INTERVAL: u64 = 4096;

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Abort with `RunTimeExceeded` after this many steps.
    pub step_limit: Option<u64>,
    /// Length of the executed-address ring buffer.
    pub trace_length: usize,
    /// Fail loading if the image width differs from this.
    pub expected_width: Option<u32>,
    /// Cooperative cancellation flag, polled every few thousand steps.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            step_limit: None,
            trace_length: DEFAULT_TRACE_LENGTH,
            expected_width: None,
            cancel: None,
        }
    }
}

/// Why a run ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// An op jumped to itself.
    Looping,
    /// An op jumped into the `2w`-bit header.
    NullIp,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationCause::Looping => write!(f, "looping"),
            TerminationCause::NullIp => write!(f, "ip<2w"),
        }
    }
}

/// How a call to [`Vm::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted(TerminationCause),
    /// Stopped at a breakpoint; the VM is inspectable and resumable.
    Breakpoint { address: BitAddr },
}

/// A loaded FlipJump program mid-execution.
#[derive(Debug)]
pub struct Vm {
    memory: Memory,
    width: u32,
    mask: u64,
    osize: u64,
    out_address: u64,
    in_address: u64,
    ip: BitAddr,
    steps: u64,
    flips: u64,
    jumps: u64,
    halted: Option<TerminationCause>,
    input: InputBuffer,
    output: OutputBuffer,
    trace: VecDeque<BitAddr>,
    breakpoints: HashSet<BitAddr>,
    resuming: bool,
    config: RunConfig,
}

impl Vm {
    pub fn new(image: &Image, input: InputBuffer, config: RunConfig) -> Result<Self> {
        validate_width(image.width)?;
        if let Some(expected) = config.expected_width {
            if expected != image.width {
                return Err(RuntimeError::Image(fj_spec::ImageError::WidthMismatch {
                    expected,
                    found: image.width,
                }));
            }
        }
        let width = image.width;
        Ok(Vm {
            memory: Memory::load_image(image),
            width,
            mask: address_mask(width),
            osize: op_size(width),
            out_address: output_address(width),
            in_address: input_address(width),
            ip: 0,
            steps: 0,
            flips: 0,
            jumps: 0,
            halted: None,
            input,
            output: OutputBuffer::new(),
            trace: VecDeque::new(),
            breakpoints: HashSet::new(),
            resuming: false,
            config,
        })
    }

    pub fn set_breakpoints(&mut self, breakpoints: &Breakpoints) {
        self.breakpoints = breakpoints.addresses();
    }

    /// Run until halt, breakpoint, step limit or cancellation.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if let Some(cause) = self.halted {
            return Ok(RunOutcome::Halted(cause));
        }
        loop {
            if !self.resuming && self.breakpoints.contains(&self.ip) {
                self.resuming = true;
                return Ok(RunOutcome::Breakpoint { address: self.ip });
            }
            self.resuming = false;

            if let Some(limit) = self.config.step_limit {
                if self.steps >= limit {
                    return Err(RuntimeError::RunTimeExceeded { limit });
                }
            }
            if let Some(cancel) = &self.config.cancel {
                if self.steps % CANCEL_POLL_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                    return Err(RuntimeError::Cancelled { steps: self.steps });
                }
            }

            // The op window at ip covers the input bit: feed one bit in
            // before fetching, so the jump word dispatches on it.
            let input_offset = self.in_address.wrapping_sub(self.ip) & self.mask;
            if input_offset < self.osize {
                let bit = self.input.read_bit();
                self.memory.set_bit(self.in_address, bit);
            }

            let a = self.memory.read_word(self.ip);
            let b = self.memory.read_word(self.ip.wrapping_add(self.width as u64) & self.mask);
            self.steps += 1;
            if self.config.trace_length > 0 {
                if self.trace.len() == self.config.trace_length {
                    self.trace.pop_front();
                }
                self.trace.push_back(self.ip);
            }

            if a == self.out_address {
                self.output.write_bit(false);
            } else if a == self.out_address + 1 {
                self.output.write_bit(true);
            }

            self.memory.flip_bit(a);
            if a >= self.osize {
                self.flips += 1;
            }

            if b == self.ip {
                self.halted = Some(TerminationCause::Looping);
                return Ok(RunOutcome::Halted(TerminationCause::Looping));
            }
            if b != self.ip.wrapping_add(self.osize) & self.mask {
                self.jumps += 1;
            }
            if b < self.osize {
                self.halted = Some(TerminationCause::NullIp);
                return Ok(RunOutcome::Halted(TerminationCause::NullIp));
            }
            self.ip = b;
        }
    }

    // ========== inspection ==========

    pub fn ip(&self) -> BitAddr {
        self.ip
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Flips that landed outside the `2w`-bit header.
    pub fn flips(&self) -> u64 {
        self.flips
    }

    /// Jumps that didn't just fall through to the next op.
    pub fn jumps(&self) -> u64 {
        self.jumps
    }

    pub fn halted(&self) -> Option<TerminationCause> {
        self.halted
    }

    /// Completed output bytes so far.
    pub fn output(&self) -> &[u8] {
        self.output.bytes()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        self.output.take()
    }

    /// The last executed op addresses, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = BitAddr> + '_ {
        self.trace.iter().copied()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fj_spec::image::pack_words;

    /// Image with the given words starting at bit 0.
    fn image_of(words: &[u64], width: u32) -> Image {
        let mut image = Image::new(width, false).unwrap();
        image
            .add_segment(
                0,
                words.len() as u64 * width as u64,
                pack_words(words, width),
            )
            .unwrap();
        image
    }

    fn run_to_end(words: &[u64]) -> Vm {
        let image = image_of(words, 64);
        let mut vm = Vm::new(&image, InputBuffer::empty(), RunConfig::default()).unwrap();
        vm.run().unwrap();
        vm
    }

    #[test]
    fn test_self_loop_halts() {
        // One op at 0 jumping to itself.
        let vm = run_to_end(&[0, 0]);
        assert_eq!(vm.halted(), Some(TerminationCause::Looping));
        assert_eq!(vm.steps(), 1);
    }

    #[test]
    fn test_fall_through_then_halt() {
        let vm = run_to_end(&[0, 128, 0, 128]);
        assert_eq!(vm.halted(), Some(TerminationCause::Looping));
        assert_eq!(vm.steps(), 2);
        assert_eq!(vm.jumps(), 0); // 0 -> 128 is a fall-through
    }

    #[test]
    fn test_null_ip_terminates() {
        // Jump to 0 from elsewhere is a jump into the header.
        let vm = run_to_end(&[0, 256, 0, 0, 0, 0]);
        assert_eq!(vm.halted(), Some(TerminationCause::NullIp));
    }

    #[test]
    fn test_flip_lands_in_memory() {
        // Flip bit 300, then self-loop.
        let vm = run_to_end(&[300, 128, 0, 128]);
        assert!(vm.memory().get_bit(300));
        assert_eq!(vm.flips(), 1);
    }

    #[test]
    fn test_flip_involution_via_ping_pong() {
        // Op at 256 flips bit 5000 and jumps to 384; op at 384 flips it
        // back and jumps to 256. Memory (except the trace bits) returns
        // to its start state every two steps.
        let words = vec![0, 256, 0, 0, 5000, 384, 5000, 256];
        let image = image_of(&words, 64);
        let config = RunConfig {
            step_limit: Some(9), // header op + 4 round trips
            ..Default::default()
        };
        let mut vm = Vm::new(&image, InputBuffer::empty(), config).unwrap();
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::RunTimeExceeded { limit: 9 }));
        // 1 header step + 8 ping-pong steps = 4 full flip pairs.
        assert!(!vm.memory().get_bit(5000));
    }

    #[test]
    fn test_output_bits_form_bytes() {
        // Emit 'A' (0b0100_0001) LSB-first through the IO pair at
        // 128/129, then self-loop.
        let bits = [1u64, 0, 0, 0, 0, 0, 1, 0];
        let mut words = vec![0, 256, 0, 0];
        let mut address = 256;
        for &bit in &bits {
            words.push(128 + bit);
            words.push(address + 128);
            address += 128;
        }
        words.push(0);
        words.push(address); // self-loop
        let vm = run_to_end(&words);
        assert_eq!(vm.output(), b"A");
        assert_eq!(vm.halted(), Some(TerminationCause::Looping));
    }

    #[test]
    fn test_partial_output_byte_is_withheld() {
        let mut words = vec![0, 256, 0, 0];
        // Three bits only.
        words.extend_from_slice(&[129, 384, 129, 512, 129, 640]);
        words.extend_from_slice(&[0, 640]);
        let vm = run_to_end(&words);
        assert_eq!(vm.output(), b"");
    }

    #[test]
    fn test_input_bit_dispatches_jump() {
        // The op at 128 covers the input bit at 199 = bit 7 of its jump
        // word, so its stored jump 256 becomes 256 or 384 by input.
        let words = vec![
            0, 128, // jump to the IO op
            0, 256, // the IO op: jump word patched by input
            0, 256, // self-loop (input bit 0 halts here)
            0, 384, // self-loop (input bit 1 halts here)
        ];

        // Input 0x01: first bit is 1, so the jump dispatches to 384.
        let image = image_of(&words, 64);
        let mut vm = Vm::new(&image, InputBuffer::new(&[0x01]), RunConfig::default()).unwrap();
        vm.run().unwrap();
        assert_eq!(vm.ip(), 384);

        // Empty input reads zero bits: dispatches to 256.
        let image = image_of(&words, 64);
        let mut vm = Vm::new(&image, InputBuffer::empty(), RunConfig::default()).unwrap();
        vm.run().unwrap();
        assert_eq!(vm.ip(), 256);
    }

    #[test]
    fn test_step_limit() {
        // Two ops jumping at each other forever.
        let words = vec![0, 256, 0, 0, 0, 384, 0, 256];
        let image = image_of(&words, 64);
        let config = RunConfig {
            step_limit: Some(100),
            ..Default::default()
        };
        let mut vm = Vm::new(&image, InputBuffer::empty(), config).unwrap();
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::RunTimeExceeded { limit: 100 }));
        // Still inspectable.
        assert_eq!(vm.steps(), 100);
        assert!(vm.halted().is_none());
    }

    #[test]
    fn test_cancellation() {
        let words = vec![0, 256, 0, 0, 0, 384, 0, 256];
        let image = image_of(&words, 64);
        let flag = Arc::new(AtomicBool::new(true));
        let config = RunConfig {
            cancel: Some(flag),
            ..Default::default()
        };
        let mut vm = Vm::new(&image, InputBuffer::empty(), config).unwrap();
        let err = vm.run().unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled { .. }));
    }

    #[test]
    fn test_breakpoint_suspends_and_resumes() {
        let words = vec![0, 256, 0, 0, 0, 256];
        let image = image_of(&words, 64);
        let mut vm = Vm::new(&image, InputBuffer::empty(), RunConfig::default()).unwrap();
        vm.breakpoints.insert(256);

        let outcome = vm.run().unwrap();
        assert_eq!(outcome, RunOutcome::Breakpoint { address: 256 });
        assert_eq!(vm.steps(), 1);

        let outcome = vm.run().unwrap();
        assert_eq!(outcome, RunOutcome::Halted(TerminationCause::Looping));
        assert_eq!(vm.steps(), 2);
    }

    #[test]
    fn test_trace_ring_buffer() {
        let words = vec![0, 128, 0, 256, 0, 384, 0, 384];
        let image = image_of(&words, 64);
        let config = RunConfig {
            trace_length: 2,
            ..Default::default()
        };
        let mut vm = Vm::new(&image, InputBuffer::empty(), config).unwrap();
        vm.run().unwrap();
        let trace: Vec<u64> = vm.trace().collect();
        assert_eq!(trace, vec![256, 384]);
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let image = image_of(&[0, 0], 32);
        let config = RunConfig {
            expected_width: Some(64),
            ..Default::default()
        };
        let err = Vm::new(&image, InputBuffer::empty(), config).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Image(fj_spec::ImageError::WidthMismatch { .. })
        ));
    }

    #[test]
    fn test_run_after_halt_is_stable() {
        let mut vm = run_to_end(&[0, 0]);
        let outcome = vm.run().unwrap();
        assert_eq!(outcome, RunOutcome::Halted(TerminationCause::Looping));
        assert_eq!(vm.steps(), 1);
    }
}
