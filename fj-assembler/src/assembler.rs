//! Two-pass assembler: placement, then resolution and emission.
//!
//! Pass 1 walks the expanded stream assigning each op an address
//! (advancing `2w` bits per op) and binding labels to the next op
//! address. `pad`, `segment` and `reserve` adjust the current address;
//! their expressions may only look backward at labels already bound.
//!
//! Pass 2 resolves every expression against the finished label table
//! and emits `w`-bit little-endian word pairs. `wflip` ops lower to a
//! single op when flipping at most one bit, and otherwise to a chain of
//! flip ops in the owning segment's wflip area (the space right after
//! the segment's last op, up to the next segment's start).

use std::collections::HashMap;
use std::path::PathBuf;

use num_bigint::BigInt;
use num_traits::{One, ToPrimitive, Zero};

use fj_spec::image::pack_words;
use fj_spec::{
    address_mask, op_size, validate_width, CodePosition, DebugInfo, Expr, ExprError, Image,
    OpTrace, StreamOp, TraceArena, DEFAULT_MAX_RECURSION_DEPTH, DEFAULT_WIDTH,
};

use crate::error::{stack_note, AssemblerError, Result};
use crate::parser::{parse_files, parse_source, parse_sources, ParseOutput};
use crate::preprocessor::{expand, ExpandOptions, Expansion};

#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// Memory width in bits; addresses live in `[0, 2^width)`.
    pub width: u32,
    /// zlib-compress segment payloads in the image.
    pub compress: bool,
    pub max_recursion_depth: usize,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        AssembleOptions {
            width: DEFAULT_WIDTH,
            compress: false,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }
}

impl AssembleOptions {
    pub fn with_width(width: u32) -> Self {
        AssembleOptions {
            width,
            ..Default::default()
        }
    }
}

/// An assembled program: the image plus its symbol-level views.
#[derive(Debug)]
pub struct Assembly {
    pub image: Image,
    pub labels: HashMap<String, u64>,
    pub debug: DebugInfo,
    pub warnings: Vec<String>,
}

/// Assemble in-memory named sources.
pub fn assemble_sources(sources: &[(&str, &str)], options: &AssembleOptions) -> Result<Assembly> {
    validate_width(options.width)?;
    let parsed = parse_sources(sources, options.width)?;
    assemble_parsed(parsed, options)
}

/// Assemble a single in-memory source.
pub fn assemble_source(name: &str, text: &str, options: &AssembleOptions) -> Result<Assembly> {
    validate_width(options.width)?;
    let parsed = parse_source(name, text, options.width)?;
    assemble_parsed(parsed, options)
}

/// Assemble `.fj` files from disk, following includes.
pub fn assemble_files(paths: &[PathBuf], options: &AssembleOptions) -> Result<Assembly> {
    validate_width(options.width)?;
    let parsed = parse_files(paths, options.width)?;
    assemble_parsed(parsed, options)
}

fn assemble_parsed(parsed: ParseOutput, options: &AssembleOptions) -> Result<Assembly> {
    let expand_options = ExpandOptions {
        max_recursion_depth: options.max_recursion_depth,
    };
    let expansion = expand(&parsed.main, &parsed.registry, &expand_options)?;
    let mut warnings = parsed.warnings;
    warnings.extend(expansion.warnings.iter().cloned());
    let mut assembly = assemble_expansion(&expansion, options)?;
    assembly.warnings = warnings;
    Ok(assembly)
}

/// Resolve and emit an already-expanded stream.
pub fn assemble_expansion(expansion: &Expansion, options: &AssembleOptions) -> Result<Assembly> {
    validate_width(options.width)?;
    let layout = place(&expansion.stream, &expansion.arena, options)?;
    emit(layout, &expansion.arena, options)
}

// ========== pass 1: placement ==========

enum Entry {
    Op {
        flip: Expr,
        jump: Expr,
        trace: OpTrace,
        address: u64,
    },
    WordFlip {
        word_address: Expr,
        flip_value: Expr,
        return_address: Expr,
        trace: OpTrace,
        address: u64,
    },
    Zeros {
        words: u64,
    },
}

struct Run {
    start: u64,
    region: usize,
    entries: Vec<Entry>,
    /// Reserved zero tail after the stored words.
    extra_zero_bits: u64,
    closed: bool,
}

struct Region {
    /// Where this region's wflip chains begin (right past its last op).
    wflip_start: u64,
    /// Start of the next declared segment, bounding the wflip area.
    limit: Option<u64>,
}

struct Layout {
    runs: Vec<Run>,
    regions: Vec<Region>,
    labels: HashMap<String, u64>,
}

struct Placer<'a> {
    arena: &'a TraceArena,
    width: u32,
    runs: Vec<Run>,
    regions: Vec<Region>,
    labels: HashMap<String, u64>,
    label_positions: HashMap<String, CodePosition>,
    current: u64,
}

impl<'a> Placer<'a> {
    fn osize(&self) -> u64 {
        op_size(self.width)
    }

    fn space(&self) -> u128 {
        1u128 << self.width
    }

    fn stack(&self, trace: OpTrace) -> String {
        match trace.frame {
            Some(frame) => stack_note(&self.arena.render(frame)),
            None => String::new(),
        }
    }

    fn open_run(&mut self) -> &mut Run {
        let region = self.regions.len() - 1;
        let needs_new = match self.runs.last() {
            Some(run) => run.closed || run.region != region,
            None => true,
        };
        if needs_new {
            self.runs.push(Run {
                start: self.current,
                region,
                entries: Vec::new(),
                extra_zero_bits: 0,
                closed: false,
            });
        }
        self.runs.last_mut().unwrap()
    }

    fn check_space(&self, next: u128, what: &str, trace: OpTrace) -> Result<()> {
        if next > self.space() {
            return Err(AssemblerError::AddressOutOfRange {
                pos: trace.pos,
                what: what.to_string(),
                width: self.width,
                stack: self.stack(trace),
            });
        }
        Ok(())
    }

    /// Evaluate a directive expression against labels bound so far.
    fn resolve_backward(&self, expr: &Expr, what: &str, trace: OpTrace) -> Result<u64> {
        let value = expr
            .resolve(&|name| self.labels.get(name).map(|&addr| BigInt::from(addr)))
            .map_err(|e| match e {
                ExprError::UnresolvedLabel { name } => AssemblerError::UnresolvedLabel {
                    pos: trace.pos,
                    name,
                    stack: self.stack(trace),
                },
                other => AssemblerError::Arithmetic {
                    pos: trace.pos,
                    stack: self.stack(trace),
                    source: other,
                },
            })?;
        value
            .to_u64()
            .filter(|&v| (v as u128) <= self.space())
            .ok_or_else(|| AssemblerError::AddressOutOfRange {
                pos: trace.pos,
                what: format!("{} {}", what, value),
                width: self.width,
                stack: self.stack(trace),
            })
    }

    fn place_op(&mut self, entry_of: impl FnOnce(u64) -> Entry, trace: OpTrace) -> Result<()> {
        let osize = self.osize();
        let address = self.current;
        let next = address as u128 + osize as u128;
        self.check_space(next, "op", trace)?;
        let entry = entry_of(address);
        self.open_run().entries.push(entry);
        self.current = next as u64;
        Ok(())
    }

    fn place(&mut self, stream: &[StreamOp]) -> Result<()> {
        for op in stream {
            match op {
                StreamOp::Label { name, trace } => {
                    if let Some(&previous) = self.label_positions.get(name) {
                        return Err(AssemblerError::DuplicateLabel {
                            pos: trace.pos,
                            name: name.clone(),
                            previous,
                            stack: self.stack(*trace),
                        });
                    }
                    self.label_positions.insert(name.clone(), trace.pos);
                    self.labels.insert(name.clone(), self.current);
                }
                StreamOp::Op { flip, jump, trace } => {
                    let (flip, jump, trace) = (flip.clone(), jump.clone(), *trace);
                    self.place_op(
                        move |address| Entry::Op {
                            flip,
                            jump,
                            trace,
                            address,
                        },
                        trace,
                    )?;
                }
                StreamOp::WordFlip {
                    word_address,
                    flip_value,
                    return_address,
                    trace,
                } => {
                    let (word_address, flip_value, return_address, trace) = (
                        word_address.clone(),
                        flip_value.clone(),
                        return_address.clone(),
                        *trace,
                    );
                    self.place_op(
                        move |address| Entry::WordFlip {
                            word_address,
                            flip_value,
                            return_address,
                            trace,
                            address,
                        },
                        trace,
                    )?;
                }
                StreamOp::Pad { alignment, trace } => {
                    let align = self.resolve_backward(alignment, "pad alignment", *trace)?;
                    if align == 0 {
                        return Err(AssemblerError::Arithmetic {
                            pos: trace.pos,
                            stack: self.stack(*trace),
                            source: ExprError::DivisionByZero {
                                expr: alignment.to_string(),
                            },
                        });
                    }
                    let osize = self.osize();
                    let ops_done = self.current / osize;
                    let ops_to_pad = (align - ops_done % align) % align;
                    let next = self.current as u128 + ops_to_pad as u128 * osize as u128;
                    self.check_space(next, "pad", *trace)?;
                    if ops_to_pad > 0 {
                        self.open_run().entries.push(Entry::Zeros {
                            words: 2 * ops_to_pad,
                        });
                        self.current = next as u64;
                    }
                }
                StreamOp::Segment { start, trace } => {
                    let start = self.resolve_backward(start, "segment start", *trace)?;
                    if start % self.osize() != 0 {
                        return Err(AssemblerError::MisalignedDirective {
                            pos: trace.pos,
                            what: "segment start".to_string(),
                            alignment: self.osize(),
                            value: format!("{:#x}", start),
                        });
                    }
                    let region = self.regions.last_mut().unwrap();
                    region.wflip_start = self.current;
                    if start >= self.current {
                        region.limit = Some(start);
                    }
                    self.regions.push(Region {
                        wflip_start: 0,
                        limit: None,
                    });
                    if let Some(run) = self.runs.last_mut() {
                        run.closed = true;
                    }
                    self.current = start;
                }
                StreamOp::Reserve { bits, trace } => {
                    let bits = self.resolve_backward(bits, "reserve size", *trace)?;
                    if bits % self.osize() != 0 {
                        return Err(AssemblerError::MisalignedDirective {
                            pos: trace.pos,
                            what: "reserve size".to_string(),
                            alignment: self.osize(),
                            value: format!("{:#x}", bits),
                        });
                    }
                    let next = self.current as u128 + bits as u128;
                    self.check_space(next, "reserve", *trace)?;
                    let run = self.open_run();
                    run.extra_zero_bits = bits;
                    run.closed = true;
                    self.current = next as u64;
                }
            }
        }
        // The final region's wflip area sits past everything placed.
        self.regions.last_mut().unwrap().wflip_start = self.current;
        Ok(())
    }
}

fn place(stream: &[StreamOp], arena: &TraceArena, options: &AssembleOptions) -> Result<Layout> {
    let mut placer = Placer {
        arena,
        width: options.width,
        runs: Vec::new(),
        regions: vec![Region {
            wflip_start: 0,
            limit: None,
        }],
        labels: HashMap::new(),
        label_positions: HashMap::new(),
        current: 0,
    };
    placer.place(stream)?;
    Ok(Layout {
        runs: placer.runs,
        regions: placer.regions,
        labels: placer.labels,
    })
}

// ========== pass 2: resolution and emission ==========

fn emit(layout: Layout, arena: &TraceArena, options: &AssembleOptions) -> Result<Assembly> {
    let width = options.width;
    let osize = op_size(width);
    let mask = address_mask(width);
    let modulus = BigInt::one() << width;
    let labels = layout.labels;

    let stack = |trace: OpTrace| match trace.frame {
        Some(frame) => stack_note(&arena.render(frame)),
        None => String::new(),
    };

    let narrow = |value: BigInt| -> u64 {
        let mut r = value % &modulus;
        if r < BigInt::zero() {
            r += &modulus;
        }
        r.to_u64().expect("narrowed value fits a word")
    };

    let resolve = |expr: &Expr, dollar: u64, trace: OpTrace| -> Result<u64> {
        let value = expr
            .resolve(&|name| {
                if name == "$" {
                    Some(BigInt::from(dollar))
                } else {
                    labels.get(name).map(|&addr| BigInt::from(addr))
                }
            })
            .map_err(|e| match e {
                ExprError::UnresolvedLabel { name } => AssemblerError::UnresolvedLabel {
                    pos: trace.pos,
                    name,
                    stack: stack(trace),
                },
                other => AssemblerError::Arithmetic {
                    pos: trace.pos,
                    stack: stack(trace),
                    source: other,
                },
            })?;
        Ok(narrow(value))
    };

    let mut debug = DebugInfo::new(width);
    for (name, &address) in &labels {
        debug.labels.insert(name.clone(), address);
    }

    // Per-region wflip chain state.
    let mut chain_cursor: Vec<u64> = layout.regions.iter().map(|r| r.wflip_start).collect();
    let mut chain_words: Vec<Vec<u64>> = vec![Vec::new(); layout.regions.len()];

    let mut image = Image::new(width, options.compress)?;

    for run in &layout.runs {
        let mut words: Vec<u64> = Vec::new();
        for entry in &run.entries {
            match entry {
                Entry::Zeros { words: count } => {
                    words.extend(std::iter::repeat(0).take(*count as usize));
                }
                Entry::Op {
                    flip,
                    jump,
                    trace,
                    address,
                } => {
                    let dollar = address.wrapping_add(osize);
                    words.push(resolve(flip, dollar, *trace)?);
                    words.push(resolve(jump, dollar, *trace)?);
                    if let Some(frame) = trace.frame {
                        debug.op_stacks.insert(*address, arena.render(frame));
                    }
                }
                Entry::WordFlip {
                    word_address,
                    flip_value,
                    return_address,
                    trace,
                    address,
                } => {
                    let dollar = address.wrapping_add(osize);
                    let target = resolve(word_address, dollar, *trace)?;
                    let value = resolve(flip_value, dollar, *trace)?;
                    let ret = resolve(return_address, dollar, *trace)?;
                    let bits: Vec<u32> = (0..width).filter(|&i| value >> i & 1 == 1).collect();
                    let flip_at = |bit: u32| ((target as u128 + bit as u128) & mask as u128) as u64;

                    match bits.as_slice() {
                        [] => {
                            words.push(0);
                            words.push(ret);
                        }
                        [only] => {
                            words.push(flip_at(*only));
                            words.push(ret);
                        }
                        [first, rest @ ..] => {
                            let region = run.region;
                            let chain_start = chain_cursor[region];
                            words.push(flip_at(*first));
                            words.push(chain_start);
                            for (i, &bit) in rest.iter().enumerate() {
                                let at = chain_cursor[region];
                                let next = at as u128 + osize as u128;
                                let within_limit = match layout.regions[region].limit {
                                    Some(limit) => next <= limit as u128,
                                    None => next <= 1u128 << width,
                                };
                                if !within_limit {
                                    return Err(AssemblerError::AddressOutOfRange {
                                        pos: trace.pos,
                                        what: format!("wflip chain at {:#x}", at),
                                        width,
                                        stack: stack(*trace),
                                    });
                                }
                                chain_words[region].push(flip_at(bit));
                                chain_words[region].push(if i == rest.len() - 1 {
                                    ret
                                } else {
                                    next as u64
                                });
                                chain_cursor[region] = next as u64;
                            }
                        }
                    }
                    if let Some(frame) = trace.frame {
                        debug.op_stacks.insert(*address, arena.render(frame));
                    }
                }
            }
        }

        // Padding- and reserve-only runs read back identically from the
        // zero default, so they are elided from the image.
        let has_ops = run
            .entries
            .iter()
            .any(|entry| !matches!(entry, Entry::Zeros { .. }));
        if !has_ops {
            continue;
        }
        let content_bits = words.len() as u64 * width as u64 + run.extra_zero_bits;
        image.add_segment(run.start, content_bits, pack_words(&words, width))?;
    }

    for (region, words) in chain_words.iter().enumerate() {
        if words.is_empty() {
            continue;
        }
        image.add_segment(
            layout.regions[region].wflip_start,
            words.len() as u64 * width as u64,
            pack_words(words, width),
        )?;
    }

    Ok(Assembly {
        image,
        labels,
        debug,
        warnings: Vec::new(),
    })
}
