//! Macro and rep expansion.
//!
//! Unwinds the parsed macro tree into a flat stream of primitive ops
//! and label bindings. Expansion is hygienic: every macro invocation
//! mints a fresh invocation id, and every label declared in its body is
//! renamed to `<caller chain>.<macro name>.<invocation id>.<name>`, so
//! two calls to the same macro can never collide. Label parameters are
//! aliased to the caller's labels instead; a `>`-parameter renames the
//! body's declaration itself.

use std::collections::{HashMap, HashSet};

use num_traits::{Signed, ToPrimitive};

use fj_spec::ops::MacroCall;
use fj_spec::{
    CodePosition, Expr, ExprError, FrameId, Item, MacroDef, MacroRegistry, OpTrace, StreamOp,
    TraceArena, DEFAULT_MAX_RECURSION_DEPTH,
};

use crate::error::{stack_note, AssemblerError, Result};

#[derive(Debug, Clone)]
pub struct ExpandOptions {
    /// Depth at which expansion gives up with `MacroRecursion`.
    pub max_recursion_depth: usize,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        ExpandOptions {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }
}

/// The preprocessor's result: the flat stream plus everything the
/// assembler and diagnostics need to make sense of it.
#[derive(Debug)]
pub struct Expansion {
    pub stream: Vec<StreamOp>,
    pub arena: TraceArena,
    /// Labels referenced anywhere in the stream but never declared by
    /// it. They must come from somewhere (they don't), so the assembler
    /// will refuse to resolve ops that use them.
    pub unresolved: HashSet<String>,
    pub warnings: Vec<String>,
}

/// Expand the top-level items against the macro registry.
pub fn expand(
    main: &[Item],
    registry: &MacroRegistry,
    options: &ExpandOptions,
) -> Result<Expansion> {
    let mut expander = Expander {
        registry,
        options,
        arena: TraceArena::new(),
        stream: Vec::new(),
        invocation_counter: 0,
        called: HashSet::new(),
    };
    let scope = Scope {
        env: HashMap::new(),
        prefix: String::new(),
        namespace: String::new(),
        frame: None,
        depth: 0,
    };
    expander.expand_items(main, &scope)?;

    let mut declared = HashSet::new();
    let mut used = HashSet::new();
    for op in &expander.stream {
        match op {
            StreamOp::Label { name, .. } => {
                declared.insert(name.clone());
            }
            StreamOp::Op { flip, jump, .. } => {
                flip.collect_labels(&mut used);
                jump.collect_labels(&mut used);
            }
            StreamOp::WordFlip {
                word_address,
                flip_value,
                return_address,
                ..
            } => {
                word_address.collect_labels(&mut used);
                flip_value.collect_labels(&mut used);
                return_address.collect_labels(&mut used);
            }
            StreamOp::Segment { start, .. } => start.collect_labels(&mut used),
            StreamOp::Reserve { bits, .. } => bits.collect_labels(&mut used),
            StreamOp::Pad { alignment, .. } => alignment.collect_labels(&mut used),
        }
    }
    used.remove("$");
    let unresolved: HashSet<String> = used.difference(&declared).cloned().collect();

    let mut warnings: Vec<String> = Vec::new();
    for (name, _) in registry.iter() {
        if !expander.called.contains(name) {
            warnings.push(format!("macro {} is never used", name));
        }
    }
    warnings.sort();

    Ok(Expansion {
        stream: expander.stream,
        arena: expander.arena,
        unresolved,
        warnings,
    })
}

/// Lexical state of one expansion level.
struct Scope {
    /// Value-param bindings, label-param aliases and hygienic locals.
    env: HashMap<String, Expr>,
    /// Unique prefix for labels declared at this level (`""` at top).
    prefix: String,
    /// Namespace of the macro being expanded, for callee lookup.
    namespace: String,
    frame: Option<FrameId>,
    depth: usize,
}

struct Expander<'a> {
    registry: &'a MacroRegistry,
    options: &'a ExpandOptions,
    arena: TraceArena,
    stream: Vec<StreamOp>,
    invocation_counter: u64,
    called: HashSet<fj_spec::MacroName>,
}

impl<'a> Expander<'a> {
    fn stack(&self, frame: Option<FrameId>) -> String {
        match frame {
            Some(id) => stack_note(&self.arena.render(id)),
            None => String::new(),
        }
    }

    fn arithmetic(&self, pos: CodePosition, frame: Option<FrameId>, source: ExprError) -> AssemblerError {
        AssemblerError::Arithmetic {
            pos,
            stack: self.stack(frame),
            source,
        }
    }

    fn eval(
        &self,
        expr: &Expr,
        scope: &Scope,
        pos: CodePosition,
    ) -> Result<Expr> {
        expr.eval_partial(&scope.env)
            .map_err(|e| self.arithmetic(pos, scope.frame, e))
    }

    fn expand_items(&mut self, items: &[Item], scope: &Scope) -> Result<()> {
        for item in items {
            self.expand_item(item, scope)?;
        }
        Ok(())
    }

    fn expand_item(&mut self, item: &Item, scope: &Scope) -> Result<()> {
        let trace = OpTrace {
            pos: item.pos(),
            frame: scope.frame,
        };
        match item {
            Item::Label { name, pos } => {
                let resolved = self.resolve_declaration(name, scope, *pos)?;
                self.stream.push(StreamOp::Label {
                    name: resolved,
                    trace,
                });
            }
            Item::FlipJump { flip, jump, pos } => {
                let flip = self.eval(flip, scope, *pos)?;
                let jump = self.eval(jump, scope, *pos)?;
                self.stream.push(StreamOp::Op { flip, jump, trace });
            }
            Item::WordFlip {
                word_address,
                flip_value,
                return_address,
                pos,
            } => {
                let word_address = self.eval(word_address, scope, *pos)?;
                let flip_value = self.eval(flip_value, scope, *pos)?;
                let return_address = self.eval(return_address, scope, *pos)?;
                self.stream.push(StreamOp::WordFlip {
                    word_address,
                    flip_value,
                    return_address,
                    trace,
                });
            }
            Item::Text { bytes, pos } => self.expand_text(bytes, *pos, trace),
            Item::Segment { start, pos } => {
                let start = self.eval(start, scope, *pos)?;
                self.stream.push(StreamOp::Segment { start, trace });
            }
            Item::Reserve { bits, pos } => {
                let bits = self.eval(bits, scope, *pos)?;
                self.stream.push(StreamOp::Reserve { bits, trace });
            }
            Item::Pad { alignment, pos } => {
                let alignment = self.eval(alignment, scope, *pos)?;
                self.stream.push(StreamOp::Pad { alignment, trace });
            }
            Item::MacroCall(call) => self.expand_call(call, scope, None)?,
            Item::Rep {
                times,
                iterator,
                call,
                pos,
            } => {
                let count = self.rep_count(times, scope, *pos)?;
                for i in 0..count {
                    self.expand_call(call, scope, Some((iterator.as_str(), i, count)))?;
                }
            }
            Item::RepOp {
                times,
                iterator,
                flip,
                jump,
                pos,
            } => {
                let count = self.rep_count(times, scope, *pos)?;
                for i in 0..count {
                    let mut env = scope.env.clone();
                    env.insert(iterator.clone(), Expr::num(i));
                    let flip = flip
                        .eval_partial(&env)
                        .map_err(|e| self.arithmetic(*pos, scope.frame, e))?;
                    let jump = jump
                        .eval_partial(&env)
                        .map_err(|e| self.arithmetic(*pos, scope.frame, e))?;
                    self.stream.push(StreamOp::Op { flip, jump, trace });
                }
            }
        }
        Ok(())
    }

    /// A declared label is either renamed to a caller label (an aliased
    /// parameter) or already bound to its hygienic local name.
    fn resolve_declaration(
        &self,
        name: &str,
        scope: &Scope,
        pos: CodePosition,
    ) -> Result<String> {
        match scope.env.get(name) {
            None => Ok(name.to_string()),
            Some(Expr::Label(aliased)) => Ok(aliased.clone()),
            Some(other) => Err(AssemblerError::SyntaxError {
                pos,
                message: format!(
                    "label \"{}\" can't be declared here: it is bound to the non-label value {}{}",
                    name,
                    other,
                    self.stack(scope.frame)
                ),
            }),
        }
    }

    /// Lower a string literal to one IO-flipping op per bit, bytes in
    /// order, bits LSB-first.
    fn expand_text(&mut self, bytes: &[u8], _pos: CodePosition, trace: OpTrace) {
        for &byte in bytes {
            for bit in 0..8 {
                let value = (byte >> bit) & 1;
                self.stream.push(StreamOp::Op {
                    flip: Expr::binary(
                        fj_spec::expr::BinaryOp::Add,
                        Expr::label("IO"),
                        Expr::num(value),
                    ),
                    jump: Expr::label("$"),
                    trace,
                });
            }
        }
    }

    fn rep_count(&self, times: &Expr, scope: &Scope, pos: CodePosition) -> Result<u64> {
        let folded = self.eval(times, scope, pos)?;
        let value = match folded.as_const() {
            Some(value) => value,
            None => {
                return Err(AssemblerError::UnresolvedRepCount {
                    pos,
                    expr: folded.to_string(),
                    stack: self.stack(scope.frame),
                })
            }
        };
        if value.is_negative() {
            return Err(AssemblerError::UnresolvedRepCount {
                pos,
                expr: format!("{} (negative)", value),
                stack: self.stack(scope.frame),
            });
        }
        value.to_u64().ok_or_else(|| AssemblerError::UnresolvedRepCount {
            pos,
            expr: format!("{} (too large)", value),
            stack: self.stack(scope.frame),
        })
    }

    fn expand_call(
        &mut self,
        call: &MacroCall,
        scope: &Scope,
        rep: Option<(&str, u64, u64)>,
    ) -> Result<()> {
        // Arguments evaluate in the caller's scope; the rep iterator is
        // bound per iteration.
        let mut caller_env = scope.env.clone();
        if let Some((iterator, index, _)) = rep {
            caller_env.insert(iterator.to_string(), Expr::num(index));
        }
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(
                arg.eval_partial(&caller_env)
                    .map_err(|e| self.arithmetic(call.pos, scope.frame, e))?,
            );
        }

        // Lookup walks the call site's namespace chain, then the
        // defining macro's.
        let def = self
            .registry
            .lookup(&call.name, args.len(), &call.namespace)
            .or_else(|| self.registry.lookup(&call.name, args.len(), &scope.namespace));
        let def = match def {
            Some(def) => def,
            None => {
                let arities = self.registry.arities_of(&call.name, &call.namespace);
                if arities.is_empty() {
                    return Err(AssemblerError::UndefinedMacro {
                        pos: call.pos,
                        name: call.name.clone(),
                        stack: self.stack(scope.frame),
                    });
                }
                let available = arities
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(" or ");
                return Err(AssemblerError::MacroArityMismatch {
                    pos: call.pos,
                    name: call.name.clone(),
                    given: args.len(),
                    available: format!("{} arguments", available),
                    stack: self.stack(scope.frame),
                });
            }
        };
        self.called.insert(def.name.clone());

        let description = match rep {
            Some((iterator, index, count)) => format!(
                "rep({}={}, out of 0..{}) macro {}  ({})",
                iterator,
                index,
                count.saturating_sub(1),
                def.name,
                call.pos
            ),
            None => format!("macro {} ({})", def.name, call.pos),
        };
        let frame = self.arena.push(scope.frame, description, call.pos);

        if scope.depth + 1 > self.options.max_recursion_depth {
            return Err(AssemblerError::MacroRecursion {
                depth: self.options.max_recursion_depth,
                stack: self.arena.render(frame).join("\n"),
            });
        }

        self.invocation_counter += 1;
        let invocation = self.invocation_counter;
        let prefix = if scope.prefix.is_empty() {
            format!("{}.{}", def.name.name, invocation)
        } else {
            format!("{}.{}.{}", scope.prefix, def.name.name, invocation)
        };

        let env = self.bind_params(def, &args, &prefix, call.pos, scope.frame)?;
        let callee_scope = Scope {
            env,
            prefix,
            namespace: def.namespace.clone(),
            frame: Some(frame),
            depth: scope.depth + 1,
        };
        self.expand_items(&def.body, &callee_scope)
    }

    /// Build the callee environment: parameters bound to arguments,
    /// every other label declared in the body bound to a fresh hygienic
    /// name.
    fn bind_params(
        &self,
        def: &MacroDef,
        args: &[Expr],
        prefix: &str,
        pos: CodePosition,
        frame: Option<FrameId>,
    ) -> Result<HashMap<String, Expr>> {
        let mut env: HashMap<String, Expr> = HashMap::new();
        for (param, arg) in def.param_names().zip(args.iter()) {
            env.insert(param.clone(), arg.clone());
        }
        // Label parameters must actually receive labels.
        for (param, arg) in def
            .param_names()
            .zip(args.iter())
            .skip(def.value_params.len())
        {
            if !matches!(arg, Expr::Label(_)) {
                return Err(AssemblerError::SyntaxError {
                    pos,
                    message: format!(
                        "label parameter \"{}\" of macro {} got the non-label argument {}{}",
                        param,
                        def.name,
                        arg,
                        self.stack(frame)
                    ),
                });
            }
        }
        // Qualified aliases, so a body written inside `ns x` can say
        // `.param` as well.
        if !def.namespace.is_empty() {
            let qualified: Vec<(String, Expr)> = env
                .iter()
                .map(|(k, v)| (format!("{}.{}", def.namespace, k), v.clone()))
                .collect();
            env.extend(qualified);
        }
        // Hygienic locals for declared labels that aren't parameters.
        let mut declared = HashSet::new();
        collect_declared_labels(&def.body, &mut declared);
        for name in declared {
            env.entry(name.clone())
                .or_insert_with(|| Expr::label(format!("{}.{}", prefix, name)));
        }
        Ok(env)
    }
}

fn collect_declared_labels(items: &[Item], out: &mut HashSet<String>) {
    for item in items {
        if let Item::Label { name, .. } = item {
            out.insert(name.clone());
        }
    }
}
