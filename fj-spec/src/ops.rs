//! Parsed-op and expanded-stream models.
//!
//! [`Item`] is what the parser produces (and what macro bodies hold).
//! [`StreamOp`] is what the preprocessor emits after expansion: a flat
//! stream the assembler can place and resolve in two passes.

use std::collections::HashMap;
use std::fmt;

use crate::expr::Expr;
use crate::position::{CodePosition, FrameId};

/// A macro is identified by its name and arity together; `zero(1)` and
/// `zero(2)` are different macros.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacroName {
    pub name: String,
    pub arity: usize,
}

impl MacroName {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        MacroName {
            name: name.into(),
            arity,
        }
    }
}

impl fmt::Display for MacroName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arity == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}({})", self.name, self.arity)
        }
    }
}

/// A macro invocation as written: `name arg, arg, ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroCall {
    /// Name as written (possibly dotted); resolved against the caller's
    /// namespace chain at expansion time.
    pub name: String,
    pub args: Vec<Expr>,
    /// Namespace in force at the call site (`""` at file scope).
    pub namespace: String,
    pub pos: CodePosition,
}

impl MacroCall {
    pub fn macro_name(&self) -> MacroName {
        MacroName::new(self.name.clone(), self.args.len())
    }
}

/// One parsed statement, either at top level or inside a macro body.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// The primitive `a;b`. Omitted parts are already defaulted by the
    /// parser: a missing flip is `0`, a missing jump is `$`.
    FlipJump {
        flip: Expr,
        jump: Expr,
        pos: CodePosition,
    },
    /// `wflip addr, value [, ret]`: flip every set bit of `value` in the
    /// word at `addr`, then jump to `ret`.
    WordFlip {
        word_address: Expr,
        flip_value: Expr,
        return_address: Expr,
        pos: CodePosition,
    },
    /// `name:`
    Label { name: String, pos: CodePosition },
    /// `name arg, ...`
    MacroCall(MacroCall),
    /// `rep(n, i) name arg, ...`
    Rep {
        times: Expr,
        iterator: String,
        call: MacroCall,
        pos: CodePosition,
    },
    /// `rep(n, i) a;b` — repeat a bare op.
    RepOp {
        times: Expr,
        iterator: String,
        flip: Expr,
        jump: Expr,
        pos: CodePosition,
    },
    /// `segment expr`: continue placement at a new (w-aligned) address.
    Segment { start: Expr, pos: CodePosition },
    /// `reserve expr`: skip the given number of zero bits.
    Reserve { bits: Expr, pos: CodePosition },
    /// `pad expr`: insert zero ops until the address is a multiple of
    /// `expr` ops.
    Pad { alignment: Expr, pos: CodePosition },
    /// `"..."`: emit the bytes through the IO port, bit by bit.
    Text { bytes: Vec<u8>, pos: CodePosition },
}

impl Item {
    pub fn pos(&self) -> CodePosition {
        match self {
            Item::FlipJump { pos, .. }
            | Item::WordFlip { pos, .. }
            | Item::Label { pos, .. }
            | Item::Rep { pos, .. }
            | Item::RepOp { pos, .. }
            | Item::Segment { pos, .. }
            | Item::Reserve { pos, .. }
            | Item::Pad { pos, .. }
            | Item::Text { pos, .. } => *pos,
            Item::MacroCall(call) => call.pos,
        }
    }
}

/// A macro definition: value parameters, label parameters and a body.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroDef {
    /// Fully-qualified name (namespace prefix applied) plus arity.
    pub name: MacroName,
    /// Parameters passed by expression.
    pub value_params: Vec<String>,
    /// `<`-parameters: labels the macro consumes from its caller.
    pub in_labels: Vec<String>,
    /// `>`-parameters: labels the macro declares on its caller's behalf.
    pub out_labels: Vec<String>,
    pub body: Vec<Item>,
    /// Namespace the macro was defined in (`""` at file scope).
    pub namespace: String,
    pub pos: CodePosition,
}

impl MacroDef {
    /// All parameter names in call order: values, then ins, then outs.
    pub fn param_names(&self) -> impl Iterator<Item = &String> {
        self.value_params
            .iter()
            .chain(self.in_labels.iter())
            .chain(self.out_labels.iter())
    }

    pub fn arity(&self) -> usize {
        self.value_params.len() + self.in_labels.len() + self.out_labels.len()
    }
}

/// Registry of macro definitions keyed by `(name, arity)`.
///
/// Lookup tries the call name as written first (it may already be fully
/// qualified), then walks the caller's namespace chain from innermost to
/// outermost.
#[derive(Debug, Clone, Default)]
pub struct MacroRegistry {
    macros: HashMap<MacroName, MacroDef>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        MacroRegistry {
            macros: HashMap::new(),
        }
    }

    /// Insert a definition. On a duplicate `(name, arity)` the existing
    /// definition is returned and the registry is unchanged.
    pub fn insert(&mut self, def: MacroDef) -> Result<(), &MacroDef> {
        match self.macros.entry(def.name.clone()) {
            std::collections::hash_map::Entry::Occupied(slot) => Err(slot.into_mut()),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(def);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &MacroName) -> Option<&MacroDef> {
        self.macros.get(name)
    }

    /// Resolve a call against the caller's namespace chain.
    pub fn lookup(&self, call_name: &str, arity: usize, caller_namespace: &str) -> Option<&MacroDef> {
        let direct = MacroName::new(call_name, arity);
        if let Some(def) = self.macros.get(&direct) {
            return Some(def);
        }
        let mut ns = caller_namespace;
        loop {
            if !ns.is_empty() {
                let qualified = MacroName::new(format!("{}.{}", ns, call_name), arity);
                if let Some(def) = self.macros.get(&qualified) {
                    return Some(def);
                }
            }
            match ns.rfind('.') {
                Some(dot) => ns = &ns[..dot],
                None if !ns.is_empty() => ns = "",
                None => return None,
            }
        }
    }

    /// Arities registered under a simple or qualified name, for
    /// arity-mismatch diagnostics.
    pub fn arities_of(&self, call_name: &str, caller_namespace: &str) -> Vec<usize> {
        let mut arities: Vec<usize> = self
            .macros
            .keys()
            .filter(|key| {
                if key.name == call_name {
                    return true;
                }
                let mut ns = caller_namespace.to_string();
                while !ns.is_empty() {
                    if key.name == format!("{}.{}", ns, call_name) {
                        return true;
                    }
                    ns = match ns.rfind('.') {
                        Some(dot) => ns[..dot].to_string(),
                        None => String::new(),
                    };
                }
                false
            })
            .map(|key| key.arity)
            .collect();
        arities.sort_unstable();
        arities.dedup();
        arities
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MacroName, &MacroDef)> {
        self.macros.iter()
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

/// Where an expanded op came from: its source position plus the macro
/// invocation chain that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTrace {
    pub pos: CodePosition,
    pub frame: Option<FrameId>,
}

/// One item of the preprocessor's flat output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOp {
    /// A primitive op awaiting placement and resolution.
    Op {
        flip: Expr,
        jump: Expr,
        trace: OpTrace,
    },
    /// A `wflip`, lowered by the assembler into one op plus an optional
    /// chain in the segment's wflip area.
    WordFlip {
        word_address: Expr,
        flip_value: Expr,
        return_address: Expr,
        trace: OpTrace,
    },
    /// Binds a (fully-qualified, hygienic) label to the next op address.
    Label { name: String, trace: OpTrace },
    Segment { start: Expr, trace: OpTrace },
    Reserve { bits: Expr, trace: OpTrace },
    Pad { alignment: Expr, trace: OpTrace },
}

impl StreamOp {
    pub fn trace(&self) -> OpTrace {
        match self {
            StreamOp::Op { trace, .. }
            | StreamOp::WordFlip { trace, .. }
            | StreamOp::Label { trace, .. }
            | StreamOp::Segment { trace, .. }
            | StreamOp::Reserve { trace, .. }
            | StreamOp::Pad { trace, .. } => *trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> CodePosition {
        CodePosition::new(0, 1, 1)
    }

    fn def(name: &str, arity: usize, namespace: &str) -> MacroDef {
        MacroDef {
            name: MacroName::new(name, arity),
            value_params: (0..arity).map(|i| format!("p{}", i)).collect(),
            in_labels: vec![],
            out_labels: vec![],
            body: vec![],
            namespace: namespace.to_string(),
            pos: pos(),
        }
    }

    #[test]
    fn test_macro_name_display() {
        assert_eq!(MacroName::new("startup", 0).to_string(), "startup");
        assert_eq!(MacroName::new("bit.xor", 2).to_string(), "bit.xor(2)");
    }

    #[test]
    fn test_registry_duplicate_rejected() {
        let mut registry = MacroRegistry::new();
        assert!(registry.insert(def("m", 1, "")).is_ok());
        assert!(registry.insert(def("m", 1, "")).is_err());
        // Same name at another arity is a different macro.
        assert!(registry.insert(def("m", 2, "")).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_lookup_direct_name_first() {
        let mut registry = MacroRegistry::new();
        registry.insert(def("bit.flip", 1, "bit")).unwrap();
        let found = registry.lookup("bit.flip", 1, "").unwrap();
        assert_eq!(found.name.name, "bit.flip");
    }

    #[test]
    fn test_lookup_walks_namespace_chain() {
        let mut registry = MacroRegistry::new();
        registry.insert(def("bit.math.add", 2, "bit.math")).unwrap();
        registry.insert(def("add", 2, "")).unwrap();

        // From inside bit.math, the qualified one wins... after the
        // direct name: "add" resolves at file scope first.
        let found = registry.lookup("add", 2, "bit.math").unwrap();
        assert_eq!(found.name.name, "add");

        // A name only defined in the namespace resolves via the chain.
        registry.insert(def("bit.math.mul", 2, "bit.math")).unwrap();
        let found = registry.lookup("mul", 2, "bit.math").unwrap();
        assert_eq!(found.name.name, "bit.math.mul");
    }

    #[test]
    fn test_lookup_missing() {
        let registry = MacroRegistry::new();
        assert!(registry.lookup("ghost", 0, "a.b").is_none());
    }

    #[test]
    fn test_arities_for_diagnostics() {
        let mut registry = MacroRegistry::new();
        registry.insert(def("m", 1, "")).unwrap();
        registry.insert(def("m", 3, "")).unwrap();
        assert_eq!(registry.arities_of("m", ""), vec![1, 3]);
        assert!(registry.arities_of("other", "").is_empty());
    }

    #[test]
    fn test_macro_def_param_order() {
        let def = MacroDef {
            name: MacroName::new("io_bit", 3),
            value_params: vec!["v".into()],
            in_labels: vec!["src".into()],
            out_labels: vec!["done".into()],
            body: vec![],
            namespace: String::new(),
            pos: pos(),
        };
        let names: Vec<&String> = def.param_names().collect();
        assert_eq!(names, ["v", "src", "done"]);
        assert_eq!(def.arity(), 3);
    }
}
