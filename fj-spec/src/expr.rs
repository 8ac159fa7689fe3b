//! Symbolic arithmetic expressions over integers and label names.
//!
//! Expressions stay symbolic through parsing and macro expansion; the
//! assembler resolves them to concrete integers once every label has an
//! address. All arithmetic is arbitrary-precision until final emission,
//! where values are narrowed modulo `2^w`. Division truncates toward
//! zero and modulo follows the sign of the dividend.

use std::collections::{HashMap, HashSet};
use std::fmt;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::ExprError;

/// Largest accepted shift amount. Shifting further than this is always a
/// mistake in a program whose addresses fit 64 bits.
const MAX_SHIFT: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation `-e`.
    Neg,
    /// Bitwise not `~e` (two's complement, infinite precision).
    Not,
    /// Bit-length `#e` (number of bits in the magnitude).
    BitLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        }
    }
}

/// A symbolic expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(BigInt),
    Label(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn num(value: impl Into<BigInt>) -> Expr {
        Expr::Const(value.into())
    }

    pub fn label(name: impl Into<String>) -> Expr {
        Expr::Label(name.into())
    }

    pub fn unary(op: UnaryOp, e: Expr) -> Expr {
        Expr::Unary(op, Box::new(e))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn ternary(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
    }

    pub fn as_const(&self) -> Option<&BigInt> {
        match self {
            Expr::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Const(_))
    }

    /// Collect every label name referenced (recursively) by this expression.
    pub fn collect_labels(&self, out: &mut HashSet<String>) {
        match self {
            Expr::Const(_) => {}
            Expr::Label(name) => {
                out.insert(name.clone());
            }
            Expr::Unary(_, e) => e.collect_labels(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_labels(out);
                rhs.collect_labels(out);
            }
            Expr::Ternary(cond, then, otherwise) => {
                cond.collect_labels(out);
                then.collect_labels(out);
                otherwise.collect_labels(out);
            }
        }
    }

    pub fn unknown_labels(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_labels(&mut out);
        out
    }

    /// Substitute every label bound in `env` and fold what folds.
    ///
    /// Labels missing from `env` are kept symbolic; the result is as
    /// small as the available bindings allow. Substituted values are
    /// themselves folded, so an env of symbolic sums still shrinks.
    pub fn eval_partial(&self, env: &HashMap<String, Expr>) -> Result<Expr, ExprError> {
        match self {
            Expr::Const(v) => Ok(Expr::Const(v.clone())),
            Expr::Label(name) => match env.get(name) {
                Some(bound) => bound.eval_partial(&HashMap::new()),
                None => Ok(Expr::Label(name.clone())),
            },
            Expr::Unary(op, e) => {
                let e = e.eval_partial(env)?;
                match e.as_const() {
                    Some(v) => Ok(Expr::Const(self.apply_unary(*op, v)?)),
                    None => Ok(Expr::unary(*op, e)),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval_partial(env)?;
                let rhs = rhs.eval_partial(env)?;
                match (lhs.as_const(), rhs.as_const()) {
                    (Some(a), Some(b)) => Ok(Expr::Const(self.apply_binary(*op, a, b)?)),
                    _ => Ok(Expr::binary(*op, lhs, rhs)),
                }
            }
            Expr::Ternary(cond, then, otherwise) => {
                let cond = cond.eval_partial(env)?;
                match cond.as_const() {
                    Some(c) => {
                        if !c.is_zero() {
                            then.eval_partial(env)
                        } else {
                            otherwise.eval_partial(env)
                        }
                    }
                    None => Ok(Expr::ternary(
                        cond,
                        then.eval_partial(env)?,
                        otherwise.eval_partial(env)?,
                    )),
                }
            }
        }
    }

    /// Resolve this expression to a concrete integer.
    ///
    /// `lookup` supplies label values (the assembler's label table plus
    /// the per-op `$` binding). Any label it cannot supply is an
    /// [`ExprError::UnresolvedLabel`].
    pub fn resolve<F>(&self, lookup: &F) -> Result<BigInt, ExprError>
    where
        F: Fn(&str) -> Option<BigInt>,
    {
        match self {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Label(name) => lookup(name).ok_or_else(|| ExprError::UnresolvedLabel {
                name: name.clone(),
            }),
            Expr::Unary(op, e) => {
                let v = e.resolve(lookup)?;
                self.apply_unary(*op, &v)
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.resolve(lookup)?;
                let b = rhs.resolve(lookup)?;
                self.apply_binary(*op, &a, &b)
            }
            Expr::Ternary(cond, then, otherwise) => {
                if !cond.resolve(lookup)?.is_zero() {
                    then.resolve(lookup)
                } else {
                    otherwise.resolve(lookup)
                }
            }
        }
    }

    fn apply_unary(&self, op: UnaryOp, v: &BigInt) -> Result<BigInt, ExprError> {
        Ok(match op {
            UnaryOp::Neg => -v,
            UnaryOp::Not => !v.clone(),
            UnaryOp::BitLength => BigInt::from(v.abs().bits()),
        })
    }

    fn apply_binary(&self, op: BinaryOp, a: &BigInt, b: &BigInt) -> Result<BigInt, ExprError> {
        let bool_int = |c: bool| BigInt::from(if c { 1 } else { 0 });
        Ok(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b.is_zero() {
                    return Err(ExprError::DivisionByZero {
                        expr: self.to_string(),
                    });
                }
                a / b
            }
            BinaryOp::Mod => {
                if b.is_zero() {
                    return Err(ExprError::DivisionByZero {
                        expr: self.to_string(),
                    });
                }
                a % b
            }
            BinaryOp::Shl => a << self.shift_amount(b)?,
            BinaryOp::Shr => a >> self.shift_amount(b)?,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Lt => bool_int(a < b),
            BinaryOp::Gt => bool_int(a > b),
            BinaryOp::Le => bool_int(a <= b),
            BinaryOp::Ge => bool_int(a >= b),
            BinaryOp::Eq => bool_int(a == b),
            BinaryOp::Ne => bool_int(a != b),
        })
    }

    fn shift_amount(&self, b: &BigInt) -> Result<u64, ExprError> {
        match b.to_u64() {
            Some(n) if n <= MAX_SHIFT => Ok(n),
            _ => Err(ExprError::BadShift {
                expr: self.to_string(),
            }),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Label(name) => write!(f, "{}", name),
            Expr::Unary(op, e) => match op {
                UnaryOp::Neg => write!(f, "(-{})", e),
                UnaryOp::Not => write!(f, "(~{})", e),
                UnaryOp::BitLength => write!(f, "(#{})", e),
            },
            Expr::Binary(op, lhs, rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Ternary(cond, then, otherwise) => {
                write!(f, "({} ? {} : {})", cond, then, otherwise)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, Expr)]) -> HashMap<String, Expr> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn resolve_with(e: &Expr, pairs: &[(&str, i64)]) -> Result<BigInt, ExprError> {
        let table: HashMap<String, BigInt> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), BigInt::from(*v)))
            .collect();
        e.resolve(&|name| table.get(name).cloned())
    }

    #[test]
    fn test_constant_folding() {
        let e = Expr::binary(BinaryOp::Add, Expr::num(2), Expr::num(3));
        let folded = e.eval_partial(&HashMap::new()).unwrap();
        assert_eq!(folded, Expr::num(5));
    }

    #[test]
    fn test_partial_keeps_unknown_labels() {
        let e = Expr::binary(BinaryOp::Add, Expr::label("start"), Expr::num(3));
        let folded = e.eval_partial(&env(&[("other", Expr::num(1))])).unwrap();
        assert_eq!(folded, Expr::binary(BinaryOp::Add, Expr::label("start"), Expr::num(3)));
        assert!(folded.unknown_labels().contains("start"));
    }

    #[test]
    fn test_substitution_folds_bound_values() {
        let e = Expr::binary(BinaryOp::Mul, Expr::label("n"), Expr::num(4));
        let folded = e
            .eval_partial(&env(&[(
                "n",
                Expr::binary(BinaryOp::Add, Expr::num(1), Expr::num(2)),
            )]))
            .unwrap();
        assert_eq!(folded, Expr::num(12));
    }

    #[test]
    fn test_label_to_label_substitution() {
        let e = Expr::label("inner");
        let folded = e
            .eval_partial(&env(&[("inner", Expr::label("caller.target"))]))
            .unwrap();
        assert_eq!(folded, Expr::label("caller.target"));
    }

    #[test]
    fn test_division_truncates_toward_zero() {
        let e = Expr::binary(BinaryOp::Div, Expr::num(-7), Expr::num(2));
        assert_eq!(resolve_with(&e, &[]).unwrap(), BigInt::from(-3));
    }

    #[test]
    fn test_modulo_follows_dividend_sign() {
        let e = Expr::binary(BinaryOp::Mod, Expr::num(-7), Expr::num(2));
        assert_eq!(resolve_with(&e, &[]).unwrap(), BigInt::from(-1));
    }

    #[test]
    fn test_division_by_zero() {
        let e = Expr::binary(BinaryOp::Div, Expr::num(1), Expr::num(0));
        assert!(matches!(
            resolve_with(&e, &[]),
            Err(ExprError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_unresolved_label() {
        let e = Expr::label("nowhere");
        assert!(matches!(
            resolve_with(&e, &[]),
            Err(ExprError::UnresolvedLabel { name }) if name == "nowhere"
        ));
    }

    #[test]
    fn test_unary_operators() {
        assert_eq!(
            resolve_with(&Expr::unary(UnaryOp::Neg, Expr::num(5)), &[]).unwrap(),
            BigInt::from(-5)
        );
        assert_eq!(
            resolve_with(&Expr::unary(UnaryOp::Not, Expr::num(0)), &[]).unwrap(),
            BigInt::from(-1)
        );
        // bit-length: 64 needs 7 bits, 0 needs none
        assert_eq!(
            resolve_with(&Expr::unary(UnaryOp::BitLength, Expr::num(64)), &[]).unwrap(),
            BigInt::from(7)
        );
        assert_eq!(
            resolve_with(&Expr::unary(UnaryOp::BitLength, Expr::num(0)), &[]).unwrap(),
            BigInt::from(0)
        );
    }

    #[test]
    fn test_shifts() {
        let e = Expr::binary(BinaryOp::Shl, Expr::num(1), Expr::num(20));
        assert_eq!(resolve_with(&e, &[]).unwrap(), BigInt::from(1 << 20));

        let e = Expr::binary(BinaryOp::Shr, Expr::num(-8), Expr::num(1));
        assert_eq!(resolve_with(&e, &[]).unwrap(), BigInt::from(-4));

        let e = Expr::binary(BinaryOp::Shl, Expr::num(1), Expr::num(-1));
        assert!(matches!(resolve_with(&e, &[]), Err(ExprError::BadShift { .. })));
    }

    #[test]
    fn test_comparisons_yield_zero_one() {
        let lt = Expr::binary(BinaryOp::Lt, Expr::num(1), Expr::num(2));
        let ge = Expr::binary(BinaryOp::Ge, Expr::num(1), Expr::num(2));
        assert_eq!(resolve_with(&lt, &[]).unwrap(), BigInt::from(1));
        assert_eq!(resolve_with(&ge, &[]).unwrap(), BigInt::from(0));
    }

    #[test]
    fn test_ternary_takes_only_one_branch() {
        // The untaken branch would divide by zero.
        let e = Expr::ternary(
            Expr::num(0),
            Expr::binary(BinaryOp::Div, Expr::num(1), Expr::num(0)),
            Expr::num(9),
        );
        assert_eq!(resolve_with(&e, &[]).unwrap(), BigInt::from(9));
    }

    #[test]
    fn test_resolve_with_labels() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::label("base"),
            Expr::binary(BinaryOp::Mul, Expr::label("i"), Expr::num(128)),
        );
        assert_eq!(
            resolve_with(&e, &[("base", 1024), ("i", 3)]).unwrap(),
            BigInt::from(1024 + 3 * 128)
        );
    }

    #[test]
    fn test_display_round_trips_shape() {
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::label("a"),
            Expr::unary(UnaryOp::BitLength, Expr::label("w")),
        );
        assert_eq!(e.to_string(), "(a + (#w))");
    }
}
