//! Recursive-descent parser for `.fj` source files.
//!
//! Produces the top-level item list ("main" body) plus the macro
//! registry. Namespaces, constant definitions and includes are handled
//! here; macro bodies are stored unexpanded for the preprocessor.
//!
//! Each file is parsed once: an `include` adds the named file to the
//! program (its top-level items land ahead of the including file's, in
//! dependency order) and repeated includes of the same file are no-ops,
//! so include cycles terminate.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use num_bigint::BigInt;

use fj_spec::expr::{BinaryOp, UnaryOp};
use fj_spec::ops::MacroCall;
use fj_spec::{CodePosition, Expr, FileId, Item, MacroDef, MacroName, MacroRegistry, SourceMap};

use crate::error::{AssemblerError, Result};
use crate::lexer::{Lexer, SpannedToken, Token};

/// Everything the parse stage hands to the preprocessor.
#[derive(Debug)]
pub struct ParseOutput {
    /// Top-level items of all files, in inclusion order.
    pub main: Vec<Item>,
    pub registry: MacroRegistry,
    pub source_map: SourceMap,
    pub warnings: Vec<String>,
}

/// Parse `.fj` files from disk, following `include`s.
pub fn parse_files(paths: &[PathBuf], width: u32) -> Result<ParseOutput> {
    let mut ctx = ParseContext::new(width);
    for path in paths {
        let pos = CodePosition::new(0, 0, 0);
        ctx.parse_path(path, pos)?;
    }
    Ok(ctx.finish())
}

/// Parse in-memory named sources, in order. `include`s resolve against
/// the current directory.
pub fn parse_sources(sources: &[(&str, &str)], width: u32) -> Result<ParseOutput> {
    let mut ctx = ParseContext::new(width);
    for (name, text) in sources {
        let file = ctx.source_map.add_file(*name);
        let items = parse_one_file(&mut ctx, file, text, None)?;
        ctx.main.extend(items);
    }
    Ok(ctx.finish())
}

/// Parse a single in-memory source.
pub fn parse_source(name: &str, text: &str, width: u32) -> Result<ParseOutput> {
    parse_sources(&[(name, text)], width)
}

struct ParseContext {
    registry: MacroRegistry,
    defs: HashMap<String, Expr>,
    source_map: SourceMap,
    included: HashSet<PathBuf>,
    warnings: Vec<String>,
    main: Vec<Item>,
}

impl ParseContext {
    fn new(width: u32) -> Self {
        let mut defs = HashMap::new();
        defs.insert("w".to_string(), Expr::num(width));
        ParseContext {
            registry: MacroRegistry::new(),
            defs,
            source_map: SourceMap::new(),
            included: HashSet::new(),
            warnings: Vec::new(),
            main: Vec::new(),
        }
    }

    fn parse_path(&mut self, path: &Path, pos: CodePosition) -> Result<()> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !self.included.insert(canonical) {
            return Ok(());
        }
        let text = fs::read_to_string(path).map_err(|e| AssemblerError::IncludeError {
            pos,
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        let file = self.source_map.add_file(path.display().to_string());
        let base_dir = path.parent().map(Path::to_path_buf);
        let items = parse_one_file(self, file, &text, base_dir)?;
        self.main.extend(items);
        Ok(())
    }

    fn finish(self) -> ParseOutput {
        ParseOutput {
            main: self.main,
            registry: self.registry,
            source_map: self.source_map,
            warnings: self.warnings,
        }
    }
}

fn parse_one_file(
    ctx: &mut ParseContext,
    file: FileId,
    text: &str,
    base_dir: Option<PathBuf>,
) -> Result<Vec<Item>> {
    let tokens = Lexer::new(text, file).tokenize()?;
    let mut parser = Parser {
        tokens,
        index: 0,
        base_dir,
        namespace: Vec::new(),
        ctx,
    };
    parser.parse_items(false, true)
}

struct Parser<'a> {
    tokens: Vec<SpannedToken>,
    index: usize,
    base_dir: Option<PathBuf>,
    namespace: Vec<String>,
    ctx: &'a mut ParseContext,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.index].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.index + offset)
            .map(|spanned| &spanned.token)
            .unwrap_or(&Token::Eof)
    }

    fn pos(&self) -> CodePosition {
        self.tokens[self.index].pos
    }

    fn bump(&mut self) -> SpannedToken {
        let spanned = self.tokens[self.index].clone();
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
        spanned
    }

    fn error(&self, message: impl Into<String>) -> AssemblerError {
        AssemblerError::SyntaxError {
            pos: self.pos(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, context: &str) -> Result<SpannedToken> {
        if *self.peek() == expected {
            Ok(self.bump())
        } else {
            Err(self.error(format!(
                "expected {} {}, got {}",
                expected,
                context,
                self.peek()
            )))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<(String, CodePosition)> {
        match self.peek().clone() {
            Token::Ident(name) => {
                let pos = self.bump().pos;
                Ok((name, pos))
            }
            other => Err(self.error(format!("expected identifier {}, got {}", context, other))),
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof | Token::RBrace)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.bump();
        }
    }

    fn namespace_string(&self) -> String {
        self.namespace.join(".")
    }

    /// Qualify a declared name with the current namespace.
    fn ns_full_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.namespace_string(), name)
        }
    }

    /// Resolve a (possibly leading-dotted) reference against the current
    /// namespace: `.x` is the current namespace's `x`, each extra dot
    /// steps one level out.
    fn resolve_reference(&self, name: &str, pos: CodePosition) -> Result<String> {
        let stripped = name.trim_start_matches('.');
        let dots = name.len() - stripped.len();
        if dots == 0 {
            return Ok(name.to_string());
        }
        if dots - 1 > self.namespace.len() {
            return Err(AssemblerError::SyntaxError {
                pos,
                message: format!(
                    "used more leading dots than the namespace depth ({} > {})",
                    dots - 1,
                    self.namespace.len()
                ),
            });
        }
        let keep = self.namespace.len() - (dots - 1);
        let mut parts: Vec<&str> = self.namespace[..keep].iter().map(String::as_str).collect();
        parts.push(stripped);
        Ok(parts.join("."))
    }

    // ========== items ==========

    /// Parse items until `}` (inside a block) or end of file.
    fn parse_items(&mut self, in_block: bool, allow_defs: bool) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Token::Eof => {
                    if in_block {
                        return Err(self.error("unexpected end of file inside a block"));
                    }
                    break;
                }
                Token::RBrace => {
                    if in_block {
                        break;
                    }
                    return Err(self.error("unexpected \"}\" outside any block"));
                }
                _ => self.parse_line(&mut items, allow_defs)?,
            }
        }
        Ok(items)
    }

    fn parse_line(&mut self, items: &mut Vec<Item>, allow_defs: bool) -> Result<()> {
        self.parse_labels(items)?;
        if !self.at_line_end() {
            self.parse_statement(items, allow_defs)?;
            self.parse_labels(items)?;
        }
        if !self.at_line_end() {
            return Err(self.error(format!("expected end of line, got {}", self.peek())));
        }
        Ok(())
    }

    fn parse_labels(&mut self, items: &mut Vec<Item>) -> Result<()> {
        while matches!(self.peek(), Token::Ident(_)) && *self.peek_at(1) == Token::Colon {
            let (name, pos) = self.expect_ident("as label name")?;
            if name.contains('.') {
                return Err(AssemblerError::SyntaxError {
                    pos,
                    message: format!("label \"{}\" can't be declared with dots", name),
                });
            }
            self.bump(); // colon
            items.push(Item::Label {
                name: self.ns_full_name(&name),
                pos,
            });
        }
        Ok(())
    }

    fn parse_statement(&mut self, items: &mut Vec<Item>, allow_defs: bool) -> Result<()> {
        match self.peek().clone() {
            Token::Def => {
                if !allow_defs {
                    return Err(self.error("macro definitions can't nest"));
                }
                self.parse_macro_def()
            }
            Token::Ns => {
                if !allow_defs {
                    return Err(self.error("namespaces can't be opened inside a macro body"));
                }
                self.parse_ns_block(items)
            }
            Token::Include => {
                if !allow_defs {
                    return Err(self.error("includes aren't allowed inside a macro body"));
                }
                self.parse_include()
            }
            Token::Rep => {
                let item = self.parse_rep()?;
                items.push(item);
                Ok(())
            }
            Token::Wflip => {
                let pos = self.bump().pos;
                let word_address = self.parse_expr()?;
                self.expect(Token::Comma, "after wflip address")?;
                let flip_value = self.parse_expr()?;
                let return_address = if *self.peek() == Token::Comma {
                    self.bump();
                    self.parse_expr()?
                } else {
                    Expr::label("$")
                };
                items.push(Item::WordFlip {
                    word_address,
                    flip_value,
                    return_address,
                    pos,
                });
                Ok(())
            }
            Token::Pad => {
                let pos = self.bump().pos;
                let alignment = self.parse_expr()?;
                items.push(Item::Pad { alignment, pos });
                Ok(())
            }
            Token::Segment => {
                let pos = self.bump().pos;
                let start = self.parse_expr()?;
                items.push(Item::Segment { start, pos });
                Ok(())
            }
            Token::Reserve => {
                let pos = self.bump().pos;
                let bits = self.parse_expr()?;
                items.push(Item::Reserve { bits, pos });
                Ok(())
            }
            Token::Str(bytes) => {
                let pos = self.bump().pos;
                items.push(Item::Text { bytes, pos });
                Ok(())
            }
            Token::Ident(_) if *self.peek_at(1) == Token::Assign => self.parse_const_def(),
            _ => {
                let item = self.parse_op_or_call()?;
                items.push(item);
                Ok(())
            }
        }
    }

    /// `a;b` in any of its four spellings, or a macro call.
    fn parse_op_or_call(&mut self) -> Result<Item> {
        let pos = self.pos();
        if *self.peek() == Token::Semicolon {
            self.bump();
            let jump = if self.at_line_end() {
                Expr::label("$")
            } else {
                self.parse_expr()?
            };
            return Ok(Item::FlipJump {
                flip: Expr::num(0),
                jump,
                pos,
            });
        }

        let first = self.parse_expr()?;
        if *self.peek() == Token::Semicolon {
            self.bump();
            let jump = if self.at_line_end() {
                Expr::label("$")
            } else {
                self.parse_expr()?
            };
            return Ok(Item::FlipJump {
                flip: first,
                jump,
                pos,
            });
        }

        // No ";": must be a macro call, so the first expression has to
        // be a bare name.
        let name = match first {
            Expr::Label(name) if name != "$" => name,
            other => {
                return Err(AssemblerError::SyntaxError {
                    pos,
                    message: format!("expected \";\" or a macro call, got expression {}", other),
                })
            }
        };
        let args = self.parse_call_args()?;
        Ok(Item::MacroCall(MacroCall {
            name,
            args,
            namespace: self.namespace_string(),
            pos,
        }))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.at_line_end() {
            return Ok(args);
        }
        args.push(self.parse_expr()?);
        while *self.peek() == Token::Comma {
            self.bump();
            args.push(self.parse_expr()?);
        }
        Ok(args)
    }

    fn parse_const_def(&mut self) -> Result<()> {
        let (name, pos) = self.expect_ident("as constant name")?;
        self.bump(); // '='
        let expr = self.parse_expr()?;
        let full_name = self.ns_full_name(&name);
        if self.ctx.defs.contains_key(&full_name) {
            return Err(AssemblerError::SyntaxError {
                pos,
                message: format!("can't redeclare the constant \"{}\"", full_name),
            });
        }
        let value = expr
            .eval_partial(&self.ctx.defs)
            .map_err(|e| AssemblerError::Arithmetic {
                pos,
                stack: String::new(),
                source: e,
            })?;
        if !value.is_const() {
            return Err(AssemblerError::SyntaxError {
                pos,
                message: format!("constant \"{}\" doesn't evaluate: {}", full_name, value),
            });
        }
        self.ctx.defs.insert(full_name, value);
        Ok(())
    }

    fn parse_ns_block(&mut self, items: &mut Vec<Item>) -> Result<()> {
        self.bump(); // 'ns'
        let (name, _) = self.expect_ident("as namespace name")?;
        self.namespace.push(name);
        self.skip_newlines();
        self.expect(Token::LBrace, "to open the namespace")?;
        let inner = self.parse_items(true, true)?;
        self.expect(Token::RBrace, "to close the namespace")?;
        self.namespace.pop();
        items.extend(inner);
        Ok(())
    }

    fn parse_include(&mut self) -> Result<()> {
        let pos = self.bump().pos;
        let bytes = match self.peek().clone() {
            Token::Str(bytes) => {
                self.bump();
                bytes
            }
            other => {
                return Err(self.error(format!("expected a quoted path after include, got {}", other)))
            }
        };
        let raw = String::from_utf8(bytes).map_err(|_| AssemblerError::IncludeError {
            pos,
            path: "<non-utf8 path>".to_string(),
            detail: "include paths must be UTF-8".to_string(),
        })?;
        let path = match &self.base_dir {
            Some(dir) => dir.join(&raw),
            None => PathBuf::from(&raw),
        };
        self.ctx.parse_path(&path, pos)
    }

    fn parse_macro_def(&mut self) -> Result<()> {
        let def_pos = self.bump().pos; // 'def'
        let (simple_name, name_pos) = self.expect_ident("as macro name")?;
        if simple_name.contains('.') {
            return Err(AssemblerError::SyntaxError {
                pos: name_pos,
                message: "macro names can't be declared with dots".to_string(),
            });
        }

        let mut value_params = Vec::new();
        while matches!(self.peek(), Token::Ident(_)) {
            let (param, _) = self.expect_ident("as parameter")?;
            value_params.push(param);
            if *self.peek() == Token::Comma {
                self.bump();
            } else {
                break;
            }
        }
        let mut in_labels = Vec::new();
        if *self.peek() == Token::Lt {
            self.bump();
            in_labels = self.parse_param_names("after \"<\"")?;
        }
        let mut out_labels = Vec::new();
        if *self.peek() == Token::Gt {
            self.bump();
            out_labels = self.parse_param_names("after \">\"")?;
        }

        let full_name = self.ns_full_name(&simple_name);
        let arity = value_params.len() + in_labels.len() + out_labels.len();
        let name = MacroName::new(full_name.clone(), arity);

        self.check_params(&value_params, &in_labels, &out_labels, &name, name_pos)?;

        self.skip_newlines();
        self.expect(Token::LBrace, "to open the macro body")?;
        let body = self.parse_items(true, false)?;
        self.expect(Token::RBrace, "to close the macro body")?;

        self.lint_params(&name, &value_params, &in_labels, &out_labels, &body);

        let def = MacroDef {
            name,
            value_params,
            in_labels,
            out_labels,
            body,
            namespace: self.namespace_string(),
            pos: def_pos,
        };
        if let Err(previous) = self.ctx.registry.insert(def) {
            return Err(AssemblerError::DuplicateMacro {
                pos: def_pos,
                name: full_name,
                previous: previous.pos,
            });
        }
        Ok(())
    }

    fn parse_param_names(&mut self, context: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        loop {
            match self.peek().clone() {
                Token::Ident(name) if !name.contains('.') => {
                    self.bump();
                    names.push(name);
                }
                other => {
                    return Err(self.error(format!("expected parameter name {}, got {}", context, other)))
                }
            }
            if *self.peek() == Token::Comma {
                self.bump();
            } else {
                break;
            }
        }
        Ok(names)
    }

    fn check_params(
        &self,
        value_params: &[String],
        in_labels: &[String],
        out_labels: &[String],
        name: &MacroName,
        pos: CodePosition,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        for param in value_params.iter().chain(in_labels).chain(out_labels) {
            if !seen.insert(param.as_str()) {
                return Err(AssemblerError::SyntaxError {
                    pos,
                    message: format!("parameter \"{}\" in macro {} is declared twice", param, name),
                });
            }
            if self.ctx.defs.contains_key(param) {
                return Err(AssemblerError::SyntaxError {
                    pos,
                    message: format!(
                        "parameter \"{}\" in macro {} is already a constant",
                        param, name
                    ),
                });
            }
        }
        Ok(())
    }

    /// Warn about parameters the body never mentions.
    fn lint_params(
        &mut self,
        name: &MacroName,
        value_params: &[String],
        in_labels: &[String],
        out_labels: &[String],
        body: &[Item],
    ) {
        let mut used = HashSet::new();
        let mut declared = HashSet::new();
        collect_body_names(body, &mut used, &mut declared);
        for param in value_params.iter().chain(in_labels).chain(out_labels) {
            if !used.contains(param) && !declared.contains(param) {
                self.ctx
                    .warnings
                    .push(format!("macro {}: unused parameter \"{}\"", name, param));
            }
        }
    }

    fn parse_rep(&mut self) -> Result<Item> {
        let pos = self.bump().pos; // 'rep'
        self.expect(Token::LParen, "after rep")?;
        let times = self.parse_expr()?;
        self.expect(Token::Comma, "after the rep count")?;
        let (iterator, _) = self.expect_ident("as the rep iterator")?;
        self.expect(Token::RParen, "after the rep iterator")?;

        if self.line_has_semicolon() {
            let (flip, jump) = self.parse_bare_op()?;
            return Ok(Item::RepOp {
                times,
                iterator,
                flip,
                jump,
                pos,
            });
        }

        let (callee, callee_pos) = match self.peek().clone() {
            Token::Ident(name) => {
                let spanned = self.bump();
                (name, spanned.pos)
            }
            other => return Err(self.error(format!("expected a macro call after rep, got {}", other))),
        };
        let args = self.parse_call_args()?;
        Ok(Item::Rep {
            times,
            iterator,
            call: MacroCall {
                name: callee,
                args,
                namespace: self.namespace_string(),
                pos: callee_pos,
            },
            pos,
        })
    }

    fn line_has_semicolon(&self) -> bool {
        for spanned in &self.tokens[self.index..] {
            match spanned.token {
                Token::Semicolon => return true,
                Token::Newline | Token::Eof | Token::RBrace => return false,
                _ => {}
            }
        }
        false
    }

    fn parse_bare_op(&mut self) -> Result<(Expr, Expr)> {
        let flip = if *self.peek() == Token::Semicolon {
            Expr::num(0)
        } else {
            self.parse_expr()?
        };
        self.expect(Token::Semicolon, "inside the op")?;
        let jump = if self.at_line_end() {
            Expr::label("$")
        } else {
            self.parse_expr()?
        };
        Ok((flip, jump))
    }

    // ========== expressions ==========
    //
    // Binding, loosest to tightest: ?: | ^ (< > <= >=) (== !=) & (<< >>)
    // (+ -) (* / %) unary.

    fn parse_expr(&mut self) -> Result<Expr> {
        let expr = self.parse_ternary()?;
        // Fold what folds right away; anything that would error (a
        // constant division by zero, say) stays symbolic so the later
        // stages report it with its position and macro stack.
        match expr.eval_partial(&HashMap::new()) {
            Ok(folded) => Ok(folded),
            Err(_) => Ok(expr),
        }
    }

    fn parse_ternary(&mut self) -> Result<Expr> {
        let cond = self.parse_or()?;
        if *self.peek() == Token::Question {
            self.bump();
            let then = self.parse_ternary()?;
            self.expect(Token::Colon, "in the conditional expression")?;
            let otherwise = self.parse_ternary()?;
            Ok(Expr::ternary(cond, then, otherwise))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_xor()?;
        while *self.peek() == Token::Pipe {
            self.bump();
            lhs = Expr::binary(BinaryOp::Or, lhs, self.parse_xor()?);
        }
        Ok(lhs)
    }

    fn parse_xor(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while *self.peek() == Token::Caret {
            self.bump();
            lhs = Expr::binary(BinaryOp::Xor, lhs, self.parse_comparison()?);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_equality()?;
        let op = match self.peek() {
            Token::Lt => BinaryOp::Lt,
            Token::Gt => BinaryOp::Gt,
            Token::Le => BinaryOp::Le,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        // Non-associative: "a < b < c" is rejected one level down.
        let rhs = self.parse_equality()?;
        Ok(Expr::binary(op, lhs, rhs))
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => return Ok(lhs),
            };
            self.bump();
            lhs = Expr::binary(op, lhs, self.parse_and()?);
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_shift()?;
        while *self.peek() == Token::Amp {
            self.bump();
            lhs = Expr::binary(BinaryOp::And, lhs, self.parse_shift()?);
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Shl => BinaryOp::Shl,
                Token::Shr => BinaryOp::Shr,
                _ => return Ok(lhs),
            };
            self.bump();
            lhs = Expr::binary(op, lhs, self.parse_additive()?);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            lhs = Expr::binary(op, lhs, self.parse_multiplicative()?);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.bump();
            lhs = Expr::binary(op, lhs, self.parse_unary()?);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Tilde => UnaryOp::Not,
            Token::Hash => UnaryOp::BitLength,
            _ => return self.parse_atom(),
        };
        self.bump();
        Ok(Expr::unary(op, self.parse_unary()?))
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::Number(value) => {
                self.bump();
                Ok(Expr::Const(value))
            }
            Token::Str(bytes) => {
                // A string inside an expression is its bytes packed
                // little-endian into one integer.
                self.bump();
                let mut value = BigInt::from(0);
                for (i, &byte) in bytes.iter().enumerate() {
                    value += BigInt::from(byte) << (8 * i);
                }
                Ok(Expr::Const(value))
            }
            Token::Dollar => {
                self.bump();
                Ok(Expr::label("$"))
            }
            Token::LParen => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen, "to close the parenthesized expression")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                let pos = self.bump().pos;
                let resolved = self.resolve_reference(&name, pos)?;
                match self.ctx.defs.get(&resolved) {
                    Some(value) => Ok(value.clone()),
                    None => Ok(Expr::label(resolved)),
                }
            }
            other => Err(self.error(format!("expected an expression, got {}", other))),
        }
    }
}

/// Names referenced and labels declared anywhere in a body, rep
/// iterators excluded from the reference set.
fn collect_body_names(items: &[Item], used: &mut HashSet<String>, declared: &mut HashSet<String>) {
    for item in items {
        match item {
            Item::FlipJump { flip, jump, .. } => {
                flip.collect_labels(used);
                jump.collect_labels(used);
            }
            Item::WordFlip {
                word_address,
                flip_value,
                return_address,
                ..
            } => {
                word_address.collect_labels(used);
                flip_value.collect_labels(used);
                return_address.collect_labels(used);
            }
            Item::Label { name, .. } => {
                declared.insert(name.clone());
            }
            Item::MacroCall(call) => {
                for arg in &call.args {
                    arg.collect_labels(used);
                }
            }
            Item::Rep {
                times,
                iterator,
                call,
                ..
            } => {
                times.collect_labels(used);
                let mut inner = HashSet::new();
                for arg in &call.args {
                    arg.collect_labels(&mut inner);
                }
                inner.remove(iterator);
                used.extend(inner);
            }
            Item::RepOp {
                times,
                iterator,
                flip,
                jump,
                ..
            } => {
                times.collect_labels(used);
                let mut inner = HashSet::new();
                flip.collect_labels(&mut inner);
                jump.collect_labels(&mut inner);
                inner.remove(iterator);
                used.extend(inner);
            }
            Item::Segment { start, .. } => start.collect_labels(used),
            Item::Reserve { bits, .. } => bits.collect_labels(used),
            Item::Pad { alignment, .. } => alignment.collect_labels(used),
            Item::Text { .. } => {
                used.insert("IO".to_string());
            }
        }
    }
    used.remove("$");
}
