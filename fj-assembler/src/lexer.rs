//! Lexer for the `.fj` assembly language.

use std::fmt;

use num_bigint::BigInt;

use fj_spec::{CodePosition, FileId};

use crate::error::{AssemblerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Plain or dotted identifier, possibly with leading dots (`.name`
    /// resolves against the current namespace).
    Ident(String),

    /// Integer literal: decimal, `0x..`, `0b..` or a char like `'a'`.
    Number(BigInt),

    /// String literal, already unescaped.
    Str(Vec<u8>),

    // Keywords
    Def,
    Rep,
    Ns,
    Wflip,
    Pad,
    Segment,
    Reserve,
    Include,

    // Punctuation
    Semicolon,
    Colon,
    Comma,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Assign,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Question,
    Hash,
    Dollar,

    Newline,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "identifier \"{}\"", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(_) => write!(f, "string literal"),
            Token::Def => write!(f, "\"def\""),
            Token::Rep => write!(f, "\"rep\""),
            Token::Ns => write!(f, "\"ns\""),
            Token::Wflip => write!(f, "\"wflip\""),
            Token::Pad => write!(f, "\"pad\""),
            Token::Segment => write!(f, "\"segment\""),
            Token::Reserve => write!(f, "\"reserve\""),
            Token::Include => write!(f, "\"include\""),
            Token::Semicolon => write!(f, "\";\""),
            Token::Colon => write!(f, "\":\""),
            Token::Comma => write!(f, "\",\""),
            Token::LBrace => write!(f, "\"{{\""),
            Token::RBrace => write!(f, "\"}}\""),
            Token::LParen => write!(f, "\"(\""),
            Token::RParen => write!(f, "\")\""),
            Token::Assign => write!(f, "\"=\""),
            Token::Plus => write!(f, "\"+\""),
            Token::Minus => write!(f, "\"-\""),
            Token::Star => write!(f, "\"*\""),
            Token::Slash => write!(f, "\"/\""),
            Token::Percent => write!(f, "\"%\""),
            Token::Amp => write!(f, "\"&\""),
            Token::Pipe => write!(f, "\"|\""),
            Token::Caret => write!(f, "\"^\""),
            Token::Tilde => write!(f, "\"~\""),
            Token::Shl => write!(f, "\"<<\""),
            Token::Shr => write!(f, "\">>\""),
            Token::Lt => write!(f, "\"<\""),
            Token::Gt => write!(f, "\">\""),
            Token::Le => write!(f, "\"<=\""),
            Token::Ge => write!(f, "\">=\""),
            Token::EqEq => write!(f, "\"==\""),
            Token::Ne => write!(f, "\"!=\""),
            Token::Question => write!(f, "\"?\""),
            Token::Hash => write!(f, "\"#\""),
            Token::Dollar => write!(f, "\"$\""),
            Token::Newline => write!(f, "end of line"),
            Token::Eof => write!(f, "end of file"),
        }
    }
}

/// A token with the position it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub pos: CodePosition,
}

#[derive(Debug, Clone)]
pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    file: FileId,
    line: u32,
    col: u32,
}

impl Lexer {
    pub fn new(input: &str, file: FileId) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            file,
            line: 1,
            col: 1,
        }
    }

    fn here(&self) -> CodePosition {
        CodePosition::new(self.file, self.line, self.col)
    }

    fn error(&self, message: impl Into<String>) -> AssemblerError {
        AssemblerError::SyntaxError {
            pos: self.here(),
            message: message.into(),
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('/') if self.peek(1) == Some('/') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut out = String::new();
        // Leading dots are namespace-relative markers.
        while self.current() == Some('.') {
            out.push('.');
            self.advance();
        }
        loop {
            match self.current() {
                Some(ch) if ch.is_ascii_alphanumeric() || ch == '_' => {
                    out.push(ch);
                    self.advance();
                }
                Some('.')
                    if matches!(self.peek(1), Some(next) if next.is_ascii_alphabetic() || next == '_') =>
                {
                    out.push('.');
                    self.advance();
                }
                _ => break,
            }
        }
        out
    }

    fn read_escape(&mut self) -> Result<u8> {
        match self.advance() {
            Some('0') => Ok(0x00),
            Some('a') => Ok(0x07),
            Some('b') => Ok(0x08),
            Some('e') => Ok(0x1b),
            Some('f') => Ok(0x0c),
            Some('n') => Ok(0x0a),
            Some('r') => Ok(0x0d),
            Some('t') => Ok(0x09),
            Some('v') => Ok(0x0b),
            Some('\\') => Ok(0x5c),
            Some('\'') => Ok(0x27),
            Some('"') => Ok(0x22),
            Some('?') => Ok(0x3f),
            Some('x') | Some('X') => {
                let hi = self.advance().ok_or_else(|| self.error("unterminated \\x escape"))?;
                let lo = self.advance().ok_or_else(|| self.error("unterminated \\x escape"))?;
                let hex: String = [hi, lo].iter().collect();
                u8::from_str_radix(&hex, 16)
                    .map_err(|_| self.error(format!("bad \\x escape: \\x{}", hex)))
            }
            Some(other) => Err(self.error(format!("unknown escape: \\{}", other))),
            None => Err(self.error("unterminated escape")),
        }
    }

    fn read_char_literal(&mut self) -> Result<Token> {
        self.advance(); // opening quote
        let value = match self.current() {
            Some('\\') => {
                self.advance();
                self.read_escape()?
            }
            Some(ch) if (' '..='~').contains(&ch) => {
                self.advance();
                ch as u8
            }
            _ => return Err(self.error("bad character literal")),
        };
        if self.advance() != Some('\'') {
            return Err(self.error("unterminated character literal"));
        }
        Ok(Token::Number(BigInt::from(value)))
    }

    fn read_string(&mut self) -> Result<Token> {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::Str(bytes));
                }
                Some('\\') => {
                    self.advance();
                    bytes.push(self.read_escape()?);
                }
                Some(ch) if (' '..='~').contains(&ch) => {
                    self.advance();
                    bytes.push(ch as u8);
                }
                Some('\n') | None => return Err(self.error("unterminated string literal")),
                Some(ch) => return Err(self.error(format!("bad character in string: {:?}", ch))),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token> {
        let radix = if self.current() == Some('0') {
            match self.peek(1) {
                Some('x') | Some('X') => 16,
                Some('b') | Some('B') => 2,
                _ => 10,
            }
        } else {
            10
        };
        if radix != 10 {
            self.advance();
            self.advance();
        }
        let mut digits = String::new();
        while let Some(ch) = self.current() {
            if ch.is_digit(radix) {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return Err(self.error("bad number literal"));
        }
        BigInt::parse_bytes(digits.as_bytes(), radix)
            .map(Token::Number)
            .ok_or_else(|| self.error(format!("bad number literal: {}", digits)))
    }

    fn keyword_or_ident(name: String) -> Token {
        match name.as_str() {
            "def" => Token::Def,
            "rep" => Token::Rep,
            "ns" => Token::Ns,
            "wflip" => Token::Wflip,
            "pad" => Token::Pad,
            "segment" => Token::Segment,
            "reserve" => Token::Reserve,
            "include" => Token::Include,
            _ => Token::Ident(name),
        }
    }

    pub fn next_token(&mut self) -> Result<SpannedToken> {
        self.skip_whitespace_and_comments();
        let pos = self.here();
        let token = match self.current() {
            None => Token::Eof,
            Some('\n') => {
                self.advance();
                Token::Newline
            }
            Some('\'') => self.read_char_literal()?,
            Some('"') => self.read_string()?,
            Some(ch) if ch.is_ascii_digit() => self.read_number()?,
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == '.' => {
                Self::keyword_or_ident(self.read_identifier())
            }
            Some(';') => {
                self.advance();
                Token::Semicolon
            }
            Some(':') => {
                self.advance();
                Token::Colon
            }
            Some(',') => {
                self.advance();
                Token::Comma
            }
            Some('{') => {
                self.advance();
                Token::LBrace
            }
            Some('}') => {
                self.advance();
                Token::RBrace
            }
            Some('(') => {
                self.advance();
                Token::LParen
            }
            Some(')') => {
                self.advance();
                Token::RParen
            }
            Some('+') => {
                self.advance();
                Token::Plus
            }
            Some('-') => {
                self.advance();
                Token::Minus
            }
            Some('*') => {
                self.advance();
                Token::Star
            }
            Some('/') => {
                self.advance();
                Token::Slash
            }
            Some('%') => {
                self.advance();
                Token::Percent
            }
            Some('&') => {
                self.advance();
                Token::Amp
            }
            Some('|') => {
                self.advance();
                Token::Pipe
            }
            Some('^') => {
                self.advance();
                Token::Caret
            }
            Some('~') => {
                self.advance();
                Token::Tilde
            }
            Some('?') => {
                self.advance();
                Token::Question
            }
            Some('#') => {
                self.advance();
                Token::Hash
            }
            Some('$') => {
                self.advance();
                Token::Dollar
            }
            Some('=') => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    Token::EqEq
                } else {
                    Token::Assign
                }
            }
            Some('!') => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                    Token::Ne
                } else {
                    return Err(self.error("unexpected character '!'"));
                }
            }
            Some('<') => {
                self.advance();
                match self.current() {
                    Some('<') => {
                        self.advance();
                        Token::Shl
                    }
                    Some('=') => {
                        self.advance();
                        Token::Le
                    }
                    _ => Token::Lt,
                }
            }
            Some('>') => {
                self.advance();
                match self.current() {
                    Some('>') => {
                        self.advance();
                        Token::Shr
                    }
                    Some('=') => {
                        self.advance();
                        Token::Ge
                    }
                    _ => Token::Gt,
                }
            }
            Some(ch) => return Err(self.error(format!("unexpected character {:?}", ch))),
        };
        Ok(SpannedToken { token, pos })
    }

    pub fn tokenize(&mut self) -> Result<Vec<SpannedToken>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let is_eof = matches!(spanned.token, Token::Eof);
            tokens.push(spanned);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Vec<Token> {
        Lexer::new(text, 0)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|spanned| spanned.token)
            .collect()
    }

    #[test]
    fn test_lex_simple_op() {
        let tokens = lex("label: a ; b");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("label".to_string()),
                Token::Colon,
                Token::Ident("a".to_string()),
                Token::Semicolon,
                Token::Ident("b".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_numbers() {
        let tokens = lex("123 0x1F 0b1010 'A' '\\n' '\\x41'");
        assert_eq!(
            tokens,
            vec![
                Token::Number(BigInt::from(123)),
                Token::Number(BigInt::from(0x1F)),
                Token::Number(BigInt::from(10)),
                Token::Number(BigInt::from(65)),
                Token::Number(BigInt::from(10)),
                Token::Number(BigInt::from(0x41)),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_string_with_escapes() {
        let tokens = lex(r#""Hi\n\x21""#);
        assert_eq!(tokens[0], Token::Str(vec![b'H', b'i', b'\n', 0x21]));
    }

    #[test]
    fn test_lex_keywords_vs_idents() {
        let tokens = lex("def rep repx ns wflip pad segment reserve include");
        assert_eq!(tokens[0], Token::Def);
        assert_eq!(tokens[1], Token::Rep);
        assert_eq!(tokens[2], Token::Ident("repx".to_string()));
        assert_eq!(tokens[3], Token::Ns);
        assert_eq!(tokens[4], Token::Wflip);
        assert_eq!(tokens[5], Token::Pad);
        assert_eq!(tokens[6], Token::Segment);
        assert_eq!(tokens[7], Token::Reserve);
        assert_eq!(tokens[8], Token::Include);
    }

    #[test]
    fn test_lex_dotted_idents() {
        let tokens = lex("bit.xor ..up.here .local");
        assert_eq!(tokens[0], Token::Ident("bit.xor".to_string()));
        assert_eq!(tokens[1], Token::Ident("..up.here".to_string()));
        assert_eq!(tokens[2], Token::Ident(".local".to_string()));
    }

    #[test]
    fn test_lex_operators() {
        let tokens = lex("<< >> <= >= == != < > = ? # $ ~");
        assert_eq!(
            tokens,
            vec![
                Token::Shl,
                Token::Shr,
                Token::Le,
                Token::Ge,
                Token::EqEq,
                Token::Ne,
                Token::Lt,
                Token::Gt,
                Token::Assign,
                Token::Question,
                Token::Hash,
                Token::Dollar,
                Token::Tilde,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_comments_and_newlines() {
        let tokens = lex("a;b // flip a, fall through\nc;d");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".to_string()),
                Token::Semicolon,
                Token::Ident("b".to_string()),
                Token::Newline,
                Token::Ident("c".to_string()),
                Token::Semicolon,
                Token::Ident("d".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_positions_track_lines() {
        let mut lexer = Lexer::new("a\n  b", 2);
        let a = lexer.next_token().unwrap();
        let _newline = lexer.next_token().unwrap();
        let b = lexer.next_token().unwrap();
        assert_eq!(a.pos, CodePosition::new(2, 1, 1));
        assert_eq!(b.pos, CodePosition::new(2, 2, 3));
    }

    #[test]
    fn test_lex_error_on_garbage() {
        let result = Lexer::new("a @ b", 0).tokenize();
        assert!(matches!(
            result,
            Err(AssemblerError::SyntaxError { .. })
        ));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(Lexer::new("\"abc", 0).tokenize().is_err());
        assert!(Lexer::new("\"abc\ndef\"", 0).tokenize().is_err());
    }
}
