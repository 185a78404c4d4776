//! Code signing requirements.
//!
//! A requirement is a small boolean expression evaluated against a peer's
//! kernel-sourced [`CodeIdentity`]:
//!
//! ```text
//! identifier "xpckit" and (uid 501 or anchor self)
//! path = "/usr/libexec/helper" || !never
//! ```
//!
//! Predicates: `always`, `never`, `true`, `false`, `identifier "…"`,
//! `path "…"`, `uid N`, `gid N`, `anchor self`. The `=` after a field name
//! is optional. `and`/`&&` binds tighter than `or`/`||`; `not`/`!` binds
//! tightest.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use xpckit_transport::CodeIdentity;

use crate::error::XpcError;

const MAX_NESTING: usize = 32;

/// A parsed code signing requirement.
#[derive(Clone, PartialEq, Eq)]
pub struct CodeRequirement {
    text: String,
    expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Const(bool),
    Identifier(String),
    Path(PathBuf),
    Uid(u32),
    Gid(u32),
    AnchorSelf,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl CodeRequirement {
    /// Parse requirement text.
    pub fn parse(text: &str) -> Result<Self, XpcError> {
        let invalid = |err: ParseError| XpcError::InvalidCodeSignatureRequirement {
            requirement: text.to_string(),
            reason: format!("{} at byte {}", err.message, err.offset),
        };
        let tokens = tokenize(text).map_err(invalid)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: text.len(),
            depth: 0,
        };
        let expr = parser.parse().map_err(invalid)?;
        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }

    /// The requirement as written.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether `peer` satisfies this requirement.
    ///
    /// `anchor self` compares against the calling process.
    pub fn is_satisfied_by(&self, peer: &CodeIdentity) -> bool {
        self.evaluate(peer, &CodeIdentity::current())
    }

    /// Evaluate with an explicit identity standing in for this process.
    pub fn evaluate(&self, peer: &CodeIdentity, local: &CodeIdentity) -> bool {
        self.expr.eval(peer, local)
    }
}

impl Expr {
    fn eval(&self, peer: &CodeIdentity, local: &CodeIdentity) -> bool {
        match self {
            Expr::Const(value) => *value,
            Expr::Identifier(id) => peer.identifier.as_deref() == Some(id.as_str()),
            Expr::Path(path) => peer.path.as_deref() == Some(path.as_path()),
            Expr::Uid(uid) => peer.uid == *uid,
            Expr::Gid(gid) => peer.gid == *gid,
            Expr::AnchorSelf => peer.path.is_some() && peer.path == local.path,
            Expr::Not(inner) => !inner.eval(peer, local),
            Expr::And(lhs, rhs) => lhs.eval(peer, local) && rhs.eval(peer, local),
            Expr::Or(lhs, rhs) => lhs.eval(peer, local) || rhs.eval(peer, local),
        }
    }
}

impl FromStr for CodeRequirement {
    type Err = XpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CodeRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for CodeRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeRequirement({:?})", self.text)
    }
}

#[derive(Debug)]
struct ParseError {
    message: String,
    offset: usize,
}

fn error(message: impl Into<String>, offset: usize) -> ParseError {
    ParseError {
        message: message.into(),
        offset,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Number(u32),
    Eq,
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        let token = match bytes[i] {
            b if b.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                Token::Open
            }
            b')' => {
                i += 1;
                Token::Close
            }
            b'=' => {
                i += 1;
                Token::Eq
            }
            b'!' => {
                i += 1;
                Token::Not
            }
            b'&' if bytes.get(i + 1) == Some(&b'&') => {
                i += 2;
                Token::And
            }
            b'|' if bytes.get(i + 1) == Some(&b'|') => {
                i += 2;
                Token::Or
            }
            b'"' => {
                let (value, next) = string_literal(text, i)?;
                i = next;
                Token::Str(value)
            }
            b if b.is_ascii_digit() => {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let number = text[start..i]
                    .parse::<u32>()
                    .map_err(|_| error("number out of range", start))?;
                Token::Number(number)
            }
            b if b.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                match &text[start..i] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    word => Token::Word(word.to_string()),
                }
            }
            _ => {
                let ch = text[start..].chars().next().unwrap_or('?');
                return Err(error(format!("unexpected character '{ch}'"), start));
            }
        };
        tokens.push((token, start));
    }
    Ok(tokens)
}

fn string_literal(text: &str, open: usize) -> Result<(String, usize), ParseError> {
    let mut value = String::new();
    let mut chars = text[open + 1..].char_indices();
    while let Some((rel, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, open + 1 + rel + 1)),
            '\\' => match chars.next() {
                Some((_, esc @ ('"' | '\\'))) => value.push(esc),
                Some((at, other)) => {
                    return Err(error(
                        format!("unknown escape '\\{other}'"),
                        open + 1 + at - 1,
                    ))
                }
                None => break,
            },
            other => value.push(other),
        }
    }
    Err(error("unterminated string", open))
}

struct Parser<'a> {
    tokens: &'a [(Token, usize)],
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser<'_> {
    fn parse(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(error("empty requirement", 0));
        }
        let expr = self.expr()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some((_, offset)) => Err(error("unexpected trailing input", *offset)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or(self.end, |(_, offset)| *offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(error("requirement nested too deeply", self.offset()));
        }
        let result = self.factor_inner();
        self.depth -= 1;
        result
    }

    fn factor_inner(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.factor()?))),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(error("expected ')'", self.offset())),
                }
            }
            Some(Token::Word(word)) => self.predicate(&word, offset),
            Some(_) => Err(error("expected a predicate", offset)),
            None => Err(error("unexpected end of requirement", offset)),
        }
    }

    fn predicate(&mut self, word: &str, offset: usize) -> Result<Expr, ParseError> {
        match word {
            "always" | "true" => Ok(Expr::Const(true)),
            "never" | "false" => Ok(Expr::Const(false)),
            "identifier" => Ok(Expr::Identifier(self.string_operand()?)),
            "path" => Ok(Expr::Path(PathBuf::from(self.string_operand()?))),
            "uid" => Ok(Expr::Uid(self.number_operand()?)),
            "gid" => Ok(Expr::Gid(self.number_operand()?)),
            "anchor" => {
                let at = self.offset();
                match self.next() {
                    Some(Token::Word(w)) if w == "self" => Ok(Expr::AnchorSelf),
                    _ => Err(error("expected 'self' after 'anchor'", at)),
                }
            }
            other => Err(error(format!("unknown predicate '{other}'"), offset)),
        }
    }

    fn skip_eq(&mut self) {
        if self.peek() == Some(&Token::Eq) {
            self.pos += 1;
        }
    }

    fn string_operand(&mut self) -> Result<String, ParseError> {
        self.skip_eq();
        let at = self.offset();
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            _ => Err(error("expected a quoted string", at)),
        }
    }

    fn number_operand(&mut self) -> Result<u32, ParseError> {
        self.skip_eq();
        let at = self.offset();
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            _ => Err(error("expected a number", at)),
        }
    }
}
