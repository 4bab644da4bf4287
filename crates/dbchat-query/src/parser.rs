//! Query text parser.
//!
//! Accepts `db.<collection>.<method>(<args>)` optionally followed by
//! `.sort(<expr>)`, `.limit(<digits>)` and the no-op `.toArray()` /
//! `.pretty()` suffixes, in any order. Parentheses are matched by depth
//! counting over a quote-aware token stream, so literals inside arguments
//! never confuse the call boundaries.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ParseError;
use crate::expr::{Expr, ExprParser};

static HEAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^db\.([A-Za-z0-9_]+)\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());

// =============================================================================
// Types
// =============================================================================

/// Supported collection methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Method {
    #[serde(rename = "find")]
    Find,
    #[serde(rename = "aggregate")]
    Aggregate,
    #[serde(rename = "countDocuments")]
    Count,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "find" => Some(Method::Find),
            "aggregate" => Some(Method::Aggregate),
            "countDocuments" => Some(Method::Count),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Find => "find",
            Method::Aggregate => "aggregate",
            Method::Count => "countDocuments",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated query, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub collection: String,
    pub method: Method,
    pub arguments: Vec<Expr>,
    pub sort: Option<Expr>,
    pub limit: Option<u64>,
}

/// A [`ParsedQuery`] with every date expression pinned to one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedQuery {
    pub collection: String,
    pub method: Method,
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl ParsedQuery {
    pub fn resolve(&self, now: DateTime<Utc>) -> ResolvedQuery {
        ResolvedQuery {
            collection: self.collection.clone(),
            method: self.method,
            arguments: self.arguments.iter().map(|a| a.resolve(now)).collect(),
            sort: self.sort.as_ref().map(|s| s.resolve(now)),
            limit: self.limit,
        }
    }
}

impl FromStr for ParsedQuery {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

// =============================================================================
// Lexing
// =============================================================================

/// A non-whitespace character outside string literals. A whole string
/// literal is represented by its opening quote.
#[derive(Debug, Clone, Copy)]
struct Token {
    pos: usize,
    ch: u8,
}

/// Quote-aware scan. Fails on a string literal still open at end of text.
fn lex(text: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'"' | b'\'' => {
                tokens.push(Token { pos: i, ch: b });
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(ParseError::UnclosedQuotes),
                        Some(b'\\') => i += 2,
                        Some(&c) if c == b => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
            }
            _ if b.is_ascii_whitespace() => i += 1,
            _ => {
                tokens.push(Token { pos: i, ch: b });
                i += 1;
            }
        }
    }
    Ok(tokens)
}

/// Match every parenthesis, returning open position -> close position.
fn match_parens(
    tokens: &[Token],
    method_open: usize,
    method: &str,
) -> Result<HashMap<usize, usize>, ParseError> {
    let mut pairs = HashMap::new();
    let mut stack = Vec::new();
    let mut total_parens = 0;

    for token in tokens {
        match token.ch {
            b'(' => {
                total_parens += 1;
                stack.push(token.pos);
            }
            b')' => {
                total_parens += 1;
                let open = stack
                    .pop()
                    .ok_or(ParseError::UnbalancedParens { position: token.pos })?;
                pairs.insert(open, token.pos);
            }
            _ => {}
        }
    }

    match stack.last() {
        None => Ok(pairs),
        Some(_) if total_parens == 1 && stack[0] == method_open => {
            Err(ParseError::NoMatchingCloseParen {
                method: method.to_string(),
            })
        }
        Some(&open) => Err(ParseError::UnbalancedParens { position: open }),
    }
}

/// Reject `,,` `{,` `,}` `[,` `,]` among the tokens strictly between
/// `start` and `end`.
fn check_commas(tokens: &[Token], start: usize, end: usize) -> Result<(), ParseError> {
    let inner: Vec<&Token> = tokens
        .iter()
        .filter(|t| t.pos > start && t.pos < end)
        .collect();
    for pair in inner.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let malformed = matches!(
            (a.ch, b.ch),
            (b',', b',') | (b'{', b',') | (b',', b'}') | (b'[', b',') | (b',', b']')
        );
        if malformed {
            let position = if a.ch == b',' { a.pos } else { b.pos };
            return Err(ParseError::InvalidCommaPlacement { position });
        }
    }
    Ok(())
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse query text into a [`ParsedQuery`].
///
/// Pure and I/O free; nothing in the text is ever evaluated.
pub fn parse(text: &str) -> Result<ParsedQuery, ParseError> {
    let text = text.trim();

    let caps = HEAD_RE.captures(text).ok_or(ParseError::InvalidPrefix)?;
    let collection = caps[1].to_string();
    let method_name = caps[2].to_string();
    let method_open = caps.get(0).map_or(0, |m| m.end());

    let tokens = lex(text)?;
    let pairs = match_parens(&tokens, method_open, &method_name)?;

    if text.as_bytes().get(method_open) != Some(&b'(') {
        return Err(ParseError::InvalidPrefix);
    }
    let method_close = *pairs
        .get(&method_open)
        .ok_or_else(|| ParseError::NoMatchingCloseParen {
            method: method_name.clone(),
        })?;

    check_commas(&tokens, method_open, method_close)?;
    let arguments =
        ExprParser::new(&text[method_open + 1..method_close], method_open + 1).parse_list()?;

    let (sort, limit) = parse_chain(text, &tokens, &pairs, method_close + 1)?;

    let method = Method::from_name(&method_name).ok_or(ParseError::UnsupportedMethod(method_name))?;

    Ok(ParsedQuery {
        collection,
        method,
        arguments,
        sort,
        limit,
    })
}

type Chain = (Option<Expr>, Option<u64>);

/// Parse the chained calls after the method call.
fn parse_chain(
    text: &str,
    tokens: &[Token],
    pairs: &HashMap<usize, usize>,
    mut pos: usize,
) -> Result<Chain, ParseError> {
    let bytes = text.as_bytes();
    let err = |position: usize, reason: String| ParseError::ArgumentParseError { position, reason };
    let skip_ws = |mut p: usize| {
        while bytes.get(p).is_some_and(|b| b.is_ascii_whitespace()) {
            p += 1;
        }
        p
    };

    let mut sort = None;
    let mut limit = None;

    loop {
        pos = skip_ws(pos);
        match bytes.get(pos) {
            None => break,
            Some(b';') if skip_ws(pos + 1) == bytes.len() => break,
            Some(b'.') => pos += 1,
            Some(_) => return Err(err(pos, "unexpected text after call".to_string())),
        }

        pos = skip_ws(pos);
        let name_start = pos;
        while bytes
            .get(pos)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            pos += 1;
        }
        let name = &text[name_start..pos];
        pos = skip_ws(pos);
        if bytes.get(pos) != Some(&b'(') {
            return Err(err(pos, format!("expected '(' after .{}", name)));
        }
        let open = pos;
        let close = *pairs
            .get(&open)
            .ok_or_else(|| ParseError::UnbalancedParens { position: open })?;
        check_commas(tokens, open, close)?;
        let inner = &text[open + 1..close];

        match name {
            "sort" => {
                if sort.is_some() {
                    return Err(err(name_start, "duplicate .sort()".to_string()));
                }
                let mut items = ExprParser::new(inner, open + 1).parse_list()?;
                if items.len() != 1 {
                    return Err(err(open + 1, ".sort() takes exactly one argument".to_string()));
                }
                sort = items.pop();
            }
            "limit" => {
                if limit.is_some() {
                    return Err(err(name_start, "duplicate .limit()".to_string()));
                }
                let digits = inner.trim();
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(err(open + 1, ".limit() takes a non-negative integer".to_string()));
                }
                let n = digits
                    .parse::<u64>()
                    .map_err(|_| err(open + 1, "limit out of range".to_string()))?;
                limit = Some(n);
            }
            "toArray" | "pretty" => {
                if !inner.trim().is_empty() {
                    return Err(err(open + 1, format!(".{}() takes no arguments", name)));
                }
            }
            "" => return Err(err(name_start, "expected a method name after '.'".to_string())),
            other => {
                return Err(err(
                    name_start,
                    format!("chained call .{}() is not supported", other),
                ))
            }
        }
        pos = close + 1;
    }

    Ok((sort, limit))
}
