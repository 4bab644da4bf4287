//! Restricted expression grammar for query arguments.
//!
//! A JSON superset: objects with quoted or bare keys, arrays, single- or
//! double-quoted strings, numbers, booleans, null, and a small set of date
//! constructors. Every other identifier or call is rejected.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::error::ParseError;

/// Maximum nesting of objects and arrays.
const MAX_DEPTH: usize = 64;

/// Largest accepted date offset (roughly 10,000 years).
const MAX_OFFSET_MS: f64 = 3.2e14;

static RELATIVE_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+)\s+(second|minute|hour|day|week|month|year)s?\s+ago$").unwrap()
});

// =============================================================================
// Expr
// =============================================================================

/// A parsed argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Expr>),
    /// Members in source order (sort specifications depend on it).
    Object(Vec<(String, Expr)>),
    Time(TimeExpr),
}

/// A whitelisted date constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    /// Offset in milliseconds from the moment the query runs; 0 is "now".
    Relative { offset_ms: i64 },
    Absolute(DateTime<Utc>),
}

impl TimeExpr {
    pub fn now() -> Self {
        TimeExpr::Relative { offset_ms: 0 }
    }

    /// Pin the expression to a concrete instant.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeExpr::Relative { offset_ms } => now
                .checked_add_signed(Duration::milliseconds(*offset_ms))
                .unwrap_or(now),
            TimeExpr::Absolute(at) => *at,
        }
    }
}

impl Expr {
    /// Convert to JSON, resolving dates against `now`.
    ///
    /// Dates become extended JSON: `{"$date": "<RFC 3339>"}`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Value {
        match self {
            Expr::Null => Value::Null,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Int(i) => Value::from(*i),
            Expr::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Expr::String(s) => Value::String(s.clone()),
            Expr::Array(items) => Value::Array(items.iter().map(|e| e.resolve(now)).collect()),
            Expr::Object(members) => {
                let mut map = Map::with_capacity(members.len());
                for (key, value) in members {
                    map.insert(key.clone(), value.resolve(now));
                }
                Value::Object(map)
            }
            Expr::Time(t) => {
                let mut map = Map::with_capacity(1);
                map.insert(
                    "$date".to_string(),
                    Value::String(t.resolve(now).to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                Value::Object(map)
            }
        }
    }

    /// Look up an object member by key.
    pub fn get(&self, key: &str) -> Option<&Expr> {
        match self {
            Expr::Object(members) => members.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

// =============================================================================
// ExprParser
// =============================================================================

/// Recursive-descent parser over one argument list.
pub(crate) struct ExprParser<'a> {
    src: &'a str,
    pos: usize,
    /// Offset of `src` within the full query text, for error positions.
    base: usize,
    depth: usize,
}

impl<'a> ExprParser<'a> {
    pub(crate) fn new(src: &'a str, base: usize) -> Self {
        Self {
            src,
            pos: 0,
            base,
            depth: 0,
        }
    }

    /// Parse a comma-separated, possibly empty, list of values.
    pub(crate) fn parse_list(mut self) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.at_end() {
            return Ok(items);
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.at_end() {
                return Ok(items);
            }
            self.expect(b',', "',' between arguments")?;
            self.skip_ws();
        }
    }

    // -----------------------------------------------------------------
    // Cursor helpers
    // -----------------------------------------------------------------

    fn err(&self, reason: impl Into<String>) -> ParseError {
        ParseError::ArgumentParseError {
            position: self.base + self.pos,
            reason: reason.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8, what: &str) -> Result<(), ParseError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}", what)))
        }
    }

    fn read_ident(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }

    fn expect_word(&mut self, word: &str) -> Result<(), ParseError> {
        self.skip_ws();
        let at = self.pos;
        if self.read_ident() == word {
            Ok(())
        } else {
            self.pos = at;
            Err(self.err(format!("expected `{}`", word)))
        }
    }

    fn expect_empty_call(&mut self) -> Result<(), ParseError> {
        self.skip_ws();
        self.expect(b'(', "'('")?;
        self.skip_ws();
        self.expect(b')', "')'")
    }

    // -----------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------

    fn parse_value(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }

        self.skip_ws();
        let result = match self.peek() {
            None => Err(self.err("expected a value")),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(q @ (b'"' | b'\'')) => self.parse_string(q).map(Expr::String),
            Some(b) if b == b'-' || b == b'+' || b == b'.' || b.is_ascii_digit() => {
                self.parse_number()
            }
            Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => self.parse_word(),
            Some(_) => {
                let c = self.peek_char().unwrap_or('?');
                Err(self.err(format!("unexpected character '{}'", c)))
            }
        };

        self.depth -= 1;
        result
    }

    fn parse_object(&mut self) -> Result<Expr, ParseError> {
        self.expect(b'{', "'{'")?;
        let mut members = Vec::new();
        self.skip_ws();
        if self.eat(b'}') {
            return Ok(Expr::Object(members));
        }
        loop {
            self.skip_ws();
            let key = self.parse_key()?;
            self.skip_ws();
            self.expect(b':', "':' after object key")?;
            let value = self.parse_value()?;
            members.push((key, value));
            self.skip_ws();
            if self.eat(b'}') {
                return Ok(Expr::Object(members));
            }
            self.expect(b',', "',' or '}' in object")?;
        }
    }

    fn parse_key(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(q @ (b'"' | b'\'')) => self.parse_string(q),
            Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' => {
                Ok(self.read_ident().to_string())
            }
            _ => Err(self.err("expected object key")),
        }
    }

    fn parse_array(&mut self) -> Result<Expr, ParseError> {
        self.expect(b'[', "'['")?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.eat(b']') {
            return Ok(Expr::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.eat(b']') {
                return Ok(Expr::Array(items));
            }
            self.expect(b',', "',' or ']' in array")?;
        }
    }

    fn parse_string(&mut self, quote: u8) -> Result<String, ParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = match self.peek_char() {
                Some(c) => c,
                None => {
                    self.pos = start;
                    return Err(self.err("unterminated string"));
                }
            };
            self.pos += c.len_utf8();
            if c as u32 == quote as u32 {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .peek_char()
                .ok_or_else(|| self.err("unterminated escape"))?;
            self.pos += escaped.len_utf8();
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                '0' => out.push('\0'),
                'u' => {
                    let hex = self
                        .src
                        .get(self.pos..self.pos + 4)
                        .ok_or_else(|| self.err("truncated \\u escape"))?;
                    let code = u32::from_str_radix(hex, 16)
                        .map_err(|_| self.err("invalid \\u escape"))?;
                    let ch = char::from_u32(code).ok_or_else(|| self.err("invalid \\u escape"))?;
                    out.push(ch);
                    self.pos += 4;
                }
                other => out.push(other),
            }
        }
    }

    /// Scan a numeric literal and return its text.
    fn scan_number(&mut self) -> Result<&'a str, ParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') || self.peek() == Some(b'+') {
            self.pos += 1;
        }
        let mut digits = 0;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
            digits += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
                digits += 1;
            }
        }
        if digits == 0 {
            self.pos = start;
            return Err(self.err("expected a number"));
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'-' | b'+')) {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return Err(self.err("malformed exponent"));
            }
        }
        Ok(&self.src[start..self.pos])
    }

    fn parse_number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        let text = self.scan_number()?;
        let integral = !text.contains(['.', 'e', 'E']);
        if integral {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Expr::Int(i));
            }
        }
        match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Expr::Float(f)),
            _ => {
                self.pos = start;
                Err(self.err("number out of range"))
            }
        }
    }

    fn parse_factor(&mut self) -> Result<f64, ParseError> {
        self.skip_ws();
        if self.eat(b'(') {
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                self.pos -= 1;
                return Err(self.err("nesting too deep"));
            }
            let value = self.parse_product()?;
            self.skip_ws();
            self.expect(b')', "')'")?;
            self.depth -= 1;
            return Ok(value);
        }
        let text = self.scan_number()?;
        text.parse::<f64>().map_err(|_| self.err("expected a number"))
    }

    fn parse_product(&mut self) -> Result<f64, ParseError> {
        let mut value = self.parse_factor()?;
        loop {
            self.skip_ws();
            if !self.eat(b'*') {
                return Ok(value);
            }
            value *= self.parse_factor()?;
        }
    }

    // -----------------------------------------------------------------
    // Identifiers and date constructors
    // -----------------------------------------------------------------

    fn parse_word(&mut self) -> Result<Expr, ParseError> {
        let at = self.pos;
        let word = self.read_ident();
        match word {
            "true" => Ok(Expr::Bool(true)),
            "false" => Ok(Expr::Bool(false)),
            "null" => Ok(Expr::Null),
            "new" => {
                self.expect_word("Date")?;
                self.parse_date_constructor().map(Expr::Time)
            }
            "Date" => {
                self.skip_ws();
                if self.eat(b'.') {
                    self.expect_word("now")?;
                    self.expect_empty_call()?;
                    let offset_ms = self.parse_offset_tail()?;
                    Ok(Expr::Time(TimeExpr::Relative { offset_ms }))
                } else {
                    self.expect_empty_call()?;
                    Ok(Expr::Time(TimeExpr::now()))
                }
            }
            "ISODate" => {
                self.skip_ws();
                self.expect(b'(', "'(' after ISODate")?;
                self.skip_ws();
                let literal = match self.peek() {
                    Some(q @ (b'"' | b'\'')) => self.parse_string(q)?,
                    _ => return Err(self.err("ISODate expects a string")),
                };
                let time = parse_date_literal(&literal)
                    .ok_or_else(|| self.err(format!("unrecognised date '{}'", literal)))?;
                self.skip_ws();
                self.expect(b')', "')'")?;
                Ok(Expr::Time(time))
            }
            other => {
                let name = other.to_string();
                self.skip_ws();
                let is_call = matches!(self.peek(), Some(b'(' | b'.'));
                self.pos = at;
                if is_call {
                    Err(self.err(format!("call expressions are not allowed: `{}`", name)))
                } else {
                    Err(self.err(format!("identifier `{}` is not allowed", name)))
                }
            }
        }
    }

    /// After `new Date`: `()` or a single whitelisted argument.
    fn parse_date_constructor(&mut self) -> Result<TimeExpr, ParseError> {
        self.skip_ws();
        self.expect(b'(', "'(' after Date")?;
        self.skip_ws();
        if self.eat(b')') {
            return Ok(TimeExpr::now());
        }

        let time = match self.peek() {
            Some(q @ (b'"' | b'\'')) => {
                let literal = self.parse_string(q)?;
                parse_date_literal(&literal)
                    .ok_or_else(|| self.err(format!("unrecognised date '{}'", literal)))?
            }
            Some(b) if b == b'-' || b.is_ascii_digit() => {
                let text = self.scan_number()?;
                let millis = text
                    .parse::<i64>()
                    .map_err(|_| self.err("epoch milliseconds must be an integer"))?;
                DateTime::from_timestamp_millis(millis)
                    .map(TimeExpr::Absolute)
                    .ok_or_else(|| self.err("epoch milliseconds out of range"))?
            }
            _ => {
                self.parse_now_term()?;
                TimeExpr::Relative {
                    offset_ms: self.parse_offset_tail()?,
                }
            }
        };

        self.skip_ws();
        self.expect(b')', "')' closing Date")?;
        Ok(time)
    }

    /// `Date.now()`, `new Date()` or `new Date().getTime()`.
    fn parse_now_term(&mut self) -> Result<(), ParseError> {
        let at = self.pos;
        match self.read_ident() {
            "Date" => {
                self.skip_ws();
                self.expect(b'.', "'.now()' after Date")?;
                self.expect_word("now")?;
                self.expect_empty_call()
            }
            "new" => {
                self.expect_word("Date")?;
                self.expect_empty_call()?;
                self.skip_ws();
                if self.eat(b'.') {
                    self.expect_word("getTime")?;
                    self.expect_empty_call()?;
                }
                Ok(())
            }
            _ => {
                self.pos = at;
                Err(self.err("date arguments must be a string, a number, or Date.now() arithmetic"))
            }
        }
    }

    /// Zero or more `+ a*b*...` / `- a*b*...` terms, in milliseconds.
    fn parse_offset_tail(&mut self) -> Result<i64, ParseError> {
        let mut total = 0f64;
        loop {
            self.skip_ws();
            let sign = match self.peek() {
                Some(b'-') => -1.0,
                Some(b'+') => 1.0,
                _ => break,
            };
            self.pos += 1;
            total += sign * self.parse_product()?;
            if !total.is_finite() || total.abs() > MAX_OFFSET_MS {
                return Err(self.err("date offset out of range"));
            }
        }
        Ok(total.round() as i64)
    }
}

/// Interpret a date string: ISO 8601 / RFC 3339, a plain date, `now`, or
/// `"<N> <unit>s ago"`.
fn parse_date_literal(literal: &str) -> Option<TimeExpr> {
    let text = literal.trim();
    if text.eq_ignore_ascii_case("now") {
        return Some(TimeExpr::now());
    }
    if let Some(caps) = RELATIVE_DATE_RE.captures(text) {
        let amount: f64 = caps[1].parse().ok()?;
        let unit_ms: f64 = match caps[2].to_lowercase().as_str() {
            "second" => 1_000.0,
            "minute" => 60_000.0,
            "hour" => 3_600_000.0,
            "day" => 86_400_000.0,
            "week" => 604_800_000.0,
            "month" => 2_592_000_000.0,
            _ => 31_536_000_000.0,
        };
        let offset = amount * unit_ms;
        if offset > MAX_OFFSET_MS {
            return None;
        }
        return Some(TimeExpr::Relative {
            offset_ms: -(offset as i64),
        });
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(TimeExpr::Absolute(at.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(TimeExpr::Absolute(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| TimeExpr::Absolute(naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const DAY_MS: i64 = 86_400_000;

    fn parse_one(src: &str) -> Result<Expr, ParseError> {
        let mut items = ExprParser::new(src, 0).parse_list()?;
        assert_eq!(items.len(), 1, "expected a single value in {}", src);
        Ok(items.remove(0))
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    // ---- Literals ----

    #[test]
    fn test_scalars() {
        assert_eq!(parse_one("null").unwrap(), Expr::Null);
        assert_eq!(parse_one("true").unwrap(), Expr::Bool(true));
        assert_eq!(parse_one("-1").unwrap(), Expr::Int(-1));
        assert_eq!(parse_one("2.5").unwrap(), Expr::Float(2.5));
        assert_eq!(parse_one("1e3").unwrap(), Expr::Float(1000.0));
        assert_eq!(parse_one("'EU'").unwrap(), Expr::String("EU".into()));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_one(r#""a\"b\nA""#).unwrap(),
            Expr::String("a\"b\nA".into())
        );
        assert_eq!(
            parse_one(r"'it\'s'").unwrap(),
            Expr::String("it's".into())
        );
    }

    #[test]
    fn test_object_preserves_key_order() {
        let expr = parse_one("{b: 1, a: -1, 'c d': 2}").unwrap();
        let keys: Vec<&str> = match &expr {
            Expr::Object(members) => members.iter().map(|(k, _)| k.as_str()).collect(),
            _ => panic!("expected object"),
        };
        assert_eq!(keys, vec!["b", "a", "c d"]);
    }

    #[test]
    fn test_operator_keys_and_nesting() {
        let expr = parse_one(r#"{total: {$gte: 100, $in: [1, 2.5, "x"]}}"#).unwrap();
        let total = expr.get("total").unwrap();
        assert_eq!(total.get("$gte"), Some(&Expr::Int(100)));
        assert_eq!(
            total.resolve(fixed_now()),
            json!({"$gte": 100, "$in": [1, 2.5, "x"]})
        );
    }

    #[test]
    fn test_list_of_arguments() {
        let items = ExprParser::new("{a: 1}, {_id: 0, a: 1}", 0)
            .parse_list()
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(ExprParser::new("  ", 0).parse_list().unwrap().is_empty());
    }

    // ---- Date constructors ----

    #[test]
    fn test_new_date_now() {
        assert_eq!(parse_one("new Date()").unwrap(), Expr::Time(TimeExpr::now()));
        assert_eq!(parse_one("Date()").unwrap(), Expr::Time(TimeExpr::now()));
    }

    #[test]
    fn test_date_now_arithmetic() {
        let expr = parse_one("new Date(Date.now() - 7 * 24 * 60 * 60 * 1000)").unwrap();
        assert_eq!(
            expr,
            Expr::Time(TimeExpr::Relative {
                offset_ms: -7 * DAY_MS
            })
        );

        let expr = parse_one("new Date(new Date().getTime() - (30 * 86400000))").unwrap();
        assert_eq!(
            expr,
            Expr::Time(TimeExpr::Relative {
                offset_ms: -30 * DAY_MS
            })
        );

        let expr = parse_one("Date.now() - 3600000").unwrap();
        assert_eq!(
            expr,
            Expr::Time(TimeExpr::Relative {
                offset_ms: -3_600_000
            })
        );
    }

    #[test]
    fn test_days_ago_literal() {
        let expr = parse_one(r#"new Date("7 days ago")"#).unwrap();
        assert_eq!(
            expr,
            Expr::Time(TimeExpr::Relative {
                offset_ms: -7 * DAY_MS
            })
        );
        let resolved = expr.resolve(fixed_now());
        assert_eq!(resolved, json!({"$date": "2024-06-08T12:00:00.000Z"}));
    }

    #[test]
    fn test_absolute_dates() {
        let iso = parse_one(r#"ISODate("2024-01-01T00:00:00Z")"#).unwrap();
        assert_eq!(
            iso.resolve(fixed_now()),
            json!({"$date": "2024-01-01T00:00:00.000Z"})
        );
        let plain = parse_one(r#"new Date('2024-03-05')"#).unwrap();
        assert_eq!(
            plain.resolve(fixed_now()),
            json!({"$date": "2024-03-05T00:00:00.000Z"})
        );
        let epoch = parse_one("new Date(0)").unwrap();
        assert_eq!(
            epoch.resolve(fixed_now()),
            json!({"$date": "1970-01-01T00:00:00.000Z"})
        );
    }

    #[test]
    fn test_unrecognised_date_literal_rejected() {
        let err = parse_one(r#"new Date("next tuesday")"#).unwrap_err();
        assert!(matches!(err, ParseError::ArgumentParseError { .. }));
    }

    // ---- Whitelist enforcement ----

    #[test]
    fn test_bare_identifier_rejected() {
        let err = parse_one("{a: someVariable}").unwrap_err();
        match err {
            ParseError::ArgumentParseError { position, reason } => {
                assert_eq!(position, 4);
                assert!(reason.contains("someVariable"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_call_expressions_rejected() {
        for src in [
            "{a: process.exit(1)}",
            "{a: require('fs')}",
            "{$where: eval('1')}",
            "{a: new Function('return 1')}",
            "{a: Date.parse('2024')}",
            "{a: new Date(Math.random())}",
            "{a: ObjectId('65a')}",
        ] {
            let err = parse_one(src).unwrap_err();
            assert!(
                matches!(err, ParseError::ArgumentParseError { .. }),
                "{} should be rejected, got {:?}",
                src,
                err
            );
        }
    }

    #[test]
    fn test_non_json_syntax_rejected() {
        for src in ["{a: /re/}", "{a: `tpl`}", "{a: 1 + 1}", "{a: undefined}", "{a: NaN}"] {
            assert!(parse_one(src).is_err(), "{} should be rejected", src);
        }
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        let err = parse_one(&deep).unwrap_err();
        assert!(err.to_string().contains("nesting too deep"));
    }

    #[test]
    fn test_offset_paren_nesting_limit() {
        let src = format!(
            "new Date(Date.now() - {}1{})",
            "(".repeat(10_000),
            ")".repeat(10_000)
        );
        let err = parse_one(&src).unwrap_err();
        assert!(err.to_string().contains("nesting too deep"));

        let shallow = parse_one("new Date(Date.now() - ((2) * (3 * (1000))))").unwrap();
        assert_eq!(shallow, Expr::Time(TimeExpr::Relative { offset_ms: -6000 }));
    }

    #[test]
    fn test_error_position_includes_base() {
        let err = ExprParser::new("{a: x}", 10).parse_list().unwrap_err();
        assert_eq!(
            err,
            ParseError::ArgumentParseError {
                position: 14,
                reason: "identifier `x` is not allowed".into()
            }
        );
    }

    #[test]
    fn test_offset_out_of_range() {
        let err = parse_one("new Date(Date.now() - 1e20)").unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
