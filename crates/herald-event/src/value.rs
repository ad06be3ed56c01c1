//! Typed event data values and their text literal grammar.
//!
//! Values travel on the wire as single-line literals in a small grammar
//! borrowed from GVariant text notation:
//!
//! - `'hello\nworld'` -- single-quoted string, `\\ \' \n \t \r` escapes
//! - `42`, `-7` -- signed decimal integer
//! - `3.25`, `-1e-3`, `inf`, `nan` -- double
//! - `true` / `false` -- boolean
//! - `(@ms 'text/plain', @ms nothing, <b'\x89PNG'>)` -- binary payload
//!   with optional MIME type (the `(msmsv)` triple)
//! - `<'nested'>` -- variant wrapping any other literal
//!
//! Every literal occupies exactly one line; newlines inside strings and
//! bytestrings are escaped, never raw.

use std::fmt;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single typed datum attached to an event under a string key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// A binary payload, e.g. a file to attach to a notification.
    Binary {
        mime: Option<String>,
        bytes: Vec<u8>,
    },
    /// A nested value wrapped as a variant.
    Variant(Box<Value>),
}

impl Value {
    /// Shorthand for a string value.
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    /// Parse a complete literal. Trailing bytes after the literal are an
    /// error; the whole input must be one value.
    pub fn parse_literal(input: &str) -> Result<Self, ValueError> {
        let mut p = Reader::new(input);
        p.skip_spaces();
        let value = p.parse_value()?;
        p.skip_spaces();
        if !p.at_end() {
            return Err(ValueError::Trailing {
                at: p.pos,
            });
        }
        Ok(value)
    }
}

impl fmt::Display for Value {
    /// Serialize to the literal grammar. The output never contains a raw
    /// newline, so a generated `DATA` line is always a single line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write_quoted(f, s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write_float(f, *x),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Binary { mime, bytes } => {
                f.write_str("(@ms ")?;
                match mime {
                    Some(m) => write_quoted(f, m)?,
                    None => f.write_str("nothing")?,
                }
                f.write_str(", @ms nothing, <b")?;
                write_bytestring(f, bytes)?;
                f.write_str(">)")
            }
            Value::Variant(inner) => write!(f, "<{}>", inner),
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\'' => f.write_str("\\'")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("'")
}

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_nan() {
        return f.write_str("nan");
    }
    if x.is_infinite() {
        return f.write_str(if x < 0.0 { "-inf" } else { "inf" });
    }
    let s = format!("{}", x);
    // Keep the literal unambiguously a double so it re-parses as one.
    if s.contains('.') || s.contains('e') || s.contains('E') {
        f.write_str(&s)
    } else {
        write!(f, "{}.0", s)
    }
}

fn write_bytestring(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    f.write_str("'")?;
    for &b in bytes {
        match b {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\n' => f.write_str("\\n")?,
            b'\t' => f.write_str("\\t")?,
            b'\r' => f.write_str("\\r")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            b => write!(f, "\\x{:02x}", b)?,
        }
    }
    f.write_str("'")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Literal grammar violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("unexpected end of literal")]
    UnexpectedEnd,
    #[error("unexpected character {found:?} at offset {at}")]
    UnexpectedChar { found: char, at: usize },
    #[error("invalid escape sequence '\\{escape}' at offset {at}")]
    BadEscape { escape: char, at: usize },
    #[error("invalid number literal {literal:?}")]
    BadNumber { literal: String },
    #[error("unknown type tag '@{tag}' at offset {at}")]
    UnknownTag { tag: String, at: usize },
    #[error("trailing bytes after literal at offset {at}")]
    Trailing { at: usize },
}

// ---------------------------------------------------------------------------
// Reader (recursive-descent parser)
// ---------------------------------------------------------------------------

struct Reader<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str) -> Self {
        Reader { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Result<char, ValueError> {
        let c = self.peek().ok_or(ValueError::UnexpectedEnd)?;
        self.pos += c.len_utf8();
        Ok(c)
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), ValueError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(ValueError::UnexpectedChar {
                found: c,
                at: self.pos,
            }),
            None => Err(ValueError::UnexpectedEnd),
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.rest().starts_with(kw) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Value, ValueError> {
        match self.peek() {
            None => Err(ValueError::UnexpectedEnd),
            Some('\'') => Ok(Value::String(self.parse_string()?)),
            Some('<') => self.parse_variant(),
            Some('(') => self.parse_binary_triple(),
            Some('b') if self.rest().starts_with("b'") => {
                self.pos += 1;
                Ok(Value::Binary {
                    mime: None,
                    bytes: self.parse_bytestring()?,
                })
            }
            Some('t') if self.eat_keyword("true") => Ok(Value::Boolean(true)),
            Some('f') if self.eat_keyword("false") => Ok(Value::Boolean(false)),
            Some('n') if self.eat_keyword("nan") => Ok(Value::Float(f64::NAN)),
            Some('i') if self.eat_keyword("inf") => Ok(Value::Float(f64::INFINITY)),
            Some('@') => {
                let start = self.pos + 1;
                self.pos = start;
                let tag: String = self
                    .rest()
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect();
                Err(ValueError::UnknownTag { tag, at: start })
            }
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some(c) => Err(ValueError::UnexpectedChar {
                found: c,
                at: self.pos,
            }),
        }
    }

    fn parse_string(&mut self) -> Result<String, ValueError> {
        self.expect('\'')?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '\'' => return Ok(out),
                '\\' => {
                    let at = self.pos;
                    match self.bump()? {
                        '\\' => out.push('\\'),
                        '\'' => out.push('\''),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        other => {
                            return Err(ValueError::BadEscape { escape: other, at });
                        }
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn parse_bytestring(&mut self) -> Result<Vec<u8>, ValueError> {
        self.expect('\'')?;
        let mut out = Vec::new();
        loop {
            match self.bump()? {
                '\'' => return Ok(out),
                '\\' => {
                    let at = self.pos;
                    match self.bump()? {
                        '\\' => out.push(b'\\'),
                        '\'' => out.push(b'\''),
                        'n' => out.push(b'\n'),
                        't' => out.push(b'\t'),
                        'r' => out.push(b'\r'),
                        'x' => {
                            let hex = self.rest().get(..2).ok_or(ValueError::UnexpectedEnd)?;
                            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                                ValueError::BadEscape { escape: 'x', at }
                            })?;
                            self.pos += 2;
                            out.push(byte);
                        }
                        other => {
                            return Err(ValueError::BadEscape { escape: other, at });
                        }
                    }
                }
                c if c.is_ascii() => out.push(c as u8),
                c => {
                    return Err(ValueError::UnexpectedChar {
                        found: c,
                        at: self.pos - c.len_utf8(),
                    });
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, ValueError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
            if self.eat_keyword("inf") {
                return Ok(Value::Float(f64::NEG_INFINITY));
            }
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => self.pos += 1,
                '.' | 'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                }
                '+' | '-' if is_float => self.pos += 1,
                _ => break,
            }
        }
        let literal = &self.input[start..self.pos];
        if is_float {
            literal
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ValueError::BadNumber {
                    literal: literal.to_owned(),
                })
        } else {
            literal
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| ValueError::BadNumber {
                    literal: literal.to_owned(),
                })
        }
    }

    fn parse_variant(&mut self) -> Result<Value, ValueError> {
        self.expect('<')?;
        self.skip_spaces();
        let inner = self.parse_value()?;
        self.skip_spaces();
        self.expect('>')?;
        Ok(Value::Variant(Box::new(inner)))
    }

    /// The `(msmsv)` triple used for file payloads: two maybe-strings
    /// (MIME type and a reserved slot) and a variant-wrapped bytestring.
    fn parse_binary_triple(&mut self) -> Result<Value, ValueError> {
        self.expect('(')?;
        self.skip_spaces();
        let mime = self.parse_maybe_string()?;
        self.skip_spaces();
        self.expect(',')?;
        self.skip_spaces();
        // Reserved slot; parsed for wire compatibility, content unused.
        let _reserved = self.parse_maybe_string()?;
        self.skip_spaces();
        self.expect(',')?;
        self.skip_spaces();
        self.expect('<')?;
        self.skip_spaces();
        self.expect('b')?;
        let bytes = self.parse_bytestring()?;
        self.skip_spaces();
        self.expect('>')?;
        self.skip_spaces();
        self.expect(')')?;
        Ok(Value::Binary { mime, bytes })
    }

    fn parse_maybe_string(&mut self) -> Result<Option<String>, ValueError> {
        if self.eat_keyword("@ms") {
            self.skip_spaces();
        }
        if self.eat_keyword("nothing") {
            return Ok(None);
        }
        self.parse_string().map(Some)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let text = v.to_string();
        assert!(!text.contains('\n'), "literal must be one line: {:?}", text);
        let back = Value::parse_literal(&text).expect(&text);
        assert_eq!(back, v, "through {:?}", text);
    }

    #[test]
    fn string_roundtrip_with_escapes() {
        roundtrip(Value::string("world"));
        roundtrip(Value::string("it's\na\ttrap\r"));
        roundtrip(Value::string("back\\slash"));
        roundtrip(Value::string(""));
        roundtrip(Value::string(".\ninside\n"));
    }

    #[test]
    fn string_literal_encodes_newlines() {
        let text = Value::string(".\ninside\n").to_string();
        assert_eq!(text, "'.\\ninside\\n'");
    }

    #[test]
    fn numbers_roundtrip() {
        roundtrip(Value::Integer(0));
        roundtrip(Value::Integer(-42));
        roundtrip(Value::Integer(i64::MAX));
        roundtrip(Value::Float(3.25));
        roundtrip(Value::Float(-0.5e-3));
        roundtrip(Value::Float(2.0));
        roundtrip(Value::Float(f64::INFINITY));
        roundtrip(Value::Float(f64::NEG_INFINITY));
    }

    #[test]
    fn float_always_reparses_as_float() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        match Value::parse_literal("2.0").unwrap() {
            Value::Float(x) => assert_eq!(x, 2.0),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn booleans() {
        assert_eq!(Value::parse_literal("true").unwrap(), Value::Boolean(true));
        assert_eq!(Value::parse_literal("false").unwrap(), Value::Boolean(false));
    }

    #[test]
    fn binary_triple_roundtrip() {
        roundtrip(Value::Binary {
            mime: Some("image/png".to_owned()),
            bytes: vec![0x89, b'P', b'N', b'G', b'\n', 0x00],
        });
        roundtrip(Value::Binary {
            mime: None,
            bytes: b"plain".to_vec(),
        });
    }

    #[test]
    fn binary_triple_text_shape() {
        let v = Value::Binary {
            mime: Some("text/plain".to_owned()),
            bytes: b"hi".to_vec(),
        };
        assert_eq!(v.to_string(), "(@ms 'text/plain', @ms nothing, <b'hi'>)");
    }

    #[test]
    fn variant_nesting() {
        roundtrip(Value::Variant(Box::new(Value::string("inner"))));
        roundtrip(Value::Variant(Box::new(Value::Variant(Box::new(
            Value::Integer(7),
        )))));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        match Value::parse_literal("@u 12") {
            Err(ValueError::UnknownTag { tag, .. }) => assert_eq!(tag, "u"),
            other => panic!("expected UnknownTag, got {:?}", other),
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert!(matches!(
            Value::parse_literal("'a' 'b'"),
            Err(ValueError::Trailing { .. })
        ));
        assert!(matches!(
            Value::parse_literal("12x"),
            Err(ValueError::Trailing { .. })
        ));
    }

    #[test]
    fn bad_escape_is_rejected() {
        assert!(matches!(
            Value::parse_literal("'\\q'"),
            Err(ValueError::BadEscape { escape: 'q', .. })
        ));
    }

    #[test]
    fn unterminated_string_is_rejected() {
        assert_eq!(
            Value::parse_literal("'open"),
            Err(ValueError::UnexpectedEnd)
        );
    }

    #[test]
    fn nan_parses() {
        match Value::parse_literal("nan").unwrap() {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("expected nan, got {:?}", other),
        }
    }
}
