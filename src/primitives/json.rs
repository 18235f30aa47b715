//! A JSON parser that enforces a byte-size ceiling and a nesting-depth ceiling as it
//! goes, instead of after the fact. `serde_json::Value` has no concept of "too deep" —
//! by the time a naively-parsed `Value` exists, the stack frames for however deep the
//! input nested have already been spent. This walks the input itself and refuses to
//! recurse past the configured depth.

use std::fmt;

/// Limits applied while parsing a JSON document.
#[derive(Debug, Clone, Copy)]
pub struct JsonLimits {
    /// Maximum input size, in bytes.
    pub max_bytes: usize,
    /// Maximum nesting depth of arrays and objects combined.
    pub max_depth: usize,
}

impl Default for JsonLimits {
    fn default() -> Self {
        JsonLimits {
            max_bytes: 1024 * 1024,
            max_depth: 20,
        }
    }
}

/// A failure to parse a JSON document within the configured [`JsonLimits`].
#[derive(Debug, Clone, PartialEq)]
pub enum JsonError {
    /// The input exceeded `max_bytes`.
    TooLarge { size: usize, limit: usize },
    /// The input nested arrays/objects deeper than `max_depth`.
    TooDeep { limit: usize },
    /// The input was not well-formed JSON.
    Malformed(String),
    /// The input, once parsed, did not terminate at EOF (trailing garbage).
    TrailingData,
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonError::TooLarge { size, limit } => {
                write!(f, "json body too large: {size} bytes (limit {limit})")
            }
            JsonError::TooDeep { limit } => write!(f, "json nesting exceeds limit of {limit}"),
            JsonError::Malformed(msg) => write!(f, "malformed json: {msg}"),
            JsonError::TrailingData => write!(f, "trailing data after json value"),
        }
    }
}

impl std::error::Error for JsonError {}

/// Parses `input` into a [`serde_json::Value`], rejecting documents that violate
/// `limits.max_bytes` or `limits.max_depth` before they can consume unbounded
/// stack or heap.
pub fn parse_json(input: &[u8], limits: JsonLimits) -> Result<serde_json::Value, JsonError> {
    if input.len() > limits.max_bytes {
        return Err(JsonError::TooLarge {
            size: input.len(),
            limit: limits.max_bytes,
        });
    }

    let text = std::str::from_utf8(input).map_err(|e| JsonError::Malformed(e.to_string()))?;
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: 0,
        max_depth: limits.max_depth,
    };
    let value = parser.parse_value(0)?;
    parser.skip_whitespace();
    if parser.pos != parser.bytes.len() {
        return Err(JsonError::TrailingData);
    }
    Ok(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    max_depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), JsonError> {
        if self.bump() == Some(byte) {
            Ok(())
        } else {
            Err(JsonError::Malformed(format!(
                "expected '{}' at byte {}",
                byte as char, self.pos
            )))
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<serde_json::Value, JsonError> {
        if depth > self.max_depth {
            return Err(JsonError::TooDeep {
                limit: self.max_depth,
            });
        }
        self.skip_whitespace();
        match self.peek() {
            Some(b'{') => self.parse_object(depth),
            Some(b'[') => self.parse_array(depth),
            Some(b'"') => Ok(serde_json::Value::String(self.parse_string()?)),
            Some(b't') => self.parse_literal("true", serde_json::Value::Bool(true)),
            Some(b'f') => self.parse_literal("false", serde_json::Value::Bool(false)),
            Some(b'n') => self.parse_literal("null", serde_json::Value::Null),
            Some(c) if c == b'-' || c.is_ascii_digit() => self.parse_number(),
            Some(c) => Err(JsonError::Malformed(format!(
                "unexpected character '{}' at byte {}",
                c as char, self.pos
            ))),
            None => Err(JsonError::Malformed("unexpected end of input".into())),
        }
    }

    fn parse_literal(
        &mut self,
        literal: &str,
        value: serde_json::Value,
    ) -> Result<serde_json::Value, JsonError> {
        let end = self.pos + literal.len();
        if self.bytes.get(self.pos..end) == Some(literal.as_bytes()) {
            self.pos = end;
            Ok(value)
        } else {
            Err(JsonError::Malformed(format!(
                "expected '{literal}' at byte {}",
                self.pos
            )))
        }
    }

    fn parse_object(&mut self, depth: usize) -> Result<serde_json::Value, JsonError> {
        self.expect(b'{')?;
        let mut map = serde_json::Map::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(serde_json::Value::Object(map));
        }
        loop {
            self.skip_whitespace();
            let key = self.parse_string()?;
            self.skip_whitespace();
            self.expect(b':')?;
            let value = self.parse_value(depth + 1)?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') => break,
                _ => {
                    return Err(JsonError::Malformed(format!(
                        "expected ',' or '}}' at byte {}",
                        self.pos
                    )))
                }
            }
        }
        Ok(serde_json::Value::Object(map))
    }

    fn parse_array(&mut self, depth: usize) -> Result<serde_json::Value, JsonError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(serde_json::Value::Array(items));
        }
        loop {
            let value = self.parse_value(depth + 1)?;
            items.push(value);
            self.skip_whitespace();
            match self.bump() {
                Some(b',') => continue,
                Some(b']') => break,
                _ => {
                    return Err(JsonError::Malformed(format!(
                        "expected ',' or ']' at byte {}",
                        self.pos
                    )))
                }
            }
        }
        Ok(serde_json::Value::Array(items))
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'u') => out.push(self.parse_unicode_escape()?),
                    _ => return Err(JsonError::Malformed("invalid escape sequence".into())),
                },
                Some(b) if b < 0x80 => out.push(b as char),
                Some(b) => {
                    // Part of a multi-byte UTF-8 sequence; the caller already validated
                    // the whole input is UTF-8, so splice the raw bytes back in.
                    let start = self.pos - 1;
                    let extra = utf8_extra_len(b);
                    let end = (start + 1 + extra).min(self.bytes.len());
                    let s = std::str::from_utf8(&self.bytes[start..end])
                        .map_err(|e| JsonError::Malformed(e.to_string()))?;
                    out.push_str(s);
                    self.pos = end;
                }
                None => return Err(JsonError::Malformed("unterminated string".into())),
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> Result<char, JsonError> {
        let hi = self.read_hex4()?;
        if (0xD800..=0xDBFF).contains(&hi) {
            if self.bump() != Some(b'\\') || self.bump() != Some(b'u') {
                return Err(JsonError::Malformed("unpaired surrogate".into()));
            }
            let lo = self.read_hex4()?;
            if !(0xDC00..=0xDFFF).contains(&lo) {
                return Err(JsonError::Malformed("invalid low surrogate".into()));
            }
            let c = 0x10000 + ((hi - 0xD800) << 10) + (lo - 0xDC00);
            char::from_u32(c).ok_or_else(|| JsonError::Malformed("invalid surrogate pair".into()))
        } else {
            char::from_u32(hi).ok_or_else(|| JsonError::Malformed("invalid unicode escape".into()))
        }
    }

    fn read_hex4(&mut self) -> Result<u32, JsonError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let b = self
                .bump()
                .ok_or_else(|| JsonError::Malformed("truncated unicode escape".into()))?;
            let digit = (b as char)
                .to_digit(16)
                .ok_or_else(|| JsonError::Malformed("invalid hex digit in escape".into()))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn parse_number(&mut self) -> Result<serde_json::Value, JsonError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let slice = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        let number: serde_json::Number = slice
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .ok_or_else(|| JsonError::Malformed(format!("invalid number '{slice}'")))?;
        Ok(serde_json::Value::Number(number))
    }
}

fn utf8_extra_len(first_byte: u8) -> usize {
    if first_byte & 0xE0 == 0xC0 {
        1
    } else if first_byte & 0xF0 == 0xE0 {
        2
    } else if first_byte & 0xF8 == 0xF0 {
        3
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_object() {
        let v = parse_json(br#"{"a":1,"b":"two","c":[1,2,3],"d":null}"#, JsonLimits::default())
            .unwrap();
        assert_eq!(v["a"], 1);
        assert_eq!(v["b"], "two");
        assert_eq!(v["d"], serde_json::Value::Null);
    }

    #[test]
    fn rejects_oversize_input() {
        let limits = JsonLimits {
            max_bytes: 4,
            max_depth: 20,
        };
        let err = parse_json(b"{\"a\":1}", limits).unwrap_err();
        assert!(matches!(err, JsonError::TooLarge { .. }));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let limits = JsonLimits {
            max_bytes: 1024,
            max_depth: 3,
        };
        let nested = "[[[[1]]]]";
        let err = parse_json(nested.as_bytes(), limits).unwrap_err();
        assert!(matches!(err, JsonError::TooDeep { .. }));
    }

    #[test]
    fn accepts_nesting_at_the_limit() {
        let limits = JsonLimits {
            max_bytes: 1024,
            max_depth: 3,
        };
        let nested = "[[[1]]]";
        assert!(parse_json(nested.as_bytes(), limits).is_ok());
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse_json(b"{\"a\":1} garbage", JsonLimits::default()).unwrap_err();
        assert!(matches!(err, JsonError::TrailingData));
    }

    #[test]
    fn parses_escaped_unicode() {
        let v = parse_json(br#"{"a":"café"}"#, JsonLimits::default()).unwrap();
        assert_eq!(v["a"], "café");
    }
}
