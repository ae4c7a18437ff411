//! Turning sandbox return payloads back into values.
//!
//! Decoding is total: a payload that cannot be classified comes back as
//! [`DecodedValue::Raw`] instead of an error.

use std::fmt;

use base64::Engine;
use image::DynamicImage;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::sandbox::{PayloadKind, RawValue};

/// Largest base64 image payload that will be materialized.
pub const MAX_IMAGE_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// A snippet's output after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    None,
    Bool(bool),
    Number(Number),
    Text(String),
    /// Mappings and sequences
    Structured(Value),
    Image(DynamicImage),
    /// A payload that could not be classified, as received
    Raw(String),
}

impl DecodedValue {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&DynamicImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    /// JSON view of the value; images are summarized by their dimensions.
    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(text) | Self::Raw(text) => Value::String(text.clone()),
            Self::Structured(value) => value.clone(),
            Self::Image(image) => serde_json::json!({
                "image": { "width": image.width(), "height": image.height() }
            }),
        }
    }

    fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::Text(s),
            structured => Self::Structured(structured),
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bool(true) => write!(f, "True"),
            Self::Bool(false) => write!(f, "False"),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(text) | Self::Raw(text) => write!(f, "{}", text),
            Self::Structured(value) => write!(f, "{}", value),
            Self::Image(image) => write!(f, "<image {}x{}>", image.width(), image.height()),
        }
    }
}

/// Decode `data` according to how the sandbox says it was serialized.
pub fn decode(data: &str, hint: PayloadKind) -> DecodedValue {
    match hint {
        PayloadKind::Text => DecodedValue::Text(data.to_string()),
        PayloadKind::Json => match serde_json::from_str::<Value>(data) {
            Ok(value) => DecodedValue::from_json(value),
            Err(e) => {
                debug!(error = %e, "Payload is not valid JSON");
                DecodedValue::Raw(data.to_string())
            }
        },
        PayloadKind::Repr => match python_literal::parse(data) {
            Some(value) => DecodedValue::from_json(value),
            None => DecodedValue::Raw(data.to_string()),
        },
        PayloadKind::Image => match decode_image(data) {
            Some(image) => DecodedValue::Image(image),
            None => DecodedValue::Raw(data.to_string()),
        },
    }
}

pub fn decode_raw(raw: &RawValue) -> DecodedValue {
    decode(&raw.data, raw.kind)
}

fn decode_image(data: &str) -> Option<DynamicImage> {
    if data.len() > MAX_IMAGE_PAYLOAD_BYTES {
        warn!(
            size = data.len(),
            limit = MAX_IMAGE_PAYLOAD_BYTES,
            "Image payload too large, returning it undecoded"
        );
        return None;
    }

    // Tolerate data URLs and wrapped base64
    let encoded = data
        .split_once(";base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(data);
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();

    let bytes = match base64::engine::general_purpose::STANDARD.decode(compact) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Image payload is not valid base64");
            return None;
        }
    };
    match image::load_from_memory(&bytes) {
        Ok(image) => Some(image),
        Err(e) => {
            debug!(error = %e, "Image payload could not be decoded");
            None
        }
    }
}

/// Parser for the subset of Python `repr()` output that maps onto JSON:
/// dicts, lists, tuples, strings, numbers, booleans and `None`.
mod python_literal {
    use super::*;

    pub fn parse(text: &str) -> Option<Value> {
        let mut parser = Parser {
            chars: text.trim().chars().collect(),
            pos: 0,
        };
        let value = parser.value()?;
        parser.skip_whitespace();
        (parser.pos == parser.chars.len()).then_some(value)
    }

    struct Parser {
        chars: Vec<char>,
        pos: usize,
    }

    impl Parser {
        fn peek(&self) -> Option<char> {
            self.chars.get(self.pos).copied()
        }

        fn skip_whitespace(&mut self) {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
        }

        fn eat(&mut self, expected: char) -> bool {
            self.skip_whitespace();
            if self.peek() == Some(expected) {
                self.pos += 1;
                true
            } else {
                false
            }
        }

        fn value(&mut self) -> Option<Value> {
            self.skip_whitespace();
            match self.peek()? {
                '{' => self.dict(),
                '[' => self.sequence(']'),
                '(' => self.sequence(')'),
                '\'' | '"' => self.string().map(Value::String),
                c if c == '-' || c == '+' || c.is_ascii_digit() => self.number(),
                _ => self.keyword(),
            }
        }

        fn sequence(&mut self, close: char) -> Option<Value> {
            self.pos += 1;
            let mut items = Vec::new();
            loop {
                if self.eat(close) {
                    return Some(Value::Array(items));
                }
                items.push(self.value()?);
                if !self.eat(',') {
                    return self.eat(close).then_some(Value::Array(items));
                }
            }
        }

        fn dict(&mut self) -> Option<Value> {
            self.pos += 1;
            let mut map = Map::new();
            loop {
                if self.eat('}') {
                    return Some(Value::Object(map));
                }
                let key = match self.value()? {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => (if b { "True" } else { "False" }).to_string(),
                    Value::Null => "None".to_string(),
                    _ => return None,
                };
                if !self.eat(':') {
                    return None;
                }
                map.insert(key, self.value()?);
                if !self.eat(',') {
                    return self.eat('}').then_some(Value::Object(map));
                }
            }
        }

        fn string(&mut self) -> Option<String> {
            let quote = self.peek()?;
            self.pos += 1;
            let mut out = String::new();
            loop {
                let c = self.peek()?;
                self.pos += 1;
                match c {
                    c if c == quote => return Some(out),
                    '\\' => {
                        let escaped = self.peek()?;
                        self.pos += 1;
                        match escaped {
                            'n' => out.push('\n'),
                            't' => out.push('\t'),
                            'r' => out.push('\r'),
                            '0' => out.push('\0'),
                            'x' => out.push(self.hex_escape(2)?),
                            'u' => out.push(self.hex_escape(4)?),
                            'U' => out.push(self.hex_escape(8)?),
                            other => out.push(other),
                        }
                    }
                    c => out.push(c),
                }
            }
        }

        fn hex_escape(&mut self, digits: usize) -> Option<char> {
            let hex: String = self.chars.get(self.pos..self.pos + digits)?.iter().collect();
            self.pos += digits;
            char::from_u32(u32::from_str_radix(&hex, 16).ok()?)
        }

        fn number(&mut self) -> Option<Value> {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'))
            {
                self.pos += 1;
            }
            let text: String = self.chars[start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();

            if let Ok(i) = text.parse::<i64>() {
                return Some(Value::Number(i.into()));
            }
            if let Ok(u) = text.parse::<u64>() {
                return Some(Value::Number(u.into()));
            }
            // Rejects inf/nan, which JSON cannot carry
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
        }

        fn keyword(&mut self) -> Option<Value> {
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            let word: String = self.chars[start..self.pos].iter().collect();
            match word.as_str() {
                "None" => Some(Value::Null),
                "True" => Some(Value::Bool(true)),
                "False" => Some(Value::Bool(false)),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;
    use std::io::Cursor;

    fn png_base64(width: u32, height: u32) -> String {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 0, 0])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_text_passes_through() {
        assert_eq!(
            decode("This is the final answer", PayloadKind::Text),
            DecodedValue::Text("This is the final answer".to_string())
        );
        // Text is never reinterpreted, even when it looks like JSON
        assert_eq!(
            decode("[1, 2]", PayloadKind::Text),
            DecodedValue::Text("[1, 2]".to_string())
        );
    }

    #[test]
    fn test_json_payloads() {
        assert_eq!(decode("42", PayloadKind::Json), DecodedValue::Number(42.into()));
        assert_eq!(decode("true", PayloadKind::Json), DecodedValue::Bool(true));
        assert_eq!(decode("null", PayloadKind::Json), DecodedValue::None);
        assert_eq!(
            decode(r#"{"k": [1, null]}"#, PayloadKind::Json),
            DecodedValue::Structured(json!({"k": [1, null]}))
        );
        assert_eq!(
            decode("NaN", PayloadKind::Json),
            DecodedValue::Raw("NaN".to_string())
        );
    }

    #[test]
    fn test_repr_payloads() {
        assert_eq!(
            decode("'X'", PayloadKind::Repr),
            DecodedValue::Text("X".to_string())
        );
        assert_eq!(
            decode("{'a': 1, 'b': [1.5, None, True], 2: (3, 4)}", PayloadKind::Repr),
            DecodedValue::Structured(json!({"a": 1, "b": [1.5, null, true], "2": [3, 4]}))
        );
        assert_eq!(
            decode("\"it's\\n\"", PayloadKind::Repr),
            DecodedValue::Text("it's\n".to_string())
        );
        assert_eq!(decode("-3", PayloadKind::Repr), DecodedValue::Number((-3).into()));
        assert_eq!(
            decode("(1,)", PayloadKind::Repr),
            DecodedValue::Structured(json!([1]))
        );
        assert_eq!(decode("None", PayloadKind::Repr), DecodedValue::None);
    }

    #[test]
    fn test_unclassifiable_repr_is_returned_raw() {
        let opaque = "<__main__.Thing object at 0x7f3a2c>";
        assert_eq!(
            decode(opaque, PayloadKind::Repr),
            DecodedValue::Raw(opaque.to_string())
        );
        assert_eq!(
            decode("nan", PayloadKind::Repr),
            DecodedValue::Raw("nan".to_string())
        );
        assert_eq!(
            decode("[1, 2", PayloadKind::Repr),
            DecodedValue::Raw("[1, 2".to_string())
        );
    }

    #[test]
    fn test_image_payload_becomes_image() {
        let decoded = decode(&png_base64(10, 10), PayloadKind::Image);
        let image = decoded.as_image().expect("decoded image");
        assert_eq!((image.width(), image.height()), (10, 10));
        assert_eq!(decoded.to_string(), "<image 10x10>");

        let data_url = format!("data:image/png;base64,{}", png_base64(2, 3));
        let image = decode(&data_url, PayloadKind::Image);
        assert_eq!(image.as_image().map(|i| i.height()), Some(3));
    }

    #[test]
    fn test_broken_image_is_returned_raw() {
        assert_eq!(
            decode("not base64!", PayloadKind::Image),
            DecodedValue::Raw("not base64!".to_string())
        );
        // Valid base64, but not an image
        assert_eq!(
            decode("aGVsbG8=", PayloadKind::Image),
            DecodedValue::Raw("aGVsbG8=".to_string())
        );
    }

    #[test]
    fn test_to_json() {
        assert_eq!(DecodedValue::None.to_json(), Value::Null);
        assert_eq!(
            DecodedValue::Text("x".to_string()).to_json(),
            Value::String("x".to_string())
        );
        let image = decode(&png_base64(4, 5), PayloadKind::Image);
        assert_eq!(
            image.to_json(),
            json!({"image": {"width": 4, "height": 5}})
        );
    }
}
