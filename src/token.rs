//! Incremental byte-to-token JSON lexer.
//!
//! The streaming view decoder (`crate::view`) and the other array-shaped
//! streaming decoders (`crate::bulk`, `crate::mango`) need to consume a JSON
//! response body token-by-token as bytes arrive over the wire, without ever
//! buffering a whole response. [`tokenize`] turns a `Stream` of raw byte
//! chunks (as produced by `reqwest::Response::bytes_stream`) into a `Stream`
//! of [`JsonToken`]s, carrying just enough nested-structure context
//! (`Ctx::Object`/`Ctx::Array`) to tell a field name apart from a string
//! value.
use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::CouchError;

/// One lexical unit of a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonToken {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    FieldName(String),
    StringValue(String),
    NumberValue(f64),
    BooleanValue(bool),
    NullValue,
}

enum Ctx {
    Object { expect_key: bool },
    Array,
}

/// Holds the not-yet-tokenized tail of the byte stream and the nesting
/// context needed to disambiguate object keys from string values.
struct Scanner {
    buf: Vec<u8>,
    stack: Vec<Ctx>,
    eof: bool,
}

impl Scanner {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            stack: Vec::new(),
            eof: false,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to scan the next token starting at the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer doesn't yet hold a complete token
    /// and more bytes are needed (unless `self.eof`, in which case a
    /// dangling partial token is a parse error).
    fn next_token(&mut self) -> Result<Option<JsonToken>, CouchError> {
        loop {
            let skip = self.buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if skip > 0 {
                self.buf.drain(..skip);
            }
            if self.buf.is_empty() {
                return Ok(None);
            }
            let b = self.buf[0];
            match b {
                b'{' => {
                    self.buf.remove(0);
                    self.stack.push(Ctx::Object { expect_key: true });
                    return Ok(Some(JsonToken::StartObject));
                }
                b'}' => {
                    self.buf.remove(0);
                    self.stack.pop();
                    self.after_value();
                    return Ok(Some(JsonToken::EndObject));
                }
                b'[' => {
                    self.buf.remove(0);
                    self.stack.push(Ctx::Array);
                    return Ok(Some(JsonToken::StartArray));
                }
                b']' => {
                    self.buf.remove(0);
                    self.stack.pop();
                    self.after_value();
                    return Ok(Some(JsonToken::EndArray));
                }
                b',' => {
                    self.buf.remove(0);
                    if let Some(Ctx::Object { expect_key }) = self.stack.last_mut() {
                        *expect_key = true;
                    }
                    continue;
                }
                b':' => {
                    self.buf.remove(0);
                    continue;
                }
                b'"' => return self.scan_string(),
                b't' | b'f' => return self.scan_bool(),
                b'n' => return self.scan_null(),
                _ => return self.scan_number(),
            }
        }
    }

    /// After closing a container or reading a scalar value while directly
    /// inside an object, the next string we see is a value again, not a key,
    /// until the next `,` flips `expect_key` back on.
    fn after_value(&mut self) {
        if let Some(Ctx::Object { expect_key }) = self.stack.last_mut() {
            *expect_key = false;
        }
    }

    fn is_key_position(&self) -> bool {
        matches!(self.stack.last(), Some(Ctx::Object { expect_key: true }))
    }

    fn scan_string(&mut self) -> Result<Option<JsonToken>, CouchError> {
        let mut i = 1;
        let mut out = String::new();
        loop {
            if i >= self.buf.len() {
                return if self.eof {
                    Err(json_err("unterminated string"))
                } else {
                    Ok(None)
                };
            }
            match self.buf[i] {
                b'"' => {
                    let as_key = self.is_key_position();
                    self.buf.drain(..=i);
                    return Ok(Some(if as_key {
                        self.after_value_keeps_key_flag();
                        JsonToken::FieldName(out)
                    } else {
                        self.after_value();
                        JsonToken::StringValue(out)
                    }));
                }
                b'\\' => {
                    if i + 1 >= self.buf.len() {
                        return if self.eof {
                            Err(json_err("unterminated escape"))
                        } else {
                            Ok(None)
                        };
                    }
                    match self.buf[i + 1] {
                        b'"' => {
                            out.push('"');
                            i += 2;
                        }
                        b'\\' => {
                            out.push('\\');
                            i += 2;
                        }
                        b'/' => {
                            out.push('/');
                            i += 2;
                        }
                        b'n' => {
                            out.push('\n');
                            i += 2;
                        }
                        b't' => {
                            out.push('\t');
                            i += 2;
                        }
                        b'r' => {
                            out.push('\r');
                            i += 2;
                        }
                        b'b' => {
                            out.push('\u{0008}');
                            i += 2;
                        }
                        b'f' => {
                            out.push('\u{000C}');
                            i += 2;
                        }
                        b'u' => {
                            if i + 6 > self.buf.len() {
                                return if self.eof {
                                    Err(json_err("unterminated unicode escape"))
                                } else {
                                    Ok(None)
                                };
                            }
                            let hex = std::str::from_utf8(&self.buf[i + 2..i + 6])
                                .map_err(|_| json_err("invalid unicode escape"))?;
                            let code = u32::from_str_radix(hex, 16)
                                .map_err(|_| json_err("invalid unicode escape"))?;
                            out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                            i += 6;
                        }
                        _ => return Err(json_err("invalid escape sequence")),
                    }
                }
                c => {
                    // Copy raw UTF-8 bytes verbatim; re-decoding happens once
                    // the whole string has been collected below.
                    let start = i;
                    while i < self.buf.len() && self.buf[i] != b'"' && self.buf[i] != b'\\' {
                        i += 1;
                    }
                    let chunk = std::str::from_utf8(&self.buf[start..i])
                        .map_err(|_| json_err("invalid utf8 in string"))?;
                    out.push_str(chunk);
                    let _ = c;
                }
            }
        }
    }

    // Field names never change `expect_key` themselves; the `:` that follows
    // them is a structural separator, and `expect_key` stays false for the
    // value, flipping back true only on the next `,`.
    fn after_value_keeps_key_flag(&mut self) {
        if let Some(Ctx::Object { expect_key }) = self.stack.last_mut() {
            *expect_key = false;
        }
    }

    fn scan_bool(&mut self) -> Result<Option<JsonToken>, CouchError> {
        if self.buf.starts_with(b"true") {
            self.buf.drain(..4);
            self.after_value();
            Ok(Some(JsonToken::BooleanValue(true)))
        } else if self.buf.starts_with(b"false") {
            self.buf.drain(..5);
            self.after_value();
            Ok(Some(JsonToken::BooleanValue(false)))
        } else if !self.eof && self.buf.len() < 5 {
            Ok(None)
        } else {
            Err(json_err("invalid literal"))
        }
    }

    fn scan_null(&mut self) -> Result<Option<JsonToken>, CouchError> {
        if self.buf.starts_with(b"null") {
            self.buf.drain(..4);
            self.after_value();
            Ok(Some(JsonToken::NullValue))
        } else if !self.eof && self.buf.len() < 4 {
            Ok(None)
        } else {
            Err(json_err("invalid literal"))
        }
    }

    fn scan_number(&mut self) -> Result<Option<JsonToken>, CouchError> {
        let is_num_char = |b: u8| b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E');
        let len = self.buf.iter().take_while(|b| is_num_char(**b)).count();
        if len == 0 {
            return Err(json_err("unexpected character in value position"));
        }
        // Without a trailing delimiter we can't be sure the number is
        // complete (more digits could still be on the way).
        if len == self.buf.len() && !self.eof {
            return Ok(None);
        }
        let text = std::str::from_utf8(&self.buf[..len]).map_err(|_| json_err("invalid number"))?;
        let value: f64 = text.parse().map_err(|_| json_err("invalid number"))?;
        self.buf.drain(..len);
        self.after_value();
        Ok(Some(JsonToken::NumberValue(value)))
    }
}

fn json_err(msg: &str) -> CouchError {
    CouchError::InvalidJson(serde::de::Error::custom(msg))
}

enum ValueFrame {
    Obj(serde_json::Map<String, serde_json::Value>, Option<String>),
    Arr(Vec<serde_json::Value>),
}

/// Assembles one arbitrary JSON value (the shape of a view row's `key` /
/// `value` / `doc`, a bulk-result element, a Mango document) out of tokens
/// fed to it one at a time. Shared by every decoder that needs to slurp a
/// subtree without caring about its schema.
#[derive(Default)]
pub struct ValueBuilder {
    stack: Vec<ValueFrame>,
}

impl ValueBuilder {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Feed one token; returns `Some(value)` the moment a complete value has
    /// been assembled at this builder's own top level.
    pub fn feed(&mut self, token: JsonToken) -> Option<serde_json::Value> {
        use serde_json::Value;
        match token {
            JsonToken::StartObject => {
                self.stack.push(ValueFrame::Obj(serde_json::Map::new(), None));
                None
            }
            JsonToken::StartArray => {
                self.stack.push(ValueFrame::Arr(Vec::new()));
                None
            }
            JsonToken::EndObject => {
                let v = match self.stack.pop() {
                    Some(ValueFrame::Obj(map, _)) => Value::Object(map),
                    _ => Value::Null,
                };
                self.complete(v)
            }
            JsonToken::EndArray => {
                let v = match self.stack.pop() {
                    Some(ValueFrame::Arr(items)) => Value::Array(items),
                    _ => Value::Null,
                };
                self.complete(v)
            }
            JsonToken::FieldName(name) => {
                if let Some(ValueFrame::Obj(_, pending)) = self.stack.last_mut() {
                    *pending = Some(name);
                }
                None
            }
            JsonToken::StringValue(s) => self.complete(Value::String(s)),
            JsonToken::NumberValue(n) => {
                self.complete(serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))
            }
            JsonToken::BooleanValue(b) => self.complete(Value::Bool(b)),
            JsonToken::NullValue => self.complete(Value::Null),
        }
    }

    fn complete(&mut self, value: serde_json::Value) -> Option<serde_json::Value> {
        match self.stack.last_mut() {
            None => Some(value),
            Some(ValueFrame::Obj(map, pending)) => {
                if let Some(key) = pending.take() {
                    map.insert(key, value);
                }
                None
            }
            Some(ValueFrame::Arr(items)) => {
                items.push(value);
                None
            }
        }
    }
}

/// Pull tokens from `tokens` until [`ValueBuilder`] reports a complete
/// value, starting from an already-consumed `first` token.
pub async fn collect_value(
    tokens: &mut (impl Stream<Item = Result<JsonToken, CouchError>> + Unpin),
    first: JsonToken,
) -> Result<serde_json::Value, CouchError> {
    let mut builder = ValueBuilder::new();
    if let Some(v) = builder.feed(first) {
        return Ok(v);
    }
    loop {
        let token = tokens
            .next()
            .await
            .ok_or_else(|| json_err("truncated response"))??;
        if let Some(v) = builder.feed(token) {
            return Ok(v);
        }
    }
}

/// Tokenize a byte-chunk stream (e.g. `reqwest::Response::bytes_stream()`)
/// into a lazy sequence of [`JsonToken`]s.
///
/// Dropping the returned stream drops the underlying byte stream with it,
/// which for a `reqwest` response cancels the in-flight HTTP request.
pub fn tokenize(
    bytes_stream: impl Stream<Item = reqwest::Result<Bytes>>,
) -> impl Stream<Item = Result<JsonToken, CouchError>> {
    try_stream! {
        futures_util::pin_mut!(bytes_stream);
        let mut scanner = Scanner::new();
        loop {
            match scanner.next_token()? {
                Some(token) => yield token,
                None => {
                    if scanner.eof {
                        break;
                    }
                    match bytes_stream.next().await {
                        Some(chunk) => scanner.feed(&chunk?),
                        None => scanner.eof = true,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt};

    async fn collect(input: &[&str]) -> Vec<JsonToken> {
        let chunks = input
            .iter()
            .map(|s| Ok(Bytes::from(s.as_bytes().to_vec())))
            .collect::<Vec<reqwest::Result<Bytes>>>();
        let stream = tokenize(stream::iter(chunks));
        futures_util::pin_mut!(stream);
        let mut out = vec![];
        while let Some(tok) = stream.next().await {
            out.push(tok.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn tokenizes_simple_object() {
        let toks = collect(&[r#"{"a":1,"b":"x"}"#]).await;
        assert_eq!(
            toks,
            vec![
                JsonToken::StartObject,
                JsonToken::FieldName("a".into()),
                JsonToken::NumberValue(1.0),
                JsonToken::FieldName("b".into()),
                JsonToken::StringValue("x".into()),
                JsonToken::EndObject,
            ]
        );
    }

    #[tokio::test]
    async fn tokenizes_across_chunk_boundaries() {
        // Split mid-number and mid-string to exercise the "need more data" path.
        let toks = collect(&[r#"{"total_rows":1"#, r#"23,"rows":[]}"#]).await;
        assert_eq!(
            toks,
            vec![
                JsonToken::StartObject,
                JsonToken::FieldName("total_rows".into()),
                JsonToken::NumberValue(123.0),
                JsonToken::FieldName("rows".into()),
                JsonToken::StartArray,
                JsonToken::EndArray,
                JsonToken::EndObject,
            ]
        );
    }

    #[tokio::test]
    async fn handles_escaped_strings_and_nesting() {
        let toks = collect(&[r#"{"key":["a\"b", null, true, false]}"#]).await;
        assert_eq!(
            toks,
            vec![
                JsonToken::StartObject,
                JsonToken::FieldName("key".into()),
                JsonToken::StartArray,
                JsonToken::StringValue("a\"b".into()),
                JsonToken::NullValue,
                JsonToken::BooleanValue(true),
                JsonToken::BooleanValue(false),
                JsonToken::EndArray,
                JsonToken::EndObject,
            ]
        );
    }
}
