//! Typed view of an inbound chat completion body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Chat completion request as forwarded to the backend.
///
/// Only the fields the gateway acts on are pulled out; everything else is
/// carried through untouched in `extra`. `model` and `stream` keep whatever
/// JSON value the caller sent and are read by truthiness, so a body is only
/// refused when it is not a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Parse a raw body, replacing a missing or falsy `model` with `default_model`.
    pub fn parse(body: &[u8], default_model: &str) -> Result<Self> {
        let mut request: ChatRequest =
            serde_json::from_slice(body).map_err(|_| Error::InvalidJson)?;

        if !request.model.as_ref().is_some_and(is_truthy) {
            request.model = Some(Value::String(default_model.to_string()));
        }
        Ok(request)
    }

    /// Whether the caller asked for a token stream.
    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(is_truthy)
    }

    /// Model name for logging; empty when the caller sent a non-string model.
    pub fn model(&self) -> &str {
        self.model.as_ref().and_then(Value::as_str).unwrap_or_default()
    }
}

/// JSON truthiness: `null`, `false`, zero and empty strings or containers are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_uses_default() {
        let request = ChatRequest::parse(br#"{"messages":[]}"#, "qwen").unwrap();
        assert_eq!(request.model(), "qwen");
        assert!(!request.is_streaming());
    }

    #[test]
    fn test_empty_and_null_model_use_default() {
        let request = ChatRequest::parse(br#"{"model":""}"#, "qwen").unwrap();
        assert_eq!(request.model(), "qwen");

        let request = ChatRequest::parse(br#"{"model":null}"#, "qwen").unwrap();
        assert_eq!(request.model(), "qwen");
    }

    #[test]
    fn test_explicit_model_and_stream_kept() {
        let request =
            ChatRequest::parse(br#"{"model":"llama","stream":true}"#, "qwen").unwrap();
        assert_eq!(request.model(), "llama");
        assert!(request.is_streaming());
    }

    #[test]
    fn test_extra_fields_forwarded() {
        let request = ChatRequest::parse(
            br#"{"messages":[{"role":"user","content":"hi"}],"temperature":0.2}"#,
            "qwen",
        )
        .unwrap();
        let forwarded = serde_json::to_value(&request).unwrap();

        assert_eq!(forwarded["model"], "qwen");
        assert_eq!(forwarded["temperature"], 0.2);
        assert_eq!(forwarded["messages"][0]["content"], "hi");
        assert!(forwarded.get("stream").is_none());
    }

    #[test]
    fn test_stream_flag_follows_truthiness() {
        for (body, streaming) in [
            (&br#"{"stream":1}"#[..], true),
            (br#"{"stream":"true"}"#, true),
            (br#"{"stream":"false"}"#, true),
            (br#"{"stream":0}"#, false),
            (br#"{"stream":""}"#, false),
            (br#"{"stream":null}"#, false),
        ] {
            let request = ChatRequest::parse(body, "qwen").unwrap();
            assert_eq!(request.is_streaming(), streaming);
        }
    }

    #[test]
    fn test_non_string_values_forwarded_unchanged() {
        let request = ChatRequest::parse(br#"{"model":7,"stream":1}"#, "qwen").unwrap();
        let forwarded = serde_json::to_value(&request).unwrap();

        assert_eq!(forwarded["model"], 7);
        assert_eq!(forwarded["stream"], 1);
        assert_eq!(request.model(), "");
    }

    #[test]
    fn test_falsy_model_uses_default() {
        for body in [&br#"{"model":0}"#[..], br#"{"model":false}"#, br#"{"model":[]}"#] {
            let request = ChatRequest::parse(body, "qwen").unwrap();
            assert_eq!(request.model(), "qwen");
        }
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        for body in [&b"{not json"[..], b"[1,2]", b"", b"\"text\""] {
            assert!(matches!(
                ChatRequest::parse(body, "qwen"),
                Err(Error::InvalidJson)
            ));
        }
    }
}
