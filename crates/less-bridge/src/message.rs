//! Newline-delimited JSON messages exchanged over the peer's stdio.
//!
//! Host to peer: `{"id", "cmd", "data"}`. Peer to host: `{"id", "success", "result" | "error"}`.
//! Either side may also send `{"id", "callback", "data"}`, answered with a response carrying
//! the same id.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn from_result(id: u64, result: Result<Value, String>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(message) => Self::err(id, message),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    pub id: u64,
    pub callback: String,
    #[serde(default)]
    pub data: Value,
}

/// Any line that can arrive on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(Request),
    Callback(Callback),
    Response(Response),
}

impl Incoming {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("callback").is_some() {
            serde_json::from_value(value).map(Incoming::Callback)
        } else if value.get("cmd").is_some() {
            serde_json::from_value(value).map(Incoming::Request)
        } else {
            serde_json::from_value(value).map(Incoming::Response)
        }
    }

    /// The id of a line that failed to [`parse`](Self::parse) but was meant as a response.
    ///
    /// Lines that are not valid JSON are recovered only when `id` is their first key, which is
    /// how responses are serialized.
    pub fn response_id(line: &str) -> Option<u64> {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if value.get("callback").is_some() || value.get("cmd").is_some() {
                return None;
            }
            return value.get("id").and_then(Value::as_u64);
        }
        if line.contains("\"callback\"") || line.contains("\"cmd\"") {
            return None;
        }

        let rest = line.trim_start().strip_prefix('{')?.trim_start().strip_prefix("\"id\"")?;
        let digits = rest.trim_start().strip_prefix(':')?.trim_start();
        let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
        digits[..end].parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(r#"{"id":1,"cmd":"ping","data":{}}"#, "request")]
    #[case(r#"{"id":2,"cmd":"shutdown"}"#, "request")]
    #[case(r#"{"id":3,"callback":"getVariable","data":{"name":"@a"}}"#, "callback")]
    #[case(r#"{"id":4,"success":true,"result":1}"#, "response")]
    #[case(r#"{"id":5,"success":false,"error":"boom"}"#, "response")]
    fn test_classify(#[case] line: &str, #[case] expected: &str) {
        let kind = match Incoming::parse(line).unwrap() {
            Incoming::Request(_) => "request",
            Incoming::Callback(_) => "callback",
            Incoming::Response(_) => "response",
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(Incoming::parse("not json").is_err());
        assert!(Incoming::parse(r#"{"success":true}"#).is_err());
    }

    #[rstest]
    #[case::truncated(r#"{"id": 12, "success": "yes""#, Some(12))]
    #[case::wrong_types(r#"{"id":7,"success":"yes"}"#, Some(7))]
    #[case::missing_success(r#"{"id":3}"#, Some(3))]
    #[case::garbage("garbage", None)]
    #[case::no_id(r#"{"success":true}"#, None)]
    #[case::truncated_callback(r#"{"id":4,"callback":"getVar"#, None)]
    #[case::bad_request(r#"{"id":5,"cmd":7}"#, None)]
    fn test_response_id_of_malformed_lines(#[case] line: &str, #[case] expected: Option<u64>) {
        assert!(Incoming::parse(line).is_err());
        assert_eq!(Incoming::response_id(line), expected);
    }

    #[test]
    fn test_response_serialization_omits_missing_fields() {
        let line = serde_json::to_string(&Response::ok(7, json!({"ready": true}))).unwrap();
        assert_eq!(line, r#"{"id":7,"success":true,"result":{"ready":true}}"#);
        let line = serde_json::to_string(&Response::err(8, "nope")).unwrap();
        assert_eq!(line, r#"{"id":8,"success":false,"error":"nope"}"#);
    }

    #[test]
    fn test_into_result() {
        assert_eq!(Response::ok(1, json!(3)).into_result(), Ok(json!(3)));
        assert_eq!(Response::err(1, "x").into_result(), Err("x".to_string()));
        let null_result: Response = serde_json::from_str(r#"{"id":1,"success":true,"result":null}"#).unwrap();
        assert_eq!(null_result.into_result(), Ok(Value::Null));
    }
}
