//! JSON-RPC envelope view over relayed payloads.
//!
//! The bridge never interprets traffic; parsing exists only to extract
//! correlation ids for endpoint routing and to produce structured log lines.
//! Payloads that fail to parse are still forwarded verbatim.

use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;

/// Maximum payload preview length in debug logs.
const PREVIEW_LEN: usize = 200;

/// A JSON-RPC 2.0 style envelope. All fields optional: the bridge relays
/// whatever the peers exchange and only reads what is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl RpcEnvelope {
    /// Parse a payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BridgeError::MalformedPayload`] when the payload is
    /// not valid JSON matching the envelope shape.
    pub fn parse(payload: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// The envelope's correlation id as a string, if any.
    ///
    /// JSON-RPC allows string and numeric ids; both normalize to the string
    /// form used by endpoint announcements.
    #[must_use]
    pub fn correlation_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// One-line description for log output.
    #[must_use]
    pub fn describe(&self) -> String {
        let kind = if self.method.is_some() {
            "request"
        } else if self.error.is_some() {
            "error-response"
        } else {
            "response"
        };
        let method = self.method.as_deref().unwrap_or("-");
        let id = self.correlation_id().unwrap_or_else(|| "-".into());
        format!("{kind} method={method} id={id}")
    }
}

/// Truncate a payload for debug logging, respecting char boundaries.
#[must_use]
pub fn preview(payload: &str) -> &str {
    if payload.len() <= PREVIEW_LEN {
        return payload;
    }
    let mut end = PREVIEW_LEN;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn string_and_numeric_ids_normalize() {
        let env = RpcEnvelope::parse(r#"{"jsonrpc":"2.0","id":"7","method":"ping"}"#).unwrap();
        assert_eq!(env.correlation_id().as_deref(), Some("7"));

        let env = RpcEnvelope::parse(r#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#).unwrap();
        assert_eq!(env.correlation_id().as_deref(), Some("42"));
    }

    #[test]
    fn missing_id_yields_no_correlation() {
        let env = RpcEnvelope::parse(r#"{"jsonrpc":"2.0","method":"notify"}"#).unwrap();
        assert_eq!(env.correlation_id(), None);
    }

    #[test]
    fn malformed_json_is_malformed_payload() {
        let err = RpcEnvelope::parse("not json at all").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedPayload(_)));
    }

    #[test]
    fn describe_distinguishes_requests_and_responses() {
        let request = RpcEnvelope::parse(r#"{"id":1,"method":"tools/list"}"#).unwrap();
        assert_eq!(request.describe(), "request method=tools/list id=1");

        let response = RpcEnvelope::parse(r#"{"id":1,"result":{}}"#).unwrap();
        assert_eq!(response.describe(), "response method=- id=1");

        let error = RpcEnvelope::parse(r#"{"id":1,"error":{"code":-32601}}"#).unwrap();
        assert_eq!(error.describe(), "error-response method=- id=1");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let short = "tiny";
        assert_eq!(preview(short), "tiny");

        let long = "é".repeat(150);
        let cut = preview(&long);
        assert!(cut.len() <= 200);
        assert!(long.starts_with(cut));
    }
}
