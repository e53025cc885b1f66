// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! IPC wire protocol: newline-delimited JSON envelopes.
//!
//! A connection opens with a [`ClientHello`] carrying the bearer token;
//! after the [`HelloAck`], typed [`CoreRequest`]/[`CoreResponse`] pairs
//! flow until either side closes.

use serde::{Deserialize, Serialize};

/// First message on a connection: authenticate with the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// Server reply to [`ClientHello`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub ok: bool,
    pub server_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One typed request from a client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreRequest {
    pub request_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_origin: Option<String>,
    #[serde(default)]
    pub client_version: String,
    pub capability: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreErrorPayload {
    pub code: String,
    pub message: String,
}

/// One response, matched to its request by `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreResponse {
    pub request_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CoreErrorPayload>,
}

impl CoreResponse {
    pub fn success(request_id: &str, result: Option<serde_json::Value>) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(request_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            ok: false,
            result: None,
            error: Some(CoreErrorPayload {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Encode a message as one newline-terminated JSON line.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_string(msg)?;
    json.push('\n');
    Ok(json)
}

/// Decode a message from a JSON line.
pub fn decode<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(json.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = CoreRequest {
            request_id: "r1".to_string(),
            session_id: "s1".to_string(),
            session_profile: Some("planner".to_string()),
            session_origin: Some("MCP".to_string()),
            client_version: "0.1.0".to_string(),
            capability: "tasks".to_string(),
            method: "create".to_string(),
            params: serde_json::json!({"title": "x"}),
            idempotency_key: Some("k1".to_string()),
        };
        let line = encode(&request).unwrap();
        assert!(line.ends_with('\n'));
        let decoded: CoreRequest = decode(&line).unwrap();
        assert_eq!(decoded.capability, "tasks");
        assert_eq!(decoded.params["title"], "x");
    }

    #[test]
    fn test_request_optional_fields_default() {
        let line = r#"{"request_id":"r1","session_id":"s1","capability":"tasks","method":"list"}"#;
        let decoded: CoreRequest = decode(line).unwrap();
        assert!(decoded.session_profile.is_none());
        assert!(decoded.idempotency_key.is_none());
        assert_eq!(decoded.params, serde_json::Value::Null);
        assert_eq!(decoded.client_version, "");
    }

    #[test]
    fn test_response_constructors() {
        let ok = CoreResponse::success("r1", Some(serde_json::json!({"id": "t1"})));
        assert!(ok.ok);
        assert!(ok.error.is_none());

        let failed = CoreResponse::failure("r1", "NOT_FOUND", "no such task");
        assert!(!failed.ok);
        assert_eq!(failed.error_code(), Some("NOT_FOUND"));

        let line = encode(&failed).unwrap();
        let decoded: CoreResponse = decode(&line).unwrap();
        assert_eq!(decoded.error.unwrap().message, "no such task");
    }

    #[test]
    fn test_hello_round_trip() {
        let hello = ClientHello {
            token: "secret".to_string(),
            client_name: None,
        };
        let decoded: ClientHello = decode(&encode(&hello).unwrap()).unwrap();
        assert_eq!(decoded.token, "secret");
    }
}
