//! Error types returned by the client.
//!
//! Every logical operation ends in `Result<T, ClientError>`. Transport
//! failures, authentication failures and vendor API errors are kept apart so
//! callers can decide whether re-issuing the call makes sense.

use serde_json::Value;

use crate::transport::TransportError;

/// Errors surfaced to callers of the client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The request never produced an HTTP response (DNS, timeout, reset).
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Authentication failed or the session is not usable.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The server answered with a 4xx/5xx status and an error envelope.
    #[error("API error (HTTP {status}) {code}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Vendor error code, or `HTTP_<status>` when the body had none.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// A response body or stream record could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Subscribing another device would exceed the per-stream limit.
    #[error("too many log streams: at most {limit} devices can be logged at once")]
    TooManyStreams {
        /// Configured maximum number of logged devices.
        limit: usize,
    },

    /// The pending request was cancelled before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The log stream worker has shut down.
    #[error("log stream is not running")]
    StreamClosed,
}

impl ClientError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }

    /// Returns `true` for errors that end the session rather than one call.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth(AuthError::RefreshRejected(_) | AuthError::NotLoggedIn)
        )
    }
}

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The server rejected the request with 401 even after a token refresh.
    #[error("unauthorized: request rejected after token refresh")]
    Unauthorized,

    /// The refresh token (or login key) was rejected; the session is over.
    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),

    /// No session exists, or it was ended by logout.
    #[error("not logged in")]
    NotLoggedIn,

    /// Username/password or one-time password rejected.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Username or password was empty.
    #[error("username and password are required")]
    MissingCredentials,

    /// `complete_two_factor` was called with no outstanding challenge.
    #[error("no two-factor challenge is pending")]
    NoTwoFactorChallenge,
}

/// Decode the vendor error envelope of a non-2xx response.
///
/// Accepts the JSON:API `errors` array, a flat `{code, message}` object and a
/// nested `{error: {code, message}}` object. Anything else falls back to the
/// raw body text.
pub fn decode_error_envelope(status: u16, body: &[u8]) -> ClientError {
    let fallback_code = format!("HTTP_{status}");
    let parsed = serde_json::from_slice::<Value>(body).ok();

    let (code, message) = match parsed.as_ref().and_then(envelope_fields) {
        Some((code, message)) => (code.unwrap_or(fallback_code), message),
        None => (
            fallback_code,
            String::from_utf8_lossy(body).trim().to_string(),
        ),
    };
    let message = if message.is_empty() {
        reason_phrase(status)
    } else {
        message
    };

    ClientError::Api {
        status,
        code,
        message,
    }
}

fn reason_phrase(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown error")
        .to_string()
}

fn envelope_fields(v: &Value) -> Option<(Option<String>, String)> {
    if let Some(errors) = v["errors"].as_array().filter(|e| !e.is_empty()) {
        let code = errors[0]["code"].as_str().map(String::from);
        let message = errors
            .iter()
            .filter_map(|e| {
                e["detail"]
                    .as_str()
                    .or_else(|| e["title"].as_str())
                    .or_else(|| e["message"].as_str())
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Some((code, message));
    }

    let inner = if v["error"].is_object() { &v["error"] } else { v };
    let message = inner["message"].as_str()?;
    let code = inner["code"].as_str().map(String::from);
    Some((code, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_parts(err: ClientError) -> (u16, String, String) {
        match err {
            ClientError::Api {
                status,
                code,
                message,
            } => (status, code, message),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn decodes_jsonapi_errors_array() {
        let body = br#"{"errors":[
            {"code":"InvalidRequest","title":"Bad","detail":"name is too long"},
            {"code":"Other","title":"Also bad"}
        ]}"#;
        let (status, code, message) = api_parts(decode_error_envelope(400, body));
        assert_eq!(status, 400);
        assert_eq!(code, "InvalidRequest");
        assert_eq!(message, "name is too long; Also bad");
    }

    #[test]
    fn errors_array_without_text_uses_reason_phrase() {
        let body = br#"{"errors":[{"code":"Conflict"},{"status":"409"}]}"#;
        let (status, code, message) = api_parts(decode_error_envelope(409, body));
        assert_eq!(status, 409);
        assert_eq!(code, "Conflict");
        assert_eq!(message, "Conflict");

        let (_, code, message) = api_parts(decode_error_envelope(500, br#"{"errors":[{}]}"#));
        assert_eq!(code, "HTTP_500");
        assert_eq!(message, "Internal Server Error");
    }

    #[test]
    fn decodes_flat_envelope() {
        let body = br#"{"code":"NotFound","message":"no such device"}"#;
        let (_, code, message) = api_parts(decode_error_envelope(404, body));
        assert_eq!(code, "NotFound");
        assert_eq!(message, "no such device");
    }

    #[test]
    fn decodes_nested_envelope_without_code() {
        let body = br#"{"error":{"message":"rate limited"}}"#;
        let (_, code, message) = api_parts(decode_error_envelope(429, body));
        assert_eq!(code, "HTTP_429");
        assert_eq!(message, "rate limited");
    }

    #[test]
    fn non_json_body_is_used_verbatim() {
        let (_, code, message) = api_parts(decode_error_envelope(502, b"Bad Gateway from proxy"));
        assert_eq!(code, "HTTP_502");
        assert_eq!(message, "Bad Gateway from proxy");
    }

    #[test]
    fn empty_body_uses_reason_phrase() {
        let (_, _, message) = api_parts(decode_error_envelope(503, b""));
        assert_eq!(message, "Service Unavailable");
    }

    #[test]
    fn not_found_helper() {
        assert!(decode_error_envelope(404, b"").is_not_found());
        assert!(!ClientError::Cancelled.is_not_found());
    }

    #[test]
    fn refresh_rejection_is_session_fatal() {
        let err = ClientError::from(AuthError::RefreshRejected("expired".into()));
        assert!(err.is_session_fatal());
        assert!(!ClientError::from(AuthError::Unauthorized).is_session_fatal());
    }

    #[test]
    fn display_includes_status_and_code() {
        let err = ClientError::Api {
            status: 409,
            code: "Conflict".into(),
            message: "name taken".into(),
        };
        assert_eq!(err.to_string(), "API error (HTTP 409) Conflict: name taken");
    }
}
