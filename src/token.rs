//! Access token value object.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ClientError;

/// Credential pair with an absolute expiry.
///
/// A token without `expires_at` is always treated as expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: String,
}

impl Token {
    pub fn new(
        access_token: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
            refresh_token: refresh_token.into(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Token endpoint payload. `expires_at` wins over `expires_in` when both are
/// present.
#[derive(Deserialize)]
struct TokenPayload {
    access_token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Result of a password login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponse {
    Token(Token),
    /// Account has two-factor enabled; finish with the OTP and this token.
    TwoFactorRequired { login_token: String },
}

impl LoginResponse {
    pub(crate) fn from_json(v: &Value, now: DateTime<Utc>) -> Result<Self, ClientError> {
        if v.get("access_token").is_none() {
            if let Some(login_token) = v["login_token"].as_str() {
                return Ok(Self::TwoFactorRequired {
                    login_token: login_token.to_string(),
                });
            }
        }
        Ok(Self::Token(token_from_json(v, None, now)?))
    }
}

/// Decode a token response. A refresh response may omit the refresh token,
/// in which case `previous_refresh` is carried over.
pub(crate) fn token_from_json(
    v: &Value,
    previous_refresh: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Token, ClientError> {
    let payload = TokenPayload::deserialize(v)
        .map_err(|e| ClientError::Parse(format!("invalid token response: {e}")))?;

    let expires_at = payload
        .expires_at
        .or_else(|| payload.expires_in.map(|secs| now + Duration::seconds(secs)));

    let refresh_token = payload
        .refresh_token
        .or_else(|| previous_refresh.map(String::from))
        .unwrap_or_default();

    Ok(Token {
        access_token: payload.access_token,
        expires_at,
        refresh_token,
    })
}
