//! Session and token lifecycle.
//!
//! [`SessionManager`] owns the current [`Token`] and is the only component
//! that changes it. State lives in a `tokio::sync::watch` channel so callers
//! blocked in [`SessionManager::valid_token`] are woken by every transition:
//!
//! ```text
//! LoggedOut ──login──▶ LoggingIn ──▶ AwaitingTwoFactor ──otp──▶ LoggedIn
//!                          └───────────────────────────────────▶ LoggedIn
//! LoggedIn ──expired/401──▶ Refreshing ──▶ LoggedIn | LoggedOut(RefreshRejected)
//! any ──logout──▶ LoggedOut
//! ```
//!
//! ## Refresh serialization
//!
//! Refreshes run under a single async mutex. A caller that queued behind an
//! in-flight refresh does not issue its own request: it receives the outcome
//! recorded by the refresh that completed while it waited, so the refresh
//! token is spent at most once per expiry. The exchange itself runs on a
//! spawned task that owns the gate, so cancelling the request that started
//! it does not abandon the refresh half way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{decode_error_envelope, AuthError, ClientError};
use crate::token::{token_from_json, LoginResponse, Token};
use crate::transport::{HttpRequest, Transport};

/// Full session state, including the token where one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session. Carries the reason when the session was ended by a
    /// failed refresh rather than an explicit logout.
    LoggedOut(Option<AuthError>),
    LoggingIn,
    AwaitingTwoFactor { login_token: String },
    LoggedIn(Token),
    /// A refresh is in flight; the token shown is the one being replaced.
    Refreshing(Token),
}

/// Token-free view of [`SessionState`] for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    LoggedOut,
    LoggingIn,
    AwaitingTwoFactor,
    LoggedIn,
    Refreshing,
}

/// Outcome of a password login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    LoggedIn(Token),
    /// Call [`SessionManager::complete_two_factor`] with this token and the OTP.
    TwoFactorRequired { login_token: String },
}

#[derive(Default)]
struct RefreshSlot {
    last_outcome: Option<Result<Token, ClientError>>,
}

pub struct SessionManager {
    shared: Arc<Shared>,
}

/// State reachable from detached refresh tasks.
struct Shared {
    transport: Arc<dyn Transport>,
    api_root: String,
    state: watch::Sender<SessionState>,
    refresh_gate: Mutex<RefreshSlot>,
    /// Bumped after every completed refresh attempt.
    refresh_generation: AtomicU64,
}

impl SessionManager {
    /// `api_root` is the versioned API prefix, e.g. `https://api.electricimp.com/v5/`.
    pub fn new(transport: Arc<dyn Transport>, api_root: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionState::LoggedOut(None));
        Self {
            shared: Arc::new(Shared {
                transport,
                api_root: api_root.into(),
                state,
                refresh_gate: Mutex::new(RefreshSlot::default()),
                refresh_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        match &*self.shared.state.borrow() {
            SessionState::LoggedOut(_) => SessionPhase::LoggedOut,
            SessionState::LoggingIn => SessionPhase::LoggingIn,
            SessionState::AwaitingTwoFactor { .. } => SessionPhase::AwaitingTwoFactor,
            SessionState::LoggedIn(_) => SessionPhase::LoggedIn,
            SessionState::Refreshing(_) => SessionPhase::Refreshing,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(
            self.phase(),
            SessionPhase::LoggedIn | SessionPhase::Refreshing
        )
    }

    /// Current token without validity checks (e.g. for the caller to persist).
    pub fn token(&self) -> Option<Token> {
        match &*self.shared.state.borrow() {
            SessionState::LoggedIn(t) | SessionState::Refreshing(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Resume a session from a token the caller persisted earlier.
    pub fn restore(&self, token: Token) {
        debug!(expired = token.is_expired(), "session restored from saved token");
        self.shared.state.send_replace(SessionState::LoggedIn(token));
    }

    /// Password login. Requests already waiting in [`valid_token`](Self::valid_token)
    /// are released once a token is stored.
    ///
    /// `two_factor` states whether the caller expects the account to need an
    /// OTP. The server decides; the flag only affects diagnostics.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        two_factor: bool,
    ) -> Result<LoginOutcome, ClientError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MissingCredentials.into());
        }

        self.shared.state.send_replace(SessionState::LoggingIn);
        let result = self
            .shared
            .post_auth("auth", json!({ "id": username, "password": password }))
            .await
            .and_then(|v| LoginResponse::from_json(&v, Utc::now()));

        match result {
            Ok(LoginResponse::Token(token)) => {
                info!(account = username, "logged in");
                self.shared
                    .state
                    .send_replace(SessionState::LoggedIn(token.clone()));
                Ok(LoginOutcome::LoggedIn(token))
            }
            Ok(LoginResponse::TwoFactorRequired { login_token }) => {
                if !two_factor {
                    warn!(account = username, "server requested a one-time password");
                }
                self.shared.state.send_replace(SessionState::AwaitingTwoFactor {
                    login_token: login_token.clone(),
                });
                Ok(LoginOutcome::TwoFactorRequired { login_token })
            }
            Err(e) => {
                let e = credentials_error(e);
                warn!(account = username, error = %e, "login failed");
                self.shared.state.send_replace(SessionState::LoggedOut(None));
                Err(e)
            }
        }
    }

    /// Finish a two-factor login. A rejected OTP leaves the challenge open
    /// so the caller can try again.
    pub async fn complete_two_factor(
        &self,
        login_token: &str,
        otp: &str,
    ) -> Result<Token, ClientError> {
        if !matches!(
            *self.shared.state.borrow(),
            SessionState::AwaitingTwoFactor { .. }
        ) {
            return Err(AuthError::NoTwoFactorChallenge.into());
        }

        let result = self
            .shared
            .post_auth("auth/2fa", json!({ "login_token": login_token, "otp": otp }))
            .await
            .and_then(|v| token_from_json(&v, None, Utc::now()));

        match result {
            Ok(token) => {
                info!("two-factor login complete");
                self.shared
                    .state
                    .send_replace(SessionState::LoggedIn(token.clone()));
                Ok(token)
            }
            Err(e) => Err(credentials_error(e)),
        }
    }

    /// Log in with a long-lived login key instead of a password.
    pub async fn login_with_key(&self, login_key: &str) -> Result<Token, ClientError> {
        self.shared.state.send_replace(SessionState::LoggingIn);
        let result = self
            .shared
            .post_auth("auth/token", json!({ "key": login_key }))
            .await
            .and_then(|v| token_from_json(&v, None, Utc::now()));

        match result {
            Ok(token) => {
                info!("logged in with login key");
                self.shared
                    .state
                    .send_replace(SessionState::LoggedIn(token.clone()));
                Ok(token)
            }
            Err(e) => {
                let e = credentials_error(e);
                self.shared.state.send_replace(SessionState::LoggedOut(None));
                Err(e)
            }
        }
    }

    /// Exchange account credentials for a new long-lived login key.
    ///
    /// Requires a session; the password is re-checked by the server.
    pub async fn get_login_key(&self, password: &str) -> Result<Value, ClientError> {
        if password.is_empty() {
            return Err(AuthError::MissingCredentials.into());
        }
        let token = self.valid_token().await?;
        let url = format!("{}accounts/me/login_keys", self.shared.api_root);
        let req = HttpRequest::new(Method::POST, url)
            .header("Authorization", token.bearer())
            .header("X-Electricimp-Password", password)
            .header("Content-Type", "application/vnd.api+json")
            .header("Accept", "application/vnd.api+json")
            .json(json!({
                "data": { "type": "login_key", "attributes": { "description": "buildapi" } }
            }));
        let resp = self.shared.transport.send(req).await?;
        if !resp.is_success() {
            return Err(credentials_error(decode_error_envelope(resp.status, &resp.body)));
        }
        serde_json::from_slice(&resp.body)
            .map_err(|e| ClientError::Parse(format!("invalid JSON from login key endpoint: {e}")))
    }

    /// End the session. Anything blocked in [`valid_token`](Self::valid_token)
    /// fails with [`AuthError::NotLoggedIn`].
    pub fn logout(&self) {
        info!("logged out");
        self.shared.state.send_replace(SessionState::LoggedOut(None));
    }

    /// A token whose expiry lies in the future.
    ///
    /// Returns immediately when the stored token is still valid. An expired
    /// token is refreshed first; a login in progress is waited for.
    pub async fn valid_token(&self) -> Result<Token, ClientError> {
        let mut rx = self.shared.state.subscribe();
        loop {
            let observed = rx.borrow_and_update().clone();
            match observed {
                SessionState::LoggedIn(token) if !token.is_expired() => return Ok(token),
                SessionState::LoggedIn(stale) | SessionState::Refreshing(stale) => {
                    return self.refresh_from(&stale).await;
                }
                SessionState::LoggingIn | SessionState::AwaitingTwoFactor { .. } => {
                    debug!("waiting for login to finish");
                    if rx.changed().await.is_err() {
                        return Err(AuthError::NotLoggedIn.into());
                    }
                }
                SessionState::LoggedOut(reason) => {
                    return Err(reason.unwrap_or(AuthError::NotLoggedIn).into());
                }
            }
        }
    }

    /// Refresh the access token now. Concurrent callers share one refresh.
    pub async fn refresh(&self) -> Result<Token, ClientError> {
        let current = self.token().ok_or(AuthError::NotLoggedIn)?;
        self.refresh_from(&current).await
    }

    /// Refresh because `rejected` was refused by the server. If another
    /// caller already replaced it, the replacement is returned instead.
    pub async fn force_refresh(&self, rejected: &Token) -> Result<Token, ClientError> {
        self.refresh_from(rejected).await
    }

    /// The refresh runs on its own task: a caller that is aborted while
    /// waiting (e.g. a cancelled request) cannot leave the session in
    /// `Refreshing` or lose the outcome the queued callers are waiting for.
    async fn refresh_from(&self, stale: &Token) -> Result<Token, ClientError> {
        let generation = self.shared.refresh_generation.load(Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let stale = stale.clone();
        tokio::spawn(async move { shared.refresh_exclusive(generation, &stale).await })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "refresh task failed");
                Err(ClientError::Cancelled)
            })
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    async fn refresh_exclusive(
        &self,
        generation: u64,
        stale: &Token,
    ) -> Result<Token, ClientError> {
        let mut slot = self.refresh_gate.lock().await;

        if self.refresh_generation.load(Ordering::SeqCst) != generation {
            if let Some(outcome) = &slot.last_outcome {
                debug!("reusing refresh completed while waiting");
                return outcome.clone();
            }
        }

        let token = match self.state() {
            SessionState::LoggedIn(t)
                if t.access_token != stale.access_token && !t.is_expired() =>
            {
                return Ok(t);
            }
            SessionState::LoggedIn(t) | SessionState::Refreshing(t) => t,
            SessionState::LoggedOut(reason) => {
                return Err(reason.unwrap_or(AuthError::NotLoggedIn).into());
            }
            SessionState::LoggingIn | SessionState::AwaitingTwoFactor { .. } => {
                return Err(AuthError::NotLoggedIn.into());
            }
        };

        let outcome = self.run_refresh(token).await;
        slot.last_outcome = Some(outcome.clone());
        self.refresh_generation.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn run_refresh(&self, token: Token) -> Result<Token, ClientError> {
        if token.refresh_token.is_empty() {
            let reason = AuthError::RefreshRejected("no refresh token".into());
            self.state
                .send_replace(SessionState::LoggedOut(Some(reason.clone())));
            return Err(reason.into());
        }

        debug!("refreshing access token");
        self.state.send_replace(SessionState::Refreshing(token.clone()));

        let result = self
            .post_auth("auth/token", json!({ "key": token.refresh_token }))
            .await
            .and_then(|v| token_from_json(&v, Some(&token.refresh_token), Utc::now()));

        match result {
            Ok(fresh) => {
                let stored = self.state.send_if_modified(|s| {
                    if matches!(s, SessionState::Refreshing(_)) {
                        *s = SessionState::LoggedIn(fresh.clone());
                        true
                    } else {
                        false
                    }
                });
                if stored {
                    info!("access token refreshed");
                    Ok(fresh)
                } else {
                    debug!("session ended during refresh; discarding new token");
                    Err(AuthError::NotLoggedIn.into())
                }
            }
            Err(ClientError::Api {
                status: 400 | 401 | 403,
                message,
                ..
            }) => {
                warn!(reason = %message, "refresh token rejected; session ended");
                let reason = AuthError::RefreshRejected(message);
                self.end_refresh(SessionState::LoggedOut(Some(reason.clone())));
                Err(reason.into())
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                self.end_refresh(SessionState::LoggedIn(token));
                Err(e)
            }
        }
    }

    /// Leave `Refreshing` unless a logout got there first.
    fn end_refresh(&self, next: SessionState) {
        self.state.send_if_modified(|s| {
            if matches!(s, SessionState::Refreshing(_)) {
                *s = next;
                true
            } else {
                false
            }
        });
    }

    async fn post_auth(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        let req = HttpRequest::new(Method::POST, format!("{}{}", self.api_root, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(body);
        let resp = self.transport.send(req).await?;
        if !resp.is_success() {
            return Err(decode_error_envelope(resp.status, &resp.body));
        }
        serde_json::from_slice(&resp.body)
            .map_err(|e| ClientError::Parse(format!("invalid JSON from auth endpoint: {e}")))
    }
}

/// Credential rejections become [`AuthError::InvalidCredentials`].
fn credentials_error(e: ClientError) -> ClientError {
    match e {
        ClientError::Api {
            status: 400 | 401 | 403,
            message,
            ..
        } => AuthError::InvalidCredentials(message).into(),
        other => other,
    }
}
