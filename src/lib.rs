#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # buildapi
//!
//! Async client for the Electric Imp impCentral device-management API.
//!
//! ## Architecture
//!
//! ```text
//! config.rs          TOML file / env-var configuration, cloud selection
//! error.rs           ClientError / AuthError, vendor error envelope decoding
//! logging.rs         tracing-subscriber initialisation
//! token.rs           access/refresh token and auth response decoding
//! transport.rs       Transport trait and the reqwest implementation
//! session.rs         SessionManager: login, 2FA, single-flight token refresh
//! request.rs         Action, PendingRequest, PaginationCursor
//! connection.rs      ConnectionManager: dispatch, 401 retry, pagination, kill_all
//! logstream/         LogStreamClient and the SSE record parser
//! client.rs          BuildApiClient, one typed method per endpoint
//! ```
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> Result<(), buildapi::ClientError> {
//! let config = buildapi::Config::load(None)?;
//! buildapi::logging::init(&config.logging);
//!
//! let client = buildapi::BuildApiClient::new(config)?;
//! client.login_with_key("my-login-key").await?;
//!
//! let devices = client.list_devices(None).await?;
//! println!("{} devices", devices["data"].as_array().map_or(0, Vec::len));
//!
//! client
//!     .start_logging("30000c2a690bd1ee", |entry| println!("{}", entry.message))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod logstream;
pub mod request;
pub mod session;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{BuildApiClient, DeviceGroupType, NewDeployment, NewWebhook};
pub use config::{Cloud, Config};
pub use connection::ConnectionManager;
pub use error::{AuthError, ClientError};
pub use logstream::{LogEntry, LogStreamClient, StreamState, StreamStatus};
pub use request::{Action, Continuation, Outcome, RequestId};
pub use session::{LoginOutcome, SessionManager, SessionPhase, SessionState};
pub use token::Token;
pub use transport::{HttpTransport, Transport, TransportError};
