//! Typed error handling for the messaging core
//!
//! Every component has its own error enum; all of them fold into [`SockError`],
//! whose [`ErrorKind`] tells the orchestrator what to do with a failure.
//!
//! # Error Categories
//!
//! - [`FrameError`]: malformed or oversized wire frames
//! - [`CacheError`]: participant index failures
//! - [`StoreError`]: message store and authorization query failures
//! - [`RegistryError`]: command dispatch failures (timeouts, panics, missing state)
//!
//! # Policy
//!
//! | Kind | Per-frame | Handshake |
//! |------|-----------|-----------|
//! | `Input` | drop, continue | 400 |
//! | `Auth` | drop silently | 401 / close |
//! | `NotFound` | empty success | 404 / close |
//! | `TransientIo` | log, notify sender | 503 |
//! | `Timeout` | log, surface | 504 |
//! | `Fatal` | log, restart worker | 500 |

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Coarse classification used to choose a failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    Auth,
    NotFound,
    TransientIo,
    Timeout,
    Fatal,
}

/// The main error type for the messaging core
#[derive(Debug, Error)]
pub enum SockError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bad ticket format, bad topic, bad payload
    #[error("invalid input: {0}")]
    Input(String),

    /// Ticket unknown or consumed, sender mismatch, topic denied
    #[error("not authorized: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SockError::Frame(_) | SockError::Input(_) => ErrorKind::Input,
            SockError::Auth(_) => ErrorKind::Auth,
            SockError::Cache(_) => ErrorKind::TransientIo,
            SockError::Store(e) => e.kind(),
            SockError::Registry(e) => e.kind(),
            SockError::Internal(_) => ErrorKind::Fatal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::TransientIo => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Input => "INPUT_ERROR",
            ErrorKind::Auth => "AUTH_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::TransientIo => "TRANSIENT_IO",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Fatal => "INTERNAL_ERROR",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Error response structure for HTTP responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl IntoResponse for SockError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self.to_response());
        (status, body).into_response()
    }
}

// =============================================================================
// Frame Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid length prefix at offset {offset}")]
    InvalidLength { offset: usize },

    #[error("field {field} is {len} bytes, wider than the length prefix allows")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("unknown action code {0}")]
    UnknownAction(String),

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("frame is {len} bytes, limit is {limit}")]
    Oversized { len: usize, limit: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

// =============================================================================
// Cache Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("malformed cache key input: {0:?}")]
    MalformedKey(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

// =============================================================================
// Store Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no connection row for {0}")]
    ConnectionNotFound(String),

    #[error("invalid page request: page {page}, size {page_size}")]
    InvalidPage { page: i64, page_size: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ConnectionNotFound(_) => ErrorKind::NotFound,
            StoreError::InvalidPage { .. } | StoreError::Frame(_) => ErrorKind::Input,
            StoreError::Database(_) => ErrorKind::TransientIo,
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

// =============================================================================
// Registry Errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("timed out when sending command")]
    SendTimeout,

    #[error("timed out when receiving command")]
    ReceiveTimeout,

    #[error("reply channel closed without response")]
    ChannelClosed,

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("no subscriber found for {0}")]
    SubscriberNotFound(String),

    #[error("no targets")]
    NoTargets,

    #[error("worker panicked handling {command}: {message}")]
    WorkerPanic { command: &'static str, message: String },

    /// Registry state contradicts its own invariants
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::SendTimeout
            | RegistryError::ReceiveTimeout
            | RegistryError::ChannelClosed => ErrorKind::Timeout,
            RegistryError::InvalidTicket(_) => ErrorKind::Auth,
            RegistryError::SubscriberNotFound(_) | RegistryError::NoTargets => {
                ErrorKind::NotFound
            }
            RegistryError::WorkerPanic { .. }
            | RegistryError::Invariant(_)
            | RegistryError::UnexpectedReply(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

pub type SockResult<T> = Result<T, SockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_timeouts_are_timeout_kind() {
        let err: SockError = RegistryError::SendTimeout.into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.to_string(), "timed out when sending command");

        let err: SockError = RegistryError::ReceiveTimeout.into();
        assert_eq!(err.to_string(), "timed out when receiving command");
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_invalid_ticket_maps_to_unauthorized() {
        let err: SockError = RegistryError::InvalidTicket("replayed".into()).into();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.error_code(), "AUTH_ERROR");
    }

    #[test]
    fn test_frame_errors_are_input() {
        let err: SockError = FrameError::UnknownAction("999".into()).into();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_store_error_kinds() {
        assert_eq!(
            SockError::from(StoreError::Database("boom".into())).kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            SockError::from(StoreError::ConnectionNotFound("c".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SockError::from(StoreError::InvalidPage {
                page: 0,
                page_size: 10
            })
            .kind(),
            ErrorKind::Input
        );
    }

    #[test]
    fn test_worker_panic_is_fatal() {
        let err = RegistryError::WorkerPanic {
            command: "send_message",
            message: "boom".into(),
        };
        assert!(err.is_fatal());
        assert!(!RegistryError::NoTargets.is_fatal());
    }

    #[test]
    fn test_error_response_body() {
        let response = SockError::Auth("ticket consumed".into()).to_response();
        assert_eq!(response.code, "AUTH_ERROR");
        assert_eq!(response.message, "not authorized: ticket consumed");
    }
}
