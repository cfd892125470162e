//! Error taxonomy for the proxy core.
//!
//! The readiness engine and socket layer surface plain [`std::io::Error`];
//! everything above that — the stream interface, the session and the
//! outbound connector — classifies failures into the small, closed set of
//! kinds the rest of the system is built to react to (retry, turn around,
//! tear down).

use std::fmt;
use thiserror::Error;

/// Error kinds recorded on a [`crate::stream_interface::StreamInterface`].
///
/// These never propagate as Rust errors on their own; they are stored on the
/// interface and read back by the session when deciding how to react.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SiErrorKind {
    QueueTimeout,
    QueueError,
    QueueAborted,
    ConnectTimeout,
    ConnectError,
    ConnectAborted,
    ConnectOther,
    DataTimeout,
    DataError,
    DataAborted,
}

impl SiErrorKind {
    /// The single-letter final-state code used in logs, per the original
    /// design's term-trace convention.
    pub fn final_state_letter(self) -> char {
        use SiErrorKind::*;
        match self {
            QueueTimeout | QueueError | QueueAborted => 'Q',
            ConnectTimeout => 'T',
            ConnectError | ConnectAborted | ConnectOther => 'C',
            DataTimeout | DataError | DataAborted => 'D',
        }
    }
}

impl fmt::Display for SiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Session-level error kinds, one step up from [`SiErrorKind`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum SessionError {
    #[error("client timed out")]
    ClientTimeout,
    #[error("client closed the connection")]
    ClientClosed,
    #[error("server timed out")]
    ServerTimeout,
    #[error("server closed the connection")]
    ServerClosed,
    #[error("proxy condition (configuration limit reached)")]
    ProxyCondition,
    #[error("resource exhausted")]
    Resource,
    #[error("internal error")]
    Internal,
    #[error("backend is down")]
    BackendDown,
}

/// The compact error taxonomy returned by the outbound connector, per the
/// bind/connect exit codes described in the external interfaces section.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConnectError {
    #[error("resource exhausted (fd limit, memory, or port range)")]
    Resource,
    #[error("proxy condition (configuration limit reached)")]
    ProxyCondition,
    #[error("server timed out while connecting")]
    ServerTimeout,
    #[error("server closed the connection")]
    ServerClosed,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl ConnectError {
    pub fn to_si_error(self) -> SiErrorKind {
        match self {
            ConnectError::ServerTimeout => SiErrorKind::ConnectTimeout,
            ConnectError::ServerClosed => SiErrorKind::ConnectError,
            ConnectError::Resource | ConnectError::ProxyCondition | ConnectError::Internal(_) => {
                SiErrorKind::ConnectOther
            }
        }
    }
}

/// Composed flags returned by listener bind operations.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BindStatus {
    pub retryable: bool,
    pub warn: bool,
    pub alert: bool,
    pub fatal: bool,
    pub abort: bool,
}

impl BindStatus {
    pub const OK: BindStatus = BindStatus {
        retryable: false,
        warn: false,
        alert: false,
        fatal: false,
        abort: false,
    };

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }
}
