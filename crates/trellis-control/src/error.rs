//! Error types for the control-plane session engine.

use crate::conn::ConnError;
use thiserror::Error;

/// Terminal causes for a server session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Business logic rejected the logon.
    #[error("authentication resulted in logon rejected")]
    LogonRejected,

    /// The client violated the protocol (duplicate device key, unknown
    /// message kind, message out of phase).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Business logic issued an invalid directive (duplicate auth URL).
    #[error("business-logic directive violation: {0}")]
    DirectiveViolation(String),

    /// The control connection failed.
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    /// The authenticate phase exceeded its upper bound.
    #[error("authenticate phase timed out")]
    AuthTimeout,

    /// A dangling session was not resumed within the grace window.
    #[error("dangling session expired")]
    DanglingExpired,

    /// The session was cancelled from outside.
    #[error("session cancelled")]
    Cancelled,

    /// No registered session carries the given id.
    #[error("unknown session id")]
    UnknownSession,

    /// Internal plumbing failure (a mailbox closed underneath the task).
    #[error("internal error: {0}")]
    Internal(String),
}
