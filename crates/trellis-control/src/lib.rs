//! # Trellis Control
//!
//! The control-plane session engine of the trellis overlay: a per-client
//! state machine that authenticates nodes, distributes peer-visibility
//! updates, and reconciles endpoint/session/home-relay changes across a
//! fleet of connected clients.
//!
//! ## Components
//!
//! - [`session`] — the per-client FSM:
//!   Authenticate → Greet → Established, with Dangling → ReEstablishing
//!   retention across reconnects and Deconstructing as the terminal state.
//! - [`registry`] — the process-wide [`Server`]: session registry,
//!   visibility engine, pair-operation broadcasting, liveness sweeps.
//! - [`conn`] — the framed control-connection seam ([`ControlConn`]) plus
//!   an in-memory implementation for tests and in-process wiring.
//! - [`hooks`] — business-logic callbacks and the visibility oracle.
//! - [`delta`] — coalescing of peer-fact changes while a client dangles.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod conn;
pub mod delta;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod session;

pub use conn::{ChannelConn, ConnError, ControlConn};
pub use delta::PeerDelta;
pub use error::ControlError;
pub use hooks::{
    AuthDirective, PairOperation, SessionHooks, SessionId, VisibilityOracle, VisibilityPair,
};
pub use registry::Server;
pub use session::{PeerFacts, ServerSession, SessionState};
