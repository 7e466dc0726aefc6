//! # Trellis Node
//!
//! Client-side session plumbing for the trellis overlay: the cipher
//! router actor that sits between the transport ingress paths (relay and
//! direct UDP) and the traffic manager.
//!
//! ## Data Flow
//!
//! ```text
//! relay ingress  ─┐                       ┌─> traffic manager
//!                 ├─> CipherRouter ──────>┤
//! direct ingress ─┘    (open/seal)        └─> relay / direct egress
//! ```
//!
//! The traffic, relay, and direct managers are external collaborators;
//! this crate only defines their mailbox contracts.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod managers;
pub mod router;

pub use error::RouterError;
pub use managers::{
    DirectDatagram, DirectHandle, RelayDatagram, RelayHandle, TrafficHandle, TrafficMessage,
};
pub use router::{CipherRouter, RouterHandle, RouterMessage};
