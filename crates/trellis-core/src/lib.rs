//! # Trellis Core
//!
//! Shared protocol plumbing for the trellis overlay network.
//!
//! This crate provides:
//! - The session-frame codec (`magic || sender session key || ciphertext`)
//! - Session payloads exchanged between peers after decryption
//! - Control-plane message identities (client ↔ coordination server)
//! - Actor primitives: cancellation tokens with a cause slot and
//!   panic-supervised task spawning
//! - Protocol timing configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Control connection                        │
//! │      (client ↔ server, ControlMessage over framed stream)    │
//! ├──────────────────────────────────────────────────────────────┤
//! │                      Session frames                           │
//! │  (peer ↔ peer, sealed SessionPayload over relay or direct)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod actor;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod session_msg;

pub use actor::{spawn_supervised, CancelToken, MAILBOX_CAPACITY};
pub use config::ControlTiming;
pub use control::{ControlMessage, IpPrefix, RelayInfo, RetryStrategy};
pub use error::{FrameError, ProtoError};
pub use frame::{build_frame, has_magic, Frame, FRAME_MAGIC};
pub use session_msg::{ClearMessage, SessionPayload};
