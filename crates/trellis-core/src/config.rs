//! Protocol timing configuration.

use std::time::Duration;

/// Timing knobs for the control-plane session engine.
#[derive(Debug, Clone)]
pub struct ControlTiming {
    /// Upper bound for the whole authenticate phase.
    pub authenticate_timeout: Duration,
    /// Polling deadline for each device-key read during authenticate.
    pub device_key_poll: Duration,
    /// How long a dangling session is retained before deconstruction.
    pub dangling_grace: Duration,
    /// How long a resumed session waits for `EndpointUpdate` and
    /// `HomeRelayUpdate` before proceeding with what it has.
    pub resume_wait: Duration,
    /// Deadline for a knock (ping/pong liveness probe).
    pub knock_deadline: Duration,
    /// Capacity of the server-global pair-operation channel.
    pub pair_channel_capacity: usize,
    /// Capacity of each session's auth-directive mailbox.
    pub auth_mailbox_capacity: usize,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            authenticate_timeout: Duration::from_secs(60),
            device_key_poll: Duration::from_millis(100),
            dangling_grace: Duration::from_secs(30),
            resume_wait: Duration::from_secs(10),
            knock_deadline: Duration::from_secs(5),
            pair_channel_capacity: 64,
            auth_mailbox_capacity: 8,
        }
    }
}
