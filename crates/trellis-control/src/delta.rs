//! Coalescing of peer-fact changes for dangling clients.
//!
//! While a client's control connection is down, changes about its visible
//! peers collapse into one [`PeerDelta`] per peer. On resume each delta is
//! replayed as a single concrete `PeerAddition`, `PeerRemove`, or
//! `PeerUpdate`.

/// A coalesceable record of pending peer-fact changes.
///
/// `add` and `remove` dominate: whichever of the two arrived last replaces
/// everything queued before it. Otherwise the three refresh flags
/// accumulate by OR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerDelta {
    /// The peer became visible; replay as a full `PeerAddition`.
    pub add: bool,
    /// The peer is gone; replay as `PeerRemove`.
    pub remove: bool,
    /// The peer's endpoints changed.
    pub endpoints: bool,
    /// The peer's session key rotated.
    pub session: bool,
    /// The peer's home relay changed.
    pub relay: bool,
}

impl PeerDelta {
    /// Delta recording a peer addition.
    #[must_use]
    pub fn addition() -> Self {
        Self {
            add: true,
            ..Self::default()
        }
    }

    /// Delta recording a peer removal.
    #[must_use]
    pub fn removal() -> Self {
        Self {
            remove: true,
            ..Self::default()
        }
    }

    /// Merge `newer` into `self`.
    ///
    /// If either side carries `add` or `remove`, that side wins outright,
    /// the newer carrier taking precedence. Otherwise the refresh flags
    /// are OR-ed.
    #[must_use]
    pub fn merge(self, newer: Self) -> Self {
        if newer.add || newer.remove {
            return newer;
        }
        if self.add || self.remove {
            return self;
        }
        Self {
            add: false,
            remove: false,
            endpoints: self.endpoints || newer.endpoints,
            session: self.session || newer.session,
            relay: self.relay || newer.relay,
        }
    }

    /// Does this delta carry anything to replay?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refresh(endpoints: bool, session: bool, relay: bool) -> PeerDelta {
        PeerDelta {
            endpoints,
            session,
            relay,
            ..PeerDelta::default()
        }
    }

    #[test]
    fn refresh_flags_accumulate() {
        let merged = refresh(true, false, false)
            .merge(refresh(false, true, false))
            .merge(refresh(false, false, true));
        assert_eq!(merged, refresh(true, true, true));
    }

    #[test]
    fn newer_add_replaces_refreshes() {
        let merged = refresh(true, true, false).merge(PeerDelta::addition());
        assert_eq!(merged, PeerDelta::addition());
    }

    #[test]
    fn older_remove_beats_newer_refresh() {
        let merged = PeerDelta::removal().merge(refresh(true, false, true));
        assert_eq!(merged, PeerDelta::removal());
    }

    #[test]
    fn newer_remove_replaces_older_add() {
        let merged = PeerDelta::addition().merge(PeerDelta::removal());
        assert_eq!(merged, PeerDelta::removal());
    }

    #[test]
    fn newer_add_replaces_older_remove() {
        let merged = PeerDelta::removal().merge(PeerDelta::addition());
        assert_eq!(merged, PeerDelta::addition());
    }
}
