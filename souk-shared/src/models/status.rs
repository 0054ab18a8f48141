use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a subscription's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Push subscription requested, no acknowledgement yet
    Connecting,
    /// Push subscription acknowledged and healthy
    Live,
    /// Push failed; fallback is being engaged
    Degraded,
    /// Poll fallback is the active source of truth
    Polling,
    /// Torn down
    Closed,
}

impl LinkState {
    /// Lowercase name, as used in logs and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Degraded => "degraded",
            Self::Polling => "polling",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport health exposed to views.
///
/// `unstable` is the passive "connection unstable" indicator raised after
/// repeated poll failures; it never blocks rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Current lifecycle state
    pub state: LinkState,
    /// Raised after repeated poll failures, cleared by the next success
    pub unstable: bool,
}

impl LinkStatus {
    /// Status in `state` with the unstable indicator cleared.
    #[must_use]
    pub const fn new(state: LinkState) -> Self {
        Self {
            state,
            unstable: false,
        }
    }

    /// Whether the subscription has been torn down.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, LinkState::Closed)
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new(LinkState::Connecting)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unstable {
            write!(f, "{} (connection unstable)", self.state)
        } else {
            write!(f, "{}", self.state)
        }
    }
}
