//! Per-interest push/poll state machine.
//!
//! ```text
//! Unconnected ──start(push)──▶ Connecting ──connected──▶ PushActive
//!      │                          │                        │   ▲
//!      │                   connect_timed_out        connection_lost
//!      │                          ▼                        ▼   │ overloaded
//!      └──────start(poll)────▶ Polling ◀───────────────────┘───┘
//!                                 │  ▲
//!                          retry_push  poll_failed / poll_succeeded
//!
//! released: any state ──▶ Stopped
//! ```

use std::time::Duration;

use reflex_core::Timestamp;
use tokio::time::Instant;

/// Parameters the transitions need from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncPolicy {
    /// Whether this interest may use push at all.
    pub push_eligible: bool,
    /// Interval between successful polls.
    pub poll_interval: Duration,
    /// Delay before retrying push after falling back to polling.
    pub push_retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Unconnected,
    Connecting {
        since: Instant,
    },
    PushActive {
        active_at: Timestamp,
    },
    Polling {
        interval: Duration,
        failures: u32,
        retry_push_at: Option<Instant>,
    },
    Stopped,
}

impl SyncState {
    pub fn start(self, policy: &SyncPolicy) -> Self {
        match self {
            Self::Unconnected if policy.push_eligible => Self::Connecting {
                since: Instant::now(),
            },
            Self::Unconnected => Self::polling(policy, false),
            other => other,
        }
    }

    pub fn connected(self, active_at: Timestamp) -> Self {
        match self {
            Self::Connecting { .. } | Self::PushActive { .. } => Self::PushActive { active_at },
            other => other,
        }
    }

    pub fn connect_timed_out(self, policy: &SyncPolicy) -> Self {
        match self {
            Self::Connecting { .. } => Self::polling(policy, true),
            other => other,
        }
    }

    pub fn connection_lost(self, policy: &SyncPolicy) -> Self {
        match self {
            Self::Connecting { .. } | Self::PushActive { .. } => Self::polling(policy, true),
            other => other,
        }
    }

    /// The push channel dropped updates; the subscription restarts its
    /// consistency window at `now`.
    pub fn overloaded(self, now: Timestamp) -> Self {
        match self {
            Self::PushActive { .. } => Self::PushActive { active_at: now },
            other => other,
        }
    }

    pub fn poll_failed(self) -> Self {
        match self {
            Self::Polling {
                interval,
                failures,
                retry_push_at,
            } => Self::Polling {
                interval,
                failures: failures.saturating_add(1),
                retry_push_at,
            },
            other => other,
        }
    }

    pub fn poll_succeeded(self, interval: Duration) -> Self {
        match self {
            Self::Polling { retry_push_at, .. } => Self::Polling {
                interval,
                failures: 0,
                retry_push_at,
            },
            other => other,
        }
    }

    /// Leave polling to try push again, if a retry is due.
    pub fn retry_push(self, now: Instant) -> Self {
        match self {
            Self::Polling {
                retry_push_at: Some(at),
                ..
            } if now >= at => Self::Connecting { since: now },
            other => other,
        }
    }

    /// Re-derive polling parameters after observers tightened their
    /// freshness. An interest that became push-eligible connects now unless
    /// a push retry is already scheduled.
    pub fn retuned(self, policy: &SyncPolicy, now: Instant) -> Self {
        match self {
            Self::Polling {
                retry_push_at: None,
                ..
            } if policy.push_eligible => Self::Connecting { since: now },
            Self::Polling {
                failures,
                retry_push_at,
                ..
            } => Self::Polling {
                interval: policy.poll_interval,
                failures,
                retry_push_at,
            },
            other => other,
        }
    }

    pub fn released(self) -> Self {
        Self::Stopped
    }

    fn polling(policy: &SyncPolicy, retry: bool) -> Self {
        Self::Polling {
            interval: policy.poll_interval,
            failures: 0,
            retry_push_at: (retry && policy.push_eligible)
                .then(|| Instant::now() + policy.push_retry_interval),
        }
    }

    pub fn is_push_active(&self) -> bool {
        matches!(self, Self::PushActive { .. })
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Polling { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting { .. } => "connecting",
            Self::PushActive { .. } => "push_active",
            Self::Polling { .. } => "polling",
            Self::Stopped => "stopped",
        }
    }
}
