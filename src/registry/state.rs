//! Feed lifecycle states and the single transition function that moves
//! between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle status of a registered feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Registered,
    Starting,
    Running,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
    Error,
}

impl FeedStatus {
    pub const ALL: [FeedStatus; 9] = [
        FeedStatus::Registered,
        FeedStatus::Starting,
        FeedStatus::Running,
        FeedStatus::Healthy,
        FeedStatus::Degraded,
        FeedStatus::Unhealthy,
        FeedStatus::Stopping,
        FeedStatus::Stopped,
        FeedStatus::Error,
    ];

    /// The feed's poll loop is up (regardless of how well it is doing).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            FeedStatus::Running | FeedStatus::Healthy | FeedStatus::Degraded | FeedStatus::Unhealthy
        )
    }

    /// States from which a fault can move the feed to `Error`.
    pub fn is_active(&self) -> bool {
        self.is_running() || matches!(self, FeedStatus::Starting | FeedStatus::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            | FeedStatus::Registered => "registered",
            | FeedStatus::Starting => "starting",
            | FeedStatus::Running => "running",
            | FeedStatus::Healthy => "healthy",
            | FeedStatus::Degraded => "degraded",
            | FeedStatus::Unhealthy => "unhealthy",
            | FeedStatus::Stopping => "stopping",
            | FeedStatus::Stopped => "stopped",
            | FeedStatus::Error => "error",
        }
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup priority class. Ordering is `Critical` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            | Priority::Critical => "critical",
            | Priority::High => "high",
            | Priority::Medium => "medium",
            | Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Something that happened to a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    StartRequested,
    Started,
    StartFailed,
    StopRequested,
    Stopped,
    StopFailed,
    /// The feed reported its own health; only running states may be reported.
    Report(FeedStatus),
    /// Consecutive failures crossed a threshold (`Degraded` or `Unhealthy`).
    FailureThreshold(FeedStatus),
    HeartbeatTimeout,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition from {from} on {event:?}")]
pub struct TransitionError {
    pub from: FeedStatus,
    pub event: FeedEvent,
}

/// The feed status machine. Every status change in the registry goes through here.
pub fn transition(from: FeedStatus, event: FeedEvent) -> Result<FeedStatus, TransitionError> {
    use FeedStatus as S;

    let next = match (from, event) {
        | (S::Registered | S::Stopped | S::Error, FeedEvent::StartRequested) => Some(S::Starting),
        | (S::Starting, FeedEvent::Started) => Some(S::Running),
        | (S::Starting, FeedEvent::StartFailed) => Some(S::Error),

        | (s, FeedEvent::StopRequested) if s.is_running() || s == S::Starting || s == S::Error => Some(S::Stopping),
        | (S::Stopping, FeedEvent::Stopped) => Some(S::Stopped),
        | (S::Stopping, FeedEvent::StopFailed) => Some(S::Error),

        | (s, FeedEvent::Report(target)) if s.is_running() && target.is_running() => Some(target),
        | (s, FeedEvent::Report(S::Error)) if s.is_running() => Some(S::Error),

        | (s, FeedEvent::FailureThreshold(target))
            if s.is_running() && matches!(target, S::Degraded | S::Unhealthy) =>
        {
            Some(target)
        }

        | (S::Running | S::Healthy | S::Degraded, FeedEvent::HeartbeatTimeout) => Some(S::Unhealthy),

        | (s, FeedEvent::Fault) if s.is_active() => Some(S::Error),

        | _ => None,
    };

    next.ok_or(TransitionError { from, event })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn happy_path_lifecycle() {
        let mut s = FeedStatus::Registered;
        for event in [
            FeedEvent::StartRequested,
            FeedEvent::Started,
            FeedEvent::Report(FeedStatus::Healthy),
            FeedEvent::FailureThreshold(FeedStatus::Degraded),
            FeedEvent::StopRequested,
            FeedEvent::Stopped,
        ] {
            s = transition(s, event).unwrap();
        }
        assert_eq!(s, FeedStatus::Stopped);
    }

    #[rstest]
    #[case(FeedStatus::Registered, FeedEvent::Started)]
    #[case(FeedStatus::Running, FeedEvent::StartRequested)]
    #[case(FeedStatus::Stopped, FeedEvent::Report(FeedStatus::Healthy))]
    #[case(FeedStatus::Healthy, FeedEvent::Report(FeedStatus::Stopped))]
    #[case(FeedStatus::Registered, FeedEvent::Fault)]
    #[case(FeedStatus::Stopped, FeedEvent::HeartbeatTimeout)]
    #[case(FeedStatus::Unhealthy, FeedEvent::HeartbeatTimeout)]
    #[case(FeedStatus::Healthy, FeedEvent::FailureThreshold(FeedStatus::Healthy))]
    #[case(FeedStatus::Registered, FeedEvent::StopRequested)]
    fn illegal_transitions_rejected(#[case] from: FeedStatus, #[case] event: FeedEvent) {
        assert_eq!(transition(from, event), Err(TransitionError { from, event }));
    }

    #[test]
    fn error_reachable_from_every_active_state() {
        for s in FeedStatus::ALL.iter().copied().filter(FeedStatus::is_active) {
            assert_eq!(transition(s, FeedEvent::Fault), Ok(FeedStatus::Error), "from {s}");
        }
    }

    #[test]
    fn error_state_can_restart_or_stop() {
        assert_eq!(transition(FeedStatus::Error, FeedEvent::StartRequested), Ok(FeedStatus::Starting));
        assert_eq!(transition(FeedStatus::Error, FeedEvent::StopRequested), Ok(FeedStatus::Stopping));
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut ps = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        ps.sort();
        assert_eq!(ps, vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]);
    }
}
