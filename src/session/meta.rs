//! Sandbox lifecycle state and per-sandbox metadata.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SandboxHandle;

/// State of a sandbox in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Registered, remote creation in flight.
    #[default]
    Pending,
    /// Provisioned and idle.
    Ready,
    /// An operation is in flight.
    Running,
    /// Deadline elapsed; remote resource released.
    TimedOut,
    /// Explicitly terminated (or reclaimed on shutdown).
    Terminated,
    /// Provisioning or an unrecoverable remote error.
    Failed,
}

impl SandboxStatus {
    /// Returns true for the terminal states. A retired handle never accepts
    /// new work.
    #[must_use]
    pub fn is_retired(self) -> bool {
        matches!(self, Self::TimedOut | Self::Terminated | Self::Failed)
    }

    /// Returns true if `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SandboxStatus::*;
        match self {
            Pending => matches!(next, Ready | Failed),
            Ready => matches!(next, Running | Terminated | TimedOut | Failed),
            Running => matches!(next, Ready | Terminated | TimedOut | Failed),
            TimedOut | Terminated | Failed => false,
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Terminated => write!(f, "terminated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything the bridge knows about one sandbox.
///
/// Owned by the [`SandboxRegistry`](crate::session::SandboxRegistry); callers
/// only ever see clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRecord {
    pub handle: SandboxHandle,

    /// Provider-side identifier; absent until provisioning succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,

    pub resource_profile: String,

    /// Snapshot the sandbox was restored from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub timeout_seconds: u64,

    /// `created_at + timeout_seconds`.
    pub deadline: DateTime<Utc>,

    pub last_activity: DateTime<Utc>,
    pub status: SandboxStatus,

    /// When the record reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,

    /// Provider diagnostic for `Failed` sandboxes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tunnels: BTreeMap<u16, String>,

    /// Background processes started and not yet waited for.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub processes: BTreeSet<String>,
}

impl SandboxRecord {
    /// Creates a `Pending` record.
    #[must_use]
    pub fn new(
        handle: SandboxHandle,
        timeout_seconds: u64,
        resource_profile: impl Into<String>,
        image_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let deadline = i64::try_from(timeout_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            handle,
            remote_id: None,
            resource_profile: resource_profile.into(),
            image_id,
            created_at: now,
            timeout_seconds,
            deadline,
            last_activity: now,
            status: SandboxStatus::Pending,
            retired_at: None,
            detail: None,
            tunnels: BTreeMap::new(),
            processes: BTreeSet::new(),
        }
    }

    /// Returns true if the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Remaining lifetime at `now`; zero once the deadline has passed.
    #[must_use]
    pub fn time_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline - now).to_std().unwrap_or_default()
    }

    /// Applies a status change without checking it. Callers check first.
    pub(crate) fn set_status(&mut self, status: SandboxStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_activity = now;
        if status.is_retired() {
            self.retired_at = Some(now);
            self.processes.clear();
        }
    }
}
