//! In-process registry of sandboxes.
//!
//! The registry is the authoritative record of which sandboxes exist and what
//! state each is in. It performs no remote calls: operations that retire a
//! sandbox hand the remote id back to the caller, which releases the remote
//! resource.
//!
//! # Exclusive use
//!
//! [`SandboxRegistry::begin_operation`] atomically moves a `Ready` sandbox to
//! `Running` under the registry lock, so at most one operation is in flight
//! per handle. [`SandboxRegistry::finish_operation`] moves it back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use crate::error::SessionError;
use crate::provider::Provisioned;
use crate::session::{SandboxHandle, SandboxRecord, SandboxStatus};

/// Remote coordinates of a sandbox an operation was started on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveOperation {
    pub handle: SandboxHandle,
    pub remote_id: String,
    pub deadline: DateTime<Utc>,
    pub timeout_seconds: u64,
}

/// A sandbox the sweep moved to `TimedOut`; its remote side must be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSandbox {
    pub handle: SandboxHandle,
    pub remote_id: Option<String>,
}

/// Owns every [`SandboxRecord`] of this process.
#[derive(Debug)]
pub struct SandboxRegistry {
    max_timeout_seconds: u64,
    retention: chrono::Duration,
    records: Mutex<HashMap<SandboxHandle, SandboxRecord>>,
}

impl SandboxRegistry {
    /// Creates an empty registry.
    ///
    /// `retention_seconds` is how long retired records stay visible to
    /// [`describe`](Self::describe) before [`sweep`](Self::sweep) prunes them.
    #[must_use]
    pub fn new(max_timeout_seconds: u64, retention_seconds: u64) -> Self {
        let retention = i64::try_from(retention_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);

        Self {
            max_timeout_seconds,
            retention,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new `Pending` sandbox and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidArgument` if `timeout_seconds` is not
    /// positive or exceeds the configured maximum.
    #[instrument(skip(self, image_id))]
    pub fn create(
        &self,
        timeout_seconds: i64,
        resource_profile: &str,
        image_id: Option<String>,
    ) -> Result<SandboxHandle, SessionError> {
        let timeout = u64::try_from(timeout_seconds)
            .ok()
            .filter(|t| *t > 0 && *t <= self.max_timeout_seconds)
            .ok_or_else(|| {
                SessionError::invalid_argument(format!(
                    "timeout_seconds must be between 1 and {}, got {timeout_seconds}",
                    self.max_timeout_seconds
                ))
            })?;

        let handle = SandboxHandle::new();
        let record = SandboxRecord::new(handle, timeout, resource_profile, image_id, Utc::now());

        self.records.lock().insert(handle, record);
        debug!(%handle, "Sandbox registered");
        Ok(handle)
    }

    /// Returns the record of a live sandbox.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the handle is unknown or retired.
    pub fn get(&self, handle: SandboxHandle) -> Result<SandboxRecord, SessionError> {
        self.records
            .lock()
            .get(&handle)
            .filter(|r| !r.status.is_retired())
            .cloned()
            .ok_or_else(|| not_found(handle))
    }

    /// Returns the record of any known sandbox, retired ones included.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the handle is unknown (or its
    /// retired record has been pruned).
    pub fn describe(&self, handle: SandboxHandle) -> Result<SandboxRecord, SessionError> {
        self.records
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| not_found(handle))
    }

    /// Moves a sandbox to `status`, enforcing the lifecycle state machine.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown handles and
    /// `SessionError::InvalidStateTransition` for illegal moves (including any
    /// move out of a retired state).
    #[instrument(skip(self))]
    pub fn update_status(
        &self,
        handle: SandboxHandle,
        status: SandboxStatus,
    ) -> Result<SandboxRecord, SessionError> {
        self.with_record(handle, |record| {
            transition(record, status, &format!("move to {status}"))?;
            Ok(record.clone())
        })
    }

    /// Completes provisioning: `Pending` → `Ready`, recording the remote id.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidStateTransition` unless the sandbox is
    /// `Pending`.
    #[instrument(skip(self, provisioned), fields(remote_id = %provisioned.remote_id))]
    pub fn mark_ready(
        &self,
        handle: SandboxHandle,
        provisioned: &Provisioned,
    ) -> Result<SandboxRecord, SessionError> {
        self.with_record(handle, |record| {
            if record.status != SandboxStatus::Pending {
                return Err(invalid_state(record, "complete provisioning of"));
            }
            transition(record, SandboxStatus::Ready, "complete provisioning of")?;
            record.remote_id = Some(provisioned.remote_id.clone());
            record.tunnels = provisioned.tunnels.clone();
            Ok(record.clone())
        })
    }

    /// Moves a sandbox to `Failed`, keeping the provider's diagnostic.
    ///
    /// # Errors
    ///
    /// Same as [`update_status`](Self::update_status).
    #[instrument(skip(self))]
    pub fn mark_failed(
        &self,
        handle: SandboxHandle,
        detail: &str,
    ) -> Result<SandboxRecord, SessionError> {
        self.with_record(handle, |record| {
            transition(record, SandboxStatus::Failed, "fail")?;
            record.detail = Some(detail.to_string());
            Ok(record.clone())
        })
    }

    /// Claims a `Ready` sandbox for one operation by moving it to `Running`.
    ///
    /// `action` phrases the operation for error messages ("run a command in").
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for unknown handles and
    /// `SessionError::InvalidStateTransition` if the sandbox is not `Ready`.
    #[instrument(skip(self))]
    pub fn begin_operation(
        &self,
        handle: SandboxHandle,
        action: &str,
    ) -> Result<ActiveOperation, SessionError> {
        self.with_record(handle, |record| {
            if record.status != SandboxStatus::Ready {
                return Err(invalid_state(record, action));
            }
            let remote_id = record
                .remote_id
                .clone()
                .ok_or_else(|| invalid_state(record, action))?;

            record.set_status(SandboxStatus::Running, Utc::now());
            trace!(%handle, "Sandbox claimed");
            Ok(ActiveOperation {
                handle,
                remote_id,
                deadline: record.deadline,
                timeout_seconds: record.timeout_seconds,
            })
        })
    }

    /// Releases a sandbox claimed by [`begin_operation`](Self::begin_operation).
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidStateTransition` if the sandbox was
    /// retired while the operation was in flight (e.g. by the deadline sweep).
    #[instrument(skip(self))]
    pub fn finish_operation(&self, handle: SandboxHandle) -> Result<(), SessionError> {
        self.with_record(handle, |record| {
            if record.status != SandboxStatus::Running {
                return Err(invalid_state(record, "release"));
            }
            record.set_status(SandboxStatus::Ready, Utc::now());
            Ok(())
        })
    }

    /// Remembers a background process started in the sandbox.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the sandbox is unknown or retired.
    pub fn add_process(&self, handle: SandboxHandle, process_id: &str) -> Result<(), SessionError> {
        self.with_record(handle, |record| {
            if record.status.is_retired() {
                return Err(not_found(handle));
            }
            record.processes.insert(process_id.to_string());
            Ok(())
        })
    }

    /// Returns true if the process was started in this sandbox and not yet
    /// waited for.
    #[must_use]
    pub fn has_process(&self, handle: SandboxHandle, process_id: &str) -> bool {
        self.records
            .lock()
            .get(&handle)
            .is_some_and(|r| r.processes.contains(process_id))
    }

    /// Forgets a background process.
    pub fn remove_process(&self, handle: SandboxHandle, process_id: &str) {
        if let Some(record) = self.records.lock().get_mut(&handle) {
            record.processes.remove(process_id);
        }
    }

    /// Expires every `Ready`/`Running` sandbox whose deadline has passed at
    /// `now`, and prunes retired records older than the retention period.
    ///
    /// Returns the newly expired sandboxes; the caller must release their
    /// remote resources.
    #[instrument(skip(self))]
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ExpiredSandbox> {
        let mut records = self.records.lock();
        let mut expired = Vec::new();

        for record in records.values_mut() {
            let live = matches!(record.status, SandboxStatus::Ready | SandboxStatus::Running);
            if live && record.is_expired_at(now) {
                record.set_status(SandboxStatus::TimedOut, now);
                debug!(handle = %record.handle, "Sandbox deadline elapsed");
                expired.push(ExpiredSandbox {
                    handle: record.handle,
                    remote_id: record.remote_id.clone(),
                });
            }
        }

        let retention = self.retention;
        let before = records.len();
        records.retain(|_, r| {
            r.retired_at
                .and_then(|at| at.checked_add_signed(retention))
                .is_none_or(|keep_until| keep_until > now)
        });
        let pruned = before - records.len();

        if !expired.is_empty() || pruned > 0 {
            debug!(expired = expired.len(), pruned, "Sweep complete");
        }
        expired
    }

    /// Handles of sandboxes that are not yet retired, with their status and
    /// remote id.
    #[must_use]
    pub fn live(&self) -> Vec<(SandboxHandle, SandboxStatus, Option<String>)> {
        self.records
            .lock()
            .values()
            .filter(|r| !r.status.is_retired())
            .map(|r| (r.handle, r.status, r.remote_id.clone()))
            .collect()
    }

    /// All known records, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.handle));
        records
    }

    /// Number of known records, retired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if the registry holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn with_record<T>(
        &self,
        handle: SandboxHandle,
        f: impl FnOnce(&mut SandboxRecord) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&handle).ok_or_else(|| not_found(handle))?;
        f(record)
    }
}

fn transition(
    record: &mut SandboxRecord,
    next: SandboxStatus,
    action: &str,
) -> Result<(), SessionError> {
    if !record.status.can_transition_to(next) {
        return Err(invalid_state(record, action));
    }
    record.set_status(next, Utc::now());
    Ok(())
}

fn not_found(handle: SandboxHandle) -> SessionError {
    SessionError::NotFound {
        handle: handle.to_string(),
    }
}

fn invalid_state(record: &SandboxRecord, action: &str) -> SessionError {
    SessionError::InvalidStateTransition {
        handle: record.handle.to_string(),
        from: record.status,
        action: action.to_string(),
    }
}
