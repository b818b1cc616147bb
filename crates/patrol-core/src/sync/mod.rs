//! Replays locally queued events against the remote session store.
//!
//! Events are delivered in capture order. A failure holds back the rest of
//! that session's events until the next pass, so the store never sees a
//! session's events out of order; other sessions keep draining.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::models::{EventKind, PatrolSession, QueuedEvent, SessionId, SessionPatch, SessionStatus};
use crate::services::LocalMirror;
use crate::store::SessionStore;

/// How a reconciliation pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    /// Every event in the snapshot was acknowledged
    Completed,
    /// Some events failed, were held back, or connectivity dropped mid-pass
    Partial,
    /// Another pass for the same guard was already running
    AlreadyRunning,
    /// Nothing attempted without connectivity
    Offline,
}

/// Result of [`Reconciler::reconcile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub status: ReconcileStatus,
    pub acknowledged: usize,
    pub failed: usize,
    /// Events still waiting for delivery after the pass
    pub remaining: usize,
}

impl ReconcileOutcome {
    pub fn ok(&self) -> bool {
        self.status == ReconcileStatus::Completed
    }

    const fn skipped(status: ReconcileStatus, remaining: usize) -> Self {
        Self {
            status,
            acknowledged: 0,
            failed: 0,
            remaining,
        }
    }
}

/// Drains the event queue of one guard at a time
pub struct Reconciler<S> {
    store: S,
    mirror: LocalMirror,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    running: Mutex<HashSet<String>>,
}

/// Held while a pass for a guard runs
struct RunningPass<'a> {
    running: &'a Mutex<HashSet<String>>,
    guard_id: String,
}

impl Drop for RunningPass<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.guard_id);
    }
}

impl<S: SessionStore> Reconciler<S> {
    pub fn new(
        store: S,
        mirror: LocalMirror,
        connectivity: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            mirror,
            connectivity,
            clock,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn try_begin(&self, guard_id: &str) -> Option<RunningPass<'_>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(guard_id.to_string()) {
            return None;
        }
        Some(RunningPass {
            running: &self.running,
            guard_id: guard_id.to_string(),
        })
    }

    /// Run one reconciliation pass for `guard_id`.
    ///
    /// Failures are recorded on the events and logged; this never errors.
    pub async fn reconcile(&self, guard_id: &str) -> ReconcileOutcome {
        if !self.connectivity.is_online() {
            let remaining = self.mirror.pending_count(guard_id).await;
            return ReconcileOutcome::skipped(ReconcileStatus::Offline, remaining);
        }
        let Some(_pass) = self.try_begin(guard_id) else {
            tracing::debug!(guard_id, "Reconciliation already running");
            let remaining = self.mirror.pending_count(guard_id).await;
            return ReconcileOutcome::skipped(ReconcileStatus::AlreadyRunning, remaining);
        };

        // Anything still inflight was interrupted by a crash or abort
        match self.mirror.reset_inflight(guard_id).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(guard_id, count, "Requeued interrupted events"),
            Err(error) => tracing::warn!(guard_id, %error, "Failed to requeue interrupted events"),
        }

        let events = self.mirror.list_pending(guard_id).await;
        let mut blocked: HashSet<SessionId> = HashSet::new();
        let mut acknowledged = 0;
        let mut failed = 0;
        let mut held_back = 0;
        let mut interrupted = false;

        for event in &events {
            if !self.connectivity.is_online() {
                tracing::info!(guard_id, "Connectivity lost, stopping reconciliation");
                interrupted = true;
                break;
            }
            if blocked.contains(&event.session_id) {
                held_back += 1;
                continue;
            }

            match self.mirror.mark_inflight(&event.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(error) => {
                    tracing::warn!(event_id = %event.id, %error, "Failed to claim queued event");
                    blocked.insert(event.session_id.clone());
                    held_back += 1;
                    continue;
                }
            }

            match self.deliver(event).await {
                Ok(()) => {
                    if let Err(error) = self.mirror.mark_acknowledged(&event.id).await {
                        // Stays inflight; the next pass resends it and the upsert absorbs it
                        tracing::warn!(event_id = %event.id, %error, "Failed to acknowledge event");
                        blocked.insert(event.session_id.clone());
                        continue;
                    }
                    tracing::debug!(event_id = %event.id, kind = %event.kind, "Event delivered");
                    acknowledged += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        event_id = %event.id,
                        kind = %event.kind,
                        session_id = %event.session_id,
                        %error,
                        "Event delivery failed"
                    );
                    if let Err(mark_error) = self.mirror.mark_failed(&event.id, &error.to_string()).await {
                        tracing::warn!(event_id = %event.id, error = %mark_error, "Failed to record delivery failure");
                    }
                    blocked.insert(event.session_id.clone());
                    failed += 1;
                }
            }
        }

        self.finish_pass(guard_id).await;

        let remaining = self.mirror.pending_count(guard_id).await;
        let clean = !interrupted && failed == 0 && held_back == 0 && acknowledged == events.len();
        let status = if clean {
            ReconcileStatus::Completed
        } else {
            ReconcileStatus::Partial
        };
        if clean {
            if let Err(error) = self.mirror.set_last_synced_at(guard_id, self.clock.now()).await {
                tracing::warn!(guard_id, %error, "Failed to stamp last sync time");
            }
        }
        if !events.is_empty() {
            tracing::info!(guard_id, acknowledged, failed, remaining, "Reconciliation pass finished");
        }

        ReconcileOutcome {
            status,
            acknowledged,
            failed,
            remaining,
        }
    }

    async fn finish_pass(&self, guard_id: &str) {
        if let Err(error) = self.mirror.purge_acknowledged_for(guard_id).await {
            tracing::warn!(guard_id, %error, "Failed to purge acknowledged events");
        }

        // An ended session stays mirrored only until its events are delivered
        if let Some(session) = self.mirror.load_session(guard_id).await {
            if !session.is_active() && !self.mirror.has_pending_for_session(&session.id).await {
                match self.mirror.clear_session(guard_id).await {
                    Ok(()) => tracing::info!(session_id = %session.id, "Cleared synced session"),
                    Err(error) => tracing::warn!(guard_id, %error, "Failed to clear synced session"),
                }
            }
        }
    }

    async fn deliver(&self, event: &QueuedEvent) -> Result<()> {
        let session_id = self.mirror.resolve_session_id(&event.session_id).await?;

        match event.kind {
            EventKind::PatrolStart if session_id.is_local() => {
                let mut session: PatrolSession = serde_json::from_value(event.payload.clone())?;
                session.id = session_id.clone();
                let created = self.store.create_session(&session.to_record()).await?;
                self.mirror
                    .remap_session(&event.guard_id, &session_id, &created.id)
                    .await?;
                tracing::info!(local_id = %session_id, server_id = %created.id, "Session created on store");

                let mut upload = event.to_upload(&created.id);
                if let Some(payload) = upload.payload.as_object_mut() {
                    payload.insert("id".to_string(), created.id.as_str().into());
                }
                self.store.upsert_event(&upload).await?;
            }
            kind if kind.is_terminal() => {
                let patch = terminal_patch(event);
                self.store.update_session(&session_id, &patch).await?;
                self.store.upsert_event(&event.to_upload(&session_id)).await?;
            }
            _ => {
                self.store.upsert_event(&event.to_upload(&session_id)).await?;
            }
        }
        Ok(())
    }
}

/// The session update carried by a terminal event.
///
/// Falls back to what the event kind and capture time imply when the payload
/// is not a patch.
pub fn terminal_patch(event: &QueuedEvent) -> SessionPatch {
    serde_json::from_value(event.payload.clone()).unwrap_or_else(|_| SessionPatch {
        status: SessionStatus::Completed,
        end_time: Some(event.captured_at),
        auto_ended: event.kind == EventKind::PatrolAutoEnd,
        last_known_latitude: None,
        last_known_longitude: None,
    })
}
