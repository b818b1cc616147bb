//! Local durable mirror: the device's single writer for session and queue state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::{Database, LibSqlMirrorRepository, MirrorRepository};
use crate::models::{EventId, EventKind, PatrolSession, QueuedEvent, SessionId};
use crate::Result;

/// Thread-safe handle over the device-local mirror database.
///
/// Read paths never fail: a database error or an unreadable record is logged
/// and reported as absent/empty so a damaged cache cannot stop the app from
/// booting. Write paths return errors and complete before returning.
#[derive(Clone)]
pub struct LocalMirror {
    db: Arc<Mutex<Database>>,
}

impl LocalMirror {
    /// Open the mirror at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and a fresh mirror created.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Mirror database at {} is unreadable: {}. Starting from an empty mirror.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Open an in-memory mirror (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// Run a raw statement against the mirror database
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute(sql, ()).await?;
        Ok(())
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database") || message.contains("malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("mirror.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted mirror file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        // WAL and shared-memory sidecars belong to the quarantined file
        for suffix in ["-wal", "-shm"] {
            let sidecar = parent.join(format!("{base_name}{suffix}"));
            if sidecar.exists() {
                std::fs::remove_file(&sidecar)?;
                tracing::warn!("Removed stale mirror sidecar {}", sidecar.display());
            }
        }

        Ok(())
    }

    pub async fn save_session(&self, session: &PatrolSession) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.save_session(session).await
    }

    pub async fn load_session(&self, guard_id: &str) -> Option<PatrolSession> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.load_session(guard_id).await.unwrap_or_else(|error| {
            tracing::warn!(guard_id, %error, "Failed to read mirrored session");
            None
        })
    }

    pub async fn clear_session(&self, guard_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.clear_session(guard_id).await
    }

    pub async fn enqueue_event(&self, event: &QueuedEvent) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.enqueue_event(event).await?;
        tracing::debug!(event_id = %event.id, kind = %event.kind, session_id = %event.session_id, "Queued event");
        Ok(())
    }

    /// Write the session record and queue its event in one transaction.
    ///
    /// On failure the previously mirrored record is left in place.
    pub async fn save_session_with_event(
        &self,
        session: &PatrolSession,
        event: &QueuedEvent,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.save_session_with_event(session, event).await?;
        tracing::debug!(event_id = %event.id, kind = %event.kind, session_id = %session.id, "Mirrored session with event");
        Ok(())
    }

    /// Deliverable events in capture order.
    pub async fn list_pending(&self, guard_id: &str) -> Vec<QueuedEvent> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.list_pending(guard_id).await.unwrap_or_else(|error| {
            tracing::warn!(guard_id, %error, "Failed to read event queue");
            Vec::new()
        })
    }

    /// Every queued event for the guard, in capture order.
    pub async fn list_events(&self, guard_id: &str) -> Vec<QueuedEvent> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.list_events(guard_id).await.unwrap_or_else(|error| {
            tracing::warn!(guard_id, %error, "Failed to read event queue");
            Vec::new()
        })
    }

    pub async fn mark_inflight(&self, id: &EventId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.mark_inflight(id).await
    }

    pub async fn mark_acknowledged(&self, id: &EventId) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.mark_acknowledged(id).await
    }

    pub async fn mark_failed(&self, id: &EventId, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.mark_failed(id, error).await
    }

    pub async fn reset_inflight(&self, guard_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.reset_inflight(guard_id).await
    }

    /// Drop acknowledged events for every guard on this device.
    pub async fn purge_acknowledged(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.purge_acknowledged(None).await
    }

    pub async fn purge_acknowledged_for(&self, guard_id: &str) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.purge_acknowledged(Some(guard_id)).await
    }

    pub async fn pending_count(&self, guard_id: &str) -> usize {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.pending_count(guard_id).await.unwrap_or_else(|error| {
            tracing::warn!(guard_id, %error, "Failed to count pending events");
            0
        })
    }

    /// Whether anything is queued ahead for the session.
    ///
    /// An unreadable queue answers `true` so callers keep to the queued path
    /// and cannot overtake events they failed to see.
    pub async fn has_pending_for_session(&self, session_id: &SessionId) -> bool {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.has_pending_for_session(session_id)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(%session_id, %error, "Failed to inspect event queue");
                true
            })
    }

    pub async fn last_synced_at(&self, guard_id: &str) -> Option<DateTime<Utc>> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.last_synced_at(guard_id).await.unwrap_or_else(|error| {
            tracing::warn!(guard_id, %error, "Failed to read last sync marker");
            None
        })
    }

    pub async fn set_last_synced_at(&self, guard_id: &str, at: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.set_last_synced_at(guard_id, at).await
    }

    pub async fn remap_session(
        &self,
        guard_id: &str,
        local_id: &SessionId,
        server_id: &SessionId,
    ) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.remap_session(guard_id, local_id, server_id).await
    }

    pub async fn resolve_session_id(&self, id: &SessionId) -> Result<SessionId> {
        let db = self.db.lock().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        repo.resolve_session_id(id).await
    }

    /// Most recently started session in the queue that never got a terminating event.
    ///
    /// Recovers a session whose mirrored record was lost or is unreadable after
    /// an unclean shutdown; the `patrol-start` payload carries the session.
    pub async fn find_unterminated_session(&self, guard_id: &str) -> Option<PatrolSession> {
        let events = self.list_events(guard_id).await;
        let terminated: HashSet<&SessionId> = events
            .iter()
            .filter(|event| event.kind.is_terminal())
            .map(|event| &event.session_id)
            .collect();

        events
            .iter()
            .rev()
            .filter(|event| event.kind == EventKind::PatrolStart)
            .filter(|event| !terminated.contains(&event.session_id))
            .find_map(|event| {
                match serde_json::from_value::<PatrolSession>(event.payload.clone()) {
                    Ok(mut session) if session.is_active() => {
                        session.id = event.session_id.clone();
                        Some(session)
                    }
                    Ok(_) => None,
                    Err(error) => {
                        tracing::warn!(event_id = %event.id, %error, "Unreadable patrol-start payload");
                        None
                    }
                }
            })
    }
}
