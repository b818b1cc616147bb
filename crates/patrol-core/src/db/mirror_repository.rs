//! Local mirror repository: session record, event queue, and sync markers

use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::error::Result;
use crate::models::{EventId, EventKind, EventSyncState, PatrolSession, QueuedEvent, SessionId};
use crate::util::datetime_from_millis;

const EVENT_COLUMNS: &str = "id, session_id, guard_id, kind, payload, captured_at, sync_state, attempts, COALESCE(last_error, '')";

/// Trait for device-local mirror storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MirrorRepository {
    /// Store the guard's session record, replacing any previous one
    async fn save_session(&self, session: &PatrolSession) -> Result<()>;

    /// Load the guard's session record; an unreadable record loads as `None`
    async fn load_session(&self, guard_id: &str) -> Result<Option<PatrolSession>>;

    /// Remove the guard's session record
    async fn clear_session(&self, guard_id: &str) -> Result<()>;

    /// Append an event to the queue
    async fn enqueue_event(&self, event: &QueuedEvent) -> Result<()>;

    /// Store the session record and queue its event together; neither lands alone
    async fn save_session_with_event(
        &self,
        session: &PatrolSession,
        event: &QueuedEvent,
    ) -> Result<()>;

    /// Events awaiting delivery (`pending` or `failed`), in capture order
    async fn list_pending(&self, guard_id: &str) -> Result<Vec<QueuedEvent>>;

    /// Every queued event for the guard regardless of state, in capture order
    async fn list_events(&self, guard_id: &str) -> Result<Vec<QueuedEvent>>;

    /// Claim an event for delivery. Returns `false` if it is no longer deliverable.
    async fn mark_inflight(&self, id: &EventId) -> Result<bool>;

    async fn mark_acknowledged(&self, id: &EventId) -> Result<()>;

    /// Record a failed attempt; the event stays eligible for the next pass
    async fn mark_failed(&self, id: &EventId, error: &str) -> Result<()>;

    /// Return events stuck `inflight` (interrupted pass) to `pending`
    async fn reset_inflight(&self, guard_id: &str) -> Result<u64>;

    /// Delete acknowledged events, for one guard or for the whole device
    async fn purge_acknowledged(&self, guard_id: Option<&str>) -> Result<u64>;

    /// Number of events not yet acknowledged
    async fn pending_count(&self, guard_id: &str) -> Result<usize>;

    /// Whether any unacknowledged event exists for the session
    async fn has_pending_for_session(&self, session_id: &SessionId) -> Result<bool>;

    async fn last_synced_at(&self, guard_id: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_synced_at(&self, guard_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Replace a temporary session id with the server id across the mirror
    async fn remap_session(
        &self,
        guard_id: &str,
        local_id: &SessionId,
        server_id: &SessionId,
    ) -> Result<()>;

    /// Follow the remap table; ids without a mapping resolve to themselves
    async fn resolve_session_id(&self, id: &SessionId) -> Result<SessionId>;
}

/// libSQL implementation of `MirrorRepository`
pub struct LibSqlMirrorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMirrorRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_events(&self, sql: &str, guard_id: &str) -> Result<Vec<QueuedEvent>> {
        let mut rows = self.conn.query(sql, [guard_id]).await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            match Self::parse_event(&row) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    tracing::warn!(guard_id, %reason, "Skipping unreadable queued event");
                }
            }
        }
        Ok(events)
    }

    /// Parse a queued event from a database row
    fn parse_event(row: &libsql::Row) -> std::result::Result<QueuedEvent, String> {
        let text = |idx: i32| row.get::<String>(idx).map_err(|error| error.to_string());

        let id = text(0)?
            .parse::<EventId>()
            .map_err(|error| format!("invalid event id: {error}"))?;
        let kind = text(3)?.parse::<EventKind>()?;
        let payload = serde_json::from_str(&text(4)?)
            .map_err(|error| format!("invalid payload: {error}"))?;
        let captured_at = row.get::<i64>(5).map_err(|error| error.to_string())?;
        let state = text(6)?;
        let sync_state = EventSyncState::parse(&state)
            .ok_or_else(|| format!("unknown sync state '{state}'"))?;
        let attempts = row.get::<i64>(7).map_err(|error| error.to_string())?;
        let last_error = text(8)?;

        Ok(QueuedEvent {
            id,
            session_id: SessionId::from_server(text(1)?),
            guard_id: text(2)?,
            kind,
            payload,
            captured_at: datetime_from_millis(captured_at),
            sync_state,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            last_error: if last_error.is_empty() {
                None
            } else {
                Some(last_error)
            },
        })
    }

    async fn set_state(&self, id: &EventId, state: EventSyncState) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE event_queue SET sync_state = ? WHERE id = ?",
                libsql::params![state.as_str(), id.as_str()],
            )
            .await?;
        Ok(rows)
    }
}

impl MirrorRepository for LibSqlMirrorRepository<'_> {
    async fn save_session(&self, session: &PatrolSession) -> Result<()> {
        let json = serde_json::to_string(session)?;
        let now = Utc::now().timestamp_millis();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO mirrored_sessions (guard_id, session_id, session_json, updated_at)
                 VALUES (?, ?, ?, ?)",
                libsql::params![
                    session.guard_id.as_str(),
                    session.id.as_str(),
                    json,
                    now
                ],
            )
            .await?;
        Ok(())
    }

    async fn load_session(&self, guard_id: &str) -> Result<Option<PatrolSession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_json FROM mirrored_sessions WHERE guard_id = ?",
                [guard_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let raw: String = row.get(0)?;
        match serde_json::from_str::<PatrolSession>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                tracing::warn!(guard_id, %error, "Ignoring unreadable mirrored session record");
                Ok(None)
            }
        }
    }

    async fn clear_session(&self, guard_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM mirrored_sessions WHERE guard_id = ?",
                [guard_id],
            )
            .await?;
        Ok(())
    }

    async fn enqueue_event(&self, event: &QueuedEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn
            .execute(
                "INSERT INTO event_queue (id, guard_id, session_id, kind, payload, captured_at, sync_state, attempts, last_error)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    event.id.as_str(),
                    event.guard_id.as_str(),
                    event.session_id.as_str(),
                    event.kind.as_str(),
                    payload,
                    event.captured_at.timestamp_millis(),
                    event.sync_state.as_str(),
                    i64::from(event.attempts),
                    event.last_error.clone().unwrap_or_default()
                ],
            )
            .await?;
        Ok(())
    }

    async fn save_session_with_event(
        &self,
        session: &PatrolSession,
        event: &QueuedEvent,
    ) -> Result<()> {
        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = async {
            self.save_session(session).await?;
            self.enqueue_event(event).await
        }
        .await;

        match result {
            Ok(()) => {
                if let Err(e) = self.conn.execute("COMMIT", ()).await {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn list_pending(&self, guard_id: &str) -> Result<Vec<QueuedEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_queue
             WHERE guard_id = ? AND sync_state IN ('pending', 'failed')
             ORDER BY seq ASC"
        );
        self.query_events(&sql, guard_id).await
    }

    async fn list_events(&self, guard_id: &str) -> Result<Vec<QueuedEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_queue WHERE guard_id = ? ORDER BY seq ASC"
        );
        self.query_events(&sql, guard_id).await
    }

    async fn mark_inflight(&self, id: &EventId) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE event_queue SET sync_state = 'inflight'
                 WHERE id = ? AND sync_state IN ('pending', 'failed')",
                [id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn mark_acknowledged(&self, id: &EventId) -> Result<()> {
        self.set_state(id, EventSyncState::Acknowledged).await?;
        Ok(())
    }

    async fn mark_failed(&self, id: &EventId, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE event_queue
                 SET sync_state = 'failed', attempts = attempts + 1, last_error = ?
                 WHERE id = ? AND sync_state != 'acknowledged'",
                libsql::params![error, id.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn reset_inflight(&self, guard_id: &str) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE event_queue SET sync_state = 'pending'
                 WHERE guard_id = ? AND sync_state = 'inflight'",
                [guard_id],
            )
            .await?;
        Ok(rows)
    }

    async fn purge_acknowledged(&self, guard_id: Option<&str>) -> Result<u64> {
        let rows = match guard_id {
            Some(guard_id) => {
                self.conn
                    .execute(
                        "DELETE FROM event_queue WHERE guard_id = ? AND sync_state = 'acknowledged'",
                        [guard_id],
                    )
                    .await?
            }
            None => {
                self.conn
                    .execute(
                        "DELETE FROM event_queue WHERE sync_state = 'acknowledged'",
                        (),
                    )
                    .await?
            }
        };
        Ok(rows)
    }

    async fn pending_count(&self, guard_id: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM event_queue WHERE guard_id = ? AND sync_state != 'acknowledged'",
                [guard_id],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn has_pending_for_session(&self, session_id: &SessionId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM event_queue WHERE session_id = ? AND sync_state != 'acknowledged')",
                [session_id.as_str()],
            )
            .await?;
        let exists = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        };
        Ok(exists)
    }

    async fn last_synced_at(&self, guard_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_synced_at FROM sync_markers WHERE guard_id = ?",
                [guard_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(datetime_from_millis(row.get::<i64>(0)?))),
            None => Ok(None),
        }
    }

    async fn set_last_synced_at(&self, guard_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_markers (guard_id, last_synced_at) VALUES (?, ?)",
                libsql::params![guard_id, at.timestamp_millis()],
            )
            .await?;
        Ok(())
    }

    async fn remap_session(
        &self,
        guard_id: &str,
        local_id: &SessionId,
        server_id: &SessionId,
    ) -> Result<()> {
        // Rewrite the mirrored record first, outside the transaction; it is a
        // read-modify-write of JSON and tolerates an unreadable record
        let mirrored = self.load_session(guard_id).await?;
        let rewritten = match mirrored {
            Some(mut session) if session.id == *local_id => {
                session.id = server_id.clone();
                Some(serde_json::to_string(&session)?)
            }
            _ => None,
        };
        let now = Utc::now().timestamp_millis();

        self.conn.execute("BEGIN TRANSACTION", ()).await?;
        let result = async {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO session_id_map (local_id, server_id, guard_id, mapped_at)
                     VALUES (?, ?, ?, ?)",
                    libsql::params![local_id.as_str(), server_id.as_str(), guard_id, now],
                )
                .await?;
            self.conn
                .execute(
                    "UPDATE event_queue SET session_id = ? WHERE session_id = ?",
                    libsql::params![server_id.as_str(), local_id.as_str()],
                )
                .await?;
            if let Some(json) = rewritten {
                self.conn
                    .execute(
                        "UPDATE mirrored_sessions SET session_id = ?, session_json = ?, updated_at = ?
                         WHERE guard_id = ? AND session_id = ?",
                        libsql::params![
                            server_id.as_str(),
                            json,
                            now,
                            guard_id,
                            local_id.as_str()
                        ],
                    )
                    .await?;
            }
            Ok::<(), libsql::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                if let Err(e) = self.conn.execute("COMMIT", ()).await {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
                tracing::info!(%local_id, %server_id, "Remapped local session id");
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e.into())
            }
        }
    }

    async fn resolve_session_id(&self, id: &SessionId) -> Result<SessionId> {
        if !id.is_local() {
            return Ok(id.clone());
        }
        let mut rows = self
            .conn
            .query(
                "SELECT server_id FROM session_id_map WHERE local_id = ?",
                [id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(SessionId::from_server(row.get::<String>(0)?)),
            None => Ok(id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::SessionStatus;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn session(guard_id: &str) -> PatrolSession {
        PatrolSession::begin(guard_id, "site-1", None, Utc::now())
    }

    fn event(session: &PatrolSession, kind: EventKind, n: i64) -> QueuedEvent {
        QueuedEvent::capture(
            session,
            kind,
            serde_json::json!({ "n": n }),
            datetime_from_millis(1_767_000_000_000 + n),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_load_clear_session() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");

        repo.save_session(&session).await.unwrap();
        let loaded = repo.load_session("guard-1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(repo.load_session("guard-2").await.unwrap().is_none());

        repo.clear_session("guard-1").await.unwrap();
        assert!(repo.load_session("guard-1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_event_insert_keeps_previous_session_record() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let active = session("guard-1");
        let start = event(&active, EventKind::PatrolStart, 1);
        repo.save_session_with_event(&active, &start).await.unwrap();

        let mut ended = active.clone();
        ended.finish(SessionStatus::Completed, Utc::now(), false);
        // Same event id violates the queue's unique key
        assert!(repo.save_session_with_event(&ended, &start).await.is_err());

        let loaded = repo.load_session("guard-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(repo.list_events("guard-1").await.unwrap().len(), 1);

        // The connection is usable again after the rollback
        let end = event(&active, EventKind::PatrolEnd, 2);
        repo.save_session_with_event(&ended, &end).await.unwrap();
        let loaded = repo.load_session("guard-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(repo.list_events("guard-1").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_corrupted_session_record_loads_as_none() {
        let db = setup().await;
        db.connection()
            .execute(
                "INSERT INTO mirrored_sessions (guard_id, session_id, session_json, updated_at)
                 VALUES ('guard-1', 'x', '{not json', 0)",
                (),
            )
            .await
            .unwrap();
        let repo = LibSqlMirrorRepository::new(db.connection());
        assert!(repo.load_session("guard-1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_pending_preserves_capture_order() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");

        // Later captured_at first: order must follow insertion, not timestamps
        let c = event(&session, EventKind::CheckpointVisit, 30);
        let a = event(&session, EventKind::CheckpointVisit, 10);
        let b = event(&session, EventKind::LocationSample, 20);
        for e in [&c, &a, &b] {
            repo.enqueue_event(e).await.unwrap();
        }

        let pending = repo.list_pending("guard-1").await.unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![c.id, a.id, b.id]);
        assert_eq!(pending[1].payload["n"], 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreadable_event_row_is_skipped() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");
        repo.enqueue_event(&event(&session, EventKind::Observation, 1))
            .await
            .unwrap();
        db.connection()
            .execute(
                "INSERT INTO event_queue (id, guard_id, session_id, kind, payload, captured_at)
                 VALUES ('bogus', 'guard-1', 's', 'tea-break', '{}', 0)",
                (),
            )
            .await
            .unwrap();

        let pending = repo.list_pending("guard-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, EventKind::Observation);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_state_transitions_and_purge() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");
        let first = event(&session, EventKind::CheckpointVisit, 1);
        let second = event(&session, EventKind::CheckpointVisit, 2);
        repo.enqueue_event(&first).await.unwrap();
        repo.enqueue_event(&second).await.unwrap();

        assert!(repo.mark_inflight(&first.id).await.unwrap());
        repo.mark_acknowledged(&first.id).await.unwrap();
        assert!(!repo.mark_inflight(&first.id).await.unwrap());

        assert!(repo.mark_inflight(&second.id).await.unwrap());
        repo.mark_failed(&second.id, "HTTP 503").await.unwrap();

        let pending = repo.list_pending("guard-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_state, EventSyncState::Failed);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(repo.pending_count("guard-1").await.unwrap(), 1);

        // Purge only touches acknowledged events
        assert_eq!(repo.purge_acknowledged(None).await.unwrap(), 1);
        assert_eq!(repo.list_events("guard-1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reset_inflight_returns_events_to_pending() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");
        let stuck = event(&session, EventKind::LocationSample, 1);
        repo.enqueue_event(&stuck).await.unwrap();
        repo.mark_inflight(&stuck.id).await.unwrap();
        assert!(repo.list_pending("guard-1").await.unwrap().is_empty());

        assert_eq!(repo.reset_inflight("guard-1").await.unwrap(), 1);
        let pending = repo.list_pending("guard-1").await.unwrap();
        assert_eq!(pending[0].sync_state, EventSyncState::Pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remap_rekeys_queue_and_mirrored_session() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        let session = session("guard-1");
        let local_id = session.id.clone();
        repo.save_session(&session).await.unwrap();
        repo.enqueue_event(&event(&session, EventKind::PatrolStart, 1))
            .await
            .unwrap();
        repo.enqueue_event(&event(&session, EventKind::CheckpointVisit, 2))
            .await
            .unwrap();

        let server_id = SessionId::from_server("srv-42");
        repo.remap_session("guard-1", &local_id, &server_id)
            .await
            .unwrap();

        assert_eq!(repo.resolve_session_id(&local_id).await.unwrap(), server_id);
        let mirrored = repo.load_session("guard-1").await.unwrap().unwrap();
        assert_eq!(mirrored.id, server_id);
        assert_eq!(mirrored.status, SessionStatus::Active);
        for queued in repo.list_events("guard-1").await.unwrap() {
            assert_eq!(queued.session_id, server_id);
        }
        assert!(repo.has_pending_for_session(&server_id).await.unwrap());
        assert!(!repo.has_pending_for_session(&local_id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_last_synced_marker() {
        let db = setup().await;
        let repo = LibSqlMirrorRepository::new(db.connection());
        assert!(repo.last_synced_at("guard-1").await.unwrap().is_none());

        let at = datetime_from_millis(1_767_000_000_000);
        repo.set_last_synced_at("guard-1", at).await.unwrap();
        assert_eq!(repo.last_synced_at("guard-1").await.unwrap(), Some(at));
    }
}
