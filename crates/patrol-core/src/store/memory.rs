//! Deterministic in-process session store

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{SessionStore, StoreError, StoreResult};
use crate::models::{
    EventKey, EventUpload, PatrolSession, SessionId, SessionPatch, SessionRecord, ShiftWindow,
    StoredEvent,
};

/// Store operation, used to target failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    CreateSession,
    UpdateSession,
    UpsertEvent,
    QueryShifts,
}

#[derive(Default)]
struct Inner {
    offline: bool,
    next_id: u64,
    sessions: HashMap<SessionId, PatrolSession>,
    client_refs: HashMap<SessionId, SessionId>,
    events: Vec<StoredEvent>,
    event_index: HashMap<EventKey, usize>,
    upload_log: Vec<EventKey>,
    shifts: Vec<ShiftWindow>,
    injected: HashMap<StoreOperation, VecDeque<Option<StoreError>>>,
    calls: HashMap<StoreOperation, usize>,
}

impl Inner {
    fn enter(&mut self, op: StoreOperation) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.offline {
            return Err(StoreError::Unavailable("network unreachable".to_string()));
        }
        if let Some(Some(err)) = self.injected.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

/// Session store kept entirely in memory.
///
/// Behaves like the hosted backend for the properties the engine relies on:
/// server-assigned session ids, create deduplication by `client_ref`, and
/// idempotent event upserts by natural key. An offline switch and per-operation
/// failure injection simulate an unreliable network.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every operation fail with a transient error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `count` calls of `op` with `error`, after any scripted before them
    pub fn fail_next(&self, op: StoreOperation, count: usize, error: StoreError) {
        let mut inner = self.lock();
        let queue = inner.injected.entry(op).or_default();
        queue.extend(std::iter::repeat(Some(error)).take(count));
    }

    /// Let the next `count` calls of `op` through before any scripted failure
    pub fn succeed_next(&self, op: StoreOperation, count: usize) {
        let mut inner = self.lock();
        let queue = inner.injected.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(count));
    }

    pub fn add_shift(&self, shift: ShiftWindow) {
        self.lock().shifts.push(shift);
    }

    pub fn session(&self, id: &SessionId) -> Option<PatrolSession> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<PatrolSession> {
        let mut sessions: Vec<_> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    /// Stored events in first-write order
    pub fn events(&self) -> Vec<StoredEvent> {
        self.lock().events.clone()
    }

    /// Every accepted upsert in call order, duplicates included
    pub fn upload_log(&self) -> Vec<EventKey> {
        self.lock().upload_log.clone()
    }

    pub fn call_count(&self, op: StoreOperation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<PatrolSession> {
        let mut inner = self.lock();
        inner.enter(StoreOperation::CreateSession)?;

        if let Some(existing) = inner
            .client_refs
            .get(&record.client_ref)
            .and_then(|id| inner.sessions.get(id))
        {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let id = SessionId::from_server(format!("srv-{}", inner.next_id));
        let session = PatrolSession {
            id: id.clone(),
            guard_id: record.guard_id.clone(),
            site_id: record.site_id.clone(),
            team_id: record.team_id.clone(),
            start_time: record.start_time,
            end_time: None,
            status: record.status,
            last_known_latitude: record.last_known_latitude,
            last_known_longitude: record.last_known_longitude,
            auto_ended: false,
            authorized_until: None,
        };
        inner.client_refs.insert(record.client_ref.clone(), id.clone());
        inner.sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn update_session(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
    ) -> StoreResult<PatrolSession> {
        let mut inner = self.lock();
        inner.enter(StoreOperation::UpdateSession)?;

        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        patch.apply_to(session);
        Ok(session.clone())
    }

    async fn upsert_event(&self, event: &EventUpload) -> StoreResult<StoredEvent> {
        let mut inner = self.lock();
        inner.enter(StoreOperation::UpsertEvent)?;

        if !inner.sessions.contains_key(&event.key.session_id) {
            return Err(StoreError::Rejected(format!(
                "unknown session {}",
                event.key.session_id
            )));
        }

        inner.upload_log.push(event.key.clone());
        if let Some(&index) = inner.event_index.get(&event.key) {
            let stored = &mut inner.events[index];
            stored.payload = event.payload.clone();
            return Ok(stored.clone());
        }

        let stored = StoredEvent {
            id: format!("evt-{}", inner.events.len() + 1),
            key: event.key.clone(),
            guard_id: event.guard_id.clone(),
            payload: event.payload.clone(),
        };
        let index = inner.events.len();
        inner.event_index.insert(event.key.clone(), index);
        inner.events.push(stored.clone());
        Ok(stored)
    }

    async fn query_active_shift_windows(
        &self,
        guard_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ShiftWindow>> {
        let mut inner = self.lock();
        inner.enter(StoreOperation::QueryShifts)?;

        Ok(inner
            .shifts
            .iter()
            .filter(|shift| shift.guard_id == guard_id && shift.end_date >= now)
            .cloned()
            .collect())
    }
}
