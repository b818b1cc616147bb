//! Patrol session lifecycle controller.
//!
//! One controller per signed-in guard. It owns the session state machine,
//! writes through to the session store when it can, queues to the local
//! mirror when it cannot, and runs the watchdog and refresh timers. All
//! transitions are serialized by a single async mutex.

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::PatrolConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::eligibility::{EligibilityReason, ShiftEligibility};
use crate::error::{Error, Result};
use crate::location::{acquire_position, LocationProvider};
use crate::models::{EventKind, PatrolSession, QueuedEvent, SessionId, SessionStatus};
use crate::services::LocalMirror;
use crate::state::{SessionPhase, SessionSnapshot, SyncSnapshot};
use crate::store::{SessionStore, StoreError, StoreResult};
use crate::sync::{ReconcileOutcome, Reconciler};

/// Announcements for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The watchdog ended the session because its shift is over
    AutoEnded {
        session_id: SessionId,
        reason: EligibilityReason,
    },
    /// An active session was resumed after a restart
    Restored { session_id: SessionId },
}

/// Where a captured event went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written straight to the session store
    Sent,
    /// Queued locally for the reconciler
    Queued,
}

enum WriteOutcome<T> {
    Done(T),
    Deferred(String),
    Rejected(StoreError),
}

#[derive(Default)]
struct Core {
    phase: SessionPhase,
    session: Option<PatrolSession>,
}

#[derive(Default)]
struct Timers {
    watchdog: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
    connectivity: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.watchdog.take(),
            self.refresh.take(),
            self.connectivity.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner<S, L> {
    guard_id: String,
    store: Arc<S>,
    location: L,
    mirror: LocalMirror,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    config: PatrolConfig,
    oracle: ShiftEligibility<Arc<S>>,
    reconciler: Reconciler<Arc<S>>,
    core: Mutex<Core>,
    session_tx: watch::Sender<SessionSnapshot>,
    sync_tx: watch::Sender<SyncSnapshot>,
    notices: broadcast::Sender<Notice>,
    timers: StdMutex<Timers>,
    watchdog_generation: AtomicU64,
    shut_down: AtomicBool,
}

/// Lifecycle controller for one guard's patrol sessions
pub struct SessionController<S, L> {
    inner: Arc<Inner<S, L>>,
}

impl<S, L> SessionController<S, L>
where
    S: SessionStore + 'static,
    L: LocationProvider + 'static,
{
    pub fn new(
        guard_id: impl Into<String>,
        store: S,
        location: L,
        mirror: LocalMirror,
        connectivity: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
        config: PatrolConfig,
    ) -> Self {
        let guard_id = guard_id.into();
        let store = Arc::new(store);
        let oracle = ShiftEligibility::new(Arc::clone(&store), config.grace_minutes);
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            mirror.clone(),
            connectivity.clone(),
            Arc::clone(&clock),
        );
        let (session_tx, _) = watch::channel(SessionSnapshot {
            guard_id: guard_id.clone(),
            ..SessionSnapshot::default()
        });
        let (sync_tx, _) = watch::channel(SyncSnapshot {
            online: connectivity.is_online(),
            ..SyncSnapshot::default()
        });
        let (notices, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(Inner {
                guard_id,
                store,
                location,
                mirror,
                connectivity,
                clock,
                config,
                oracle,
                reconciler,
                core: Mutex::new(Core::default()),
                session_tx,
                sync_tx,
                notices,
                timers: StdMutex::new(Timers::default()),
                watchdog_generation: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn guard_id(&self) -> &str {
        &self.inner.guard_id
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.inner.mirror
    }

    /// Resume persisted state and start the background timers
    pub async fn initialize(&self) -> Result<SessionSnapshot> {
        let snapshot = self.restore().await?;
        self.inner.spawn_background();
        self.inner.refresh_sync_snapshot().await;
        Ok(snapshot)
    }

    /// Resume a persisted session without re-checking eligibility.
    ///
    /// Falls back to the newest queued `patrol-start` without a terminating
    /// event when the mirrored record is missing or unreadable.
    pub async fn restore(&self) -> Result<SessionSnapshot> {
        self.inner.restore().await
    }

    /// Start a patrol at `site_id`, gated by the guard's shift
    pub async fn start(&self, site_id: &str, team_id: Option<String>) -> Result<PatrolSession> {
        self.inner.start(site_id, team_id).await
    }

    /// Capture an activity or location event for the active session
    pub async fn record_event(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        self.inner.record_event(kind, payload).await
    }

    /// End the active session. A no-op when nothing is active.
    pub async fn end(&self, user_initiated: bool) -> Result<Option<PatrolSession>> {
        self.inner
            .finish(SessionStatus::Completed, !user_initiated, None)
            .await
    }

    /// Cancel the active session. A no-op when nothing is active.
    pub async fn cancel(&self) -> Result<Option<PatrolSession>> {
        self.inner.finish(SessionStatus::Cancelled, false, None).await
    }

    /// Re-check the shift now, auto-ending the session if it has elapsed.
    ///
    /// Returns whether a session is still active afterwards.
    pub async fn check_authorization(&self) -> bool {
        self.inner.check_authorization().await
    }

    /// Reconcile queued events now
    pub async fn force_sync(&self) -> ReconcileOutcome {
        self.inner.sync_now().await
    }

    /// Drop acknowledged events from the device queue
    pub async fn clear_acknowledged_cache(&self) -> Result<u64> {
        let purged = self.inner.mirror.purge_acknowledged().await?;
        self.inner.refresh_sync_snapshot().await;
        Ok(purged)
    }

    /// Re-read queue depth and the sync marker from the mirror
    pub async fn refresh_sync_state(&self) -> SyncSnapshot {
        self.inner.refresh_sync_snapshot().await;
        self.inner.sync_tx.borrow().clone()
    }

    /// Stop every timer; later ticks of a stale timer are ignored
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn session_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.session_tx.subscribe()
    }

    pub fn sync_state(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.sync_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.session_tx.borrow().clone()
    }

    pub async fn current_session(&self) -> Option<PatrolSession> {
        self.inner.core.lock().await.session.clone()
    }
}

impl<S, L> Drop for SessionController<S, L> {
    fn drop(&mut self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

impl<S, L> Inner<S, L>
where
    S: SessionStore + 'static,
    L: LocationProvider + 'static,
{
    fn publish(&self, core: &Core) {
        let snapshot = SessionSnapshot {
            phase: core.phase,
            guard_id: self.guard_id.clone(),
            session_id: core.session.as_ref().map(|s| s.id.clone()),
            site_id: core.session.as_ref().map(|s| s.site_id.clone()),
            start_time: core.session.as_ref().map(|s| s.start_time),
            auto_ended: core.session.as_ref().is_some_and(|s| s.auto_ended),
        };
        self.session_tx.send_replace(snapshot);
    }

    async fn bounded<T>(&self, write: impl Future<Output = StoreResult<T>>) -> WriteOutcome<T> {
        match tokio::time::timeout(self.config.write_timeout(), write).await {
            Ok(Ok(value)) => WriteOutcome::Done(value),
            Ok(Err(error)) if error.is_transient() => WriteOutcome::Deferred(error.to_string()),
            Ok(Err(error)) => WriteOutcome::Rejected(error),
            Err(_) => WriteOutcome::Deferred("write timed out".to_string()),
        }
    }

    /// Direct writes only when they cannot overtake queued work
    async fn can_write_directly(&self, session_id: &SessionId) -> bool {
        self.connectivity.is_online()
            && !session_id.is_local()
            && !self.mirror.has_pending_for_session(session_id).await
    }

    async fn restore(self: &Arc<Self>) -> Result<SessionSnapshot> {
        let mut core = self.core.lock().await;
        if core.phase.is_active() {
            return Ok(self.session_tx.borrow().clone());
        }

        let recovered = match self.mirror.load_session(&self.guard_id).await {
            Some(session) if session.is_active() => Some(session),
            Some(session) => {
                // Ended but not yet delivered
                core.phase = SessionPhase::Ended {
                    status: session.status,
                };
                core.session = Some(session);
                None
            }
            None => match self.mirror.find_unterminated_session(&self.guard_id).await {
                Some(session) => {
                    tracing::warn!(session_id = %session.id, "Recovered session from the event queue");
                    self.mirror.save_session(&session).await?;
                    Some(session)
                }
                None => None,
            },
        };

        if let Some(session) = recovered {
            tracing::info!(session_id = %session.id, guard_id = %self.guard_id, "Resumed patrol session");
            let _ = self.notices.send(Notice::Restored {
                session_id: session.id.clone(),
            });
            core.phase = SessionPhase::Active { persisted: true };
            core.session = Some(session);
            self.arm_watchdog();
        }

        self.publish(&core);
        Ok(self.session_tx.borrow().clone())
    }

    async fn start(self: &Arc<Self>, site_id: &str, team_id: Option<String>) -> Result<PatrolSession> {
        let site_id = site_id.trim();
        if site_id.is_empty() {
            return Err(Error::InvalidInput("site id must not be empty".to_string()));
        }

        let mut core = self.core.lock().await;
        if core.phase.is_active() {
            return Err(Error::SessionAlreadyActive(self.guard_id.clone()));
        }
        if !core.phase.accepts_start() {
            return Err(Error::InvalidTransition {
                state: core.phase.as_str(),
                action: "start a patrol",
            });
        }
        if self
            .mirror
            .load_session(&self.guard_id)
            .await
            .is_some_and(|session| session.is_active())
        {
            return Err(Error::SessionAlreadyActive(self.guard_id.clone()));
        }

        let previous = std::mem::take(&mut *core);
        core.phase = SessionPhase::Starting;
        self.publish(&core);

        match self.begin_session(&mut core, site_id, team_id).await {
            Ok(session) => {
                self.arm_watchdog();
                self.publish(&core);
                drop(core);
                self.refresh_sync_snapshot().await;
                Ok(session)
            }
            Err(error) => {
                *core = previous;
                self.publish(&core);
                Err(error)
            }
        }
    }

    async fn begin_session(
        &self,
        core: &mut Core,
        site_id: &str,
        team_id: Option<String>,
    ) -> Result<PatrolSession> {
        let now = self.clock.now();
        let decision = self.oracle.evaluate(&self.guard_id, now).await;
        if !decision.eligible {
            tracing::info!(guard_id = %self.guard_id, reason = %decision.reason, "Patrol start refused");
            return Err(Error::Ineligible(decision.reason));
        }

        let mut session = PatrolSession::begin(&self.guard_id, site_id, team_id, now);
        session.authorized_until = decision.window.as_ref().map(|window| window.end_date);
        if let Some(position) =
            acquire_position(&self.location, &self.config.location_policy()).await
        {
            session.set_position(position.latitude, position.longitude);
        }

        if self.connectivity.is_online() {
            match self.bounded(self.store.create_session(&session.to_record())).await {
                WriteOutcome::Done(created) => session.id = created.id,
                WriteOutcome::Deferred(reason) => {
                    tracing::warn!(%reason, "Session store unreachable, starting offline");
                }
                WriteOutcome::Rejected(error) => return Err(error.into()),
            }
        }

        core.phase = SessionPhase::Active { persisted: false };
        core.session = Some(session.clone());
        self.publish(core);

        if let Err(error) = self.mirror.save_session(&session).await {
            if !session.id.is_local() {
                self.withdraw_unmirrored(&session).await;
            }
            return Err(error);
        }
        let start = QueuedEvent::capture(
            &session,
            EventKind::PatrolStart,
            serde_json::to_value(&session)?,
            now,
        );
        if let Err(error) = self.write_or_queue(start).await {
            // The session exists; the queued start event is retried by the reconciler
            tracing::warn!(session_id = %session.id, %error, "Start event was rejected");
        }

        core.phase = SessionPhase::Active { persisted: true };
        tracing::info!(
            session_id = %session.id,
            guard_id = %self.guard_id,
            site_id,
            offline = session.id.is_local(),
            "Patrol started"
        );
        Ok(session)
    }

    /// Cancel a session created on the store that the device failed to mirror
    async fn withdraw_unmirrored(&self, session: &PatrolSession) {
        let mut withdrawn = session.clone();
        withdrawn.finish(SessionStatus::Cancelled, self.clock.now(), false);
        match self
            .bounded(self.store.update_session(&withdrawn.id, &withdrawn.to_patch()))
            .await
        {
            WriteOutcome::Done(_) => {
                tracing::warn!(session_id = %withdrawn.id, "Cancelled session that could not be mirrored");
            }
            WriteOutcome::Deferred(reason) => {
                tracing::error!(session_id = %withdrawn.id, %reason, "Unmirrored session left active on the store");
            }
            WriteOutcome::Rejected(error) => {
                tracing::error!(session_id = %withdrawn.id, %error, "Unmirrored session left active on the store");
            }
        }
    }

    /// Write an event to the store, or queue it when that is not possible.
    ///
    /// A permanent rejection still queues the event (so nothing captured is
    /// lost) and reports the error.
    async fn write_or_queue(&self, event: QueuedEvent) -> Result<Delivery> {
        if self.can_write_directly(&event.session_id).await {
            match self
                .bounded(self.store.upsert_event(&event.to_upload(&event.session_id)))
                .await
            {
                WriteOutcome::Done(_) => return Ok(Delivery::Sent),
                WriteOutcome::Deferred(reason) => {
                    tracing::debug!(event_id = %event.id, %reason, "Direct write deferred to queue");
                }
                WriteOutcome::Rejected(error) => {
                    self.mirror.enqueue_event(&event).await?;
                    self.mirror.mark_failed(&event.id, &error.to_string()).await?;
                    self.refresh_sync_snapshot().await;
                    return Err(error.into());
                }
            }
        }

        self.mirror.enqueue_event(&event).await?;
        self.refresh_sync_snapshot().await;
        Ok(Delivery::Queued)
    }

    async fn record_event(&self, kind: EventKind, payload: serde_json::Value) -> Result<Delivery> {
        if kind == EventKind::PatrolStart || kind.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "{kind} is recorded by the session lifecycle"
            )));
        }

        let mut core = self.core.lock().await;
        let session = match (core.phase, core.session.as_mut()) {
            (SessionPhase::Active { .. }, Some(session)) => session,
            (phase, _) => {
                return Err(Error::InvalidTransition {
                    state: phase.as_str(),
                    action: "record an event",
                })
            }
        };

        let event = QueuedEvent::capture(session, kind, payload, self.clock.now());
        if kind == EventKind::LocationSample {
            let coordinate = |name: &str| event.payload.get(name).and_then(serde_json::Value::as_f64);
            if let (Some(latitude), Some(longitude)) = (coordinate("latitude"), coordinate("longitude")) {
                session.set_position(latitude, longitude);
                if let Err(error) = self.mirror.save_session(session).await {
                    tracing::warn!(%error, "Failed to persist last known position");
                }
            }
        }

        self.write_or_queue(event).await
    }

    /// End the active session; with `expected`, only if it is still that session
    async fn finish(
        &self,
        status: SessionStatus,
        auto_ended: bool,
        expected: Option<&SessionId>,
    ) -> Result<Option<PatrolSession>> {
        let mut core = self.core.lock().await;
        let session = match (core.phase, core.session.as_ref()) {
            (SessionPhase::Active { .. }, Some(session)) => session.clone(),
            _ => return Ok(None),
        };
        if let Some(expected) = expected {
            if !self.is_same_session(expected, &session.id).await {
                tracing::debug!(%expected, current = %session.id, "Session changed, skipping end");
                return Ok(None);
            }
        }

        let previous_phase = core.phase;
        core.phase = SessionPhase::Ending;
        self.publish(&core);

        match self.close_session(session, status, auto_ended).await {
            Ok(ended) => {
                self.disarm_watchdog();
                core.phase = SessionPhase::Ended { status };
                core.session = Some(ended.clone());
                self.publish(&core);
                drop(core);
                self.refresh_sync_snapshot().await;
                tracing::info!(
                    session_id = %ended.id,
                    status = %status,
                    auto_ended,
                    "Patrol ended"
                );
                Ok(Some(ended))
            }
            Err(error) => {
                core.phase = previous_phase;
                self.publish(&core);
                Err(error)
            }
        }
    }

    /// Ids match directly or through a temporary-to-server remap
    async fn is_same_session(&self, expected: &SessionId, current: &SessionId) -> bool {
        expected == current
            || self
                .mirror
                .resolve_session_id(expected)
                .await
                .is_ok_and(|resolved| resolved == *current)
    }

    async fn close_session(
        &self,
        mut session: PatrolSession,
        status: SessionStatus,
        auto_ended: bool,
    ) -> Result<PatrolSession> {
        let now = self.clock.now();
        session.finish(status, now, auto_ended);
        let kind = if auto_ended {
            EventKind::PatrolAutoEnd
        } else {
            EventKind::PatrolEnd
        };
        let patch = session.to_patch();
        let terminal = QueuedEvent::capture(&session, kind, serde_json::to_value(&patch)?, now);

        if self.can_write_directly(&session.id).await {
            match self.bounded(self.store.update_session(&session.id, &patch)).await {
                WriteOutcome::Done(_) => {
                    match self
                        .bounded(self.store.upsert_event(&terminal.to_upload(&session.id)))
                        .await
                    {
                        WriteOutcome::Done(_) => {
                            self.mirror.clear_session(&self.guard_id).await?;
                            return Ok(session);
                        }
                        WriteOutcome::Deferred(reason) => {
                            tracing::debug!(%reason, "Terminal event deferred to queue");
                        }
                        WriteOutcome::Rejected(error) => {
                            // The session itself is closed on the store; keep the event for retry
                            tracing::warn!(session_id = %session.id, %error, "Terminal event was rejected");
                        }
                    }
                }
                WriteOutcome::Deferred(reason) => {
                    tracing::warn!(%reason, "Session store unreachable, ending offline");
                }
                WriteOutcome::Rejected(error) => return Err(error.into()),
            }
        }

        self.mirror.save_session_with_event(&session, &terminal).await?;
        Ok(session)
    }

    async fn check_authorization(&self) -> bool {
        let session = {
            let core = self.core.lock().await;
            match (core.phase, core.session.as_ref()) {
                (SessionPhase::Active { .. }, Some(session)) => session.clone(),
                _ => return false,
            }
        };

        let now = self.clock.now();
        let decision = self.oracle.evaluate(&self.guard_id, now).await;
        if decision.eligible {
            return true;
        }
        if decision.is_verification_failure() {
            // Cannot reach the schedule; hold to the window that authorized the start
            match session.authorized_until {
                Some(until) if now > until => {}
                _ => return true,
            }
        }

        tracing::info!(session_id = %session.id, reason = %decision.reason, "Shift elapsed, ending patrol");
        match self
            .finish(SessionStatus::Completed, true, Some(&session.id))
            .await
        {
            Ok(Some(ended)) => {
                let _ = self.notices.send(Notice::AutoEnded {
                    session_id: ended.id,
                    reason: decision.reason,
                });
                false
            }
            Ok(None) => self.core.lock().await.phase.is_active(),
            Err(error) => {
                tracing::warn!(session_id = %session.id, %error, "Automatic end failed");
                true
            }
        }
    }

    async fn sync_now(&self) -> ReconcileOutcome {
        self.sync_tx.send_modify(|sync| sync.syncing = true);
        let outcome = self.reconciler.reconcile(&self.guard_id).await;

        {
            // Follow a remap of the in-memory session to its server id
            let mut core = self.core.lock().await;
            if let Some(session) = core.session.as_mut().filter(|s| s.id.is_local()) {
                match self.mirror.resolve_session_id(&session.id).await {
                    Ok(server_id) if server_id != session.id => {
                        session.id = server_id;
                        self.publish(&core);
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "Failed to resolve session id"),
                }
            }
        }

        let last_synced_at = self.mirror.last_synced_at(&self.guard_id).await;
        let online = self.connectivity.is_online();
        self.sync_tx.send_modify(|sync| {
            sync.online = online;
            sync.syncing = false;
            sync.pending_count = outcome.remaining;
            sync.last_sync_result = Some(outcome.status);
            sync.last_synced_at = last_synced_at;
        });
        outcome
    }

    async fn refresh_sync_snapshot(&self) {
        let pending_count = self.mirror.pending_count(&self.guard_id).await;
        let last_synced_at = self.mirror.last_synced_at(&self.guard_id).await;
        let online = self.connectivity.is_online();
        self.sync_tx.send_modify(|sync| {
            sync.online = online;
            sync.pending_count = pending_count;
            sync.last_synced_at = last_synced_at;
        });
    }

    /// One refresh timer tick
    async fn refresh(&self) {
        self.refresh_sync_snapshot().await;
        let pending = self.sync_tx.borrow().pending_count;
        if pending > 0 && self.connectivity.is_online() {
            self.sync_now().await;
        }
    }

    fn arm_watchdog(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.watchdog_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let period = self.config.watchdog_interval();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.watchdog_generation.load(Ordering::SeqCst) != generation
                    || inner.shut_down.load(Ordering::SeqCst)
                {
                    break;
                }
                if !inner.check_authorization().await {
                    break;
                }
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timers.watchdog.replace(handle) {
            previous.abort();
        }
    }

    fn disarm_watchdog(&self) {
        self.watchdog_generation.fetch_add(1, Ordering::SeqCst);
        // The watchdog itself may be the caller; its loop exits on the generation check
    }

    fn spawn_background(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let refresh = spawn_periodic(Arc::downgrade(self), self.config.sync_interval());
        let connectivity = spawn_connectivity_listener(
            Arc::downgrade(self),
            self.connectivity.transitions(),
        );

        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for previous in [
            timers.refresh.replace(refresh),
            timers.connectivity.replace(connectivity),
        ]
        .into_iter()
        .flatten()
        {
            previous.abort();
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.watchdog_generation.fetch_add(1, Ordering::SeqCst);
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        tracing::debug!(guard_id = %self.guard_id, "Lifecycle controller shut down");
    }
}

fn spawn_periodic<S, L>(weak: Weak<Inner<S, L>>, period: std::time::Duration) -> JoinHandle<()>
where
    S: SessionStore + 'static,
    L: LocationProvider + 'static,
{
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if inner.shut_down.load(Ordering::SeqCst) {
                break;
            }
            inner.refresh().await;
        }
    })
}

fn spawn_connectivity_listener<S, L>(
    weak: Weak<Inner<S, L>>,
    mut transitions: broadcast::Receiver<Connectivity>,
) -> JoinHandle<()>
where
    S: SessionStore + 'static,
    L: LocationProvider + 'static,
{
    tokio::spawn(async move {
        loop {
            let transition = match transitions.recv().await {
                Ok(transition) => transition,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else { break };
            if inner.shut_down.load(Ordering::SeqCst) {
                break;
            }
            inner
                .sync_tx
                .send_modify(|sync| sync.online = transition.is_online());
            if transition.is_online() {
                let outcome = inner.sync_now().await;
                tracing::debug!(?outcome, "Reconciled after reconnect");
            }
        }
    })
}
