use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::clock::ManualClock;
use crate::location::FixedLocation;
use crate::models::{EventSyncState, ShiftWindow};
use crate::state::SyncState;
use crate::store::{InMemorySessionStore, StoreOperation};
use crate::sync::ReconcileStatus;

const GUARD: &str = "guard-7";

type TestController = SessionController<Arc<InMemorySessionStore>, FixedLocation>;

struct Rig {
    store: Arc<InMemorySessionStore>,
    mirror: LocalMirror,
    connectivity: ConnectivityMonitor,
    clock: Arc<ManualClock>,
    config: PatrolConfig,
    controller: TestController,
}

impl Rig {
    /// Another controller over the same device state, as after an app restart
    fn relaunch(&self) -> TestController {
        SessionController::new(
            GUARD,
            Arc::clone(&self.store),
            FixedLocation::at(51.5, -0.12),
            self.mirror.clone(),
            self.connectivity.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    fn go_offline(&self) {
        self.store.set_offline(true);
        self.connectivity.set_online(false);
    }

    fn go_online(&self) {
        self.store.set_offline(false);
        self.connectivity.set_online(true);
    }

    /// Move the clock forward so captured events get distinct natural keys
    fn tick(&self) {
        self.clock.advance(Duration::minutes(1));
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
}

async fn rig_with(config: PatrolConfig) -> Rig {
    let store = Arc::new(InMemorySessionStore::new());
    store.add_shift(ShiftWindow {
        guard_id: GUARD.to_string(),
        start_date: at(10, 0),
        end_date: at(18, 0),
        site_id: "site-harbour".to_string(),
        team_id: "team-night".to_string(),
    });
    let mirror = LocalMirror::open_in_memory().await.unwrap();
    let connectivity = ConnectivityMonitor::new(true);
    let clock = Arc::new(ManualClock::new(at(10, 30)));
    let controller = SessionController::new(
        GUARD,
        Arc::clone(&store),
        FixedLocation::at(51.5, -0.12),
        mirror.clone(),
        connectivity.clone(),
        clock.clone(),
        config.clone(),
    );
    Rig {
        store,
        mirror,
        connectivity,
        clock,
        config,
        controller,
    }
}

async fn rig() -> Rig {
    rig_with(PatrolConfig::default()).await
}

fn kinds(store: &InMemorySessionStore) -> Vec<EventKind> {
    store.events().iter().map(|event| event.key.kind).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn online_start_creates_session_on_store() {
    let rig = rig().await;

    let session = rig
        .controller
        .start("site-harbour", Some("team-night".into()))
        .await
        .unwrap();

    assert!(!session.id.is_local());
    assert_eq!(session.authorized_until, Some(at(18, 0)));
    assert_eq!(session.last_known_latitude, Some(51.5));
    assert_eq!(rig.store.sessions().len(), 1);
    assert_eq!(kinds(&rig.store), vec![EventKind::PatrolStart]);

    let snapshot = rig.controller.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Active { persisted: true });
    assert_eq!(snapshot.session_id, Some(session.id.clone()));
    assert_eq!(rig.mirror.load_session(GUARD).await.unwrap().id, session.id);
    assert_eq!(rig.mirror.pending_count(GUARD).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn start_before_grace_period_is_refused_and_state_restored() {
    let rig = rig().await;
    rig.clock.set(at(9, 5));

    let error = rig.controller.start("site-harbour", None).await.unwrap_err();

    assert!(matches!(
        error,
        Error::Ineligible(EligibilityReason::NotActiveYet { .. })
    ));
    assert_eq!(rig.controller.snapshot().phase, SessionPhase::NoSession);
    assert!(rig.store.sessions().is_empty());
    assert!(rig.mirror.load_session(GUARD).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_inside_grace_period_is_allowed() {
    let rig = rig().await;
    rig.clock.set(at(9, 40));

    let session = rig.controller.start("site-harbour", None).await.unwrap();
    assert_eq!(session.start_time, at(9, 40));
}

#[tokio::test(flavor = "multi_thread")]
async fn unverifiable_shift_blocks_start() {
    let rig = rig().await;
    rig.store.fail_next(
        StoreOperation::QueryShifts,
        1,
        StoreError::Unavailable("dns failure".into()),
    );

    let error = rig.controller.start("site-harbour", None).await.unwrap_err();
    assert!(matches!(
        error,
        Error::Ineligible(EligibilityReason::VerificationFailed)
    ));
    assert_eq!(rig.store.call_count(StoreOperation::CreateSession), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn at_most_one_active_session_per_guard() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();

    let error = rig.controller.start("site-harbour", None).await.unwrap_err();
    assert!(matches!(error, Error::SessionAlreadyActive(_)));

    // A second controller on the same device sees the mirrored session
    let other = rig.relaunch();
    let error = other.start("site-harbour", None).await.unwrap_err();
    assert!(matches!(error, Error::SessionAlreadyActive(_)));

    assert_eq!(rig.store.sessions().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_create_surfaces_and_leaves_no_session() {
    let rig = rig().await;
    rig.store.fail_next(
        StoreOperation::CreateSession,
        1,
        StoreError::Rejected("site is closed".into()),
    );

    let error = rig.controller.start("site-harbour", None).await.unwrap_err();
    assert!(!error.is_transient());
    assert_eq!(rig.controller.snapshot().phase, SessionPhase::NoSession);
    assert!(rig.mirror.load_session(GUARD).await.is_none());
    assert!(rig.mirror.list_events(GUARD).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_create_failure_starts_offline_under_local_id() {
    let rig = rig().await;
    rig.store.fail_next(
        StoreOperation::CreateSession,
        1,
        StoreError::Unavailable("502 bad gateway".into()),
    );

    let session = rig.controller.start("site-harbour", None).await.unwrap();

    assert!(session.id.is_local());
    let queued = rig.mirror.list_pending(GUARD).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, EventKind::PatrolStart);
    assert_eq!(rig.controller.sync_state().borrow().pending_count, 1);

    // Reconciliation swaps in the server id and direct writes resume
    let outcome = rig.controller.force_sync().await;
    assert!(outcome.ok());
    let server_id = rig.controller.snapshot().session_id.unwrap();
    assert!(!server_id.is_local());
    assert_eq!(rig.store.sessions()[0].id, server_id);

    rig.tick();
    let delivery = rig
        .controller
        .record_event(EventKind::CheckpointVisit, json!({"checkpoint_id": "gate-2"}))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Sent);
    assert!(rig
        .store
        .events()
        .iter()
        .all(|event| event.key.session_id == server_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_patrol_round_trip() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    rig.go_offline();

    for checkpoint in ["gate-1", "gate-2"] {
        rig.tick();
        let delivery = rig
            .controller
            .record_event(EventKind::CheckpointVisit, json!({ "checkpoint_id": checkpoint }))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Queued);
    }

    rig.tick();
    let ended = rig.controller.end(true).await.unwrap().unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
    assert!(!ended.auto_ended);
    assert_eq!(
        rig.controller.snapshot().phase,
        SessionPhase::Ended {
            status: SessionStatus::Completed
        }
    );

    let queued: Vec<EventKind> = rig
        .mirror
        .list_pending(GUARD)
        .await
        .iter()
        .map(|event| event.kind)
        .collect();
    assert_eq!(
        queued,
        vec![
            EventKind::CheckpointVisit,
            EventKind::CheckpointVisit,
            EventKind::PatrolEnd
        ]
    );
    // Ended but unsynced sessions stay mirrored
    assert!(!rig.mirror.load_session(GUARD).await.unwrap().is_active());

    rig.go_online();
    let outcome = rig.controller.force_sync().await;

    assert_eq!(outcome.status, ReconcileStatus::Completed);
    assert_eq!(outcome.acknowledged, 3);
    assert_eq!(
        kinds(&rig.store),
        vec![
            EventKind::PatrolStart,
            EventKind::CheckpointVisit,
            EventKind::CheckpointVisit,
            EventKind::PatrolEnd
        ]
    );
    let stored = rig.store.session(&session.id).unwrap();
    assert_eq!(stored.status, SessionStatus::Completed);
    assert!(!stored.auto_ended);
    assert!(rig.mirror.load_session(GUARD).await.is_none());
    assert_eq!(rig.mirror.pending_count(GUARD).await, 0);

    let sync = rig.controller.sync_state().borrow().clone();
    assert_eq!(sync.pending_count, 0);
    assert_eq!(sync.last_sync_result, Some(ReconcileStatus::Completed));
    assert!(sync.last_synced_at.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn end_is_idempotent() {
    let rig = rig().await;
    assert_eq!(rig.controller.end(true).await.unwrap(), None);

    rig.controller.start("site-harbour", None).await.unwrap();
    rig.tick();
    assert!(rig.controller.end(true).await.unwrap().is_some());
    assert_eq!(rig.controller.end(true).await.unwrap(), None);
    assert_eq!(rig.controller.cancel().await.unwrap(), None);

    assert_eq!(
        kinds(&rig.store),
        vec![EventKind::PatrolStart, EventKind::PatrolEnd]
    );
    assert_eq!(rig.store.call_count(StoreOperation::UpdateSession), 1);
    // Online end leaves nothing mirrored
    assert!(rig.mirror.load_session(GUARD).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_end_returns_to_active() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.store.fail_next(
        StoreOperation::UpdateSession,
        1,
        StoreError::Rejected("row level security".into()),
    );

    assert!(rig.controller.end(true).await.is_err());
    assert_eq!(
        rig.controller.snapshot().phase,
        SessionPhase::Active { persisted: true }
    );
    assert!(rig.controller.end(true).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_marks_session_cancelled() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    rig.tick();

    rig.controller.cancel().await.unwrap();

    assert_eq!(
        rig.store.session(&session.id).unwrap().status,
        SessionStatus::Cancelled
    );
    // A fresh session may follow a cancelled one
    rig.tick();
    assert!(rig.controller.start("site-harbour", None).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_resumes_session_without_rechecking_shift() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    rig.controller.shutdown();

    // Out of shift by now, yet restore must not consult the schedule
    rig.clock.set(at(19, 0));
    let queries = rig.store.call_count(StoreOperation::QueryShifts);
    let relaunched = rig.relaunch();
    let mut notices = relaunched.notices();

    let snapshot = relaunched.restore().await.unwrap();

    assert_eq!(snapshot.phase, SessionPhase::Active { persisted: true });
    assert_eq!(snapshot.session_id, Some(session.id.clone()));
    assert_eq!(rig.store.call_count(StoreOperation::QueryShifts), queries);
    assert_eq!(
        notices.try_recv().unwrap(),
        Notice::Restored {
            session_id: session.id
        }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_recovers_session_from_queue_when_record_is_lost() {
    let rig = rig().await;
    rig.store.fail_next(
        StoreOperation::CreateSession,
        1,
        StoreError::Unavailable("connection reset".into()),
    );
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    rig.controller.shutdown();
    rig.mirror.clear_session(GUARD).await.unwrap();

    let relaunched = rig.relaunch();
    let snapshot = relaunched.restore().await.unwrap();

    assert_eq!(snapshot.phase, SessionPhase::Active { persisted: true });
    assert_eq!(snapshot.session_id, Some(session.id.clone()));
    assert_eq!(rig.mirror.load_session(GUARD).await.unwrap().id, session.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_auto_ends_elapsed_shift() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    let mut notices = rig.controller.notices();

    rig.clock.set(at(17, 59));
    assert!(rig.controller.check_authorization().await);

    rig.clock.set(at(18, 1));
    assert!(!rig.controller.check_authorization().await);

    let snapshot = rig.controller.snapshot();
    assert_eq!(
        snapshot.phase,
        SessionPhase::Ended {
            status: SessionStatus::Completed
        }
    );
    assert!(snapshot.auto_ended);
    let stored = rig.store.session(&session.id).unwrap();
    assert!(stored.auto_ended);
    assert_eq!(stored.end_time, Some(at(18, 1)));
    assert_eq!(
        kinds(&rig.store),
        vec![EventKind::PatrolStart, EventKind::PatrolAutoEnd]
    );
    assert!(matches!(
        notices.try_recv().unwrap(),
        Notice::AutoEnded { session_id, .. } if session_id == session.id
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_holds_to_authorized_window_when_unverifiable() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.store.fail_next(
        StoreOperation::QueryShifts,
        2,
        StoreError::Unavailable("timeout".into()),
    );

    rig.clock.set(at(17, 0));
    assert!(rig.controller.check_authorization().await);

    rig.clock.set(at(18, 30));
    assert!(!rig.controller.check_authorization().await);
    assert!(rig.controller.snapshot().auto_ended);
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_timer_ends_session_in_background() {
    let config = PatrolConfig {
        watchdog_interval_secs: 1,
        ..PatrolConfig::default()
    };
    let rig = rig_with(config).await;
    let mut notices = rig.controller.notices();
    rig.controller.start("site-harbour", None).await.unwrap();

    rig.clock.set(at(18, 5));
    let notice = tokio::time::timeout(StdDuration::from_secs(5), notices.recv())
        .await
        .expect("watchdog did not fire")
        .unwrap();

    assert!(matches!(notice, Notice::AutoEnded { .. }));
    assert!(rig.controller.snapshot().auto_ended);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_the_watchdog() {
    let config = PatrolConfig {
        watchdog_interval_secs: 1,
        ..PatrolConfig::default()
    };
    let rig = rig_with(config).await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.controller.shutdown();

    rig.clock.set(at(18, 5));
    tokio::time::sleep(StdDuration::from_millis(1500)).await;

    assert_eq!(
        rig.controller.snapshot().phase,
        SessionPhase::Active { persisted: true }
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_triggers_reconciliation() {
    let rig = rig().await;
    rig.controller.initialize().await.unwrap();
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.go_offline();
    rig.tick();
    rig.controller
        .record_event(EventKind::Observation, json!({"text": "side door ajar"}))
        .await
        .unwrap();
    let mut sync = rig.controller.sync_state();

    rig.go_online();
    let drained = tokio::time::timeout(
        StdDuration::from_secs(5),
        sync.wait_for(|state| state.online && state.pending_count == 0 && !state.syncing),
    )
    .await
    .map(|state| state.is_ok());

    assert!(matches!(drained, Ok(true)));
    assert_eq!(
        kinds(&rig.store),
        vec![EventKind::PatrolStart, EventKind::Observation]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_writes_never_overtake_queued_events() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.go_offline();
    rig.tick();
    rig.controller
        .record_event(EventKind::CheckpointVisit, json!({"checkpoint_id": "a"}))
        .await
        .unwrap();

    // Back online, but the queue has not drained yet
    rig.store.set_offline(false);
    rig.connectivity.set_online(true);
    rig.tick();
    let delivery = rig
        .controller
        .record_event(EventKind::CheckpointVisit, json!({"checkpoint_id": "b"}))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Queued);

    rig.controller.force_sync().await;
    let checkpoints: Vec<String> = rig
        .store
        .events()
        .iter()
        .filter(|event| event.key.kind == EventKind::CheckpointVisit)
        .map(|event| event.payload["checkpoint_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(checkpoints, vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_event_is_kept_and_reported() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.store.fail_next(
        StoreOperation::UpsertEvent,
        1,
        StoreError::Rejected("payload too large".into()),
    );
    rig.tick();

    let error = rig
        .controller
        .record_event(EventKind::IncidentReport, json!({"summary": "broken fence"}))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Store(StoreError::Rejected(_))));
    let queued = rig.mirror.list_events(GUARD).await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].sync_state, EventSyncState::Failed);
    assert_eq!(queued[0].attempts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn record_event_requires_active_session() {
    let rig = rig().await;
    let error = rig
        .controller
        .record_event(EventKind::CheckpointVisit, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidTransition { .. }));

    rig.controller.start("site-harbour", None).await.unwrap();
    let error = rig
        .controller
        .record_event(EventKind::PatrolEnd, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidInput(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn location_samples_update_last_known_position() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.tick();

    rig.controller
        .record_event(
            EventKind::LocationSample,
            json!({"latitude": 51.51, "longitude": -0.09, "accuracy_m": 12.0}),
        )
        .await
        .unwrap();

    let session = rig.controller.current_session().await.unwrap();
    assert_eq!(session.last_known_latitude, Some(51.51));
    assert_eq!(session.last_known_longitude, Some(-0.09));
    let mirrored = rig.mirror.load_session(GUARD).await.unwrap();
    assert_eq!(mirrored.last_known_longitude, Some(-0.09));
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_acknowledged_cache_only_drops_delivered_events() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    let delivered = QueuedEvent::capture(&session, EventKind::Observation, json!({}), at(11, 0));
    let waiting = QueuedEvent::capture(&session, EventKind::Observation, json!({}), at(11, 1));
    rig.mirror.enqueue_event(&delivered).await.unwrap();
    rig.mirror.enqueue_event(&waiting).await.unwrap();
    rig.mirror.mark_inflight(&delivered.id).await.unwrap();
    rig.mirror.mark_acknowledged(&delivered.id).await.unwrap();

    assert_eq!(rig.controller.clear_acknowledged_cache().await.unwrap(), 1);
    let left = rig.mirror.list_events(GUARD).await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, waiting.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn relaunched_controller_reports_queue_depth() {
    let rig = rig().await;
    rig.controller.start("site-harbour", None).await.unwrap();
    rig.go_offline();
    rig.tick();
    rig.controller
        .record_event(EventKind::Observation, json!({ "note": "door ajar" }))
        .await
        .unwrap();
    rig.controller.shutdown();

    let relaunched = rig.relaunch();
    assert_eq!(relaunched.sync_state().borrow().pending_count, 0);
    let sync = relaunched.refresh_sync_state().await;
    assert!(!sync.online);
    assert_eq!(sync.pending_count, 1);
    assert_eq!(sync.indicator(), SyncState::Offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_offline_end_keeps_session_active_across_restart() {
    let rig = rig().await;
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    rig.go_offline();
    rig.tick();
    rig.mirror
        .execute_raw(
            "CREATE TRIGGER refuse_end BEFORE INSERT ON event_queue
             WHEN NEW.kind = 'patrol-end'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .await
        .unwrap();

    assert!(rig.controller.end(true).await.is_err());
    assert_eq!(
        rig.controller.snapshot().phase,
        SessionPhase::Active { persisted: true }
    );
    let mirrored = rig.mirror.load_session(GUARD).await.unwrap();
    assert_eq!(mirrored.status, SessionStatus::Active);
    assert!(rig.mirror.list_events(GUARD).await.is_empty());

    rig.mirror.execute_raw("DROP TRIGGER refuse_end").await.unwrap();
    let relaunched = rig.relaunch();
    assert_eq!(
        relaunched.restore().await.unwrap().phase,
        SessionPhase::Active { persisted: true }
    );
    assert!(relaunched.end(true).await.unwrap().is_some());

    rig.go_online();
    assert!(relaunched.force_sync().await.ok());
    assert_eq!(
        rig.store.session(&session.id).unwrap().status,
        SessionStatus::Completed
    );
    assert!(rig.mirror.load_session(GUARD).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_that_cannot_be_mirrored_is_cancelled_on_store() {
    let rig = rig().await;
    rig.mirror
        .execute_raw(
            "CREATE TRIGGER refuse_session BEFORE INSERT ON mirrored_sessions
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .await
        .unwrap();

    assert!(rig.controller.start("site-harbour", None).await.is_err());
    assert_eq!(rig.controller.snapshot().phase, SessionPhase::NoSession);
    let sessions = rig.store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Cancelled);

    rig.mirror.execute_raw("DROP TRIGGER refuse_session").await.unwrap();
    rig.tick();
    let session = rig.controller.start("site-harbour", None).await.unwrap();

    let active: Vec<_> = rig
        .store
        .sessions()
        .into_iter()
        .filter(|stored| stored.status == SessionStatus::Active)
        .map(|stored| stored.id)
        .collect();
    assert_eq!(active, vec![session.id]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_authorization_end_leaves_newer_session_alone() {
    let rig = rig().await;
    let first = rig.controller.start("site-harbour", None).await.unwrap();
    rig.tick();
    rig.controller.end(true).await.unwrap();
    rig.tick();
    let second = rig.controller.start("site-harbour", None).await.unwrap();

    let ended = rig
        .controller
        .inner
        .finish(SessionStatus::Completed, true, Some(&first.id))
        .await
        .unwrap();

    assert_eq!(ended, None);
    let snapshot = rig.controller.snapshot();
    assert_eq!(snapshot.phase, SessionPhase::Active { persisted: true });
    assert_eq!(snapshot.session_id, Some(second.id.clone()));
    assert_eq!(
        rig.store.session(&second.id).unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn authorization_end_follows_remapped_session_id() {
    let rig = rig().await;
    rig.store.fail_next(
        StoreOperation::CreateSession,
        1,
        StoreError::Unavailable("502 bad gateway".into()),
    );
    let session = rig.controller.start("site-harbour", None).await.unwrap();
    assert!(session.id.is_local());
    assert!(rig.controller.force_sync().await.ok());
    rig.tick();

    let ended = rig
        .controller
        .inner
        .finish(SessionStatus::Completed, true, Some(&session.id))
        .await
        .unwrap()
        .unwrap();

    assert!(!ended.id.is_local());
    assert!(ended.auto_ended);
    assert_eq!(
        rig.store.session(&ended.id).unwrap().status,
        SessionStatus::Completed
    );
}
