use std::future::Future;

use patrol_core::{SessionPhase, SessionSnapshot, SessionStore, SyncState};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{format_notice, sync_state_label, CliController};
use crate::error::CliError;

/// Supervise the active patrol until it ends or `stop` resolves.
///
/// Runs the controller's watchdog and sync timers, printing notices and sync
/// indicator changes. Returns the last session state seen.
pub async fn run_watch<S, F>(
    controller: &CliController<S>,
    stop: F,
) -> Result<SessionSnapshot, CliError>
where
    S: SessionStore + 'static,
    F: Future<Output = ()>,
{
    let mut notices = controller.notices();
    let mut session = controller.session_state();
    let mut sync = controller.sync_state();

    let snapshot = controller.initialize().await?;
    if !snapshot.phase.is_active() {
        println!("No active patrol to watch");
        controller.shutdown();
        return Ok(snapshot);
    }
    if let Some(id) = &snapshot.session_id {
        println!("Watching patrol {id}; press Ctrl-C to stop watching");
    }

    let mut indicator: Option<SyncState> = None;
    tokio::pin!(stop);
    let last = loop {
        tokio::select! {
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", format_notice(&notice)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} notices", skipped);
                }
                Err(RecvError::Closed) => break session.borrow().clone(),
            },
            changed = session.changed() => {
                let current = session.borrow_and_update().clone();
                let closed = matches!(
                    current.phase,
                    SessionPhase::NoSession | SessionPhase::Ended { .. }
                );
                if changed.is_err() || closed {
                    break current;
                }
            }
            changed = sync.changed() => {
                if changed.is_ok() {
                    let current = sync.borrow_and_update().clone();
                    let next = current.indicator();
                    if indicator != Some(next) {
                        indicator = Some(next);
                        println!(
                            "Sync: {} ({} pending)",
                            sync_state_label(next),
                            current.pending_count
                        );
                    }
                }
            }
            () = &mut stop => {
                println!("Stopped watching; the patrol is still active");
                break session.borrow().clone();
            }
        }
    };

    // Let the auto-end notice print before returning
    while let Ok(notice) = notices.try_recv() {
        println!("{}", format_notice(&notice));
    }
    controller.shutdown();
    Ok(last)
}
