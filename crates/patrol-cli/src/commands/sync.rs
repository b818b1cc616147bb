use patrol_core::{ReconcileOutcome, ReconcileStatus, SessionStore};

use crate::commands::common::CliController;
use crate::error::CliError;

pub async fn run_sync<S: SessionStore + 'static>(
    controller: &CliController<S>,
) -> Result<ReconcileOutcome, CliError> {
    controller.restore().await?;
    let outcome = controller.force_sync().await;
    println!("{}", format_outcome(&outcome));
    Ok(outcome)
}

pub async fn run_clear_synced<S: SessionStore + 'static>(
    controller: &CliController<S>,
) -> Result<u64, CliError> {
    let purged = controller.clear_acknowledged_cache().await?;
    println!("Removed {purged} delivered event(s) from the local queue");
    Ok(purged)
}

pub fn format_outcome(outcome: &ReconcileOutcome) -> String {
    match outcome.status {
        ReconcileStatus::Completed => {
            format!("Sync completed: {} event(s) delivered", outcome.acknowledged)
        }
        ReconcileStatus::Partial => format!(
            "Sync incomplete: {} delivered, {} failed, {} still queued",
            outcome.acknowledged, outcome.failed, outcome.remaining
        ),
        ReconcileStatus::AlreadyRunning => "A sync is already running".to_string(),
        ReconcileStatus::Offline => {
            format!("Offline: {} event(s) queued", outcome.remaining)
        }
    }
}
