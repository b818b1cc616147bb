use patrol_core::{PatrolSession, SessionStore};

use crate::commands::common::CliController;
use crate::error::CliError;

pub async fn run_start<S: SessionStore + 'static>(
    controller: &CliController<S>,
    site_id: &str,
    team_id: Option<String>,
) -> Result<PatrolSession, CliError> {
    controller.restore().await?;
    let session = controller.start(site_id, team_id).await?;

    if session.id.is_local() {
        println!(
            "Patrol started offline at {}; it will be uploaded on the next sync",
            session.site_id
        );
    } else {
        println!("Patrol {} started at {}", session.id, session.site_id);
    }
    Ok(session)
}

/// End or cancel the active patrol; `None` when there was nothing to close
pub async fn run_end<S: SessionStore + 'static>(
    controller: &CliController<S>,
    cancel: bool,
) -> Result<Option<PatrolSession>, CliError> {
    controller.restore().await?;
    let closed = if cancel {
        controller.cancel().await?
    } else {
        controller.end(true).await?
    };

    let Some(session) = closed else {
        println!("No active patrol");
        return Ok(None);
    };

    let verb = if cancel { "cancelled" } else { "ended" };
    println!("Patrol {} {verb}", session.id);
    let pending = controller.refresh_sync_state().await.pending_count;
    if pending > 0 {
        println!("{pending} event(s) waiting to sync; run `patrol sync` when connected");
    }
    Ok(Some(session))
}
