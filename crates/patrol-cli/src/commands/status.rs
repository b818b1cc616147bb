use chrono::Utc;
use patrol_core::SessionStore;

use crate::commands::common::{format_status_lines, CliController, StatusReport};
use crate::error::CliError;

pub async fn run_status<S: SessionStore + 'static>(
    controller: &CliController<S>,
    as_json: bool,
) -> Result<StatusReport, CliError> {
    let session = controller.restore().await?;
    let sync = controller.refresh_sync_state().await;
    let report = StatusReport::new(session, sync);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report, Utc::now()) {
            println!("{line}");
        }
    }
    Ok(report)
}
