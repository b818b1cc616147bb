use patrol_core::{Delivery, EventKind, SessionStore};

use crate::commands::common::{
    checkpoint_payload, ensure_loggable, parse_event_payload, CliController,
};
use crate::error::CliError;

pub async fn run_checkpoint<S: SessionStore + 'static>(
    controller: &CliController<S>,
    checkpoint_id: &str,
    note: Option<String>,
) -> Result<Delivery, CliError> {
    let payload = checkpoint_payload(checkpoint_id, note)?;
    record(controller, EventKind::CheckpointVisit, payload).await
}

pub async fn run_log<S: SessionStore + 'static>(
    controller: &CliController<S>,
    kind: EventKind,
    payload: Option<&str>,
) -> Result<Delivery, CliError> {
    let kind = ensure_loggable(kind)?;
    let payload = parse_event_payload(payload)?;
    record(controller, kind, payload).await
}

async fn record<S: SessionStore + 'static>(
    controller: &CliController<S>,
    kind: EventKind,
    payload: serde_json::Value,
) -> Result<Delivery, CliError> {
    controller.restore().await?;
    let delivery = controller.record_event(kind, payload).await?;
    match delivery {
        Delivery::Sent => println!("Recorded {kind}"),
        Delivery::Queued => println!("Recorded {kind} (queued for sync)"),
    }
    Ok(delivery)
}
