use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] patrol_core::Error),
    #[error(transparent)]
    Store(#[from] patrol_core::StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Checkpoint ID cannot be empty")]
    EmptyCheckpointId,
    #[error("Event payload must be a JSON object")]
    PayloadNotObject,
    #[error("{0} is recorded by `patrol start`, `patrol end` or `patrol cancel`")]
    ReservedEventKind(patrol_core::EventKind),
    #[error(transparent)]
    Profile(#[from] crate::config_profiles::ProfileError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("No guard configured. Pass --guard, set PATROL_GUARD_ID, or run `patrol config init --guard-id <ID>`.")]
    GuardNotConfigured,
    #[error(
        "Session store is not configured. Run `patrol config init --store-url <URL> --anon-key <KEY>`, or set PATROL_STORE_URL and PATROL_ANON_KEY."
    )]
    StoreNotConfigured,
}
