use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use patrol_core::store::RestStoreConfig;
use patrol_core::util::normalize_text_option;
use patrol_core::{
    parse_patrol_config, Clock, ConnectivityMonitor, EventKind, FixedLocation, LocalMirror,
    Notice, PatrolConfig, RestSessionStore, SessionController, SessionSnapshot, SessionStore,
    SyncSnapshot, SyncState, SystemClock,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cli::GlobalArgs;
use crate::config_profiles::{GuardProfile, ProfileStore};
use crate::error::CliError;

pub type CliController<S> = SessionController<S, FixedLocation>;

/// Settings for one invocation, merged from flags, environment, and profile
#[derive(Debug, Clone)]
pub struct Context {
    pub db_path: PathBuf,
    pub guard_id: Option<String>,
    pub online: bool,
    pub location: FixedLocation,
    pub config: PatrolConfig,
    pub backend: Option<RestStoreConfig>,
}

impl Context {
    pub fn resolve(global: &GlobalArgs) -> Result<Self, CliError> {
        let flags = GuardProfile {
            guard_id: global.guard.clone(),
            ..GuardProfile::default()
        };
        let (profile_name, profile) = ProfileStore::load()?
            .resolve(global.profile.as_deref(), GuardProfile::from_env().overlay(flags))?;

        let config = load_patrol_config()?;
        let backend = profile
            .backend()
            .resolve(config.write_timeout())
            .map_err(CliError::Config)?;
        let location = match (global.lat, global.lng) {
            (Some(latitude), Some(longitude)) => FixedLocation::at(latitude, longitude),
            _ => FixedLocation::unavailable(),
        };

        tracing::debug!(profile = %profile_name, "Resolved CLI context");
        Ok(Self {
            db_path: resolve_db_path(global.db_path.clone()),
            guard_id: profile.guard_id,
            online: !global.offline,
            location,
            config,
            backend,
        })
    }

    pub fn guard_id(&self) -> Result<&str, CliError> {
        self.guard_id.as_deref().ok_or(CliError::GuardNotConfigured)
    }

    pub fn store(&self) -> Result<RestSessionStore, CliError> {
        let config = self.backend.clone().ok_or(CliError::StoreNotConfigured)?;
        Ok(RestSessionStore::new(config)?)
    }

    /// Controller over the on-disk mirror for this context's guard
    pub async fn controller<S>(
        &self,
        store: S,
        clock: Arc<dyn Clock>,
    ) -> Result<CliController<S>, CliError>
    where
        S: SessionStore + 'static,
    {
        let guard_id = self.guard_id()?.to_string();
        let mirror = LocalMirror::open_path(self.db_path.clone()).await?;
        Ok(SessionController::new(
            guard_id,
            store,
            self.location,
            mirror,
            ConnectivityMonitor::new(self.online),
            clock,
            self.config.clone(),
        ))
    }

    pub async fn system_controller(&self) -> Result<CliController<RestSessionStore>, CliError> {
        let store = self.store()?;
        self.controller(store, Arc::new(SystemClock)).await
    }
}

/// Engine timings from the JSON file named by `PATROL_CONFIG`, else defaults
pub fn load_patrol_config() -> Result<PatrolConfig, CliError> {
    let Some(path) = env::var_os("PATROL_CONFIG").map(PathBuf::from) else {
        return Ok(PatrolConfig::default());
    };
    let raw = std::fs::read_to_string(&path)?;
    parse_patrol_config(&raw)
        .map_err(|error| CliError::Config(format!("{}: {error}", path.display())))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("PATROL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patrol")
        .join("mirror.db")
}

/// Event payload from `--payload`; absent means an empty object
pub fn parse_event_payload(raw: Option<&str>) -> Result<Value, CliError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Value::Object(Map::new()));
    };
    match serde_json::from_str::<Value>(raw)? {
        value @ Value::Object(_) => Ok(value),
        _ => Err(CliError::PayloadNotObject),
    }
}

pub fn checkpoint_payload(checkpoint_id: &str, note: Option<String>) -> Result<Value, CliError> {
    let checkpoint_id = checkpoint_id.trim();
    if checkpoint_id.is_empty() {
        return Err(CliError::EmptyCheckpointId);
    }
    let mut payload = Map::new();
    payload.insert("checkpoint_id".into(), Value::from(checkpoint_id));
    if let Some(note) = normalize_text_option(note) {
        payload.insert("note".into(), Value::from(note));
    }
    Ok(Value::Object(payload))
}

/// Start and end are driven by their own commands
pub fn ensure_loggable(kind: EventKind) -> Result<EventKind, CliError> {
    if matches!(kind, EventKind::PatrolStart) || kind.is_terminal() {
        Err(CliError::ReservedEventKind(kind))
    } else {
        Ok(kind)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub session: SessionSnapshot,
    pub sync: SyncSnapshot,
    pub indicator: SyncState,
}

impl StatusReport {
    pub fn new(session: SessionSnapshot, sync: SyncSnapshot) -> Self {
        let indicator = sync.indicator();
        Self {
            session,
            sync,
            indicator,
        }
    }
}

pub fn format_status_lines(report: &StatusReport, now: DateTime<Utc>) -> Vec<String> {
    let session = &report.session;
    let mut lines = vec![format!("Guard:    {}", session.guard_id)];

    let mut patrol = format!("Patrol:   {}", session.phase.as_str());
    if let Some(site) = &session.site_id {
        patrol.push_str(&format!(" at {site}"));
    }
    if session.auto_ended {
        patrol.push_str(" (shift ended)");
    }
    lines.push(patrol);

    if let Some(id) = &session.session_id {
        lines.push(format!("Session:  {id}"));
    }
    if let Some(start) = session.start_time {
        lines.push(format!(
            "Started:  {} ({})",
            format_timestamp(start),
            format_elapsed(start, now)
        ));
    }

    let sync = &report.sync;
    lines.push(format!(
        "Sync:     {} ({} pending)",
        sync_state_label(report.indicator),
        sync.pending_count
    ));
    lines.push(format!(
        "Synced:   {}",
        sync.last_synced_at
            .map_or_else(|| "never".to_string(), format_timestamp)
    ));
    lines
}

pub const fn sync_state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Offline => "offline",
        SyncState::Syncing => "syncing",
        SyncState::Pending => "pending",
        SyncState::Synced => "synced",
        SyncState::Error => "needs attention",
    }
}

pub fn format_notice(notice: &Notice) -> String {
    match notice {
        Notice::AutoEnded { session_id, reason } => {
            format!("Patrol {session_id} ended automatically: {reason}")
        }
        Notice::Restored { session_id } => format!("Resumed patrol {session_id}"),
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - since).num_minutes().max(0);
    if minutes < 1 {
        "just started".to_string()
    } else if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {:02}m", minutes / 60, minutes % 60)
    }
}
