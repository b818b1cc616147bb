//! Observable state exposed to presentation adapters.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{SessionId, SessionStatus};
use crate::sync::ReconcileStatus;

/// Where the guard's patrol session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum SessionPhase {
    #[default]
    NoSession,
    Starting,
    /// `persisted` is false only between creation and the first mirror write
    Active { persisted: bool },
    Ending,
    Ended { status: SessionStatus },
}

impl SessionPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSession => "not started",
            Self::Starting => "starting",
            Self::Active { .. } => "active",
            Self::Ending => "ending",
            Self::Ended { .. } => "ended",
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// A new session may be started from here
    pub const fn accepts_start(self) -> bool {
        matches!(self, Self::NoSession | Self::Ended { .. })
    }
}

/// Session state as seen by the UI
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub phase: SessionPhase,
    pub guard_id: String,
    pub session_id: Option<SessionId>,
    pub site_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub auto_ended: bool,
}

/// Sync state as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct SyncSnapshot {
    pub online: bool,
    pub syncing: bool,
    pub pending_count: usize,
    pub last_sync_result: Option<ReconcileStatus>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    /// Collapse the snapshot into a single indicator
    pub const fn indicator(&self) -> SyncState {
        if !self.online {
            SyncState::Offline
        } else if self.syncing {
            SyncState::Syncing
        } else if matches!(self.last_sync_result, Some(ReconcileStatus::Partial)) {
            SyncState::Error
        } else if self.pending_count > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}

/// Single-glance sync indicator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Pending,
    Synced,
    Error,
}
