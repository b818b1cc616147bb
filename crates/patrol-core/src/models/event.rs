//! Queued activity/location event model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::session::{PatrolSession, SessionId};

/// A unique identifier for a captured event, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Activity subtype tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    PatrolStart,
    PatrolEnd,
    PatrolAutoEnd,
    CheckpointVisit,
    LocationSample,
    IncidentReport,
    Observation,
}

impl EventKind {
    pub const ALL: [Self; 7] = [
        Self::PatrolStart,
        Self::PatrolEnd,
        Self::PatrolAutoEnd,
        Self::CheckpointVisit,
        Self::LocationSample,
        Self::IncidentReport,
        Self::Observation,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PatrolStart => "patrol-start",
            Self::PatrolEnd => "patrol-end",
            Self::PatrolAutoEnd => "patrol-auto-end",
            Self::CheckpointVisit => "checkpoint-visit",
            Self::LocationSample => "location-sample",
            Self::IncidentReport => "incident-report",
            Self::Observation => "observation",
        }
    }

    /// Events that close a session
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::PatrolEnd | Self::PatrolAutoEnd)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| format!("unknown event kind '{needle}'"))
    }
}

/// Delivery state of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventSyncState {
    #[default]
    Pending,
    Inflight,
    Acknowledged,
    Failed,
}

impl EventSyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Inflight => "inflight",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "inflight" => Some(Self::Inflight),
            "acknowledged" => Some(Self::Acknowledged),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Natural key for idempotent upserts: session, kind, and millisecond bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub session_id: SessionId,
    pub kind: EventKind,
    pub captured_at_ms: i64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.session_id, self.kind, self.captured_at_ms)
    }
}

/// An activity or location sample captured on the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: EventId,
    pub session_id: SessionId,
    pub guard_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
    pub sync_state: EventSyncState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedEvent {
    /// Capture a new pending event for a session
    pub fn capture(
        session: &PatrolSession,
        kind: EventKind,
        payload: serde_json::Value,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            session_id: session.id.clone(),
            guard_id: session.guard_id.clone(),
            kind,
            payload,
            captured_at,
            sync_state: EventSyncState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            session_id: self.session_id.clone(),
            kind: self.kind,
            captured_at_ms: self.captured_at.timestamp_millis(),
        }
    }

    /// Upload shape addressed to the given (possibly remapped) session id
    pub fn to_upload(&self, session_id: &SessionId) -> EventUpload {
        EventUpload {
            key: EventKey {
                session_id: session_id.clone(),
                kind: self.kind,
                captured_at_ms: self.captured_at.timestamp_millis(),
            },
            guard_id: self.guard_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Payload sent to the remote store for an idempotent upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUpload {
    pub key: EventKey,
    pub guard_id: String,
    pub payload: serde_json::Value,
}

/// Event as acknowledged by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub key: EventKey,
    pub guard_id: String,
    pub payload: serde_json::Value,
}
