//! Patrol session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const LOCAL_ID_PREFIX: &str = "local-";

/// Opaque session identifier.
///
/// Server-assigned once the session reached the remote store. Sessions started
/// without connectivity carry a temporary `local-<uuid>` id until reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a temporary local id (UUID v7, time-sortable)
    #[must_use]
    pub fn new_local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Wrap an id handed out by the remote store
    pub fn from_server(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether this id still awaits a server-assigned replacement
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted status of a patrol session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A patrol session owned by a single guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolSession {
    pub id: SessionId,
    pub guard_id: String,
    pub site_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub last_known_latitude: Option<f64>,
    #[serde(default)]
    pub last_known_longitude: Option<f64>,
    #[serde(default)]
    pub auto_ended: bool,
    /// End of the shift window that authorized this session
    #[serde(default)]
    pub authorized_until: Option<DateTime<Utc>>,
}

impl PatrolSession {
    /// Build a new active session under a temporary local id
    pub fn begin(
        guard_id: impl Into<String>,
        site_id: impl Into<String>,
        team_id: Option<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new_local(),
            guard_id: guard_id.into(),
            site_id: site_id.into(),
            team_id,
            start_time,
            end_time: None,
            status: SessionStatus::Active,
            last_known_latitude: None,
            last_known_longitude: None,
            auto_ended: false,
            authorized_until: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn set_position(&mut self, latitude: f64, longitude: f64) {
        self.last_known_latitude = Some(latitude);
        self.last_known_longitude = Some(longitude);
    }

    /// Move to a terminal status. Has no effect on an already-terminal session.
    pub fn finish(&mut self, status: SessionStatus, end_time: DateTime<Utc>, auto_ended: bool) {
        if !self.is_active() || status == SessionStatus::Active {
            return;
        }
        self.status = status;
        self.end_time = Some(end_time);
        self.auto_ended = auto_ended;
    }

    /// Create payload for the remote store
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            client_ref: self.id.clone(),
            guard_id: self.guard_id.clone(),
            site_id: self.site_id.clone(),
            team_id: self.team_id.clone(),
            start_time: self.start_time,
            status: self.status,
            last_known_latitude: self.last_known_latitude,
            last_known_longitude: self.last_known_longitude,
        }
    }

    /// Update payload describing the session's current mutable fields
    pub fn to_patch(&self) -> SessionPatch {
        SessionPatch {
            status: self.status,
            end_time: self.end_time,
            auto_ended: self.auto_ended,
            last_known_latitude: self.last_known_latitude,
            last_known_longitude: self.last_known_longitude,
        }
    }
}

/// Create payload for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Id the session was created under on the device; lets a store dedupe replays
    pub client_ref: SessionId,
    pub guard_id: String,
    pub site_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default)]
    pub last_known_latitude: Option<f64>,
    #[serde(default)]
    pub last_known_longitude: Option<f64>,
}

/// Update payload for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub status: SessionStatus,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_ended: bool,
    #[serde(default)]
    pub last_known_latitude: Option<f64>,
    #[serde(default)]
    pub last_known_longitude: Option<f64>,
}

impl SessionPatch {
    /// Apply this patch onto a stored session
    pub fn apply_to(&self, session: &mut PatrolSession) {
        session.status = self.status;
        session.end_time = self.end_time;
        session.auto_ended = self.auto_ended;
        if self.last_known_latitude.is_some() {
            session.last_known_latitude = self.last_known_latitude;
        }
        if self.last_known_longitude.is_some() {
            session.last_known_longitude = self.last_known_longitude;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_session_ids_are_unique_and_marked_local() {
        let a = SessionId::new_local();
        let b = SessionId::new_local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!SessionId::from_server("8f3c").is_local());
    }

    #[test]
    fn finish_is_terminal_once() {
        let start = Utc::now();
        let mut session = PatrolSession::begin("guard-1", "site-1", None, start);
        session.finish(SessionStatus::Completed, start, true);
        session.finish(SessionStatus::Cancelled, start, false);

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.auto_ended);
        assert_eq!(session.end_time, Some(start));
    }

    #[test]
    fn session_serializes_status_lowercase() {
        let session = PatrolSession::begin("guard-1", "site-1", Some("team-a".into()), Utc::now());
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "active");
        assert!(json["id"].as_str().unwrap().starts_with("local-"));
    }

    #[test]
    fn patch_keeps_known_position_when_absent() {
        let mut session = PatrolSession::begin("guard-1", "site-1", None, Utc::now());
        session.set_position(51.5, -0.12);
        let patch = SessionPatch {
            status: SessionStatus::Completed,
            end_time: Some(Utc::now()),
            auto_ended: false,
            last_known_latitude: None,
            last_known_longitude: None,
        };
        patch.apply_to(&mut session);
        assert_eq!(session.last_known_latitude, Some(51.5));
        assert_eq!(session.status, SessionStatus::Completed);
    }
}
