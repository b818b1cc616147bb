//! PostgREST-style session store over HTTPS.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{SessionStore, StoreError, StoreResult};
use crate::models::{
    EventKey, EventKind, EventUpload, PatrolSession, SessionId, SessionPatch, SessionRecord,
    SessionStatus, ShiftWindow, StoredEvent,
};
use crate::util::{compact_text, datetime_from_millis, is_http_url};

const SESSIONS_TABLE: &str = "patrol_sessions";
const ACTIVITIES_TABLE: &str = "patrol_activities";
const SHIFTS_TABLE: &str = "shifts";
const ACTIVITY_CONFLICT_COLUMNS: &str = "session_id,kind,captured_at";

/// Connection settings for [`RestSessionStore`]
#[derive(Clone, PartialEq, Eq)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    /// User access token; the API key is sent as bearer when absent
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for RestStoreConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RestStoreConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Session store backed by a hosted PostgREST endpoint
#[derive(Clone)]
pub struct RestSessionStore {
    rest_url: String,
    api_key: String,
    bearer: String,
    client: Client,
}

impl RestSessionStore {
    pub fn new(config: RestStoreConfig) -> StoreResult<Self> {
        let rest_url = normalize_rest_url(&config.base_url)?;
        let api_key = config.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(StoreError::Rejected(
                "Store API key must not be empty".to_string(),
            ));
        }
        let bearer = config
            .access_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| api_key.clone());

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| StoreError::Rejected(format!("HTTP client setup failed: {error}")))?;

        Ok(Self {
            rest_url,
            api_key,
            bearer,
            client,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.bearer)
            .header("Accept", "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> StoreResult<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(|error| {
            if error.is_decode() {
                // The store answered, but not in a shape this client understands
                StoreError::Rejected(format!("Unexpected response from store: {error}"))
            } else {
                StoreError::Unavailable(format!("Failed to read store response: {error}"))
            }
        })
    }
}

impl SessionStore for RestSessionStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<PatrolSession> {
        let body = SessionInsert::from(record);
        let request = self
            .client
            .post(self.table_url(SESSIONS_TABLE))
            .query(&[("on_conflict", "client_ref")])
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(&body);

        let rows: Vec<SessionRow> = self.send(request).await?;
        first_row(rows, || format!("session for {}", record.client_ref))?.into_session()
    }

    async fn update_session(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
    ) -> StoreResult<PatrolSession> {
        let body = SessionUpdate::from(patch);
        let request = self
            .client
            .patch(self.table_url(SESSIONS_TABLE))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&body);

        let rows: Vec<SessionRow> = self.send(request).await?;
        first_row(rows, || format!("session {id}"))?.into_session()
    }

    async fn upsert_event(&self, event: &EventUpload) -> StoreResult<StoredEvent> {
        let body = ActivityRow {
            id: None,
            session_id: event.key.session_id.to_string(),
            kind: event.key.kind,
            captured_at: datetime_from_millis(event.key.captured_at_ms),
            guard_id: event.guard_id.clone(),
            payload: event.payload.clone(),
        };
        let request = self
            .client
            .post(self.table_url(ACTIVITIES_TABLE))
            .query(&[("on_conflict", ACTIVITY_CONFLICT_COLUMNS)])
            .header("Prefer", "return=representation,resolution=merge-duplicates")
            .json(&body);

        let rows: Vec<ActivityRow> = self.send(request).await?;
        Ok(first_row(rows, || format!("activity {}", event.key))?.into_stored())
    }

    async fn query_active_shift_windows(
        &self,
        guard_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ShiftWindow>> {
        let request = self.client.get(self.table_url(SHIFTS_TABLE)).query(&[
            ("select", "guard_id,start_date,end_date,site_id,team_id".to_string()),
            ("guard_id", format!("eq.{guard_id}")),
            ("end_date", format!("gte.{}", format_timestamp(now))),
            ("order", "start_date.asc".to_string()),
        ]);

        let rows: Vec<ShiftRow> = self.send(request).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Ensure the base URL is http(s) and points at the REST root
pub fn normalize_rest_url(url: &str) -> StoreResult<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(StoreError::Rejected(
            "Store URL must not be empty".to_string(),
        ));
    }
    if !is_http_url(trimmed) {
        return Err(StoreError::Rejected(
            "Store URL must include http:// or https://".to_string(),
        ));
    }
    if trimmed.ends_with("/rest/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/rest/v1"))
    }
}

fn transport_error(error: reqwest::Error) -> StoreError {
    if error.is_builder() {
        StoreError::Rejected(format!("Invalid request: {error}"))
    } else {
        StoreError::Unavailable(format!("HTTP request failed: {error}"))
    }
}

async fn check_status(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Map an unsuccessful HTTP status to a transient or permanent failure
fn classify_status(status: StatusCode, body: &str) -> StoreError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            StoreError::Unavailable(message)
        }
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        status if status.is_server_error() => StoreError::Unavailable(message),
        _ => StoreError::Rejected(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
    error: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorResponse>(body) {
        if let Some(message) = payload
            .message
            .or(payload.details)
            .or(payload.hint)
            .or(payload.error)
        {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn first_row<T>(rows: Vec<T>, what: impl FnOnce() -> String) -> StoreResult<T> {
    rows.into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(what()))
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Serialize)]
struct SessionInsert<'a> {
    client_ref: &'a str,
    guard_id: &'a str,
    site_id: &'a str,
    team_id: Option<&'a str>,
    start_time: DateTime<Utc>,
    status: SessionStatus,
    last_known_latitude: Option<f64>,
    last_known_longitude: Option<f64>,
}

impl<'a> From<&'a SessionRecord> for SessionInsert<'a> {
    fn from(record: &'a SessionRecord) -> Self {
        Self {
            client_ref: record.client_ref.as_str(),
            guard_id: &record.guard_id,
            site_id: &record.site_id,
            team_id: record.team_id.as_deref(),
            start_time: record.start_time,
            status: record.status,
            last_known_latitude: record.last_known_latitude,
            last_known_longitude: record.last_known_longitude,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionUpdate {
    status: SessionStatus,
    end_time: Option<DateTime<Utc>>,
    auto_ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_known_latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_known_longitude: Option<f64>,
}

impl From<&SessionPatch> for SessionUpdate {
    fn from(patch: &SessionPatch) -> Self {
        Self {
            status: patch.status,
            end_time: patch.end_time,
            auto_ended: patch.auto_ended,
            last_known_latitude: patch.last_known_latitude,
            last_known_longitude: patch.last_known_longitude,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    id: serde_json::Value,
    guard_id: String,
    site_id: String,
    #[serde(default)]
    team_id: Option<String>,
    start_time: DateTime<Utc>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    status: String,
    #[serde(default)]
    last_known_latitude: Option<f64>,
    #[serde(default)]
    last_known_longitude: Option<f64>,
    #[serde(default)]
    auto_ended: Option<bool>,
}

impl SessionRow {
    fn into_session(self) -> StoreResult<PatrolSession> {
        let status = match self.status.as_str() {
            "active" => SessionStatus::Active,
            "completed" => SessionStatus::Completed,
            "cancelled" => SessionStatus::Cancelled,
            other => {
                return Err(StoreError::Rejected(format!(
                    "Unexpected session status '{other}' from store"
                )))
            }
        };
        // Integer and uuid primary keys both occur in deployed schemas
        let id = match self.id {
            serde_json::Value::String(id) => id,
            other => other.to_string(),
        };

        Ok(PatrolSession {
            id: SessionId::from_server(id),
            guard_id: self.guard_id,
            site_id: self.site_id,
            team_id: self.team_id,
            start_time: self.start_time,
            end_time: self.end_time,
            status,
            last_known_latitude: self.last_known_latitude,
            last_known_longitude: self.last_known_longitude,
            auto_ended: self.auto_ended.unwrap_or(false),
            authorized_until: None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivityRow {
    #[serde(default, skip_serializing)]
    id: Option<serde_json::Value>,
    session_id: String,
    kind: EventKind,
    captured_at: DateTime<Utc>,
    guard_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ActivityRow {
    fn into_stored(self) -> StoredEvent {
        let id = match self.id {
            Some(serde_json::Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        StoredEvent {
            id,
            key: EventKey {
                session_id: SessionId::from_server(self.session_id),
                kind: self.kind,
                captured_at_ms: self.captured_at.timestamp_millis(),
            },
            guard_id: self.guard_id,
            payload: self.payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShiftRow {
    guard_id: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    site_id: String,
    #[serde(default)]
    team_id: Option<String>,
}

impl From<ShiftRow> for ShiftWindow {
    fn from(row: ShiftRow) -> Self {
        Self {
            guard_id: row.guard_id,
            start_date: row.start_date,
            end_date: row.end_date,
            site_id: row.site_id,
            team_id: row.team_id.unwrap_or_default(),
        }
    }
}
