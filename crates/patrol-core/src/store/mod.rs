//! Remote session store abstraction.
//!
//! The hosted backend is an external collaborator; the lifecycle controller
//! and the reconciler only see this trait.

mod memory;
mod rest;

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    EventUpload, PatrolSession, SessionId, SessionPatch, SessionRecord, ShiftWindow, StoredEvent,
};

pub use memory::{InMemorySessionStore, StoreOperation};
pub use rest::{normalize_rest_url, RestSessionStore, RestStoreConfig};

/// Failure talking to the remote store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network trouble, timeouts, throttling, server-side faults
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
    /// Validation or permission failure; retrying unchanged will not help
    #[error("Session store rejected the request: {0}")]
    Rejected(String),
    #[error("Session store record not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Transient failures fall back to the offline queue
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for patrol sessions, their events, and shift schedules.
pub trait SessionStore: Send + Sync {
    /// Create a session; stores should treat a repeated `client_ref` as the same session
    fn create_session(
        &self,
        record: &SessionRecord,
    ) -> impl Future<Output = StoreResult<PatrolSession>> + Send;

    fn update_session(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
    ) -> impl Future<Output = StoreResult<PatrolSession>> + Send;

    /// Idempotent: a repeated natural key must not create a second event
    fn upsert_event(
        &self,
        event: &EventUpload,
    ) -> impl Future<Output = StoreResult<StoredEvent>> + Send;

    /// Shift windows for the guard that have not ended by `now`
    fn query_active_shift_windows(
        &self,
        guard_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<Vec<ShiftWindow>>> + Send;
}

macro_rules! forward_session_store {
    ($($target:ty),+) => {$(
        impl<S: SessionStore> SessionStore for $target {
            fn create_session(
                &self,
                record: &SessionRecord,
            ) -> impl Future<Output = StoreResult<PatrolSession>> + Send {
                (**self).create_session(record)
            }

            fn update_session(
                &self,
                id: &SessionId,
                patch: &SessionPatch,
            ) -> impl Future<Output = StoreResult<PatrolSession>> + Send {
                (**self).update_session(id, patch)
            }

            fn upsert_event(
                &self,
                event: &EventUpload,
            ) -> impl Future<Output = StoreResult<StoredEvent>> + Send {
                (**self).upsert_event(event)
            }

            fn query_active_shift_windows(
                &self,
                guard_id: &str,
                now: DateTime<Utc>,
            ) -> impl Future<Output = StoreResult<Vec<ShiftWindow>>> + Send {
                (**self).query_active_shift_windows(guard_id, now)
            }
        }
    )+};
}

forward_session_store!(&S, std::sync::Arc<S>);
