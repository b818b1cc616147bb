//! patrol-core - Core library for Patrol
//!
//! This crate contains the shift-gated patrol session lifecycle, the durable
//! device-local mirror, and the offline reconciliation engine used by every
//! Patrol client (CLI today, field apps through the same API).

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod eligibility;
pub mod error;
pub mod lifecycle;
pub mod location;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_patrol_config, BackendConfig, PatrolConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use eligibility::{EligibilityDecision, EligibilityReason, ShiftEligibility};
pub use error::{Error, Result};
pub use lifecycle::{Delivery, Notice, SessionController};
pub use location::{FixedLocation, LocationPolicy, LocationProvider, Position};
pub use models::{EventKind, PatrolSession, QueuedEvent, SessionId, SessionStatus, ShiftWindow};
pub use services::LocalMirror;
pub use state::{SessionPhase, SessionSnapshot, SyncSnapshot, SyncState};
pub use store::{InMemorySessionStore, RestSessionStore, SessionStore, StoreError};
pub use sync::{ReconcileOutcome, ReconcileStatus, Reconciler};
