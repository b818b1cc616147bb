//! Data models for Patrol

mod event;
mod session;
mod shift;

pub use event::{EventId, EventKey, EventKind, EventSyncState, EventUpload, QueuedEvent, StoredEvent};
pub use session::{PatrolSession, SessionId, SessionPatch, SessionRecord, SessionStatus};
pub use shift::ShiftWindow;
