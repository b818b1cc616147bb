//! Error types for patrol-core

use thiserror::Error;

use crate::eligibility::EligibilityReason;
use crate::store::StoreError;

/// Result type alias using patrol-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in patrol-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote session store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Guard is not authorized to hold a session right now
    #[error("Not eligible to start a patrol: {0}")]
    Ineligible(EligibilityReason),

    /// Lifecycle action is not valid from the current state
    #[error("Cannot {action} while the patrol is {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    /// Another session is already active for this guard
    #[error("Guard {0} already has an active patrol session")]
    SessionAlreadyActive(String),
}

impl Error {
    /// Whether a retry later may succeed without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_transient())
    }
}
