//! Bounded geolocation acquisition

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A position fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    High,
    Low,
}

/// One attempt at reading the device position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub accuracy: Accuracy,
    pub timeout: Duration,
    /// Oldest cached fix the provider may return; `None` demands a fresh one
    pub maximum_age: Option<Duration>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location unavailable: {0}")]
    Unavailable(String),
    #[error("Location request timed out")]
    Timeout,
}

/// Platform geolocation source
pub trait LocationProvider: Send + Sync {
    fn current_position(
        &self,
        request: &LocationRequest,
    ) -> impl Future<Output = Result<Position, LocationError>> + Send;
}

/// Timeouts for the two acquisition attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationPolicy {
    pub high_accuracy_timeout: Duration,
    pub low_accuracy_timeout: Duration,
    pub low_accuracy_max_age: Duration,
}

impl Default for LocationPolicy {
    fn default() -> Self {
        Self {
            high_accuracy_timeout: Duration::from_secs(8),
            low_accuracy_timeout: Duration::from_secs(15),
            low_accuracy_max_age: Duration::from_secs(300),
        }
    }
}

impl LocationPolicy {
    fn attempts(&self) -> [LocationRequest; 2] {
        [
            LocationRequest {
                accuracy: Accuracy::High,
                timeout: self.high_accuracy_timeout,
                maximum_age: None,
            },
            LocationRequest {
                accuracy: Accuracy::Low,
                timeout: self.low_accuracy_timeout,
                maximum_age: Some(self.low_accuracy_max_age),
            },
        ]
    }
}

/// Try a high-accuracy fix, then a low-accuracy one, then give up.
///
/// Each attempt is bounded by its own timeout, whether or not the provider
/// honours the request's timeout itself.
pub async fn acquire_position<L: LocationProvider>(
    provider: &L,
    policy: &LocationPolicy,
) -> Option<Position> {
    for request in policy.attempts() {
        match tokio::time::timeout(request.timeout, provider.current_position(&request)).await {
            Ok(Ok(position)) => return Some(position),
            Ok(Err(error)) => {
                tracing::debug!("{:?} accuracy location failed: {}", request.accuracy, error);
            }
            Err(_) => {
                tracing::debug!("{:?} accuracy location timed out", request.accuracy);
            }
        }
    }
    tracing::warn!("Proceeding without a location fix");
    None
}

/// Provider that always reports the same fix, or none
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation {
    position: Option<(f64, f64)>,
}

impl FixedLocation {
    pub const fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            position: Some((latitude, longitude)),
        }
    }

    pub const fn unavailable() -> Self {
        Self { position: None }
    }
}

impl LocationProvider for FixedLocation {
    async fn current_position(&self, _request: &LocationRequest) -> Result<Position, LocationError> {
        let (latitude, longitude) = self
            .position
            .ok_or_else(|| LocationError::Unavailable("no location source".to_string()))?;
        Ok(Position {
            latitude,
            longitude,
            accuracy_m: None,
            captured_at: Utc::now(),
        })
    }
}
