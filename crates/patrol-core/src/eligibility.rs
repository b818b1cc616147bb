//! Shift eligibility oracle.
//!
//! Decides whether a guard may hold an active patrol session at a given
//! instant. The decision is fail-closed: when the schedule cannot be read the
//! guard is treated as ineligible.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::models::ShiftWindow;
use crate::store::SessionStore;
use crate::util::minutes_until;

/// Default number of minutes before a shift starts during which a session may begin
pub const DEFAULT_GRACE_MINUTES: i64 = 30;

/// Why a guard is or is not eligible
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EligibilityReason {
    /// Inside a running shift
    OnShift { ends_at: DateTime<Utc> },
    /// Inside the grace period before a shift
    StartsSoon { minutes: i64 },
    /// No current or upcoming shifts at all
    NoShiftsScheduled,
    /// Shifts exist, but none is within the grace period yet
    NotActiveYet { next_start: DateTime<Utc> },
    /// The schedule could not be read
    VerificationFailed,
}

impl fmt::Display for EligibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnShift { ends_at } => {
                write!(f, "on shift until {}", ends_at.format("%Y-%m-%d %H:%M UTC"))
            }
            Self::StartsSoon { minutes: 1 } => f.write_str("shift starts in 1 minute"),
            Self::StartsSoon { minutes } => write!(f, "shift starts in {minutes} minutes"),
            Self::NoShiftsScheduled => {
                f.write_str("no shifts scheduled; contact your supervisor")
            }
            Self::NotActiveYet { next_start } => write!(
                f,
                "shift not active yet; next shift starts {}",
                next_start.format("%Y-%m-%d %H:%M UTC")
            ),
            Self::VerificationFailed => {
                f.write_str("unable to verify your shift; check your connection and retry")
            }
        }
    }
}

/// Outcome of an eligibility check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityDecision {
    pub eligible: bool,
    pub reason: EligibilityReason,
    /// The window that authorizes the session, when eligible
    pub window: Option<ShiftWindow>,
}

impl EligibilityDecision {
    fn eligible(reason: EligibilityReason, window: ShiftWindow) -> Self {
        Self {
            eligible: true,
            reason,
            window: Some(window),
        }
    }

    const fn ineligible(reason: EligibilityReason) -> Self {
        Self {
            eligible: false,
            reason,
            window: None,
        }
    }

    pub const fn is_verification_failure(&self) -> bool {
        matches!(self.reason, EligibilityReason::VerificationFailed)
    }
}

/// Evaluates shift eligibility against a session store
pub struct ShiftEligibility<S> {
    store: S,
    grace: Duration,
}

impl<S: SessionStore> ShiftEligibility<S> {
    pub fn new(store: S, grace_minutes: i64) -> Self {
        Self {
            store,
            grace: Duration::minutes(grace_minutes),
        }
    }

    /// Check eligibility for `guard_id` at `now`. Never fails; a store error is
    /// reported as [`EligibilityReason::VerificationFailed`].
    pub async fn evaluate(&self, guard_id: &str, now: DateTime<Utc>) -> EligibilityDecision {
        match self.store.query_active_shift_windows(guard_id, now).await {
            Ok(windows) => decide(&windows, now, self.grace),
            Err(error) => {
                tracing::warn!("Shift verification failed for {}: {}", guard_id, error);
                EligibilityDecision::ineligible(EligibilityReason::VerificationFailed)
            }
        }
    }
}

/// Pure eligibility rule over a set of shift windows
pub fn decide(windows: &[ShiftWindow], now: DateTime<Utc>, grace: Duration) -> EligibilityDecision {
    let well_formed: Vec<&ShiftWindow> = windows.iter().filter(|w| w.is_well_formed()).collect();

    if well_formed.is_empty() {
        return EligibilityDecision::ineligible(EligibilityReason::NoShiftsScheduled);
    }

    // Running windows first, then the one lasting longest
    let chosen = well_formed
        .iter()
        .filter(|w| w.covers(now, grace))
        .max_by(|a, b| {
            a.has_started(now)
                .cmp(&b.has_started(now))
                .then(a.end_date.cmp(&b.end_date))
        });

    if let Some(window) = chosen {
        let reason = if window.has_started(now) {
            EligibilityReason::OnShift {
                ends_at: window.end_date,
            }
        } else {
            EligibilityReason::StartsSoon {
                minutes: minutes_until(now, window.start_date),
            }
        };
        return EligibilityDecision::eligible(reason, (*window).clone());
    }

    match well_formed
        .iter()
        .filter(|w| w.start_date > now)
        .map(|w| w.start_date)
        .min()
    {
        Some(next_start) => {
            EligibilityDecision::ineligible(EligibilityReason::NotActiveYet { next_start })
        }
        None => EligibilityDecision::ineligible(EligibilityReason::NoShiftsScheduled),
    }
}
