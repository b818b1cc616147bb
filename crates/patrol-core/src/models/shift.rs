//! Shift window model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A scheduled time range during which a guard may operate at a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub guard_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub site_id: String,
    #[serde(default)]
    pub team_id: String,
}

impl ShiftWindow {
    /// Earliest instant a session may start under this window
    pub fn grace_start(&self, grace: Duration) -> DateTime<Utc> {
        self.start_date - grace
    }

    /// `start - grace <= now <= end`, both bounds inclusive
    pub fn covers(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.grace_start(grace) <= now && now <= self.end_date
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now
    }

    /// Windows that end at or before they start are scheduling errors
    pub fn is_well_formed(&self) -> bool {
        self.end_date > self.start_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> ShiftWindow {
        ShiftWindow {
            guard_id: "guard-1".to_string(),
            start_date: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 0).unwrap(),
            site_id: "site-1".to_string(),
            team_id: "team-a".to_string(),
        }
    }

    #[test]
    fn covers_is_inclusive_at_both_edges() {
        let grace = Duration::minutes(30);
        let shift = window();
        assert!(shift.covers(Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(), grace));
        assert!(shift.covers(Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 0).unwrap(), grace));
        assert!(!shift.covers(Utc.with_ymd_and_hms(2026, 3, 2, 9, 29, 59).unwrap(), grace));
        assert!(!shift.covers(Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 1).unwrap(), grace));
    }

    #[test]
    fn reversed_window_is_not_well_formed() {
        let mut shift = window();
        std::mem::swap(&mut shift.start_date, &mut shift.end_date);
        assert!(!shift.is_well_formed());
    }
}
