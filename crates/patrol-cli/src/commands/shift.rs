use chrono::{DateTime, Utc};
use patrol_core::{EligibilityDecision, SessionStore, ShiftEligibility};

/// Ask the shift schedule whether `guard_id` may start a patrol at `now`
pub async fn run_shift<S: SessionStore>(
    store: S,
    guard_id: &str,
    grace_minutes: i64,
    now: DateTime<Utc>,
) -> EligibilityDecision {
    let decision = ShiftEligibility::new(store, grace_minutes)
        .evaluate(guard_id, now)
        .await;
    println!("{}", format_decision(&decision));
    decision
}

pub fn format_decision(decision: &EligibilityDecision) -> String {
    if decision.eligible {
        format!("Eligible: {}", decision.reason)
    } else {
        format!("Not eligible: {}", decision.reason)
    }
}
