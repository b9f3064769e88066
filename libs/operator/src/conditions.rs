//! Shared condition-list upsert, used by all four CRD controllers (both C6's
//! validation conditions and C10's gate conditions are "the thing that
//! writes conditions" — this is the one place that does it).

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";
pub const STATUS_UNKNOWN: &str = "Unknown";

/// Insert or update `condition` by `type_` in `conditions`. `LastTransitionTime`
/// only changes when `status` changes; `observed_generation` is carried
/// through unconditionally on every call (the spec's upsert-rule discipline).
pub fn upsert(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    observed_generation: i64,
) {
    let now = Time(Utc::now());
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.into();
        existing.observed_generation = Some(observed_generation);
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
            observed_generation: Some(observed_generation),
        });
    }
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == STATUS_TRUE)
}

pub fn get(conditions: &[Condition], type_: &str) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_only_changes_on_status_change() {
        let mut conditions = Vec::new();
        upsert(&mut conditions, "Ready", STATUS_TRUE, "OK", "ready", 1);
        let first = conditions[0].last_transition_time.clone();
        std::thread::sleep(std::time::Duration::from_millis(5));
        upsert(&mut conditions, "Ready", STATUS_TRUE, "OK", "still ready", 2);
        assert_eq!(conditions[0].last_transition_time.0, first.0);
        assert_eq!(conditions[0].observed_generation, Some(2));

        upsert(&mut conditions, "Ready", STATUS_FALSE, "Blocked", "no longer ready", 3);
        assert_ne!(conditions[0].last_transition_time.0, first.0);
    }

    #[test]
    fn is_true_checks_status_string() {
        let mut conditions = Vec::new();
        upsert(&mut conditions, "Validated", STATUS_TRUE, "OK", "", 1);
        assert!(is_true(&conditions, "Validated"));
        assert!(!is_true(&conditions, "Bootstrapped"));
    }
}
