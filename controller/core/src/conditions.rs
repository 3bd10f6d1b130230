use chrono::{DateTime, Utc};
use tortoise_k8s_api::tortoise::{ConditionStatus, TortoiseCondition, TortoiseConditionType};

/// Sets a condition, bumping `lastTransitionTime` only when the status
/// changes.
pub fn set(
    conditions: &mut Vec<TortoiseCondition>,
    type_: TortoiseConditionType,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let status = ConditionStatus::from(status);
    let message = message.into();
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(c) => {
            if c.status != status {
                c.last_transition_time = now;
            }
            c.status = status;
            c.reason = reason.to_string();
            c.message = message;
            c.last_update_time = now;
        }
        None => conditions.push(TortoiseCondition {
            type_,
            status,
            reason: reason.to_string(),
            message,
            last_update_time: now,
            last_transition_time: now,
        }),
    }
}

pub fn get(
    conditions: &[TortoiseCondition],
    type_: TortoiseConditionType,
) -> Option<&TortoiseCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[TortoiseCondition], type_: TortoiseConditionType) -> bool {
    get(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}
