//! Outcome decisions.
//!
//! A `Decider` is pure: it looks at the claimed row and what the handler did, and says
//! which store transition comes next. The worker loop and the recovery sweep share it,
//! so "worker vanished" and "handler raised" go through the same retry budget.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{HandlerError, RetryPolicy, Task};
use crate::recurrence::RecurrenceRule;

/// What to do with a task after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Close the row as `completed`.
    Complete,

    /// Close the row as `completed` and insert the next occurrence at `next_at`.
    Recur { next_at: DateTime<Utc> },

    /// Put the row back to `pending` with a bumped retry count.
    Retry {
        retry_count: u32,
        delay: Duration,
        next_at: DateTime<Utc>,
        error: String,
    },

    /// Close the row as `failed`.
    Fail { error: String },
}

pub trait Decider: Send + Sync {
    fn on_success(&self, task: &Task, now: DateTime<Utc>) -> Decision;

    fn on_failure(&self, task: &Task, error: &HandlerError, now: DateTime<Utc>) -> Decision;
}

/// Retries transient failures with exponential backoff until `max_retries` is used up,
/// and expands recurrence rules on success.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Decider for DefaultDecider {
    fn on_success(&self, task: &Task, now: DateTime<Utc>) -> Decision {
        let Some(raw) = task.recurrence_rule.as_deref() else {
            return Decision::Complete;
        };
        let rule = match raw.parse::<RecurrenceRule>() {
            Ok(rule) => rule,
            Err(e) => {
                return Decision::Fail {
                    error: format!("invalid recurrence rule '{raw}': {e}"),
                };
            }
        };
        let anchor = task.recurrence_anchor.unwrap_or(task.scheduled_at);
        match rule.next_after(anchor, now) {
            Some(next_at) => Decision::Recur { next_at },
            None => Decision::Complete,
        }
    }

    fn on_failure(&self, task: &Task, error: &HandlerError, now: DateTime<Utc>) -> Decision {
        if error.is_permanent() {
            return Decision::Fail {
                error: error.to_string(),
            };
        }
        if task.retry_count >= task.max_retries {
            return Decision::Fail {
                error: format!(
                    "retries exhausted ({}/{}): {error}",
                    task.retry_count, task.max_retries
                ),
            };
        }
        let delay = self.policy.next_delay(task.retry_count);
        let next_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Decision::Retry {
            retry_count: task.retry_count + 1,
            delay,
            next_at,
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy::new(Duration::from_secs(10)))
    }

    fn task(max_retries: u32, retry_count: u32) -> Task {
        let mut task = NewTask::new("t1", "echo", json!({}), t0())
            .max_retries(max_retries)
            .into_task(t0());
        task.retry_count = retry_count;
        task
    }

    #[test]
    fn success_without_rule_completes() {
        assert_eq!(decider().on_success(&task(2, 0), t0()), Decision::Complete);
    }

    #[test]
    fn failure_with_budget_retries_with_backoff() {
        let decision = decider().on_failure(&task(2, 1), &"boom".into(), t0());
        assert_eq!(
            decision,
            Decision::Retry {
                retry_count: 2,
                delay: Duration::from_secs(20),
                next_at: t0() + chrono::Duration::seconds(20),
                error: "boom".into(),
            }
        );
    }

    #[test]
    fn failure_without_budget_fails() {
        let decision = decider().on_failure(&task(2, 2), &"boom".into(), t0());
        assert!(matches!(decision, Decision::Fail { error } if error.contains("retries exhausted (2/2)")));
    }

    #[test]
    fn permanent_failure_skips_budget() {
        let decision = decider().on_failure(&task(5, 0), &HandlerError::permanent("bad input"), t0());
        assert_eq!(
            decision,
            Decision::Fail {
                error: "bad input".into()
            }
        );
    }

    #[test]
    fn recurring_success_schedules_next_occurrence() {
        let task = NewTask::new("t2", "digest", json!({}), t0())
            .recurrence("FREQ=HOURLY;COUNT=3")
            .into_task(t0());
        let decision = decider().on_success(&task, t0() + chrono::Duration::seconds(5));
        assert_eq!(
            decision,
            Decision::Recur {
                next_at: t0() + chrono::Duration::hours(1)
            }
        );
    }

    #[test]
    fn exhausted_rule_completes() {
        let task = NewTask::new("t3", "digest", json!({}), t0())
            .recurrence("FREQ=DAILY;COUNT=1")
            .into_task(t0());
        assert_eq!(decider().on_success(&task, t0()), Decision::Complete);
    }

    #[test]
    fn malformed_rule_fails_permanently() {
        let task = NewTask::new("t4", "digest", json!({}), t0())
            .recurrence("FREQ=FORTNIGHTLY")
            .into_task(t0());
        assert!(matches!(
            decider().on_success(&task, t0()),
            Decision::Fail { error } if error.contains("invalid recurrence rule")
        ));
    }
}
