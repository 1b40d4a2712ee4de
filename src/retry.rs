use std::time::Duration;

use crate::model::{BackoffKind, RetryPolicySpec};
use crate::state::{StepState, StepStatus};

/// Default retry policy for steps that don't declare their own: a single attempt, no retries.
pub fn default_policy() -> RetryPolicySpec {
    RetryPolicySpec {
        max_attempts: 1,
        backoff: BackoffKind::Fixed,
        delay_ms: 0,
    }
}

/// Computes the delay before `attempt` (1-indexed) given a backoff policy.
pub fn delay_for(attempt: u32, policy: &RetryPolicySpec) -> Duration {
    let attempt = attempt.max(1);
    let millis = match policy.backoff {
        BackoffKind::Fixed => policy.delay_ms,
        BackoffKind::Linear => policy.delay_ms.saturating_mul(attempt as u64),
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
            policy.delay_ms.saturating_mul(factor)
        }
    };
    Duration::from_millis(millis)
}

/// A step may be retried iff it hasn't exhausted its attempt budget and its current status
/// is Failed or Retrying.
pub fn can_retry(state: &StepState, policy: &RetryPolicySpec) -> bool {
    matches!(state.status, StepStatus::Failed | StepStatus::Retrying)
        && state.attempts < policy.max_attempts
}
