//! Quota, expiry, and status enforcement.
//!
//! Checks run inline after traffic reports (through a deduplicating queue)
//! and once a day. A violation pauses the affected forwards and marks them
//! auto-paused; the daily sweep resets counters on their anchor day and
//! resumes auto-paused forwards whose checks pass again.

mod enforcer;
mod sweep;

#[cfg(test)]
mod enforcement_tests;

pub use enforcer::{EnforcementQueue, EnforcementReceiver, LimitCheck, LimitEnforcer};
pub use sweep::{DailySweep, SweepSummary, is_reset_day};

use crate::storage::{STATUS_ACTIVE, User, UserTunnel};

/// Quotas are configured in GB and compared against billed bytes.
pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Why an account or grant may not carry traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("account is disabled")]
    Disabled,

    #[error("account has expired")]
    Expired,

    #[error("traffic quota exceeded")]
    QuotaExceeded,
}

/// Shared evaluation for users and grants. `flow_gb == 0` is unlimited and
/// `exp_time_ms == 0` never expires.
const fn evaluate(
    status: i64,
    flow_gb: i64,
    used: i64,
    exp_time_ms: i64,
    now_ms: i64,
) -> Option<Violation> {
    if status != STATUS_ACTIVE {
        return Some(Violation::Disabled);
    }
    if exp_time_ms > 0 && exp_time_ms <= now_ms {
        return Some(Violation::Expired);
    }
    if flow_gb > 0 && used >= flow_gb.saturating_mul(BYTES_PER_GB) {
        return Some(Violation::QuotaExceeded);
    }
    None
}

pub const fn user_violation(user: &User, now_ms: i64) -> Option<Violation> {
    evaluate(
        user.status,
        user.flow,
        user.in_flow + user.out_flow,
        user.exp_time,
        now_ms,
    )
}

pub const fn grant_violation(grant: &UserTunnel, now_ms: i64) -> Option<Violation> {
    evaluate(
        grant.status,
        grant.flow,
        grant.in_flow + grant.out_flow,
        grant.exp_time,
        now_ms,
    )
}
