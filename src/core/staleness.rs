//! 停滞检测
//!
//! 每个周期记录一个轻量签名（如最短剩余时间的文本）。若上一周期预计世界会前进约 `expected_change_ms`，
//! 但超过 `expected_change_ms * tolerance` 后签名仍完全相同，则认为会话已与真实状态脱节，需要强制重新同步。

use serde::{Deserialize, Serialize};

pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// 周期状态快照，只保留上一周期的一份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp_ms: u64,
    pub signature: String,
}

impl StateSnapshot {
    pub fn new(timestamp_ms: u64, signature: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleCheck {
    pub is_stale: bool,
    pub reason: Option<String>,
}

impl StaleCheck {
    fn fresh() -> Self {
        Self {
            is_stale: false,
            reason: None,
        }
    }
}

/// 签名相同且经过时间 ≥ expected_change_ms * tolerance 时判定为停滞；没有上一快照时从不停滞
pub fn check_stale(
    previous: Option<&StateSnapshot>,
    current: &StateSnapshot,
    expected_change_ms: u64,
    tolerance: f64,
) -> StaleCheck {
    let Some(previous) = previous else {
        return StaleCheck::fresh();
    };
    if previous.signature != current.signature {
        return StaleCheck::fresh();
    }
    let elapsed = current.timestamp_ms.saturating_sub(previous.timestamp_ms);
    let threshold = expected_change_ms as f64 * tolerance;
    if (elapsed as f64) < threshold {
        return StaleCheck::fresh();
    }
    StaleCheck {
        is_stale: true,
        reason: Some(format!(
            "signature '{}' unchanged for {}ms (expected change within {}ms)",
            current.signature, elapsed, expected_change_ms
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_previous_never_stale() {
        let current = StateSnapshot::new(1_000_000, "5000");
        assert!(!check_stale(None, &current, 100, DEFAULT_TOLERANCE).is_stale);
    }

    #[test]
    fn test_unchanged_signature_past_threshold() {
        let prev = StateSnapshot::new(0, "5000");
        let curr = StateSnapshot::new(60_000, "5000");
        let check = check_stale(Some(&prev), &curr, 100_000, DEFAULT_TOLERANCE);
        assert!(check.is_stale);
        assert!(check.reason.unwrap().contains("5000"));
    }

    #[test]
    fn test_changed_signature_not_stale() {
        let prev = StateSnapshot::new(0, "5000");
        let curr = StateSnapshot::new(60_000, "4000");
        assert!(!check_stale(Some(&prev), &curr, 100_000, DEFAULT_TOLERANCE).is_stale);
    }

    #[test]
    fn test_threshold_boundary() {
        let prev = StateSnapshot::new(0, "x");
        let at = StateSnapshot::new(50_000, "x");
        let before = StateSnapshot::new(49_999, "x");
        assert!(check_stale(Some(&prev), &at, 100_000, 0.5).is_stale);
        assert!(!check_stale(Some(&prev), &before, 100_000, 0.5).is_stale);
    }

    #[test]
    fn test_differing_signatures_never_stale_at_any_elapsed() {
        let prev = StateSnapshot::new(0, "a");
        for elapsed in [0u64, 49_999, 50_000, 10_000_000] {
            let curr = StateSnapshot::new(elapsed, "b");
            assert!(!check_stale(Some(&prev), &curr, 100_000, 0.5).is_stale);
        }
    }

    #[test]
    fn test_clock_going_backwards_is_not_stale() {
        let prev = StateSnapshot::new(10_000, "x");
        let curr = StateSnapshot::new(5_000, "x");
        assert!(!check_stale(Some(&prev), &curr, 1_000, 0.5).is_stale);
    }
}
