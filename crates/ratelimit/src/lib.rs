//! Sliding-window rate limiter: separate 1-second budgets for order
//! submissions and cancellations. Risk intents (`is_risk = true`) bypass
//! this limiter entirely — callers must not route them through
//! [`RateLimiter::try_admit`] at all, per the spec's "risk intents bypass
//! the limiter, never queued" rule. Denied non-risk intents are dropped,
//! never queued: queueing would stretch an already-stale market snapshot.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Submit,
    Cancel,
}

const WINDOW_MS: i64 = 1_000;

#[derive(Debug)]
pub struct RateLimiter {
    max_submits: u32,
    max_cancels: u32,
    submit_times: VecDeque<DateTime<Utc>>,
    cancel_times: VecDeque<DateTime<Utc>>,
    /// Risk submissions observed (uncounted against the budget) for
    /// diagnostics/testing — never consulted when making admit decisions.
    pub risk_observed: u64,
}

impl RateLimiter {
    pub fn new(max_orders_per_sec: u32, max_cancels_per_sec: u32) -> Self {
        Self {
            max_submits: max_orders_per_sec,
            max_cancels: max_cancels_per_sec,
            submit_times: VecDeque::new(),
            cancel_times: VecDeque::new(),
            risk_observed: 0,
        }
    }

    /// Ask for admission of a non-risk action. Returns `true` and records
    /// the action if under budget; returns `false` (and records nothing)
    /// otherwise. Risk intents must never call this — they bypass the
    /// limiter by construction.
    pub fn try_admit(&mut self, kind: ActionKind, now: DateTime<Utc>) -> bool {
        let (times, max) = match kind {
            ActionKind::Submit => (&mut self.submit_times, self.max_submits),
            ActionKind::Cancel => (&mut self.cancel_times, self.max_cancels),
        };
        prune(times, now);
        if times.len() as u32 >= max {
            return false;
        }
        times.push_back(now);
        true
    }

    /// Record that a risk action occurred, without consuming budget.
    pub fn observe_risk(&mut self) {
        self.risk_observed += 1;
    }
}

fn prune(times: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::milliseconds(WINDOW_MS);
    while let Some(front) = times.front() {
        if *front < cutoff {
            times.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn admits_up_to_budget_then_denies() {
        let mut rl = RateLimiter::new(3, 10);
        assert!(rl.try_admit(ActionKind::Submit, t(0)));
        assert!(rl.try_admit(ActionKind::Submit, t(10)));
        assert!(rl.try_admit(ActionKind::Submit, t(20)));
        assert!(!rl.try_admit(ActionKind::Submit, t(30)));
    }

    #[test]
    fn budget_frees_up_as_the_window_slides() {
        let mut rl = RateLimiter::new(2, 10);
        assert!(rl.try_admit(ActionKind::Submit, t(0)));
        assert!(rl.try_admit(ActionKind::Submit, t(100)));
        assert!(!rl.try_admit(ActionKind::Submit, t(200)));
        // Once t=0's submission falls outside the 1s window, it admits again.
        assert!(rl.try_admit(ActionKind::Submit, t(1_001)));
    }

    #[test]
    fn submit_and_cancel_budgets_are_independent() {
        let mut rl = RateLimiter::new(1, 1);
        assert!(rl.try_admit(ActionKind::Submit, t(0)));
        assert!(!rl.try_admit(ActionKind::Submit, t(0)));
        assert!(rl.try_admit(ActionKind::Cancel, t(0)));
    }

    #[test]
    fn risk_observations_never_consume_budget() {
        let mut rl = RateLimiter::new(1, 1);
        for _ in 0..100 {
            rl.observe_risk();
        }
        assert!(rl.try_admit(ActionKind::Submit, t(0)));
    }
}
