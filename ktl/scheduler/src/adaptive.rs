//! Adaptive concurrency controller (`spec.md` §4.7).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ktl_config::AdaptiveConcurrencyConfig;
use tokio::sync::Semaphore;

use crate::fsm::AttemptOutcome;

const HIGH_FAIL_RATE: f64 = 0.30;
const LOW_FAIL_RATE: f64 = 0.05;

/// Reason carried on a `RUN_CONCURRENCY` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyChangeReason {
    HighFailureRate,
    LowFailureRate,
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyChange {
    pub from: usize,
    pub to: usize,
    pub reason: ConcurrencyChangeReason,
    pub window: usize,
    pub fail_rate: f64,
}

/// Bounded outcome ring plus the consecutive-threshold state machine that
/// derives `Target` from it. `Target` itself lives in a shared
/// [`WorkerPool`] so the orchestrator can react to it without polling this
/// type directly.
pub struct AdaptiveController {
    config: AdaptiveConcurrencyConfig,
    outcomes: VecDeque<AttemptOutcome>,
    consecutive_high: usize,
    consecutive_low: usize,
    pool: Arc<WorkerPool>,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConcurrencyConfig, pool: Arc<WorkerPool>) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(config.window_size),
            config,
            consecutive_high: 0,
            consecutive_low: 0,
            pool,
        }
    }

    /// Records one attempt outcome and reconciles `Target`. Returns the
    /// change to emit as `RUN_CONCURRENCY`, if any.
    pub fn record(&mut self, outcome: AttemptOutcome) -> Option<ConcurrencyChange> {
        if self.outcomes.len() >= self.config.window_size {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(outcome);

        let fails = self
            .outcomes
            .iter()
            .filter(|o| !matches!(o, AttemptOutcome::Succeeded))
            .count();
        let fail_rate = fails as f64 / self.outcomes.len() as f64;

        if fail_rate > HIGH_FAIL_RATE {
            self.consecutive_high += 1;
            self.consecutive_low = 0;
        } else if fail_rate < LOW_FAIL_RATE {
            self.consecutive_low += 1;
            self.consecutive_high = 0;
        } else {
            self.consecutive_high = 0;
            self.consecutive_low = 0;
        }

        if self.consecutive_high >= self.config.raise_threshold {
            self.consecutive_high = 0;
            let from = self.pool.target();
            let to = (from / 2).max(1);
            if to != from {
                self.pool.set_target(to);
                return Some(ConcurrencyChange {
                    from,
                    to,
                    reason: ConcurrencyChangeReason::HighFailureRate,
                    window: self.outcomes.len(),
                    fail_rate,
                });
            }
        } else if self.consecutive_low >= self.config.lower_threshold {
            self.consecutive_low = 0;
            let from = self.pool.target();
            let to = (from + 1).min(self.config.max);
            if to != from {
                self.pool.set_target(to);
                return Some(ConcurrencyChange {
                    from,
                    to,
                    reason: ConcurrencyChangeReason::LowFailureRate,
                    window: self.outcomes.len(),
                    fail_rate,
                });
            }
        }

        None
    }
}

/// The dynamic worker pool: a semaphore sized to `target`. Shrinking the
/// target retires a permit the next time one is returned rather than
/// revoking one in use, which is what "surplus workers exit at their next
/// idle boundary" (`spec.md` §4.7) means in a permit-per-worker model.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    target: AtomicUsize,
}

impl WorkerPool {
    pub fn new(initial: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(initial.max(1))),
            target: AtomicUsize::new(initial.max(1)),
        })
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    fn set_target(self: &Arc<Self>, new_target: usize) {
        let old_target = self.target.swap(new_target, Ordering::SeqCst);
        if new_target > old_target {
            self.semaphore.add_permits(new_target - old_target);
        } else if new_target < old_target {
            let retire = old_target - new_target;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                for _ in 0..retire {
                    if let Ok(permit) = this.semaphore.acquire().await {
                        permit.forget();
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize) -> AdaptiveConcurrencyConfig {
        AdaptiveConcurrencyConfig {
            window_size: 8,
            raise_threshold: 2,
            lower_threshold: 2,
            max,
        }
    }

    #[test]
    fn sustained_high_failure_rate_halves_target() {
        let pool = WorkerPool::new(8);
        let mut controller = AdaptiveController::new(config(16), Arc::clone(&pool));

        for _ in 0..2 {
            for _ in 0..4 {
                controller.record(AttemptOutcome::RetryableFailed);
            }
        }
        assert_eq!(pool.target(), 4);
    }

    #[test]
    fn sustained_success_raises_target_up_to_max() {
        let pool = WorkerPool::new(2);
        let mut controller = AdaptiveController::new(config(4), Arc::clone(&pool));

        for _ in 0..2 {
            for _ in 0..8 {
                controller.record(AttemptOutcome::Succeeded);
            }
        }
        assert!(pool.target() <= 4);
        assert!(pool.target() >= 2);
    }

    #[test]
    fn target_never_drops_below_one() {
        let pool = WorkerPool::new(1);
        let mut controller = AdaptiveController::new(config(4), Arc::clone(&pool));
        for _ in 0..4 {
            for _ in 0..4 {
                controller.record(AttemptOutcome::RetryableFailed);
            }
        }
        assert_eq!(pool.target(), 1);
    }
}
