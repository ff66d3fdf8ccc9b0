//! Lifetime prediction for span placement.
//!
//! Time is logical: the subject advances the clock by one tick per mutation
//! and a tick counts as one millisecond. Wall-clock time would make runs
//! unreproducible.

use super::options::{LifetimePredictionOptions, LifetimeStrategy};
use super::table::RegionKind;

/// Spans are grouped by object count; the predictor remembers the most
/// recent lifetime per group.
const BUCKETS: usize = 64;
const UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifetimeStats {
    pub predicted_short: u64,
    pub predicted_long: u64,
    /// Predictions that matched the observed lifetime on delete.
    pub correct: u64,
    pub mispredicted: u64,
}

pub struct LifetimeTracker {
    options: LifetimePredictionOptions,
    clock: u64,
    last_lifetime: [u64; BUCKETS],
    stats: LifetimeStats,
}

/// Outcome of a prediction, carried on the span until it is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub short_lived: bool,
    pub placement: RegionKind,
}

impl LifetimeTracker {
    pub fn new(options: LifetimePredictionOptions) -> Self {
        LifetimeTracker {
            options,
            clock: 0,
            last_lifetime: [UNKNOWN; BUCKETS],
            stats: LifetimeStats::default(),
        }
    }

    /// Advance the clock and return the new time.
    #[inline]
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.clock
    }

    pub fn stats(&self) -> LifetimeStats {
        self.stats
    }

    fn threshold_ticks(&self) -> u64 {
        self.options.threshold.as_millis() as u64
    }

    pub fn predict(&mut self, objects: usize) -> Prediction {
        if !self.options.predicts() {
            return Prediction {
                short_lived: false,
                placement: RegionKind::Filler,
            };
        }
        let short_lived = match self.options.strategy {
            LifetimeStrategy::AlwaysShortLivedRegions => true,
            LifetimeStrategy::PredictedLifetimeRegions => {
                let last = self.last_lifetime[objects % BUCKETS];
                last != UNKNOWN && last < self.threshold_ticks()
            }
        };
        if short_lived {
            self.stats.predicted_short += 1;
        } else {
            self.stats.predicted_long += 1;
        }
        let placement = if short_lived && self.options.places() {
            RegionKind::ShortLived
        } else {
            RegionKind::Filler
        };
        Prediction {
            short_lived,
            placement,
        }
    }

    /// Record the lifetime of a span allocated at `born` that predicted
    /// `short_lived`.
    pub fn observe(&mut self, objects: usize, born: u64, short_lived: bool) {
        if !self.options.predicts() {
            return;
        }
        let lifetime = self.clock.saturating_sub(born);
        self.last_lifetime[objects % BUCKETS] = lifetime;
        if (lifetime < self.threshold_ticks()) == short_lived {
            self.stats.correct += 1;
        } else {
            self.stats.mispredicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::options::LifetimeMode;
    use core::time::Duration;

    fn tracker(mode: LifetimeMode, strategy: LifetimeStrategy, ms: u64) -> LifetimeTracker {
        LifetimeTracker::new(LifetimePredictionOptions::new(
            mode,
            strategy,
            Duration::from_millis(ms),
        ))
    }

    #[test]
    fn disabled_never_predicts() {
        let mut t = tracker(
            LifetimeMode::Disabled,
            LifetimeStrategy::AlwaysShortLivedRegions,
            10,
        );
        let p = t.predict(1);
        assert!(!p.short_lived);
        assert_eq!(p.placement, RegionKind::Filler);
        assert_eq!(t.stats(), LifetimeStats::default());
    }

    #[test]
    fn counterfactual_predicts_without_placing() {
        let mut t = tracker(
            LifetimeMode::Counterfactual,
            LifetimeStrategy::AlwaysShortLivedRegions,
            10,
        );
        let p = t.predict(1);
        assert!(p.short_lived);
        assert_eq!(p.placement, RegionKind::Filler);
        assert_eq!(t.stats().predicted_short, 1);
    }

    #[test]
    fn predicted_strategy_learns_per_bucket() {
        let mut t = tracker(
            LifetimeMode::Enabled,
            LifetimeStrategy::PredictedLifetimeRegions,
            5,
        );
        // Nothing observed yet: long-lived.
        assert!(!t.predict(3).short_lived);
        let born = t.tick();
        t.tick();
        t.observe(3, born, false);
        assert_eq!(t.stats().mispredicted, 1);

        let p = t.predict(3);
        assert!(p.short_lived);
        assert_eq!(p.placement, RegionKind::ShortLived);
        // A different bucket has no history.
        assert!(!t.predict(4).short_lived);
    }
}
