use crate::mutator::StrategyTag;
use rand::Rng;
use rand_core::RngCore;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Exploration probability of the default epsilon-greedy policy.
pub const DEFAULT_EPSILON: f64 = 0.10;
/// Exploration constant of the UCB1 policy.
pub const DEFAULT_UCB_EXPLORATION: f64 = std::f64::consts::SQRT_2;

/// Outcome counters for one strategy. A success is new coverage or a crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyStats {
    /// Observed success rate; `None` while the strategy is untried.
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }
}

/// A rule for choosing the next strategy from per-strategy statistics.
///
/// `stats` is never empty and is given in strategy-table order; policies use
/// that order as the final tie-break so choices are reproducible under a fixed RNG.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn choose(&self, stats: &[(StrategyTag, StrategyStats)], rng: &mut dyn RngCore)
    -> StrategyTag;
}

/// Explore uniformly with probability `epsilon`, otherwise exploit the best
/// observed success rate.
///
/// Untried strategies count as rate `+∞`, so each strategy is attempted once
/// before any is repeated by the exploit branch. Ties on rate go to the strategy
/// with fewer attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpsilonGreedy {
    epsilon: f64,
}

impl EpsilonGreedy {
    /// `epsilon` is clamped into `[0, 1]`; NaN falls back to the default.
    pub fn new(epsilon: f64) -> Self {
        let epsilon = if epsilon.is_nan() {
            DEFAULT_EPSILON
        } else {
            epsilon.clamp(0.0, 1.0)
        };
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl Default for EpsilonGreedy {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

fn exploit_rate(stats: &StrategyStats) -> f64 {
    stats.success_rate().unwrap_or(f64::INFINITY)
}

impl SelectionPolicy for EpsilonGreedy {
    fn name(&self) -> &'static str {
        "epsilon-greedy"
    }

    fn choose(
        &self,
        stats: &[(StrategyTag, StrategyStats)],
        rng: &mut dyn RngCore,
    ) -> StrategyTag {
        if rng.random_bool(self.epsilon) {
            return stats[rng.random_range(0..stats.len())].0;
        }
        best_by(stats, |s| exploit_rate(s))
    }
}

/// Upper-confidence-bound policy: `rate + c * sqrt(ln N / attempts)`.
///
/// Offered as an alternative behind the same selector interface; its choices
/// are not numerically comparable with epsilon-greedy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ucb1 {
    exploration: f64,
}

impl Ucb1 {
    pub fn new(exploration: f64) -> Self {
        let exploration = if exploration.is_finite() && exploration >= 0.0 {
            exploration
        } else {
            DEFAULT_UCB_EXPLORATION
        };
        Self { exploration }
    }
}

impl Default for Ucb1 {
    fn default() -> Self {
        Self::new(DEFAULT_UCB_EXPLORATION)
    }
}

impl SelectionPolicy for Ucb1 {
    fn name(&self) -> &'static str {
        "ucb1"
    }

    fn choose(
        &self,
        stats: &[(StrategyTag, StrategyStats)],
        _rng: &mut dyn RngCore,
    ) -> StrategyTag {
        let total: u64 = stats.iter().map(|(_, s)| s.attempts).sum();
        let ln_total = (total.max(1) as f64).ln();
        best_by(stats, |s| match s.success_rate() {
            None => f64::INFINITY,
            Some(rate) => rate + self.exploration * (ln_total / s.attempts as f64).sqrt(),
        })
    }
}

/// Highest score wins; ties go to fewer attempts, then to table order.
fn best_by<F>(stats: &[(StrategyTag, StrategyStats)], score: F) -> StrategyTag
where
    F: Fn(&StrategyStats) -> f64,
{
    let mut best = &stats[0];
    let mut best_score = score(&best.1);
    for entry in &stats[1..] {
        let entry_score = score(&entry.1);
        let ordering = entry_score
            .partial_cmp(&best_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| best.1.attempts.cmp(&entry.1.attempts));
        if ordering == Ordering::Greater {
            best = entry;
            best_score = entry_score;
        }
    }
    best.0
}

/// Chooses a mutation strategy per round and learns from outcomes.
///
/// The selector owns the [`StrategyStats`]; they are written only through
/// [`AdaptiveStrategySelector::record_outcome`].
#[derive(Debug)]
pub struct AdaptiveStrategySelector {
    stats: Vec<(StrategyTag, StrategyStats)>,
    policy: Box<dyn SelectionPolicy>,
}

impl AdaptiveStrategySelector {
    /// Creates a selector over `tags` (duplicates ignored) using `policy`.
    /// With no tags at all, `select` always answers `StrategyTag::Hybrid`.
    pub fn new(tags: &[StrategyTag], policy: Box<dyn SelectionPolicy>) -> Self {
        let mut stats: Vec<(StrategyTag, StrategyStats)> = Vec::with_capacity(tags.len());
        for &tag in tags {
            if !stats.iter().any(|(t, _)| *t == tag) {
                stats.push((tag, StrategyStats::default()));
            }
        }
        Self { stats, policy }
    }

    pub fn epsilon_greedy(tags: &[StrategyTag], epsilon: f64) -> Self {
        Self::new(tags, Box::new(EpsilonGreedy::new(epsilon)))
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Picks the strategy for the next mutation.
    pub fn select<R: RngCore + ?Sized>(&self, rng: &mut R) -> StrategyTag {
        if self.stats.is_empty() {
            return StrategyTag::Hybrid;
        }
        let mut rng = rng;
        self.policy.choose(&self.stats, &mut rng)
    }

    /// Counts one attempt of `tag`, and one success if `success`.
    /// Outcomes for tags the selector does not know are ignored.
    pub fn record_outcome(&mut self, tag: StrategyTag, success: bool) {
        if let Some((_, stats)) = self.stats.iter_mut().find(|(t, _)| *t == tag) {
            stats.attempts = stats.attempts.saturating_add(1);
            if success {
                stats.successes = stats.successes.saturating_add(1);
            }
        }
    }

    pub fn stats(&self) -> &[(StrategyTag, StrategyStats)] {
        &self.stats
    }

    pub fn stats_for(&self, tag: StrategyTag) -> Option<StrategyStats> {
        self.stats
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, stats)| *stats)
    }

    pub fn success_rate(&self, tag: StrategyTag) -> Option<f64> {
        self.stats_for(tag).and_then(|s| s.success_rate())
    }
}
