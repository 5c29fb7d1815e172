use crate::corpus::{CorpusError, CorpusManager, SeedId};
use crate::coverage::CoverageMap;
use crate::mutator::{CandidateFilter, DropCounts, StrategyTable, StrategyTag};
use crate::selector::{AdaptiveStrategySelector, SelectionPolicy};
use parking_lot::Mutex;
use rand::Rng;
use rand_core::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Each requested candidate gets this many tries before a batch comes back short.
const MAX_ATTEMPTS_PER_CANDIDATE: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    /// The selector named a strategy the table does not hold.
    #[error("Strategy '{0}' is not registered in the strategy table")]
    StrategyMissing(StrategyTag),
}

/// All mutable engine state, passed explicitly to whoever needs it.
///
/// Each component sits behind its own lock; there is no lock spanning two
/// components. Cloning shares the same components.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub coverage: Arc<Mutex<CoverageMap>>,
    pub corpus: Arc<Mutex<CorpusManager>>,
    pub selector: Arc<Mutex<AdaptiveStrategySelector>>,
    pub table: Arc<StrategyTable>,
}

impl EngineState {
    /// Wires the components together, building a selector over every
    /// strategy registered in `table`.
    pub fn new(
        coverage: CoverageMap,
        corpus: CorpusManager,
        table: StrategyTable,
        policy: Box<dyn SelectionPolicy>,
    ) -> Self {
        let selector = AdaptiveStrategySelector::new(&table.tags(), policy);
        Self {
            coverage: Arc::new(Mutex::new(coverage)),
            corpus: Arc::new(Mutex::new(corpus)),
            selector: Arc::new(Mutex::new(selector)),
            table: Arc::new(table),
        }
    }
}

/// A mutated payload plus the provenance needed to attribute its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub bytes: Vec<u8>,
    pub seed_id: SeedId,
    /// The strategy that actually produced `bytes`.
    pub strategy: StrategyTag,
    /// Set when the selected strategy failed and `strategy` stood in for it.
    pub fallback_from: Option<StrategyTag>,
}

/// Produces batches of candidates from the corpus.
///
/// Callable from many threads at once: locks are held only to pick a seed
/// and a strategy, mutation itself runs outside any lock.
#[derive(Debug)]
pub struct MutationEngine {
    state: EngineState,
    filter: CandidateFilter,
    dropped_empty: AtomicU64,
    dropped_oversized: AtomicU64,
    fallbacks: AtomicU64,
}

impl MutationEngine {
    pub fn new(state: EngineState, filter: CandidateFilter) -> Self {
        Self {
            state,
            filter,
            dropped_empty: AtomicU64::new(0),
            dropped_oversized: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Generates up to `n` candidates.
    ///
    /// # Arguments
    /// * `n`: Number of candidates wanted.
    /// * `rng`: Source of randomness for seed choice, strategy choice and mutation.
    ///
    /// # Returns
    /// A `Result` containing the candidates, or `EngineError::Corpus(EmptyCorpus)`
    /// if there is nothing to mutate yet. The batch is shorter than `n` when
    /// too many candidates were dropped by the size filter.
    pub fn next_batch(
        &self,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Candidate>, EngineError> {
        let mut batch = Vec::with_capacity(n);
        let max_attempts = n.saturating_mul(MAX_ATTEMPTS_PER_CANDIDATE);
        let mut attempts = 0;
        while batch.len() < n && attempts < max_attempts {
            attempts += 1;
            if let Some(candidate) = self.next_candidate(rng)? {
                batch.push(candidate);
            }
        }
        if batch.len() < n {
            debug!(requested = n, produced = batch.len(), "short batch");
        }
        Ok(batch)
    }

    fn next_candidate(&self, rng: &mut dyn RngCore) -> Result<Option<Candidate>, EngineError> {
        let (seed_id, seed_bytes) = {
            let mut corpus = self.state.corpus.lock();
            let id = corpus.select_seed(rng)?;
            let bytes = corpus
                .get(id)
                .map(|seed| seed.bytes.clone())
                .ok_or(CorpusError::SeedNotFound(id))?;
            (id, bytes)
        };
        let selected = self.state.selector.lock().select(rng);

        let (strategy, fallback_from, raw) = self.mutate(selected, &seed_bytes, rng)?;
        let (mut valid, drops) = self.filter.validate(raw);
        self.count_drops(&drops);
        if valid.is_empty() {
            debug!(seed_id, %strategy, "no valid candidate produced");
            return Ok(None);
        }
        let pick = rng.random_range(0..valid.len());
        let bytes = valid.swap_remove(pick);
        debug!(seed_id, %strategy, len = bytes.len(), "candidate generated");
        Ok(Some(Candidate {
            bytes,
            seed_id,
            strategy,
            fallback_from,
        }))
    }

    /// Applies `tag`, falling back to `Hybrid` when the strategy reports itself
    /// unavailable.
    fn mutate(
        &self,
        tag: StrategyTag,
        input: &[u8],
        rng: &mut dyn RngCore,
    ) -> Result<(StrategyTag, Option<StrategyTag>, Vec<Vec<u8>>), EngineError> {
        let strategy = self
            .state
            .table
            .get(tag)
            .ok_or(EngineError::StrategyMissing(tag))?;
        match strategy.apply(input, rng) {
            Ok(candidates) => Ok((tag, None, candidates)),
            Err(err) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    strategy = %tag,
                    error = %err,
                    "strategy unavailable, falling back to hybrid"
                );
                let hybrid = self
                    .state
                    .table
                    .get(StrategyTag::Hybrid)
                    .ok_or(EngineError::StrategyMissing(StrategyTag::Hybrid))?;
                let candidates = hybrid.apply(input, rng).unwrap_or_default();
                Ok((StrategyTag::Hybrid, Some(tag), candidates))
            }
        }
    }

    fn count_drops(&self, drops: &DropCounts) {
        if drops.empty > 0 {
            self.dropped_empty.fetch_add(drops.empty, Ordering::Relaxed);
        }
        if drops.oversized > 0 {
            self.dropped_oversized
                .fetch_add(drops.oversized, Ordering::Relaxed);
        }
    }

    /// Candidates dropped by the size filter since the engine was created.
    pub fn drop_counts(&self) -> DropCounts {
        DropCounts {
            empty: self.dropped_empty.load(Ordering::Relaxed),
            oversized: self.dropped_oversized.load(Ordering::Relaxed),
        }
    }

    /// How many times a failing strategy was replaced by `Hybrid`.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}
