use crate::coverage::EdgeId;
use crate::scheduler::PowerSchedule;
use rand_core::RngCore;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Stable identifier of a corpus entry. Ids are never reused.
pub type SeedId = u64;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorpusError {
    /// Energy or selection was requested before any seed was added.
    /// The caller must seed the corpus before retrying.
    #[error("Corpus is empty, cannot select a seed")]
    EmptyCorpus,

    /// The requested seed id is not (or no longer) in the corpus.
    #[error("Seed {0} not found in corpus")]
    SeedNotFound(SeedId),

    /// `minimize` observed a cancellation request; the corpus was left untouched.
    #[error("Corpus minimization interrupted, corpus unchanged")]
    MinimizationInterrupted,

    /// An I/O error occurred while loading seed files from disk.
    #[error("Corpus I/O error: {0}")]
    Io(String),
}

/// A cooperative cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

/// A corpus entry: a payload plus the statistics the energy schedule needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub id: SeedId,
    pub bytes: Vec<u8>,
    /// Every edge hit by the execution that admitted this seed.
    pub coverage_edges: BTreeSet<EdgeId>,
    /// How many of `coverage_edges` were seen for the first time by this seed.
    pub new_edges: usize,
    /// Running average of execution time.
    pub exec_time: Duration,
    pub exec_count: u64,
    pub crashes_found: u32,
    pub times_fuzzed: u32,
    /// Logical insertion time, strictly increasing across the corpus.
    pub created_at: u64,
}

/// Summary of a completed minimization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizeReport {
    pub kept: BTreeSet<SeedId>,
    pub removed: usize,
    pub edges_covered: usize,
}

/// Owns the seed set, computes per-seed energy, selects seeds for mutation and
/// shrinks the corpus by greedy set cover.
///
/// Seeds are only ever removed by [`CorpusManager::minimize`]; there is no
/// silent eviction.
#[derive(Debug)]
pub struct CorpusManager {
    seeds: BTreeMap<SeedId, Seed>,
    by_digest: HashMap<[u8; 16], SeedId>,
    /// How many seeds cover each edge; its key count is the covered union.
    edge_refs: HashMap<EdgeId, u32>,
    next_id: SeedId,
    clock: u64,
    total_known_edges: u64,
    schedule: PowerSchedule,
}

impl Default for CorpusManager {
    fn default() -> Self {
        Self::new(PowerSchedule::default(), 0)
    }
}

impl CorpusManager {
    /// Creates an empty corpus.
    ///
    /// # Arguments
    /// * `schedule`: The energy formula used by `energy` and `select_seed`.
    /// * `total_known_edges`: Declared edge universe of the target (`0` if unknown).
    ///   The coverage factor divides by the larger of this and the number of
    ///   distinct edges covered by the corpus.
    pub fn new(schedule: PowerSchedule, total_known_edges: u64) -> Self {
        Self {
            seeds: BTreeMap::new(),
            by_digest: HashMap::new(),
            edge_refs: HashMap::new(),
            next_id: 0,
            clock: 0,
            total_known_edges,
            schedule,
        }
    }

    /// Adds a seed that produced new coverage.
    ///
    /// Byte-identical duplicates are a no-op: the existing seed is left as is
    /// and its id is returned.
    pub fn add_seed(
        &mut self,
        bytes: Vec<u8>,
        coverage_edges: impl IntoIterator<Item = EdgeId>,
        new_edges: usize,
        exec_time: Duration,
    ) -> SeedId {
        let digest = md5::compute(&bytes).0;
        if let Some(&existing) = self.by_digest.get(&digest) {
            debug!(seed_id = existing, "duplicate seed ignored");
            return existing;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.clock += 1;
        let coverage_edges: BTreeSet<EdgeId> = coverage_edges.into_iter().collect();
        for &edge in &coverage_edges {
            *self.edge_refs.entry(edge).or_default() += 1;
        }
        debug!(
            seed_id = id,
            len = bytes.len(),
            edges = coverage_edges.len(),
            new_edges,
            "seed added"
        );
        self.seeds.insert(
            id,
            Seed {
                id,
                bytes,
                coverage_edges,
                new_edges,
                exec_time,
                exec_count: 1,
                crashes_found: 0,
                times_fuzzed: 0,
                created_at: self.clock,
            },
        );
        self.by_digest.insert(digest, id);
        id
    }

    /// Adds a bootstrap seed with no recorded coverage.
    pub fn add_initial_seed(&mut self, bytes: Vec<u8>) -> SeedId {
        self.add_seed(bytes, std::iter::empty(), 0, Duration::ZERO)
    }

    /// Loads bootstrap seeds from files, or from the files directly inside the
    /// given directories (no recursion). Returns how many new seeds were added.
    pub fn load_initial_seeds(&mut self, seed_paths: &[PathBuf]) -> Result<usize, CorpusError> {
        let before = self.len();
        for path in seed_paths {
            if path.is_file() {
                let data = fs::read(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e))
                })?;
                self.add_initial_seed(data);
            } else if path.is_dir() {
                let entries = fs::read_dir(path).map_err(|e| {
                    CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path, e))
                })?;
                let mut files = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|e| {
                        CorpusError::Io(format!("Error reading entry in {:?}: {}", path, e))
                    })?;
                    let file_path = entry.path();
                    if file_path.is_file() {
                        files.push(file_path);
                    }
                }
                // Directory iteration order is platform-dependent.
                files.sort();
                for file_path in files {
                    let data = fs::read(&file_path).map_err(|e| {
                        CorpusError::Io(format!("Failed to read seed file {:?}: {}", file_path, e))
                    })?;
                    self.add_initial_seed(data);
                }
            } else {
                return Err(CorpusError::Io(format!(
                    "Seed path {:?} is neither a file nor a directory",
                    path
                )));
            }
        }
        Ok(self.len() - before)
    }

    pub fn get(&self, id: SeedId) -> Option<&Seed> {
        self.seeds.get(&id)
    }

    pub fn contains(&self, id: SeedId) -> bool {
        self.seeds.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Seeds in insertion order.
    pub fn seeds(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.values()
    }

    pub fn schedule(&self) -> &PowerSchedule {
        &self.schedule
    }

    /// Union of the coverage of every seed currently in the corpus.
    pub fn covered_edges(&self) -> BTreeSet<EdgeId> {
        self.edge_refs.keys().copied().collect()
    }

    /// Size of the covered union, without materializing it.
    pub fn covered_edge_count(&self) -> usize {
        self.edge_refs.len()
    }

    fn edge_universe(&self) -> u64 {
        self.total_known_edges.max(self.edge_refs.len() as u64)
    }

    /// Scheduling priority of a seed, in `[0, schedule.base()]`.
    pub fn energy(&self, id: SeedId) -> Result<u32, CorpusError> {
        if self.seeds.is_empty() {
            return Err(CorpusError::EmptyCorpus);
        }
        let seed = self.seeds.get(&id).ok_or(CorpusError::SeedNotFound(id))?;
        Ok(self.schedule.energy(seed, self.edge_universe()))
    }

    /// Picks a seed with probability proportional to its energy and marks it as
    /// fuzzed once more.
    ///
    /// Candidates are laid out by descending energy, then ascending
    /// `times_fuzzed`, then insertion order, so equal energies map onto the
    /// random draw deterministically. If all energies are zero the first seed of
    /// that ordering is returned.
    pub fn select_seed(&mut self, rng: &mut dyn RngCore) -> Result<SeedId, CorpusError> {
        if self.seeds.is_empty() {
            return Err(CorpusError::EmptyCorpus);
        }
        let universe = self.edge_universe();
        let mut ranked: Vec<(u32, u32, SeedId)> = self
            .seeds
            .values()
            .map(|seed| {
                (
                    self.schedule.energy(seed, universe),
                    seed.times_fuzzed,
                    seed.id,
                )
            })
            .collect();
        ranked.sort_by_key(|&(energy, fuzzed, id)| (Reverse(energy), fuzzed, id));

        let total: u64 = ranked.iter().map(|&(energy, _, _)| energy as u64).sum();
        let chosen = if total == 0 {
            ranked[0].2
        } else {
            let mut draw = rng.next_u64() % total;
            let mut picked = ranked[ranked.len() - 1].2;
            for &(energy, _, id) in &ranked {
                let energy = energy as u64;
                if draw < energy {
                    picked = id;
                    break;
                }
                draw -= energy;
            }
            picked
        };

        if let Some(seed) = self.seeds.get_mut(&chosen) {
            seed.times_fuzzed = seed.times_fuzzed.saturating_add(1);
        }
        Ok(chosen)
    }

    /// Folds one execution of a seed's descendant back into the seed's running
    /// statistics.
    pub fn record_execution(
        &mut self,
        id: SeedId,
        exec_time: Duration,
        crashed: bool,
    ) -> Result<(), CorpusError> {
        let seed = self
            .seeds
            .get_mut(&id)
            .ok_or(CorpusError::SeedNotFound(id))?;
        let runs = seed.exec_count as u128;
        let total_nanos = seed.exec_time.as_nanos() * runs + exec_time.as_nanos();
        let average = total_nanos / (runs + 1);
        seed.exec_time = Duration::from_nanos(u64::try_from(average).unwrap_or(u64::MAX));
        seed.exec_count = seed.exec_count.saturating_add(1);
        if crashed {
            seed.crashes_found = seed.crashes_found.saturating_add(1);
        }
        Ok(())
    }

    fn release_edges(&mut self, edges: &BTreeSet<EdgeId>) {
        for edge in edges {
            if let Some(count) = self.edge_refs.get_mut(edge) {
                *count -= 1;
                if *count == 0 {
                    self.edge_refs.remove(edge);
                }
            }
        }
    }

    /// Shrinks the corpus to a subset with identical total edge coverage.
    ///
    /// Greedy set cover: repeatedly keep the seed covering the most edges not yet
    /// covered (ties: shorter payload, then earlier `created_at`) until the
    /// corpus-wide union is covered. The kept set is computed first and applied
    /// in one step; if `cancel` fires during the computation, the corpus is left
    /// untouched and `MinimizationInterrupted` is returned.
    ///
    /// A corpus with no recorded coverage at all is left as is.
    pub fn minimize(&mut self, cancel: &CancellationToken) -> Result<MinimizeReport, CorpusError> {
        self.minimize_until(|| cancel.is_cancelled())
    }

    /// Greedy cover, polling `interrupted` before every seed evaluation.
    fn minimize_until(
        &mut self,
        mut interrupted: impl FnMut() -> bool,
    ) -> Result<MinimizeReport, CorpusError> {
        let universe = self.covered_edges();
        if universe.is_empty() {
            return Ok(MinimizeReport {
                kept: self.seeds.keys().copied().collect(),
                removed: 0,
                edges_covered: 0,
            });
        }

        let mut covered: BTreeSet<EdgeId> = BTreeSet::new();
        let mut kept: BTreeSet<SeedId> = BTreeSet::new();

        while covered.len() < universe.len() {
            let mut best: Option<(&Seed, usize)> = None;
            for seed in self.seeds.values() {
                if interrupted() {
                    info!(
                        kept = kept.len(),
                        "minimization interrupted, corpus unchanged"
                    );
                    return Err(CorpusError::MinimizationInterrupted);
                }
                if kept.contains(&seed.id) {
                    continue;
                }
                let gain = seed.coverage_edges.difference(&covered).count();
                if gain == 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((current, current_gain)) => {
                        compare_cover_candidates(seed, gain, current, current_gain)
                            == Ordering::Less
                    }
                };
                if better {
                    best = Some((seed, gain));
                }
            }
            match best {
                Some((seed, _)) => {
                    covered.extend(seed.coverage_edges.iter().copied());
                    kept.insert(seed.id);
                }
                // Unreachable while `universe` is the union of seed coverage.
                None => break,
            }
        }

        let dropped: Vec<SeedId> = self
            .seeds
            .keys()
            .copied()
            .filter(|id| !kept.contains(id))
            .collect();
        for id in &dropped {
            if let Some(seed) = self.seeds.remove(id) {
                self.release_edges(&seed.coverage_edges);
            }
        }
        self.by_digest.retain(|_, id| kept.contains(id));
        let removed = dropped.len();
        info!(
            kept = kept.len(),
            removed,
            edges = covered.len(),
            "corpus minimized"
        );
        Ok(MinimizeReport {
            kept,
            removed,
            edges_covered: covered.len(),
        })
    }
}

/// Orders two set-cover candidates; `Less` means `a` should be picked first.
fn compare_cover_candidates(a: &Seed, a_gain: usize, b: &Seed, b_gain: usize) -> Ordering {
    b_gain
        .cmp(&a_gain)
        .then_with(|| a.bytes.len().cmp(&b.bytes.len()))
        .then_with(|| a.created_at.cmp(&b.created_at))
}
