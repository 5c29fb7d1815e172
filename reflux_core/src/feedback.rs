use crate::config::{ConfigError, RefluxConfig};
use crate::corpus::{CancellationToken, CorpusError, CorpusManager, MinimizeReport, SeedId};
use crate::coverage::{CoverageMap, EdgeId};
use crate::defense::{DefenseError, DefenseRiskScorer, Verdict};
use crate::engine::{Candidate, EngineError, EngineState, MutationEngine};
use crate::mutator::{DropCounts, ExternalHandle, StrategyTable, StrategyTag};
use crate::oracle::{Oracle, Telemetry, TelemetryOracle};
use parking_lot::Mutex;
use rand_core::RngCore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedbackError {
    /// The telemetry could not be turned into a valid signal; nothing was updated.
    #[error("Rejected defense signal: {0}")]
    Defense(#[from] DefenseError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Orchestrator is shut down")]
    ShutDown,
}

/// Where the fuzzing round currently stands. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Dispatch,
    AwaitResult,
    Update,
    ShutDown,
}

/// What an execution collaborator reports back for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Parent seed; `None` for payloads that did not come from the corpus.
    pub seed_id: Option<SeedId>,
    pub strategy: StrategyTag,
    pub fallback_from: Option<StrategyTag>,
    pub input: Vec<u8>,
    pub edges_hit: Vec<EdgeId>,
    pub crashed: bool,
    pub exec_time: Duration,
    pub telemetry: Telemetry,
}

impl ExecutionResult {
    /// Pairs a dispatched candidate with what happened when it ran.
    pub fn for_candidate(
        candidate: Candidate,
        edges_hit: Vec<EdgeId>,
        crashed: bool,
        exec_time: Duration,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            seed_id: Some(candidate.seed_id),
            strategy: candidate.strategy,
            fallback_from: candidate.fallback_from,
            input: candidate.bytes,
            edges_hit,
            crashed,
            exec_time,
            telemetry,
        }
    }
}

/// One processed execution, as published to reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackEntry {
    /// Position in the entry stream, starting at 0.
    pub sequence: u64,
    pub strategy_used: StrategyTag,
    pub fallback_from: Option<StrategyTag>,
    pub seed_id: Option<SeedId>,
    /// Id of the corpus entry created from this execution, if any.
    pub new_seed_id: Option<SeedId>,
    /// Number of edges seen for the first time.
    pub new_coverage: usize,
    pub crashed: bool,
    pub target: String,
    pub verdict: Verdict,
    pub risk_score: f64,
    pub reasoning: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyRate {
    pub strategy: StrategyTag,
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: Option<f64>,
}

/// Point-in-time view of the engine for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub corpus_size: usize,
    pub coverage_ratio: f64,
    pub known_edges: usize,
    pub strategies: Vec<StrategyRate>,
    pub verdicts: BTreeMap<Verdict, u64>,
    pub results: u64,
    pub crashes: u64,
    pub dropped: DropCounts,
    pub fallbacks: u64,
    pub minimize_due: bool,
    pub phase: RoundPhase,
}

/// Tunables of the feedback loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Blocks for one target/signature needed to escalate.
    pub escalation_count: usize,
    pub escalation_window: Duration,
    /// Flag minimization as due after this many results (`0` disables).
    pub minimize_every: u64,
    /// Flag minimization as due after this many new seeds (`0` disables).
    pub minimize_growth: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            escalation_count: 3,
            escalation_window: Duration::from_secs(60),
            minimize_every: 1_000,
            minimize_growth: 64,
        }
    }
}

/// Remembers recent `block` verdicts per target/signature.
#[derive(Debug)]
struct EscalationTracker {
    threshold: usize,
    window: Duration,
    blocks: HashMap<(String, String), VecDeque<Instant>>,
}

impl EscalationTracker {
    fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            blocks: HashMap::new(),
        }
    }

    /// Records a block at `now`; true once the window holds `threshold` blocks.
    ///
    /// Blocks older than the window are forgotten for every key, and keys with
    /// no recent block are dropped.
    fn observe_block(&mut self, key: (String, String), now: Instant) -> bool {
        let window = self.window;
        self.blocks.retain(|_, recent| {
            while recent
                .front()
                .is_some_and(|&at| now.saturating_duration_since(at) > window)
            {
                recent.pop_front();
            }
            !recent.is_empty()
        });
        let recent = self.blocks.entry(key).or_default();
        recent.push_back(now);
        recent.len() >= self.threshold
    }
}

#[derive(Debug)]
struct LoopState {
    phase: RoundPhase,
    entries: Vec<FeedbackEntry>,
    verdicts: BTreeMap<Verdict, u64>,
    escalation: EscalationTracker,
    results: u64,
    crashes: u64,
    results_since_minimize: u64,
    seeds_since_minimize: usize,
    minimize_due: bool,
}

/// Closes the loop between execution results, the corpus, the strategy
/// selector and defense scoring.
///
/// `on_execution_result` may be called from many threads; calls are applied
/// one at a time. Component locks are taken one at a time and never while
/// another component lock is held.
pub struct FeedbackOrchestrator {
    engine: MutationEngine,
    scorer: DefenseRiskScorer,
    oracle: Box<dyn Oracle>,
    settings: OrchestratorSettings,
    state: Mutex<LoopState>,
    shutdown: CancellationToken,
}

impl FeedbackOrchestrator {
    pub fn new(
        engine: MutationEngine,
        scorer: DefenseRiskScorer,
        oracle: Box<dyn Oracle>,
        settings: OrchestratorSettings,
    ) -> Self {
        let escalation =
            EscalationTracker::new(settings.escalation_count, settings.escalation_window);
        Self {
            engine,
            scorer,
            oracle,
            settings,
            state: Mutex::new(LoopState {
                phase: RoundPhase::Dispatch,
                entries: Vec::new(),
                verdicts: BTreeMap::new(),
                escalation,
                results: 0,
                crashes: 0,
                results_since_minimize: 0,
                seeds_since_minimize: 0,
                minimize_due: false,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Assembles every component from `config`.
    ///
    /// # Arguments
    /// * `config`: Validated before use.
    /// * `external`: Optional payload generator registered as the `External` strategy.
    pub fn from_config(
        config: &RefluxConfig,
        external: Option<ExternalHandle>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let total_edges = config.corpus.total_known_edges;
        let table = StrategyTable::standard(
            &config.strategy_params(),
            &config.protocol_profile()?,
            external,
        );
        let state = EngineState::new(
            CoverageMap::new(total_edges),
            CorpusManager::new(config.power_schedule()?, total_edges),
            table,
            config.selection_policy(),
        );
        let engine = MutationEngine::new(state, config.candidate_filter());
        Ok(Self::new(
            engine,
            DefenseRiskScorer::new(config.scoring_thresholds()),
            Box::new(TelemetryOracle::new(config.defense.crash_severity)),
            config.orchestrator_settings(),
        ))
    }

    pub fn state(&self) -> &EngineState {
        self.engine.state()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.lock().phase
    }

    /// Hands out the next batch of candidates to execute.
    pub fn dispatch(
        &self,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Candidate>, FeedbackError> {
        if self.shutdown.is_cancelled() {
            return Err(FeedbackError::ShutDown);
        }
        self.set_phase(RoundPhase::Dispatch);
        let batch = self.engine.next_batch(n, rng)?;
        self.set_phase(RoundPhase::AwaitResult);
        Ok(batch)
    }

    fn set_phase(&self, phase: RoundPhase) {
        let mut state = self.state.lock();
        if state.phase != RoundPhase::ShutDown {
            state.phase = phase;
        }
    }

    /// Applies one execution outcome to coverage, corpus and selector, scores
    /// it and appends the resulting entry.
    ///
    /// The defense signal is built and scored before any state is touched, so
    /// a rejected signal leaves everything as it was.
    ///
    /// # Returns
    /// The appended [`FeedbackEntry`], `FeedbackError::Defense` for invalid
    /// telemetry, or `FeedbackError::ShutDown` after [`Self::shutdown`].
    pub fn on_execution_result(
        &self,
        result: ExecutionResult,
    ) -> Result<FeedbackEntry, FeedbackError> {
        self.apply_result(result, Instant::now())
    }

    fn apply_result(
        &self,
        result: ExecutionResult,
        now: Instant,
    ) -> Result<FeedbackEntry, FeedbackError> {
        let mut state = self.state.lock();
        if self.shutdown.is_cancelled() {
            return Err(FeedbackError::ShutDown);
        }
        state.phase = RoundPhase::Update;

        let scored = self
            .oracle
            .signal_for(&result.input, result.crashed, &result.telemetry)
            .and_then(|signal| self.scorer.score(&signal));
        let scored = match scored {
            Ok(scored) => scored,
            Err(err) => {
                warn!(
                    error = %err,
                    strategy = %result.strategy,
                    "defense signal rejected"
                );
                state.phase = RoundPhase::Dispatch;
                return Err(err.into());
            }
        };

        let components = self.engine.state();
        let first_seen = components.coverage.lock().record_new(&result.edges_hit);
        let is_new = !first_seen.is_empty();

        let mut new_seed_id = None;
        if is_new {
            let mut corpus = components.corpus.lock();
            let before = corpus.len();
            let id = corpus.add_seed(
                result.input.clone(),
                result.edges_hit.iter().copied(),
                first_seen.len(),
                result.exec_time,
            );
            if corpus.len() > before {
                state.seeds_since_minimize += 1;
                info!(
                    seed_id = id,
                    new_edges = first_seen.len(),
                    strategy = %result.strategy,
                    "new seed"
                );
                new_seed_id = Some(id);
            }
        } else if result.crashed {
            if let Some(parent) = result.seed_id {
                let mut corpus = components.corpus.lock();
                if corpus
                    .record_execution(parent, result.exec_time, true)
                    .is_err()
                {
                    debug!(seed_id = parent, "crash credited to a seed no longer in the corpus");
                }
            }
        }

        {
            let mut selector = components.selector.lock();
            selector.record_outcome(result.strategy, is_new || result.crashed);
            if let Some(failed) = result.fallback_from {
                selector.record_outcome(failed, false);
            }
        }

        let mut verdict = scored.verdict;
        if verdict == Verdict::Block {
            let key = (
                result.telemetry.target.clone(),
                result.telemetry.signature.clone().unwrap_or_default(),
            );
            if state.escalation.observe_block(key, now) {
                verdict = Verdict::Escalate;
                warn!(
                    target_system = %result.telemetry.target,
                    risk = scored.risk_score,
                    "repeated blocks, escalating"
                );
            }
        }

        state.results += 1;
        if result.crashed {
            state.crashes += 1;
        }
        state.results_since_minimize += 1;
        *state.verdicts.entry(verdict).or_default() += 1;
        if !state.minimize_due && self.minimize_threshold_reached(&state) {
            debug!("corpus minimization due");
            state.minimize_due = true;
        }

        let entry = FeedbackEntry {
            sequence: state.entries.len() as u64,
            strategy_used: result.strategy,
            fallback_from: result.fallback_from,
            seed_id: result.seed_id,
            new_seed_id,
            new_coverage: first_seen.len(),
            crashed: result.crashed,
            target: result.telemetry.target,
            verdict,
            risk_score: scored.risk_score,
            reasoning: scored.reasoning,
            timestamp_ms: unix_millis(),
        };
        state.entries.push(entry.clone());
        state.phase = RoundPhase::Dispatch;
        Ok(entry)
    }

    fn minimize_threshold_reached(&self, state: &LoopState) -> bool {
        let by_results = self.settings.minimize_every > 0
            && state.results_since_minimize >= self.settings.minimize_every;
        let by_growth = self.settings.minimize_growth > 0
            && state.seeds_since_minimize >= self.settings.minimize_growth;
        by_results || by_growth
    }

    pub fn minimize_due(&self) -> bool {
        self.state.lock().minimize_due
    }

    /// Minimizes the corpus if the loop flagged it as due; otherwise a no-op.
    pub fn run_maintenance(&self) -> Result<Option<MinimizeReport>, FeedbackError> {
        if !self.minimize_due() {
            return Ok(None);
        }
        self.minimize_now().map(Some)
    }

    /// Minimizes the corpus now. Aborts, leaving the corpus unchanged, if
    /// [`Self::shutdown`] is called meanwhile.
    pub fn minimize_now(&self) -> Result<MinimizeReport, FeedbackError> {
        let report = self
            .engine
            .state()
            .corpus
            .lock()
            .minimize(&self.shutdown)?;
        let mut state = self.state.lock();
        state.minimize_due = false;
        state.results_since_minimize = 0;
        state.seeds_since_minimize = 0;
        Ok(report)
    }

    /// Stops the loop: a running minimization is cancelled and every later
    /// result or dispatch is rejected.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.state.lock().phase = RoundPhase::ShutDown;
        info!("feedback loop shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Entries appended at or after position `cursor`.
    pub fn entries_since(&self, cursor: usize) -> Vec<FeedbackEntry> {
        let state = self.state.lock();
        state.entries.get(cursor..).unwrap_or_default().to_vec()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let (verdicts, results, crashes, minimize_due, phase) = {
            let state = self.state.lock();
            (
                state.verdicts.clone(),
                state.results,
                state.crashes,
                state.minimize_due,
                state.phase,
            )
        };
        let components = self.engine.state();
        let (coverage_ratio, known_edges) = {
            let coverage = components.coverage.lock();
            (coverage.coverage_ratio(), coverage.known_edges())
        };
        let corpus_size = components.corpus.lock().len();
        let strategies = components
            .selector
            .lock()
            .stats()
            .iter()
            .map(|(tag, stats)| StrategyRate {
                strategy: *tag,
                attempts: stats.attempts,
                successes: stats.successes,
                success_rate: stats.success_rate(),
            })
            .collect();
        EngineSnapshot {
            corpus_size,
            coverage_ratio,
            known_edges,
            strategies,
            verdicts,
            results,
            crashes,
            dropped: self.engine.drop_counts(),
            fallbacks: self.engine.fallback_count(),
            minimize_due,
            phase,
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defense::Severity;
    use crate::mutator::test_utils::{OfflineGenerator, modbus_request};
    use crate::mutator::CandidateFilter;
    use crate::oracle::Finding;
    use crate::selector::EpsilonGreedy;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;

    fn orchestrator(settings: OrchestratorSettings) -> FeedbackOrchestrator {
        let config = RefluxConfig::default();
        let table = StrategyTable::standard(
            &config.strategy_params(),
            &config.protocol_profile().unwrap(),
            None,
        );
        let state = EngineState::new(
            CoverageMap::new(16),
            CorpusManager::default(),
            table,
            Box::new(EpsilonGreedy::default()),
        );
        FeedbackOrchestrator::new(
            MutationEngine::new(state, CandidateFilter::new(1024)),
            DefenseRiskScorer::default(),
            Box::new(TelemetryOracle::default()),
            settings,
        )
    }

    fn result(seed_id: Option<SeedId>, edges: &[EdgeId], crashed: bool) -> ExecutionResult {
        ExecutionResult {
            seed_id,
            strategy: StrategyTag::BitFlip,
            fallback_from: None,
            input: modbus_request(),
            edges_hit: edges.to_vec(),
            crashed,
            exec_time: Duration::from_millis(2),
            telemetry: Telemetry {
                target: "plc-1".to_string(),
                ..Telemetry::default()
            },
        }
    }

    fn blocking(mut result: ExecutionResult) -> ExecutionResult {
        result.telemetry.findings.push(Finding {
            source: "ids".to_string(),
            severity: "high".to_string(),
            detail: "write to protected coil".to_string(),
            tags: vec![],
        });
        result.telemetry.knowledge_score = Some(0.9);
        result
    }

    #[test]
    fn new_coverage_adds_a_seed_and_counts_success() {
        let orch = orchestrator(OrchestratorSettings::default());
        let entry = orch.on_execution_result(result(None, &[1, 2], false)).unwrap();
        assert_eq!(entry.new_coverage, 2);
        assert!(entry.new_seed_id.is_some());
        assert_eq!(entry.verdict, Verdict::Monitor);
        assert_eq!(orch.state().corpus.lock().len(), 1);
        let stats = orch
            .state()
            .selector
            .lock()
            .stats_for(StrategyTag::BitFlip)
            .unwrap();
        assert_eq!((stats.attempts, stats.successes), (1, 1));

        let again = orch.on_execution_result(result(None, &[1, 2], false)).unwrap();
        assert_eq!(again.new_coverage, 0);
        assert_eq!(again.new_seed_id, None);
        assert_eq!(again.sequence, 1);
        assert_eq!(orch.state().corpus.lock().len(), 1);
    }

    #[test]
    fn crash_without_new_coverage_updates_parent() {
        let orch = orchestrator(OrchestratorSettings::default());
        let parent = orch.state().corpus.lock().add_initial_seed(b"seed".to_vec());
        orch.on_execution_result(result(None, &[7], false)).unwrap();
        let entry = orch
            .on_execution_result(result(Some(parent), &[7], true))
            .unwrap();
        assert!(entry.crashed);
        assert_eq!(entry.verdict, Verdict::Investigate);
        let seed = orch.state().corpus.lock().get(parent).cloned().unwrap();
        assert_eq!(seed.crashes_found, 1);
        assert_eq!(seed.exec_count, 2);
    }

    #[test]
    fn invalid_telemetry_changes_nothing() {
        let orch = orchestrator(OrchestratorSettings::default());
        let mut bad = result(None, &[1, 2, 3], false);
        bad.telemetry.evasion_score = Some(2.0);
        assert!(matches!(
            orch.on_execution_result(bad),
            Err(FeedbackError::Defense(DefenseError::InvalidSignal { .. }))
        ));
        assert_eq!(orch.state().coverage.lock().known_edges(), 0);
        assert!(orch.state().corpus.lock().is_empty());
        assert!(orch.entries_since(0).is_empty());
        assert_eq!(orch.snapshot().results, 0);
    }

    #[test]
    fn third_block_for_same_target_escalates() {
        let orch = orchestrator(OrchestratorSettings::default());
        let verdicts: Vec<Verdict> = (0..3)
            .map(|_| {
                orch.on_execution_result(blocking(result(None, &[], false)))
                    .unwrap()
                    .verdict
            })
            .collect();
        assert_eq!(
            verdicts,
            vec![Verdict::Block, Verdict::Block, Verdict::Escalate]
        );
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.verdicts.get(&Verdict::Block), Some(&2));
        assert_eq!(snapshot.verdicts.get(&Verdict::Escalate), Some(&1));
    }

    #[test]
    fn blocks_for_other_targets_do_not_escalate() {
        let orch = orchestrator(OrchestratorSettings::default());
        for target in ["a", "b", "c"] {
            let mut r = blocking(result(None, &[], false));
            r.telemetry.target = target.to_string();
            assert_eq!(orch.on_execution_result(r).unwrap().verdict, Verdict::Block);
        }
    }

    #[test]
    fn escalation_window_expires() {
        let mut tracker = EscalationTracker::new(3, Duration::from_secs(60));
        let key = || ("plc-1".to_string(), String::new());
        let start = Instant::now();
        assert!(!tracker.observe_block(key(), start));
        assert!(!tracker.observe_block(key(), start + Duration::from_secs(30)));
        assert!(!tracker.observe_block(key(), start + Duration::from_secs(120)));
        assert!(!tracker.observe_block(key(), start + Duration::from_secs(121)));
        assert!(tracker.observe_block(key(), start + Duration::from_secs(122)));
    }

    #[test]
    fn escalation_forgets_targets_without_recent_blocks() {
        let mut tracker = EscalationTracker::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for signature in ["overrun at 0x10", "overrun at 0x20", "overrun at 0x30"] {
            tracker.observe_block(("plc-1".to_string(), signature.to_string()), start);
        }
        assert_eq!(tracker.blocks.len(), 3);

        let latest = ("plc-1".to_string(), "overrun at 0x40".to_string());
        tracker.observe_block(latest.clone(), start + Duration::from_secs(90));
        assert_eq!(tracker.blocks.len(), 1);
        assert!(tracker.blocks.contains_key(&latest));
    }

    #[test]
    fn fallback_charges_the_failed_strategy() {
        let orch = orchestrator(OrchestratorSettings::default());
        let mut r = result(None, &[9], false);
        r.strategy = StrategyTag::Hybrid;
        r.fallback_from = Some(StrategyTag::External);
        orch.on_execution_result(r).unwrap();
        let selector = orch.state().selector.lock();
        assert_eq!(selector.stats_for(StrategyTag::Hybrid).unwrap().successes, 1);
        // External is not registered without a generator, so it is not tracked.
        assert_eq!(selector.stats_for(StrategyTag::External), None);
    }

    #[test]
    fn fallback_is_recorded_when_external_is_registered() {
        let mut config = RefluxConfig::default();
        config.corpus.total_known_edges = 16;
        let external = ExternalHandle::new(Arc::new(OfflineGenerator));
        let orch = FeedbackOrchestrator::from_config(&config, Some(external)).unwrap();
        let mut r = result(None, &[9], false);
        r.strategy = StrategyTag::Hybrid;
        r.fallback_from = Some(StrategyTag::External);
        orch.on_execution_result(r).unwrap();
        let stats = orch
            .state()
            .selector
            .lock()
            .stats_for(StrategyTag::External)
            .unwrap();
        assert_eq!((stats.attempts, stats.successes), (1, 0));
    }

    #[test]
    fn minimization_becomes_due_and_runs() {
        let orch = orchestrator(OrchestratorSettings {
            minimize_every: 0,
            minimize_growth: 2,
            ..OrchestratorSettings::default()
        });
        let mut first = result(None, &[1, 2], false);
        first.input = b"first".to_vec();
        orch.on_execution_result(first).unwrap();
        assert_eq!(orch.run_maintenance().unwrap(), None);
        let mut subset = result(None, &[1, 2, 3], false);
        subset.input = b"second".to_vec();
        orch.on_execution_result(subset).unwrap();
        assert!(orch.minimize_due());

        let report = orch.run_maintenance().unwrap().unwrap();
        assert_eq!(report.kept.len(), 1);
        assert_eq!(report.removed, 1);
        assert!(!orch.minimize_due());
        assert_eq!(orch.snapshot().corpus_size, 1);
    }

    #[test]
    fn shutdown_is_terminal() {
        let orch = orchestrator(OrchestratorSettings::default());
        orch.state().corpus.lock().add_initial_seed(modbus_request());
        let mut covering = result(None, &[1], false);
        covering.input = b"covering".to_vec();
        orch.on_execution_result(covering).unwrap();
        orch.shutdown();
        assert_eq!(orch.phase(), RoundPhase::ShutDown);
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(orch.dispatch(1, &mut rng), Err(FeedbackError::ShutDown));
        assert_eq!(
            orch.on_execution_result(result(None, &[1], false)),
            Err(FeedbackError::ShutDown)
        );
        assert_eq!(
            orch.minimize_now(),
            Err(FeedbackError::Corpus(CorpusError::MinimizationInterrupted))
        );
        assert_eq!(orch.state().corpus.lock().len(), 2);
    }

    #[test]
    fn dispatch_then_feedback_cycles_phases() {
        let orch = orchestrator(OrchestratorSettings::default());
        orch.state().corpus.lock().add_initial_seed(modbus_request());
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let batch = orch.dispatch(4, &mut rng).unwrap();
        assert_eq!(orch.phase(), RoundPhase::AwaitResult);
        let distinct: std::collections::HashSet<Vec<u8>> = batch
            .iter()
            .map(|c| c.bytes.clone())
            .filter(|bytes| *bytes != modbus_request())
            .collect();
        for (i, candidate) in batch.into_iter().enumerate() {
            let edges = vec![100 + i as EdgeId];
            let r = ExecutionResult::for_candidate(
                candidate,
                edges,
                false,
                Duration::from_micros(50),
                Telemetry::default(),
            );
            orch.on_execution_result(r).unwrap();
        }
        assert_eq!(orch.phase(), RoundPhase::Dispatch);
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.results, 4);
        assert_eq!(snapshot.corpus_size, 1 + distinct.len());
        assert_eq!(orch.entries_since(2).len(), 2);
        assert!(orch.entries_since(10).is_empty());
    }

    #[test]
    fn crash_severity_is_configurable() {
        let mut config = RefluxConfig::default();
        config.defense.crash_severity = Severity::Critical;
        let orch = FeedbackOrchestrator::from_config(&config, None).unwrap();
        let entry = orch.on_execution_result(result(None, &[1], true)).unwrap();
        assert_eq!(entry.verdict, Verdict::Block);
    }
}
