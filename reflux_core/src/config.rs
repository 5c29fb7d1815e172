use crate::defense::{ScoringThresholds, Severity};
use crate::feedback::OrchestratorSettings;
use crate::mutator::{CandidateFilter, FieldSpec, ProtocolProfile, StrategyParams};
use crate::scheduler::{EnergyWeights, PowerSchedule, ScheduleError};
use crate::selector::{EpsilonGreedy, SelectionPolicy, Ucb1};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix marking a dictionary token written as hex.
const HEX_TOKEN_PREFIX: &str = "hex:";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid dictionary token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub rng_seed: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u64,
}

fn default_batch_size() -> usize {
    32
}
pub fn default_max_rounds() -> u64 {
    1_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            rng_seed: 0,
            max_rounds: default_max_rounds(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_energy_base")]
    pub energy_base: u32,
    #[serde(default)]
    pub weights: EnergyWeights,
    /// Size of the target's edge universe, `0` when unknown.
    #[serde(default)]
    pub total_known_edges: u64,
    #[serde(default = "default_minimize_every")]
    pub minimize_every: u64,
    #[serde(default = "default_minimize_growth")]
    pub minimize_growth: usize,
    #[serde(default)]
    pub initial_seed_paths: Vec<PathBuf>,
}

fn default_energy_base() -> u32 {
    crate::scheduler::DEFAULT_ENERGY_BASE
}
fn default_minimize_every() -> u64 {
    1_000
}
fn default_minimize_growth() -> usize {
    64
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            energy_base: default_energy_base(),
            weights: EnergyWeights::default(),
            total_known_edges: 0,
            minimize_every: default_minimize_every(),
            minimize_growth: default_minimize_growth(),
            initial_seed_paths: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    EpsilonGreedy,
    Ucb1,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    #[serde(default = "default_max_candidate_size")]
    pub max_candidate_size: usize,
    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_ucb_exploration")]
    pub ucb_exploration: f64,
    #[serde(default = "default_hybrid_min_depth")]
    pub hybrid_min_depth: usize,
    #[serde(default = "default_hybrid_max_depth")]
    pub hybrid_max_depth: usize,
    #[serde(default = "default_max_block")]
    pub max_block: usize,
    #[serde(default = "default_offsets")]
    pub arithmetic_offsets: usize,
    #[serde(default = "default_offsets")]
    pub interesting_offsets: usize,
    #[serde(default = "default_splices")]
    pub dictionary_splices: usize,
    #[serde(default = "default_splices")]
    pub protocol_mutations: usize,
}

fn default_max_candidate_size() -> usize {
    4096
}
fn default_epsilon() -> f64 {
    crate::selector::DEFAULT_EPSILON
}
fn default_ucb_exploration() -> f64 {
    crate::selector::DEFAULT_UCB_EXPLORATION
}
fn default_hybrid_min_depth() -> usize {
    2
}
fn default_hybrid_max_depth() -> usize {
    3
}
fn default_max_block() -> usize {
    32
}
fn default_offsets() -> usize {
    4
}
fn default_splices() -> usize {
    2
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            max_candidate_size: default_max_candidate_size(),
            policy: PolicyKind::default(),
            epsilon: default_epsilon(),
            ucb_exploration: default_ucb_exploration(),
            hybrid_min_depth: default_hybrid_min_depth(),
            hybrid_max_depth: default_hybrid_max_depth(),
            max_block: default_max_block(),
            arithmetic_offsets: default_offsets(),
            interesting_offsets: default_offsets(),
            dictionary_splices: default_splices(),
            protocol_mutations: default_splices(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DefenseSettings {
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
    #[serde(default = "default_investigate_threshold")]
    pub investigate_threshold: f64,
    #[serde(default = "default_evasion_weight")]
    pub evasion_weight: f64,
    #[serde(default = "default_escalation_count")]
    pub escalation_count: usize,
    #[serde(default = "default_escalation_window_ms")]
    pub escalation_window_ms: u64,
    #[serde(default = "default_crash_severity")]
    pub crash_severity: Severity,
}

fn default_block_threshold() -> f64 {
    crate::defense::DEFAULT_BLOCK_THRESHOLD
}
fn default_investigate_threshold() -> f64 {
    crate::defense::DEFAULT_INVESTIGATE_THRESHOLD
}
fn default_evasion_weight() -> f64 {
    crate::defense::DEFAULT_EVASION_WEIGHT
}
fn default_escalation_count() -> usize {
    3
}
fn default_escalation_window_ms() -> u64 {
    60_000
}
fn default_crash_severity() -> Severity {
    Severity::High
}

impl Default for DefenseSettings {
    fn default() -> Self {
        Self {
            block_threshold: default_block_threshold(),
            investigate_threshold: default_investigate_threshold(),
            evasion_weight: default_evasion_weight(),
            escalation_count: default_escalation_count(),
            escalation_window_ms: default_escalation_window_ms(),
            crash_severity: default_crash_severity(),
        }
    }
}

/// Protocol knowledge for the `Dictionary` and `ProtocolAware` strategies.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProtocolSettings {
    #[serde(default)]
    pub name: String,
    /// Plain-text tokens, or `hex:`-prefixed hex strings for binary tokens.
    #[serde(default)]
    pub dictionary: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RefluxConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub defense: DefenseSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
}

impl RefluxConfig {
    /// Reads, parses and validates a TOML config file.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: RefluxConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    /// Checks every value the components would otherwise reject or misuse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.batch_size == 0 {
            return Err(invalid("engine.batch-size", "must be at least 1"));
        }
        if self.mutation.max_candidate_size == 0 {
            return Err(invalid("mutation.max-candidate-size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.mutation.epsilon) {
            return Err(invalid("mutation.epsilon", "must be within [0, 1]"));
        }
        if !self.mutation.ucb_exploration.is_finite() || self.mutation.ucb_exploration < 0.0 {
            return Err(invalid(
                "mutation.ucb-exploration",
                "must be finite and non-negative",
            ));
        }
        let m = &self.mutation;
        if m.hybrid_min_depth == 0 || m.hybrid_min_depth > m.hybrid_max_depth {
            return Err(invalid(
                "mutation.hybrid-min-depth",
                format!(
                    "need 1 <= min ({}) <= max ({})",
                    m.hybrid_min_depth, m.hybrid_max_depth
                ),
            ));
        }

        let d = &self.defense;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(d.block_threshold) || !in_unit(d.investigate_threshold) {
            return Err(invalid("defense", "thresholds must be within [0, 1]"));
        }
        if d.investigate_threshold > d.block_threshold {
            return Err(invalid(
                "defense.investigate-threshold",
                "must not exceed block-threshold",
            ));
        }
        if !d.evasion_weight.is_finite() || d.evasion_weight < 0.0 {
            return Err(invalid(
                "defense.evasion-weight",
                "must be finite and non-negative",
            ));
        }
        if d.escalation_count == 0 {
            return Err(invalid("defense.escalation-count", "must be at least 1"));
        }

        for field in &self.protocol.fields {
            if !matches!(field.width, 1 | 2 | 4) {
                return Err(invalid(
                    "protocol.fields",
                    format!(
                        "field '{}' has width {}, expected 1, 2 or 4",
                        field.name, field.width
                    ),
                ));
            }
        }
        self.power_schedule()?;
        self.protocol_profile()?;
        Ok(())
    }

    pub fn power_schedule(&self) -> Result<PowerSchedule, ConfigError> {
        Ok(PowerSchedule::new(
            self.corpus.energy_base,
            self.corpus.weights,
        )?)
    }

    pub fn strategy_params(&self) -> StrategyParams {
        let m = &self.mutation;
        StrategyParams {
            max_block: m.max_block,
            arithmetic_offsets: m.arithmetic_offsets,
            interesting_offsets: m.interesting_offsets,
            dictionary_splices: m.dictionary_splices,
            protocol_mutations: m.protocol_mutations,
            hybrid_min_depth: m.hybrid_min_depth,
            hybrid_max_depth: m.hybrid_max_depth,
        }
    }

    pub fn protocol_profile(&self) -> Result<ProtocolProfile, ConfigError> {
        let dictionary = self
            .protocol
            .dictionary
            .iter()
            .map(|token| parse_token(token))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProtocolProfile {
            name: self.protocol.name.clone(),
            dictionary,
            fields: self.protocol.fields.clone(),
        })
    }

    pub fn selection_policy(&self) -> Box<dyn SelectionPolicy> {
        match self.mutation.policy {
            PolicyKind::EpsilonGreedy => Box::new(EpsilonGreedy::new(self.mutation.epsilon)),
            PolicyKind::Ucb1 => Box::new(Ucb1::new(self.mutation.ucb_exploration)),
        }
    }

    pub fn candidate_filter(&self) -> CandidateFilter {
        CandidateFilter::new(self.mutation.max_candidate_size)
    }

    pub fn scoring_thresholds(&self) -> ScoringThresholds {
        ScoringThresholds {
            block: self.defense.block_threshold,
            investigate: self.defense.investigate_threshold,
            evasion_weight: self.defense.evasion_weight,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            escalation_count: self.defense.escalation_count,
            escalation_window: Duration::from_millis(self.defense.escalation_window_ms),
            minimize_every: self.corpus.minimize_every,
            minimize_growth: self.corpus.minimize_growth,
        }
    }
}

fn parse_token(token: &str) -> Result<Vec<u8>, ConfigError> {
    let bytes = match token.strip_prefix(HEX_TOKEN_PREFIX) {
        Some(encoded) => hex::decode(encoded).map_err(|e| ConfigError::InvalidToken {
            token: token.to_string(),
            reason: e.to_string(),
        })?,
        None => token.as_bytes().to_vec(),
    };
    if bytes.is_empty() {
        return Err(ConfigError::InvalidToken {
            token: token.to_string(),
            reason: "token is empty".to_string(),
        });
    }
    Ok(bytes)
}
