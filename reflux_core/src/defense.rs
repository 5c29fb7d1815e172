use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, trace};

/// Default risk at or above which the verdict is `block`.
pub const DEFAULT_BLOCK_THRESHOLD: f64 = 0.85;
/// Default risk at or above which the verdict is `investigate`.
pub const DEFAULT_INVESTIGATE_THRESHOLD: f64 = 0.6;
/// Default share of the evasion score added on top of the base risk.
pub const DEFAULT_EVASION_WEIGHT: f64 = 0.25;

/// Slack for threshold comparisons so `0.5 + 0.1` still counts as `0.6`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefenseError {
    /// A severity label outside `info|low|medium|high|critical`.
    #[error("Invalid severity '{0}'")]
    InvalidSeverity(String),
    /// A confidence or score outside `[0, 1]` (or not a number).
    #[error("Invalid defense signal: {field} = {value} is outside [0, 1]")]
    InvalidSignal { field: &'static str, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_score(&self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = DefenseError;

    /// Parses a severity label, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(DefenseError::InvalidSeverity(s.to_string())),
        }
    }
}

/// The discrete defense decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Monitor,
    Investigate,
    Block,
    /// Raised by the feedback loop for repeated blocks, never by a single score.
    Escalate,
}

impl Verdict {
    pub const ALL: [Verdict; 4] = [
        Verdict::Monitor,
        Verdict::Investigate,
        Verdict::Block,
        Verdict::Escalate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Investigate => "investigate",
            Self::Block => "block",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw findings from a scanner or from execution telemetry. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefenseEvent {
    source: String,
    payload: JsonValue,
    tags: BTreeSet<String>,
}

impl DefenseEvent {
    pub fn new(
        source: impl Into<String>,
        payload: JsonValue,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            source: source.into(),
            payload,
            tags: tags.into_iter().collect(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }
}

/// Input to one scoring call.
#[derive(Debug, Clone, PartialEq)]
pub struct DefenseSignal {
    pub event: DefenseEvent,
    pub severity: Severity,
    pub confidence: f64,
    pub knowledge_score: Option<f64>,
    pub evasion_score: Option<f64>,
}

impl DefenseSignal {
    pub fn new(event: DefenseEvent, severity: Severity, confidence: f64) -> Self {
        Self {
            event,
            severity,
            confidence,
            knowledge_score: None,
            evasion_score: None,
        }
    }

    pub fn with_knowledge(mut self, score: f64) -> Self {
        self.knowledge_score = Some(score);
        self
    }

    pub fn with_evasion(mut self, score: f64) -> Self {
        self.evasion_score = Some(score);
        self
    }

    /// Rejects any confidence or score outside `[0, 1]`. Values are never clamped.
    pub fn validate(&self) -> Result<(), DefenseError> {
        check_unit("confidence", self.confidence)?;
        if let Some(knowledge) = self.knowledge_score {
            check_unit("knowledge_score", knowledge)?;
        }
        if let Some(evasion) = self.evasion_score {
            check_unit("evasion_score", evasion)?;
        }
        Ok(())
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), DefenseError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DefenseError::InvalidSignal { field, value })
    }
}

/// Output of one scoring call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefenseResult {
    pub risk_score: f64,
    pub verdict: Verdict,
    pub reasoning: String,
}

/// Configurable constants of the scoring rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringThresholds {
    pub block: f64,
    pub investigate: f64,
    pub evasion_weight: f64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            block: DEFAULT_BLOCK_THRESHOLD,
            investigate: DEFAULT_INVESTIGATE_THRESHOLD,
            evasion_weight: DEFAULT_EVASION_WEIGHT,
        }
    }
}

/// Lifecycle of a single scoring call. The scorer keeps no state between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringPhase {
    Idle,
    Scoring,
    Scored,
}

/// Which input decided the risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DominantFactor {
    Severity,
    Knowledge,
    Evasion,
}

impl DominantFactor {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Severity => "severity",
            Self::Knowledge => "knowledge",
            Self::Evasion => "evasion",
        }
    }
}

/// Turns a [`DefenseSignal`] into a risk score and a verdict.
///
/// `risk = min(1, max(severity, knowledge) + evasion * evasion_weight)`;
/// `risk >= block` is `block`, `risk >= investigate` is `investigate`,
/// anything lower is `monitor`. A pure function of the signal and thresholds.
#[derive(Debug, Clone, Default)]
pub struct DefenseRiskScorer {
    thresholds: ScoringThresholds,
}

impl DefenseRiskScorer {
    pub fn new(thresholds: ScoringThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ScoringThresholds {
        &self.thresholds
    }

    pub fn score(&self, signal: &DefenseSignal) -> Result<DefenseResult, DefenseError> {
        let mut phase = ScoringPhase::Idle;
        trace!(?phase, source = signal.event.source(), "scoring signal");

        signal.validate()?;
        phase = ScoringPhase::Scoring;
        trace!(?phase);

        let severity = signal.severity.as_score();
        let knowledge = signal.knowledge_score.unwrap_or(0.0);
        let evasion = signal.evasion_score.unwrap_or(0.0) * self.thresholds.evasion_weight;
        let base = severity.max(knowledge);
        let risk_score = (base + evasion).min(1.0);
        let verdict = self.verdict_for(risk_score);

        let mut dominant = if severity >= knowledge {
            DominantFactor::Severity
        } else {
            DominantFactor::Knowledge
        };
        if evasion > base {
            dominant = DominantFactor::Evasion;
        }
        let reasoning = format!(
            "{} dominant: severity={} ({:.2}), knowledge={:.2}, evasion=+{:.2} -> risk {:.2}",
            dominant.as_str(),
            signal.severity,
            severity,
            knowledge,
            evasion,
            risk_score
        );

        phase = ScoringPhase::Scored;
        debug!(?phase, risk_score, %verdict, "signal scored");
        Ok(DefenseResult {
            risk_score,
            verdict,
            reasoning,
        })
    }

    /// Maps a risk score to `monitor`, `investigate` or `block`. Both
    /// thresholds are inclusive lower bounds, compared exactly.
    pub fn verdict_for(&self, risk_score: f64) -> Verdict {
        if risk_score >= self.thresholds.block {
            Verdict::Block
        } else if risk_score >= self.thresholds.investigate {
            Verdict::Investigate
        } else {
            Verdict::Monitor
        }
    }
}
