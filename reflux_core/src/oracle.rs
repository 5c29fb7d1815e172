use crate::defense::{DefenseError, DefenseEvent, DefenseSignal, Severity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

/// Event source used when findings come from more than one scanner, or none.
pub const TELEMETRY_SOURCE: &str = "execution_telemetry";

/// One finding reported by a scanning collaborator about an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub source: String,
    /// Severity label; parsed when the signal is built.
    pub severity: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Telemetry attached to an execution result by the execution and defense
/// collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// The system under test. Escalation is tracked per target.
    pub target: String,
    /// Narrows escalation tracking within a target, e.g. a crash signature.
    pub signature: Option<String>,
    pub findings: Vec<Finding>,
    pub knowledge_score: Option<f64>,
    pub evasion_score: Option<f64>,
    /// Confidence in the telemetry; absent means `1.0`.
    pub confidence: Option<f64>,
}

/// An `Oracle` turns the outcome of an execution into a [`DefenseSignal`].
pub trait Oracle: Send + Sync {
    /// # Arguments
    /// * `input`: The executed payload.
    /// * `crashed`: Whether the target crashed on it.
    /// * `telemetry`: Findings and upstream scores for the execution.
    ///
    /// # Returns
    /// The signal to score, or `DefenseError::InvalidSeverity` for a finding
    /// with an unknown severity label.
    fn signal_for(
        &self,
        input: &[u8],
        crashed: bool,
        telemetry: &Telemetry,
    ) -> Result<DefenseSignal, DefenseError>;
}

/// Builds signals from crash status and scanner findings.
///
/// Severity is the highest of the findings' severities and, for a crash,
/// `crash_severity`. Without either it is `info`.
#[derive(Debug, Clone)]
pub struct TelemetryOracle {
    crash_severity: Severity,
}

impl Default for TelemetryOracle {
    fn default() -> Self {
        Self::new(Severity::High)
    }
}

impl TelemetryOracle {
    pub fn new(crash_severity: Severity) -> Self {
        Self { crash_severity }
    }

    pub fn crash_severity(&self) -> Severity {
        self.crash_severity
    }
}

impl Oracle for TelemetryOracle {
    fn signal_for(
        &self,
        input: &[u8],
        crashed: bool,
        telemetry: &Telemetry,
    ) -> Result<DefenseSignal, DefenseError> {
        let mut severity = if crashed {
            self.crash_severity
        } else {
            Severity::Info
        };
        let mut tags = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for finding in &telemetry.findings {
            severity = severity.max(finding.severity.parse::<Severity>()?);
            sources.insert(finding.source.as_str());
            tags.extend(finding.tags.iter().cloned());
        }
        if crashed {
            tags.insert("crash".to_string());
        }

        let source = match (sources.len(), sources.first()) {
            (1, Some(only)) => only.to_string(),
            _ => TELEMETRY_SOURCE.to_string(),
        };
        let details: Vec<&str> = telemetry
            .findings
            .iter()
            .map(|f| f.detail.as_str())
            .collect();
        let payload = json!({
            "target": telemetry.target,
            "signature": telemetry.signature,
            "crashed": crashed,
            "input_hash": format!("{:x}", md5::compute(input)),
            "input_len": input.len(),
            "findings": details,
        });

        let event = DefenseEvent::new(source, payload, tags);
        let mut signal = DefenseSignal::new(event, severity, telemetry.confidence.unwrap_or(1.0));
        signal.knowledge_score = telemetry.knowledge_score;
        signal.evasion_score = telemetry.evasion_score;
        Ok(signal)
    }
}
