pub mod config;
pub mod corpus;
pub mod coverage;
pub mod defense;
pub mod engine;
pub mod executor;
pub mod feedback;
pub mod mutator;
pub mod oracle;
pub mod scheduler;
pub mod selector;

pub use config::{ConfigError, RefluxConfig};
pub use corpus::{CancellationToken, CorpusError, CorpusManager, MinimizeReport, Seed, SeedId};
pub use coverage::{CoverageMap, EdgeId};
pub use defense::{
    DefenseError, DefenseEvent, DefenseResult, DefenseRiskScorer, DefenseSignal, Severity, Verdict,
};
pub use engine::{Candidate, EngineError, EngineState, MutationEngine};
pub use executor::{EdgeTrace, Execution, Executor, InProcessExecutor};
pub use feedback::{
    EngineSnapshot, ExecutionResult, FeedbackEntry, FeedbackError, FeedbackOrchestrator,
    OrchestratorSettings, RoundPhase,
};
pub use mutator::{
    ExternalGenerator, ExternalHandle, GeneratorError, MutationStrategy, StrategyTable, StrategyTag,
};
pub use oracle::{Finding, Oracle, Telemetry, TelemetryOracle};
pub use scheduler::{EnergyWeights, PowerSchedule, ScheduleError};
pub use selector::{AdaptiveStrategySelector, EpsilonGreedy, SelectionPolicy, StrategyStats, Ucb1};
