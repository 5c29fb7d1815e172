use reflux_core::config::{ProtocolSettings, RefluxConfig};
use reflux_core::corpus::CorpusError;
use reflux_core::defense::Verdict;
use reflux_core::executor::{EdgeTrace, Execution, Executor, InProcessExecutor};
use reflux_core::feedback::{EngineSnapshot, ExecutionResult, FeedbackError, FeedbackOrchestrator};
use reflux_core::mutator::{FieldKind, FieldSpec};
use reflux_core::oracle::{Finding, Telemetry};

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const TARGET_NAME: &str = "toy-plc";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Number of dispatch rounds to run.
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(short, long)]
    batch_size: Option<usize>,
    /// Seed for the fuzzer's random number generator.
    #[clap(short, long)]
    seed: Option<u64>,
    /// Print the final snapshot as JSON.
    #[clap(long)]
    json: bool,
}

/// A small Modbus/TCP-like request handler with a planted overrun.
fn toy_plc(data: &[u8], trace: &mut EdgeTrace) {
    trace.visit(0x01);
    if data.len() < 8 {
        return;
    }
    trace.visit(0x02);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    if length != data.len() - 6 {
        trace.visit(0x03);
        return;
    }
    trace.visit(0x04);
    let function = data[7];
    trace.visit(0x100 + function as u64);
    match function {
        0x03 | 0x04 if data.len() >= 12 => {
            let quantity = u16::from_be_bytes([data[10], data[11]]);
            match quantity {
                0 => trace.visit(0x10),
                1..=125 => trace.visit(0x11),
                _ => trace.visit(0x12),
            }
        }
        0x05 | 0x06 if data.len() >= 12 => {
            let address = u16::from_be_bytes([data[8], data[9]]);
            if address > 0x270F {
                trace.visit(0x20);
            } else {
                trace.visit(0x21);
            }
        }
        0x0F | 0x10 if data.len() >= 13 => {
            trace.visit(0x30);
            let byte_count = data[12] as usize;
            if byte_count > data.len() - 13 {
                trace.visit(0x31);
                if byte_count > 200 {
                    panic!("write-multiple byte count overruns frame");
                }
            }
        }
        _ => trace.visit(0x40),
    }
}

/// What a network sensor in front of the toy PLC would report.
fn telemetry_for(input: &[u8], execution: &Execution) -> Telemetry {
    let mut findings = Vec::new();
    if let Some(&function) = input.get(7) {
        if matches!(function, 0x05 | 0x06 | 0x0F | 0x10) {
            findings.push(Finding {
                source: "toy_ids".to_string(),
                severity: "medium".to_string(),
                detail: format!("write function 0x{function:02x}"),
                tags: vec!["write".to_string()],
            });
        }
    }
    // A non-zero protocol id slips past naive filters.
    let evasion = match input.get(2..4) {
        Some([0, 0]) | None => 0.0,
        Some(_) => 0.4,
    };
    Telemetry {
        target: TARGET_NAME.to_string(),
        signature: execution.crash_message.clone(),
        findings,
        knowledge_score: None,
        evasion_score: Some(evasion),
        confidence: None,
    }
}

fn modbus_protocol() -> ProtocolSettings {
    ProtocolSettings {
        name: "modbus-tcp".to_string(),
        dictionary: vec!["hex:0000".to_string(), "hex:ffff".to_string(), "hex:270f".to_string()],
        fields: vec![
            FieldSpec {
                name: "length".to_string(),
                offset: 4,
                width: 2,
                big_endian: true,
                kind: FieldKind::Length { from: 6 },
            },
            FieldSpec {
                name: "function".to_string(),
                offset: 7,
                width: 1,
                big_endian: true,
                kind: FieldKind::FunctionCode {
                    valid: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10],
                },
            },
            FieldSpec {
                name: "address".to_string(),
                offset: 8,
                width: 2,
                big_endian: true,
                kind: FieldKind::Address { max: Some(0x270F) },
            },
        ],
    }
}

fn default_seeds() -> Vec<Vec<u8>> {
    vec![
        // Read holding registers 107..110.
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03],
        // Write single register 1 = 3.
        vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x06, 0x00, 0x01, 0x00, 0x03],
    ]
}

fn print_snapshot(snapshot: &EngineSnapshot, elapsed_secs: f64) {
    println!("Fuzz loop finished in {elapsed_secs:.2}s ({:?}).", snapshot.phase);
    println!(
        "Executions: {}, Crashes: {}, Corpus Size: {}, Edges: {} (coverage {:.1}%)",
        snapshot.results,
        snapshot.crashes,
        snapshot.corpus_size,
        snapshot.known_edges,
        snapshot.coverage_ratio * 100.0
    );
    println!(
        "Dropped candidates: {} empty, {} oversized; external fallbacks: {}",
        snapshot.dropped.empty, snapshot.dropped.oversized, snapshot.fallbacks
    );
    println!("Strategies:");
    for rate in &snapshot.strategies {
        let shown = rate
            .success_rate
            .map_or_else(|| "untried".to_string(), |r| format!("{:.3}", r));
        println!(
            "  {:<20} {:>8} attempts {:>6} successes  rate {}",
            rate.strategy.to_string(),
            rate.attempts,
            rate.successes,
            shown
        );
    }
    println!("Verdicts:");
    for verdict in Verdict::ALL {
        let count = snapshot.verdicts.get(&verdict).copied().unwrap_or(0);
        println!("  {:<12} {}", verdict.to_string(), count);
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            RefluxConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "no config file specified, loading default");
                RefluxConfig::load_from_file(&default_config_path)?
            } else {
                info!(
                    "no config file specified and 'config.toml' not found, using built-in defaults"
                );
                RefluxConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.engine.max_rounds = iterations;
    }
    if let Some(batch_size) = cli.batch_size {
        config.engine.batch_size = batch_size;
    }
    if let Some(seed) = cli.seed {
        config.engine.rng_seed = seed;
    }
    if config.protocol.fields.is_empty() && config.protocol.dictionary.is_empty() {
        config.protocol = modbus_protocol();
    }
    debug!(?config, "effective configuration");

    let orchestrator = Arc::new(FeedbackOrchestrator::from_config(&config, None)?);
    {
        let mut corpus = orchestrator.state().corpus.lock();
        let loaded = corpus.load_initial_seeds(&config.corpus.initial_seed_paths)?;
        if corpus.is_empty() {
            for seed in default_seeds() {
                corpus.add_initial_seed(seed);
            }
        }
        info!(loaded, corpus = corpus.len(), "corpus seeded");
    }

    let handle = Arc::clone(&orchestrator);
    ctrlc::set_handler(move || handle.shutdown())?;

    // Crashes are reported through the feedback loop, not the default panic hook.
    std::panic::set_hook(Box::new(|panic_info| {
        debug!(%panic_info, "target panicked");
    }));

    let executor = InProcessExecutor::new(toy_plc);
    let mut rng = ChaCha8Rng::seed_from_u64(config.engine.rng_seed);
    let max_rounds = config.engine.max_rounds;
    info!(
        rounds = max_rounds,
        batch = config.engine.batch_size,
        "starting fuzz loop"
    );
    let start_time = Instant::now();

    'rounds: for round in 0..max_rounds {
        let batch = match orchestrator.dispatch(config.engine.batch_size, &mut rng) {
            Ok(batch) => batch,
            Err(FeedbackError::ShutDown) => break,
            Err(e) => return Err(e.into()),
        };
        for candidate in batch {
            let execution = executor.execute(&candidate.bytes);
            let telemetry = telemetry_for(&candidate.bytes, &execution);
            let result = ExecutionResult::for_candidate(
                candidate,
                execution.edges,
                execution.crashed,
                execution.exec_time,
                telemetry,
            );
            match orchestrator.on_execution_result(result) {
                Ok(entry) if entry.crashed || entry.verdict >= Verdict::Block => {
                    info!(
                        sequence = entry.sequence,
                        verdict = %entry.verdict,
                        risk = entry.risk_score,
                        strategy = %entry.strategy_used,
                        "{}",
                        entry.reasoning
                    );
                }
                Ok(_) => {}
                Err(FeedbackError::ShutDown) => break 'rounds,
                Err(FeedbackError::Defense(e)) => warn!(error = %e, "result skipped"),
                Err(e) => return Err(e.into()),
            }
        }
        match orchestrator.run_maintenance() {
            Ok(Some(report)) => info!(
                round,
                kept = report.kept.len(),
                removed = report.removed,
                "corpus minimized"
            ),
            Ok(None) => {}
            Err(FeedbackError::Corpus(CorpusError::MinimizationInterrupted)) => {
                warn!("minimization interrupted by shutdown");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let snapshot = orchestrator.snapshot();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot, start_time.elapsed().as_secs_f64());
    }
    Ok(())
}
