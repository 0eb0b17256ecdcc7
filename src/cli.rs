//! `evolvectl`: argument parsing and the command handlers behind it.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use colored::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::analysis::{PatternAnalyzer, Prioritizer};
use crate::clock::{now_ms, Clock, ManualClock};
use crate::config::PipelineConfig;
use crate::deploy::InMemoryFlagStore;
use crate::metrics::MetricsReport;
use crate::model::{Evolution, EvolutionStatus, ImprovementHypothesis, Pattern};
use crate::orchestrator::{Orchestrator, OrchestratorStatus, PipelineComponents};
use crate::sandbox::{ProcessSandbox, SandboxRunner};
use crate::simulation::{
    SimulatedCodeGenerator, SimulatedEnvironments, SimulatedHealthProbe, SimulatedSandbox, StaticApproval,
};
use crate::store::InMemoryStore;
use crate::telemetry::{TelemetryLog, TelemetrySource, ToolExecutionRecord};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "evolvectl")]
#[command(version)]
#[command(about = "Drive and inspect the autonomous evolution pipeline")]
pub struct Args {
    /// Log filter, e.g. `evolution=debug` (defaults to RUST_LOG, then `info`)
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the full pipeline against simulated collaborators
    Simulate(SimulateArgs),

    /// Detect patterns in a telemetry file and print ranked hypotheses
    Analyze {
        /// JSONL file of tool-execution records
        telemetry: PathBuf,

        /// Pipeline config (TOML); defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Parse and validate a pipeline config file
    CheckConfig {
        path: PathBuf,
    },

    /// Print the default pipeline config as TOML
    DefaultConfig,

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// JSONL telemetry to analyze; a synthetic trace is generated when omitted
    #[arg(long)]
    pub telemetry: Option<PathBuf>,

    /// Number of cycles to run
    #[arg(long, default_value = "3")]
    pub cycles: u32,

    /// Pipeline config (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seed for the synthetic trace and the simulated health probe
    #[arg(long, default_value = "7")]
    pub seed: u64,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Run trials as real child processes (`sandbox.command` over
    /// `sandbox.base_dir`) instead of the simulated sandbox
    #[arg(long)]
    pub process_sandbox: bool,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn run(args: Args) -> CliResult<()> {
    match args.command {
        Command::Simulate(sim) => {
            let summary = simulate(&sim).await?;
            if sim.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Command::Analyze { telemetry, config, json } => {
            let config = load_config(config.as_deref())?;
            let log = TelemetryLog::from_jsonl(&telemetry, TelemetryLog::DEFAULT_CAPACITY)?;
            let analysis = analyze(&config, log.records());
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                print_analysis(&analysis);
            }
        }
        Command::CheckConfig { path } => {
            PipelineConfig::load(&path)?;
            println!("{} {}", "ok".bright_green().bold(), path.display());
        }
        Command::DefaultConfig => {
            print!("{}", PipelineConfig::default().to_toml_string()?);
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Args::command(), "evolvectl", &mut std::io::stdout());
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> CliResult<PipelineConfig> {
    Ok(match path {
        Some(p) => PipelineConfig::load(p)?,
        None => PipelineConfig::default(),
    })
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Analysis {
    pub records: usize,
    pub patterns: Vec<Pattern>,
    pub hypotheses: Vec<ScoredHypothesis>,
}

#[derive(Debug, Serialize)]
pub struct ScoredHypothesis {
    pub score: f64,
    pub risk_level: f64,
    pub hypothesis: ImprovementHypothesis,
}

pub fn analyze(config: &PipelineConfig, records: Vec<ToolExecutionRecord>) -> Analysis {
    let now = records.iter().map(|r| r.timestamp_ms).max().unwrap_or_else(now_ms);
    let count = records.len();
    let analyzer = PatternAnalyzer::new(config.analyzer.clone(), Arc::new(Vec::<ToolExecutionRecord>::new()));
    let patterns = analyzer.analyze(&records, now);
    let hypotheses = analyzer.generate_hypotheses(&patterns, now);
    let ranked = Prioritizer::new(config.prioritizer.clone()).rank(hypotheses, &Default::default());
    Analysis {
        records: count,
        patterns,
        hypotheses: ranked
            .into_iter()
            .map(|r| ScoredHypothesis { score: r.score, risk_level: r.hypothesis.risk_level(), hypothesis: r.hypothesis })
            .collect(),
    }
}

fn print_analysis(a: &Analysis) {
    println!("{}", format!("{} records, {} patterns", a.records, a.patterns.len()).bold());
    for p in &a.patterns {
        println!(
            "  {:<15} {:<24} n={:<5} confidence={:.2}",
            p.kind.to_string().bright_yellow(),
            p.context.tools.join(","),
            p.frequency,
            p.confidence
        );
    }
    println!();
    println!("{}", "Hypotheses (highest priority first)".bold());
    for (i, h) in a.hypotheses.iter().enumerate() {
        println!(
            "  {:>2}. [{:<11}] score={:.3} risk={:.2}  {}",
            i + 1,
            h.hypothesis.category.to_string().bright_cyan(),
            h.score,
            h.risk_level,
            h.hypothesis.description
        );
    }
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub status: OrchestratorStatus,
    pub metrics: MetricsReport,
    pub evolutions: Vec<Evolution>,
}

/// Synthetic trace: one slow tool, one flaky tool, one healthy tool.
pub fn synthetic_telemetry(seed: u64, start_ms: u64) -> Vec<ToolExecutionRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut records = Vec::new();
    for i in 0..40u64 {
        let at = start_ms.saturating_sub(40_000) + i * 1_000;
        records.push(ToolExecutionRecord {
            tool_id: "search".into(),
            duration_ms: rng.gen_range(1_400..1_900),
            success: true,
            error: None,
            memory_bytes: None,
            timestamp_ms: at,
        });
        let failed = rng.gen_bool(0.3);
        records.push(ToolExecutionRecord {
            tool_id: "fetch".into(),
            duration_ms: rng.gen_range(80..200),
            success: !failed,
            error: failed.then(|| "connection reset".to_string()),
            memory_bytes: None,
            timestamp_ms: at,
        });
        records.push(ToolExecutionRecord {
            tool_id: "read".into(),
            duration_ms: rng.gen_range(5..40),
            success: true,
            error: None,
            memory_bytes: None,
            timestamp_ms: at,
        });
    }
    records
}

/// Run `args.cycles` cycles on a manual clock.  Each cycle waits for every
/// admitted evolution to finish before time moves on.
pub async fn simulate(args: &SimulateArgs) -> CliResult<SimulationSummary> {
    let config = load_config(args.config.as_deref())?;
    let start = now_ms();
    let telemetry: Arc<dyn TelemetrySource> = match &args.telemetry {
        Some(path) => Arc::new(TelemetryLog::from_jsonl(path, TelemetryLog::DEFAULT_CAPACITY)?),
        None => Arc::new(synthetic_telemetry(args.seed, start)),
    };
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(InMemoryStore::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let sandbox: Arc<dyn SandboxRunner> = if args.process_sandbox {
        Arc::new(ProcessSandbox::new(&config.sandbox))
    } else {
        Arc::new(SimulatedSandbox::passing())
    };
    let components = PipelineComponents {
        telemetry,
        code_generator: Arc::new(SimulatedCodeGenerator::new(Arc::clone(&dyn_clock))),
        approval: Arc::new(StaticApproval::approving()),
        sandbox,
        flags: Arc::new(InMemoryFlagStore::new()),
        health: Arc::new(SimulatedHealthProbe::new(args.seed)),
        environments: Arc::new(SimulatedEnvironments::default()),
        store: store.clone(),
        clock: dyn_clock,
    };
    let interval = config.orchestrator.cycle_interval();
    let orchestrator = Orchestrator::new(config, components)?;

    for _ in 0..args.cycles {
        let report = orchestrator.run_cycle();
        tracing::info!(
            target: "evolution::cli",
            cycle = report.cycle,
            admitted = report.admitted.len(),
            "simulated cycle"
        );
        orchestrator.wait_idle().await;
        clock.advance(interval);
    }

    Ok(SimulationSummary {
        status: orchestrator.get_status(),
        metrics: orchestrator.get_metrics_report(),
        evolutions: store.evolutions(),
    })
}

fn status_label(status: EvolutionStatus) -> ColoredString {
    let s = status.to_string();
    match status {
        EvolutionStatus::Completed => s.bright_green(),
        EvolutionStatus::RolledBack => s.bright_yellow(),
        EvolutionStatus::Failed => s.bright_red(),
        _ => s.normal(),
    }
}

fn print_summary(s: &SimulationSummary) {
    let m = &s.metrics;
    println!("{}", "Evolution pipeline simulation".bold());
    println!(
        "  cycles={}  attempted={}  succeeded={}  failed={}  rolled back={}  task failures={}",
        s.status.cycle_count,
        m.cumulative.attempted,
        m.cumulative.succeeded.to_string().bright_green(),
        m.cumulative.failed.to_string().bright_red(),
        m.cumulative.rolled_back.to_string().bright_yellow(),
        s.status.failure_count
    );
    println!("  gate pass rate {:.0}%", m.validation.pass_rate * 100.0);
    for (kind, stats) in &m.strategies {
        println!("  {:<10} {} rollouts, avg {:.0} ms", kind, stats.deployments, stats.average_duration_ms);
    }
    println!();
    for e in &s.evolutions {
        println!(
            "  {} {:<12} {:<11} risk={:.2} {}",
            e.id.dimmed(),
            status_label(e.status),
            e.hypothesis.category,
            e.risk_level,
            e.failure_reason.as_deref().unwrap_or(&e.hypothesis.description)
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
