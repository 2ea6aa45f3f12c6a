use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_engine::{CommandGenerator, CommandPlanner, Engine, HandlerRegistry, RunHandle, parse_instruction_file};
use cadence_types::{ExecutionRecord, InstructionDocument, InstructionKind, RecordFilter, RunEvent, RunStatus, StepStatus, validate};
use cadence_util::{CapabilityStore, EngineConfig, JsonRecordStore, expand_tilde, load_config, load_config_from_path};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{Level, warn};

/// Run and inspect Cadence instructions.
#[derive(Parser, Debug)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Engine configuration file (defaults to CADENCE_CONFIG_PATH or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding execution records
    #[arg(long, global = true)]
    state_dir: Option<String>,

    /// Program that turns an intent on stdin into a workflow on stdout
    #[arg(long, global = true)]
    planner_cmd: Option<String>,

    /// Program that turns a capability request on stdin into a command capability on stdout
    #[arg(long, global = true)]
    generator_cmd: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check an instruction document without running it
    Validate { file: PathBuf },

    /// Run an instruction document; Ctrl-C requests cancellation
    Run {
        file: PathBuf,

        /// Print only the final record
        #[arg(long)]
        quiet: bool,
    },

    /// Show the execution record of a run
    Status { id: String },

    /// List execution records, newest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<RunStatus>,

        #[arg(long, value_parser = parse_kind)]
        kind: Option<InstructionKind>,
    },

    /// Restore a record to its previous snapshot
    Rollback { id: String },

    /// Start a new run for a failed or cancelled record
    Retry {
        id: String,

        #[arg(long)]
        quiet: bool,
    },

    /// List registered handlers
    Handlers,

    /// Print the JSON Schema of instruction documents
    Schema,
}

fn parse_status(text: &str) -> Result<RunStatus, String> {
    text.parse()
}

fn parse_kind(text: &str) -> Result<InstructionKind, String> {
    InstructionKind::parse(text).ok_or_else(|| format!("unknown kind '{text}'; expected one of direct, workflow, intent, capability_request"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Command::Validate { file } => validate_file(file),
        Command::Schema => {
            let schema = schemars::schema_for!(InstructionDocument);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Handlers => {
            let (engine, _) = build_engine(&cli, false)?;
            for descriptor in engine.registry().list() {
                let parameters = descriptor.parameter_names().join(", ");
                println!(
                    "{:<12} {:<9} {:<16} {}",
                    descriptor.name,
                    descriptor.provenance.label(),
                    if descriptor.concurrency_safe { "concurrent" } else { "serialized" },
                    if parameters.is_empty() { "-".to_string() } else { parameters }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { file, quiet } => {
            let raw = parse_instruction_file(file)?;
            let (engine, events) = build_engine(&cli, !quiet)?;
            let handle = engine.submit(&raw)?;
            follow(&engine, handle, events).await
        }
        Command::Retry { id, quiet } => {
            let (engine, events) = build_engine(&cli, !quiet)?;
            let handle = engine.retry(id)?;
            follow(&engine, handle, events).await
        }
        Command::Status { id } => {
            let (engine, _) = build_engine(&cli, false)?;
            print_record(&engine.status(id)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Rollback { id } => {
            let (engine, _) = build_engine(&cli, false)?;
            print_record(&engine.rollback(id)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List { status, kind } => {
            let (engine, _) = build_engine(&cli, false)?;
            let filter = RecordFilter {
                status: *status,
                kind: *kind,
            };
            for record in engine.list(&filter)? {
                println!(
                    "{:<38} {:<18} {:<10} {:>3}/{:<3} {}",
                    record.id,
                    record.kind,
                    record.status,
                    record.count_steps(StepStatus::Completed),
                    record.steps.len(),
                    record.created_at.to_rfc3339()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_engine_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => load_config().context("failed to load engine configuration")?,
    };
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = expand_tilde(state_dir);
    }
    Ok(config)
}

fn build_engine(cli: &Cli, with_events: bool) -> Result<(Engine, Option<UnboundedReceiver<RunEvent>>)> {
    let config = load_engine_config(cli)?;
    let store = JsonRecordStore::from_config(&config)
        .with_context(|| format!("failed to open state directory {}", config.state_dir.display()))?;
    let capabilities = CapabilityStore::from_config(&config)
        .with_context(|| format!("failed to open installed capabilities under {}", config.state_dir.display()))?;
    let mut engine = Engine::new(Arc::new(HandlerRegistry::with_builtins()), Arc::new(store), config)
        .with_capability_store(Arc::new(capabilities));
    engine.restore_capabilities().context("failed to restore installed capabilities")?;

    if let Some(command_line) = &cli.planner_cmd {
        let planner = CommandPlanner::from_command_line(command_line).context("--planner-cmd must name a program")?;
        engine = engine.with_planner(Arc::new(planner));
    }
    if let Some(command_line) = &cli.generator_cmd {
        let generator = CommandGenerator::from_command_line(command_line).context("--generator-cmd must name a program")?;
        engine = engine.with_generator(Arc::new(generator));
    }

    if !with_events {
        return Ok((engine, None));
    }
    let (sender, receiver) = unbounded_channel();
    Ok((engine.with_event_sink(sender), Some(receiver)))
}

fn validate_file(file: &Path) -> Result<ExitCode> {
    let raw = parse_instruction_file(file)?;
    match validate(&raw) {
        Ok(instruction) => {
            println!("valid {} instruction '{}'", instruction.kind(), instruction.id);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            for violation in &error.violations {
                println!("{violation}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Wait for `handle`, printing progress and forwarding Ctrl-C as a cancel request.
async fn follow(engine: &Engine, handle: RunHandle, events: Option<UnboundedReceiver<RunEvent>>) -> Result<ExitCode> {
    let printer = events.map(|events| tokio::spawn(print_events(events)));
    let id = handle.id().to_string();
    let mut wait = std::pin::pin!(handle.wait());

    let record = loop {
        tokio::select! {
            finished = &mut wait => break finished?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                eprintln!("cancellation requested for {id}; waiting for running steps");
                if !engine.cancel(&id)? {
                    warn!(instruction_id = %id, "run already finished");
                }
            }
        }
    };

    if let Some(printer) = printer {
        printer.abort();
    }
    print_record(&record)?;
    Ok(if record.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn print_events(mut events: UnboundedReceiver<RunEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RunEvent::StepStarted { step_id, handler, .. } => eprintln!("  started   {step_id} ({handler})"),
            RunEvent::StepFinished {
                step_id,
                status,
                error,
                duration_ms,
                ..
            } => match error {
                Some(error) => eprintln!("  {status:<9} {step_id} after {duration_ms}ms: {error}"),
                None => eprintln!("  {status:<9} {step_id} after {duration_ms}ms"),
            },
            RunEvent::RunCompleted { instruction_id, status, .. } => eprintln!("{instruction_id} {status}"),
            RunEvent::RunStarted { .. } | RunEvent::StepReady { .. } | RunEvent::CancelRequested { .. } => {}
        }
    }
}

fn print_record(record: &ExecutionRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}
