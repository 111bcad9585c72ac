use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use recon_batch::config::{CorTable, ModeSettings, OutputMode, ReconSettings, SchedulerConfig};
use recon_batch::scheduler::job::{CorMethod, Job, Machine, ReconType};
use recon_batch::scheduler::slots::SlotId;
use recon_batch::scheduler::BatchScheduler;
use recon_batch::shutdown::install_shutdown_handler;
use recon_batch::status::{BatchEvent, BatchSummary, ChannelSink, StatusEvent};
use recon_batch::worker::{CommandBuilder, RemoteWrapper, SshWrapper, TomocupyCommandBuilder};

#[derive(Parser, Debug)]
#[command(name = "recon-batch")]
#[command(version)]
#[command(about = "Run tomographic reconstructions over a pool of GPUs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Reconstruct a batch of scans, one GPU per job
    Run(RunArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Scan files to reconstruct
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Reconstruction type
    #[arg(long = "type", value_enum, default_value = "try")]
    recon_type: ReconTypeArg,

    /// Number of GPUs to run jobs on
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=8))]
    gpus: u32,

    /// Machine to run on, "Local" or a host reachable over ssh
    #[arg(long, default_value = Machine::LOCAL_LABEL)]
    machine: String,

    /// Rotation center applied to every scan
    #[arg(long, allow_negative_numbers = true, conflicts_with = "cor_file")]
    cor: Option<f64>,

    /// JSON file mapping scan paths or names to rotation centers
    #[arg(long)]
    cor_file: Option<PathBuf>,

    /// How the rotation axis is determined
    #[arg(long, value_enum, default_value = "manual")]
    cor_method: CorMethodArg,

    /// Reconstruction subcommand
    #[arg(long, value_enum, default_value = "recon")]
    recon_way: ReconWayArg,

    /// Configuration file passed to the reconstruction tool
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reconstruction executable
    #[arg(long, default_value = "tomocupy")]
    executable: String,

    /// Write each job's output to <DIR>/<scan>-<type>-gpu<n>-<job id>.log
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Print the commands that would run and exit
    #[arg(long)]
    dry_run: bool,

    /// Extra arguments for the reconstruction tool (after `--`)
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReconTypeArg {
    Try,
    Full,
}

impl From<ReconTypeArg> for ReconType {
    fn from(arg: ReconTypeArg) -> Self {
        match arg {
            ReconTypeArg::Try => ReconType::Try,
            ReconTypeArg::Full => ReconType::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CorMethodArg {
    Manual,
    Auto,
}

impl From<CorMethodArg> for CorMethod {
    fn from(arg: CorMethodArg) -> Self {
        match arg {
            CorMethodArg::Manual => CorMethod::Manual,
            CorMethodArg::Auto => CorMethod::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReconWayArg {
    Recon,
    ReconSteps,
}

impl ReconWayArg {
    fn as_str(&self) -> &'static str {
        match self {
            ReconWayArg::Recon => "recon",
            ReconWayArg::ReconSteps => "recon_steps",
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct PlannedJob {
    file: String,
    slot: Option<SlotId>,
    command: Option<Vec<String>>,
    env: Vec<(String, String)>,
    skipped: Option<String>,
}

#[derive(Serialize)]
struct RunOutput {
    run_id: String,
    stopped: bool,
    summary: Option<BatchSummary>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn recon_settings(args: &RunArgs) -> ReconSettings {
    let mode = ModeSettings {
        recon_way: args.recon_way.as_str().to_string(),
    };
    ReconSettings {
        try_mode: mode.clone(),
        full_mode: mode,
        config_file: args.config.clone(),
        output: match &args.log_dir {
            Some(dir) => OutputMode::LogDir(dir.clone()),
            None => OutputMode::Inherit,
        },
        ..ReconSettings::default()
    }
    .with_executable(args.executable.clone())
    .with_extra_args(args.extra_args.clone())
}

fn build_jobs(args: &RunArgs) -> Result<Vec<Job>, Box<dyn std::error::Error>> {
    let table = match &args.cor_file {
        Some(path) => {
            let table = CorTable::from_file(path)?;
            tracing::info!(path = %path.display(), entries = table.len(), "Loaded COR file");
            Some(table)
        }
        None => None,
    };

    let jobs = args
        .files
        .iter()
        .map(|file| {
            let job = Job::new(file.clone(), args.recon_type.into())
                .with_cor_method(args.cor_method.into());
            let cor = args
                .cor
                .or_else(|| table.as_ref().and_then(|t| t.lookup(file)));
            match cor {
                Some(cor) => job.with_cor(cor),
                None => job,
            }
        })
        .collect();
    Ok(jobs)
}

fn print_plan(
    jobs: &[Job],
    settings: ReconSettings,
    args: &RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let builder = TomocupyCommandBuilder::new(settings);
    let wrapper = SshWrapper::new();
    let machine = Machine::from_label(&args.machine);

    let mut planned = Vec::with_capacity(jobs.len());
    let mut next_slot = 0u32;
    for job in jobs {
        let job = job.clone().with_machine(machine.clone());
        let entry = match job.validated_cor() {
            Ok(cor) => {
                let slot = SlotId(next_slot % args.gpus);
                next_slot += 1;
                let command = wrapper.wrap(builder.build(&job, slot, cor), &job.machine);
                PlannedJob {
                    file: job.file_path.display().to_string(),
                    slot: Some(slot),
                    command: Some(command.argv()),
                    env: command.env.into_iter().collect(),
                    skipped: None,
                }
            }
            Err(e) => PlannedJob {
                file: job.file_path.display().to_string(),
                slot: None,
                command: None,
                env: Vec::new(),
                skipped: Some(e.to_string()),
            },
        };
        planned.push(entry);
    }

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&planned)?);
        }
        OutputFormat::Table => {
            for entry in &planned {
                match (&entry.command, &entry.skipped) {
                    (Some(command), _) => {
                        let env: Vec<String> =
                            entry.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                        let slot = entry.slot.map(|s| s.to_string()).unwrap_or_default();
                        println!("{:<8} {} {}", slot, env.join(" "), command.join(" "));
                    }
                    (None, Some(reason)) => {
                        println!("{:<8} {} ({})", "SKIP", entry.file, reason);
                    }
                    (None, None) => {}
                }
            }
        }
    }
    Ok(())
}

/// Print scheduler events until the scheduler drops its sink. Returns the
/// terminal batch event.
async fn print_events(
    mut rx: mpsc::UnboundedReceiver<StatusEvent>,
    output: OutputFormat,
) -> Option<BatchEvent> {
    let mut terminal = None;
    while let Some(event) = rx.recv().await {
        match output {
            OutputFormat::Json => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
            },
            OutputFormat::Table => match &event {
                StatusEvent::Job(update) => {
                    println!(
                        "{}  {:<32} {:<10} {}",
                        update.at.format("%H:%M:%S"),
                        update.filename,
                        update.color.as_str().to_uppercase(),
                        update.text
                    );
                }
                StatusEvent::Progress(progress) => {
                    println!(
                        "[{:>3}%] {}/{} done, {} running, {} queued",
                        progress.percent(),
                        progress.completed,
                        progress.total,
                        progress.running,
                        progress.queue_depth
                    );
                }
                StatusEvent::Batch(_) => {}
            },
        }

        if let StatusEvent::Batch(batch) = event {
            if matches!(
                batch,
                BatchEvent::Completed { .. } | BatchEvent::Stopped { .. }
            ) {
                terminal = Some(batch);
            }
        }
    }
    terminal
}

fn print_summary(
    run_id: String,
    terminal: Option<BatchEvent>,
    output: &OutputFormat,
) -> Result<bool, Box<dyn std::error::Error>> {
    let (stopped, summary) = match terminal {
        Some(BatchEvent::Completed { summary, .. }) => (false, Some(summary)),
        Some(BatchEvent::Stopped { summary, .. }) => (true, Some(summary)),
        _ => (true, None),
    };

    match output {
        OutputFormat::Json => {
            let out = RunOutput {
                run_id,
                stopped,
                summary,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!();
            println!("Run ID:     {}", run_id);
            println!("State:      {}", if stopped { "stopped" } else { "complete" });
            if let Some(s) = &summary {
                println!("Jobs:       {}", s.total);
                println!("Succeeded:  {}", s.succeeded);
                println!("Failed:     {}", s.failed);
                println!("Skipped:    {}", s.skipped);
                println!("Cancelled:  {}", s.cancelled);
            }
        }
    }

    let clean = !stopped && summary.is_some_and(|s| s.failed == 0);
    Ok(clean)
}

// =============================================================================
// Run Implementation
// =============================================================================

async fn run_batch(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let jobs = build_jobs(&args)?;
    let settings = recon_settings(&args);

    if args.dry_run {
        print_plan(&jobs, settings, &args)?;
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(dir) = &args.log_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    let shutdown = install_shutdown_handler()?;
    let (sink, rx) = ChannelSink::new();
    let scheduler = BatchScheduler::local(SchedulerConfig::default(), settings, Arc::new(sink));
    let printer = tokio::spawn(print_events(rx, args.output));

    let handle = scheduler
        .submit(jobs, args.gpus as usize, &args.machine)
        .await?;
    tracing::info!(run_id = %handle.run_id, jobs = handle.total_jobs, "Batch submitted");

    tokio::select! {
        result = scheduler.wait_idle() => result?,
        _ = shutdown.cancelled() => {
            let report = scheduler.stop().await?;
            tracing::info!(
                cancelled_running = report.cancelled_running,
                cancelled_queued = report.cancelled_queued,
                force_killed = report.force_killed,
                "Batch stopped by signal"
            );
        }
    }

    // Ends the scheduler task, which closes the event channel
    scheduler.shutdown().await;
    drop(scheduler);
    let terminal = printer.await?;

    let clean = print_summary(handle.run_id.to_string(), terminal, &args.output)?;
    Ok(if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr so JSON output on stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Run(run_args) => run_batch(run_args).await,
    }
}
