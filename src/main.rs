use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bedloop::config::{DriverConfig, NodeConfig, QueueConfig};
use bedloop::dashboard::ImportResponse;
use bedloop::node::Node;
use bedloop::queue::{EditableQueue, LocalQueue, Strategy};
use bedloop::shutdown::install_shutdown_handler;
use bedloop::storage::{gjob, FileLocator, JobManifest, JobStore};

#[derive(Parser, Debug)]
#[command(name = "bedloop")]
#[command(version)]
#[command(about = "Continuous printing: queue jobs, print, clear the bed, repeat")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Drive a printer through its queues
    Run(RunArgs),

    /// Job archive and queue commands
    Job {
        #[command(flatten)]
        store: StoreArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Printer name
    #[arg(long, default_value = "printer")]
    name: String,

    /// Printer profile matched against set profiles
    #[arg(long, default_value = "")]
    profile: String,

    /// Directory for queue stores and run history
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory queued file paths are relative to
    #[arg(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Directory the printer picks files up from (default: <data-dir>/printer)
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    /// Directory of <hook>.gcode scripts, e.g. print_success.gcode
    #[arg(long)]
    script_dir: Option<PathBuf>,

    /// Local queues in priority order (comma-separated)
    #[arg(long, default_value = "local")]
    queues: String,

    /// Seconds between watchdog ticks
    #[arg(long, default_value = "5")]
    tick_secs: u64,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    // === Driver Options ===
    /// Attempts per set before a failing print stops the queue
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Cancel and retry spaghetti pauses within this many minutes of the start
    #[arg(long)]
    retry_on_pause_minutes: Option<u64>,

    /// Start failures tolerated before going inactive
    #[arg(long, default_value = "3")]
    max_startup_attempts: u32,

    /// Wait for the bed to drop below this temperature (°C) before clearing
    #[arg(long)]
    cooldown_threshold: Option<f64>,

    /// Stop waiting for cooldown after this many minutes
    #[arg(long, default_value = "60")]
    cooldown_timeout_minutes: f64,

    /// Finished runs kept in the history file
    #[arg(long, default_value = "500")]
    run_history: usize,
}

// =============================================================================
// Job Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// Directory holding queue stores
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory queued file paths are relative to
    #[arg(long, default_value = "uploads")]
    upload_dir: PathBuf,

    /// Queue to operate on
    #[arg(long, short = 'q', default_value = "local")]
    queue: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Dashboard URL of a running node, e.g. http://localhost:8080.
    /// Imports must go through it while the node is running.
    #[arg(long)]
    node: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List jobs in the queue
    List,
    /// Import a .gjob archive into the queue
    Import {
        /// Archive to import
        src: PathBuf,
    },
    /// Export a queued job and its files to a .gjob archive
    Export {
        /// The job ID (UUID)
        job_id: Uuid,
        /// Destination archive
        dest: PathBuf,
    },
    /// Show the manifest of a .gjob archive
    Inspect {
        /// Archive to inspect
        src: PathBuf,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListItem {
    id: Uuid,
    name: String,
    count: u32,
    remaining: u32,
    sets: usize,
    acquired: bool,
}

#[derive(Serialize)]
struct ImportOutput {
    job_id: Uuid,
    name: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_queues(queues: &str) -> Vec<QueueConfig> {
    queues
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(QueueConfig::new)
        .collect()
}

fn open_queue(store: &StoreArgs) -> Result<LocalQueue, Box<dyn std::error::Error>> {
    let config = NodeConfig::new("cli", &store.data_dir).with_upload_dir(&store.upload_dir);
    let jobs = JobStore::open(config.store_path(&store.queue))?;
    let queue = LocalQueue::new(
        store.queue.as_str(),
        Strategy::InOrder,
        "",
        jobs,
        FileLocator::new(&store.upload_dir),
    )?;
    Ok(queue)
}

fn print_manifest(manifest: &JobManifest, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", manifest.to_json()?),
        OutputFormat::Table => {
            println!("Job:       {} ({})", manifest.name, manifest.id);
            println!("Count:     {}/{} remaining", manifest.remaining, manifest.count);
            println!();
            println!("{:<40} {:<10} {:<20} MATERIALS", "PATH", "REMAINING", "PROFILES");
            println!("{}", "-".repeat(85));
            for set in &manifest.sets {
                let materials: Vec<&str> = set
                    .materials
                    .iter()
                    .map(|m| m.as_deref().unwrap_or("-"))
                    .collect();
                println!(
                    "{:<40} {:<10} {:<20} {}",
                    set.path,
                    format!("{}/{}", set.remaining, set.count),
                    set.profiles.join(","),
                    materials.join(",")
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Run Implementation
// =============================================================================

async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut driver = DriverConfig::default().with_max_retries(args.max_retries);
    driver.max_startup_attempts = args.max_startup_attempts;
    if let Some(minutes) = args.retry_on_pause_minutes {
        driver = driver.with_retry_on_pause(Duration::from_secs(minutes * 60));
    }
    if let Some(threshold) = args.cooldown_threshold {
        driver = driver.with_cooldown(threshold, args.cooldown_timeout_minutes);
    }

    let mut config = NodeConfig::new(args.name, args.data_dir)
        .with_profile(args.profile)
        .with_upload_dir(args.upload_dir)
        .with_tick_interval(Duration::from_secs(args.tick_secs.max(1)))
        .with_run_history(args.run_history)
        .with_driver(driver);
    for queue in parse_queues(&args.queues) {
        config = config.with_queue(queue);
    }
    if let Some(dir) = args.watch_dir {
        config = config.with_watch_dir(dir);
    }
    if let Some(dir) = args.script_dir {
        config = config.with_script_dir(dir);
    }
    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_dashboard(addr);
    }

    tracing::info!(
        printer = %config.printer_name,
        data_dir = %config.data_dir.display(),
        queues = ?config.local_queues().iter().map(|q| q.name.clone()).collect::<Vec<_>>(),
        dashboard_addr = ?config.dashboard_addr,
        "Starting bedloop node"
    );

    let shutdown = install_shutdown_handler();
    let (node, rx) = Node::new(config)?;
    node.run(rx, shutdown).await;
    Ok(())
}

// =============================================================================
// Job Command Handlers
// =============================================================================

fn handle_job_list(store: &StoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_queue(store)?;
    let jobs: Vec<JobListItem> = queue
        .jobs()
        .iter()
        .map(|job| JobListItem {
            id: job.id,
            name: job.name.clone(),
            count: job.count,
            remaining: job.remaining,
            sets: job.sets.len(),
            acquired: job.acquired,
        })
        .collect();

    match store.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs in queue {}", store.queue);
                return Ok(());
            }
            println!("{:<38} {:<24} {:<10} {:<6} ACQUIRED", "ID", "NAME", "REMAINING", "SETS");
            println!("{}", "-".repeat(88));
            for job in &jobs {
                println!(
                    "{:<38} {:<24} {:<10} {:<6} {}",
                    job.id,
                    job.name,
                    format!("{}/{}", job.remaining, job.count),
                    job.sets,
                    if job.acquired { "yes" } else { "" }
                );
            }
        }
    }
    Ok(())
}

async fn import_via_node(
    node: &str,
    queue: &str,
    manifest: &JobManifest,
) -> Result<Uuid, Box<dyn std::error::Error>> {
    let url = format!("{}/api/jobs/import", node.trim_end_matches('/'));
    let response: ImportResponse = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "queue": queue, "manifest": manifest }))
        .send()
        .await?
        .json()
        .await?;
    match response.job_id {
        Some(job_id) if response.success => Ok(job_id),
        _ => Err(response
            .error
            .unwrap_or_else(|| "import rejected".to_string())
            .into()),
    }
}

async fn handle_job_import(store: &StoreArgs, src: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = gjob::unpack(&src, &FileLocator::new(&store.upload_dir))?;
    let job_id = match &store.node {
        Some(node) => import_via_node(node, &store.queue, &manifest).await?,
        None => open_queue(store)?.import_job(&manifest)?,
    };

    match store.output {
        OutputFormat::Json => {
            let output = ImportOutput {
                job_id,
                name: manifest.name,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Imported job {} into queue {}", manifest.name, store.queue);
            println!("Job ID: {}", job_id);
        }
    }
    Ok(())
}

fn handle_job_export(store: &StoreArgs, job_id: Uuid, dest: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_queue(store)?;
    let manifest = queue.export_job(job_id)?;
    gjob::pack(&manifest, &FileLocator::new(&store.upload_dir), &dest)?;
    println!("Exported {} to {}", manifest.name, dest.display());
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_node(run_args).await?;
        }
        Commands::Job { store, command } => match command {
            JobCommands::List => handle_job_list(&store)?,
            JobCommands::Import { src } => handle_job_import(&store, src).await?,
            JobCommands::Export { job_id, dest } => handle_job_export(&store, job_id, dest)?,
            JobCommands::Inspect { src } => print_manifest(&gjob::read_manifest(&src)?, &store.output)?,
        },
    }

    Ok(())
}
