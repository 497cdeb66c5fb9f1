use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use synthfleet::config::{CoordinatorConfig, TlsConfig, WorkerConfig};
use synthfleet::coordinator::Coordinator;
use synthfleet::grpc::GrpcTransport;
use synthfleet::ipc::memory_channel;
use synthfleet::pipeline::Stage;
use synthfleet::proto::pipeline_service_client::PipelineServiceClient;
use synthfleet::proto::{
    DeleteJobRequest, GetJobRequest, JobInfo, ListFilesRequest, ListJobsRequest,
    ListWorkersRequest, SetJobFieldRequest, SetJobStateRequest, SubmitJobRequest,
};
use synthfleet::shutdown::install_shutdown_handler;
use synthfleet::tls::resolve_identity;
use synthfleet::worker::{ToolchainPlanner, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "synthfleet")]
#[command(version)]
#[command(about = "Distributed HLS build and run pipeline for SDSoC and AWS F1")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator
    Server(ServerArgs),

    /// Start a worker and connect it to a coordinator
    Worker(WorkerArgs),

    /// Run a coordinator and a local worker in one process
    Dev(DevArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List connected workers and their slot usage
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server / Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct TlsArgs {
    /// Enable mutual TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to this process's certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to this process's private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Fall back to plaintext when TLS material is missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl TlsArgs {
    /// Command-line TLS flags win over the config file when `--tls` is given.
    fn apply(self, tls: &mut TlsConfig) {
        if self.tls {
            *tls = TlsConfig {
                enabled: true,
                ca_cert_path: self.ca_cert,
                cert_path: self.cert,
                key_path: self.key,
                allow_insecure: self.allow_insecure,
            };
        } else if self.allow_insecure {
            tls.allow_insecure = true;
        }
    }
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// TOML config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to listen on for gRPC (binds 0.0.0.0)
    #[arg(long)]
    port: Option<u16>,

    /// Instance directory holding the job store
    #[arg(long)]
    instance_dir: Option<PathBuf>,

    /// Fleet-wide in-flight limit, e.g. `synthesize=4` (repeatable)
    #[arg(long = "parallelism", value_parser = parse_count)]
    parallelism: Vec<(String, u32)>,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// TOML config file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Worker identifier, unique in the fleet
    #[arg(long)]
    worker_id: Option<String>,

    /// Coordinator address (use https:// for TLS)
    #[arg(long)]
    coordinator: Option<String>,

    /// Offered capability and slot count, e.g. `synthesize=2` (repeatable)
    #[arg(long = "capability", value_parser = parse_count)]
    capabilities: Vec<(String, u32)>,

    /// Per-stage wall-clock limit in seconds, e.g. `execute=9000` (repeatable)
    #[arg(long = "stage-timeout", value_parser = parse_count)]
    stage_timeouts: Vec<(String, u32)>,

    #[command(flatten)]
    tls: TlsArgs,
}

#[derive(Parser, Debug)]
struct DevArgs {
    /// Port to listen on for gRPC
    #[arg(long, default_value = "50061")]
    port: u16,

    /// Instance directory holding the job store
    #[arg(long, default_value = "instance")]
    instance_dir: PathBuf,

    /// Capabilities of the local worker; defaults to one slot of every stage
    #[arg(long = "capability", value_parser = parse_count)]
    capabilities: Vec<(String, u32)>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50061")]
    addr: String,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Toolchain: sdsoc or f1
        #[arg(long, short = 't')]
        toolchain: String,

        /// Display name (defaults to the job ID)
        #[arg(long, short = 'n', default_value = "")]
        name: String,

        /// Zip archive with the sources; must be readable by the coordinator
        #[arg(long, conflicts_with = "source")]
        archive: Option<PathBuf>,

        /// Source directory; must be readable by the coordinator
        #[arg(long)]
        source: Option<PathBuf>,

        /// Job option, e.g. `hwname=mmult` or `mode=hw_emu` (repeatable)
        #[arg(long = "set", short = 's', value_parser = parse_key_value)]
        config: Vec<(String, String)>,
    },
    /// Show a job with its log
    Status {
        job_id: String,
    },
    /// List all jobs, oldest first
    List,
    /// Override a job's state, e.g. `queued` or `running:execute`
    SetState {
        job_id: String,
        state: String,
    },
    /// Set one config field (`name` renames the job)
    Set {
        job_id: String,
        key: String,
        value: String,
    },
    /// Delete a job and its files
    Delete {
        job_id: String,
    },
    /// List the files in a job's directory
    Files {
        job_id: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    started_ms: i64,
}

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    name: String,
    toolchain: String,
    state: String,
    started_ms: i64,
    stages: Vec<String>,
    stage_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    config: BTreeMap<String, String>,
    make_conf: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
}

impl JobOutput {
    fn from_proto(job: JobInfo, with_log: bool) -> Self {
        Self {
            job_id: job.job_id,
            name: job.name,
            toolchain: job.toolchain,
            state: job.state,
            started_ms: job.started_ms,
            stages: job.stages,
            stage_index: job.stage_index,
            failure: (!job.failure.is_empty()).then_some(job.failure),
            config: job.config.into_iter().collect(),
            make_conf: job.make_conf.into_iter().collect(),
            log: with_log.then_some(job.log),
        }
    }
}

#[derive(Serialize)]
struct CapabilityOutput {
    name: String,
    slots: u32,
    active: u32,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: String,
    capabilities: Vec<CapabilityOutput>,
    last_heartbeat_ms_ago: u64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

fn parse_count(s: &str) -> Result<(String, u32), String> {
    let (key, value) = parse_key_value(s)?;
    let count = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a non-negative integer", value))?;
    Ok((key, count))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn format_started(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Absolute form of a client-side path, since the coordinator resolves it.
fn absolute(path: PathBuf) -> Result<String, Box<dyn std::error::Error>> {
    Ok(std::path::absolute(path)?.to_string_lossy().into_owned())
}

async fn create_client(
    args: &ClientArgs,
) -> Result<PipelineServiceClient<Channel>, Box<dyn std::error::Error>> {
    let tls = TlsConfig {
        enabled: args.ca_cert.is_some() || args.addr.starts_with("https://"),
        ca_cert_path: args.ca_cert.clone(),
        cert_path: args.cert.clone(),
        key_path: args.key.clone(),
        allow_insecure: false,
    };
    let mut transport = GrpcTransport::new(args.addr.clone());
    if let Some(identity) = resolve_identity(&tls).await? {
        transport = transport.with_tls(identity);
    }
    Ok(transport.pipeline_client().await?)
}

// =============================================================================
// Process Entry Points
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(port) = args.port {
        config.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    }
    if let Some(dir) = args.instance_dir {
        config.instance_dir = dir;
    }
    config.parallelism.extend(args.parallelism);
    args.tls.apply(&mut config.tls);

    tracing::info!(
        listen_addr = %config.listen_addr,
        instance_dir = %config.instance_dir.display(),
        parallelism = ?config.parallelism,
        tls_enabled = config.tls.enabled,
        "Starting synthfleet coordinator"
    );

    let shutdown = install_shutdown_handler()?;
    Coordinator::open(config)?.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(worker_id) = args.worker_id {
        config.worker_id = worker_id;
    }
    if let Some(coordinator) = args.coordinator {
        config.coordinator = coordinator;
    }
    config.capabilities.extend(args.capabilities);
    config.stage_timeouts_secs.extend(
        args.stage_timeouts
            .into_iter()
            .map(|(stage, secs)| (stage, u64::from(secs))),
    );
    args.tls.apply(&mut config.tls);
    config.validate()?;

    let mut transport = GrpcTransport::new(config.coordinator.clone());
    if let Some(identity) = resolve_identity(&config.tls).await? {
        transport = transport.with_tls(identity);
    }

    tracing::info!(
        worker_id = %config.worker_id,
        coordinator = %config.coordinator,
        capabilities = ?config.capabilities,
        "Starting synthfleet worker"
    );

    let planner = Arc::new(ToolchainPlanner::new(config.toolchain.clone()));
    let pool = WorkerPool::new(config, planner);
    let shutdown = install_shutdown_handler()?;
    pool.run(&transport, shutdown).await?;
    Ok(())
}

async fn run_dev(args: DevArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = CoordinatorConfig::new(SocketAddr::from(([127, 0, 0, 1], args.port)), args.instance_dir);
    let coordinator = Coordinator::open(config)?;
    let (transport, listener) = memory_channel();
    coordinator.serve_memory(listener);

    let mut worker_config = WorkerConfig::new("local");
    if args.capabilities.is_empty() {
        for stage in Stage::ALL {
            worker_config = worker_config.with_capability(stage.required_capability(), 1);
        }
    } else {
        worker_config.capabilities.extend(args.capabilities);
    }
    worker_config.validate()?;
    let planner = Arc::new(ToolchainPlanner::new(worker_config.toolchain.clone()));
    let pool = WorkerPool::new(worker_config, planner);

    tracing::info!(port = args.port, "Starting synthfleet in single-process mode");

    let shutdown = install_shutdown_handler()?;
    let worker = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(&transport, shutdown).await }
    });
    coordinator.run(shutdown).await?;
    worker.await??;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_command(
    client: &mut PipelineServiceClient<Channel>,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            toolchain,
            name,
            archive,
            source,
            config,
        } => {
            let request = SubmitJobRequest {
                name,
                toolchain,
                config: config.into_iter().collect(),
                archive_path: archive.map(absolute).transpose()?.unwrap_or_default(),
                source_dir: source.map(absolute).transpose()?.unwrap_or_default(),
            };
            let resp = client.submit_job(request).await?.into_inner();
            match output_format {
                OutputFormat::Json => {
                    let output = JobSubmitOutput {
                        job_id: resp.job_id,
                        started_ms: resp.started_ms,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", resp.job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = client.get_job(GetJobRequest { job_id }).await?.into_inner();
            print_job(JobOutput::from_proto(job, true), output_format)?;
        }
        JobCommands::List => {
            let jobs = client.list_jobs(ListJobsRequest {}).await?.into_inner().jobs;
            print_job_list(jobs, output_format)?;
        }
        JobCommands::SetState { job_id, state } => {
            let resp = client
                .set_job_state(SetJobStateRequest {
                    job_id: job_id.clone(),
                    state,
                })
                .await?
                .into_inner();
            match output_format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "job_id": job_id, "state": resp.state }))
                }
                OutputFormat::Table => println!("Job {} is now {}", job_id, resp.state),
            }
        }
        JobCommands::Set { job_id, key, value } => {
            client
                .set_job_field(SetJobFieldRequest {
                    job_id: job_id.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
                .await?;
            if let OutputFormat::Table = output_format {
                println!("Job {}: {} = {}", job_id, key, value);
            }
        }
        JobCommands::Delete { job_id } => {
            client
                .delete_job(DeleteJobRequest {
                    job_id: job_id.clone(),
                })
                .await?;
            if let OutputFormat::Table = output_format {
                println!("Job {} deleted", job_id);
            }
        }
        JobCommands::Files { job_id } => {
            let paths = client
                .list_files(ListFilesRequest { job_id })
                .await?
                .into_inner()
                .paths;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&paths)?),
                OutputFormat::Table => {
                    for path in paths {
                        println!("{}", path);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_job(job: JobOutput, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:     {}", job.job_id);
            println!("Name:       {}", job.name);
            println!("Toolchain:  {}", job.toolchain);
            println!("State:      {}", job.state);
            println!("Started:    {}", format_started(job.started_ms));
            println!("Stages:     {}", job.stages.join(" -> "));
            if let Some(failure) = &job.failure {
                println!("Failure:    {}", failure);
            }
            if !job.config.is_empty() {
                println!("Config:");
                for (key, value) in &job.config {
                    println!("  {} = {}", key, value);
                }
            }
            if !job.make_conf.is_empty() {
                println!("Make conf:");
                for (key, value) in &job.make_conf {
                    println!("  {} = {}", key, value);
                }
            }
            if let Some(log) = job.log.as_deref().filter(|l| !l.is_empty()) {
                println!("Log:");
                for line in log.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

fn print_job_list(
    jobs: Vec<JobInfo>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<JobOutput> = jobs
        .into_iter()
        .map(|j| JobOutput::from_proto(j, false))
        .collect();
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<13} {:<20} {:<8} {:<20} STARTED",
                "JOB ID", "NAME", "TOOL", "STATE"
            );
            println!("{}", "-".repeat(84));
            for job in &jobs {
                let name = if job.name.chars().count() > 20 {
                    format!("{}...", job.name.chars().take(17).collect::<String>())
                } else {
                    job.name.clone()
                };
                println!(
                    "{:<13} {:<20} {:<8} {:<20} {}",
                    job.job_id,
                    name,
                    job.toolchain,
                    job.state,
                    format_started(job.started_ms)
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_workers(
    client: &mut PipelineServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let workers: Vec<WorkerOutput> = client
        .list_workers(ListWorkersRequest {})
        .await?
        .into_inner()
        .workers
        .into_iter()
        .map(|w| WorkerOutput {
            worker_id: w.worker_id,
            capabilities: w
                .capabilities
                .into_iter()
                .map(|c| CapabilityOutput {
                    name: c.name,
                    slots: c.slots,
                    active: c.active,
                })
                .collect(),
            last_heartbeat_ms_ago: w.last_heartbeat_ms_ago,
        })
        .collect();

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&workers)?),
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No workers connected.");
                return Ok(());
            }
            println!("{:<20} {:<45} LAST HEARTBEAT", "WORKER", "CAPABILITIES (active/slots)");
            println!("{}", "-".repeat(80));
            for worker in &workers {
                let caps = worker
                    .capabilities
                    .iter()
                    .map(|c| format!("{} {}/{}", c.name, c.active, c.slots))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "{:<20} {:<45} {}ms ago",
                    worker.worker_id, caps, worker.last_heartbeat_ms_ago
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Dev(dev_args) => run_dev(dev_args).await?,
        Commands::Job { client, command } => {
            let mut grpc_client = create_client(&client).await?;
            if let Err(e) = handle_job_command(&mut grpc_client, command, &client.output).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Workers { client } => {
            let mut grpc_client = create_client(&client).await?;
            handle_workers(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
