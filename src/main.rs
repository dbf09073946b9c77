use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use framefarm::api::{ErrorBody, SetWorkersRequest, StartJobRequest, StartJobResponse};
use framefarm::broker::PoolSnapshot;
use framefarm::config::{FarmConfig, SceneSeed, SchedulingConfig, StorageConfig};
use framefarm::node::Node;
use framefarm::shutdown::install_shutdown_handler;
use framefarm::supervisor::JobSnapshot;

#[derive(Parser, Debug)]
#[command(name = "framefarm")]
#[command(version)]
#[command(about = "Render farm scheduler: splits render jobs across a shared worker pool")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (control API and worker gateway)
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Worker pool commands
    Pool {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: PoolCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for the control API and the worker gateway
    #[arg(long, default_value = "7500")]
    port: u16,

    /// Blob service base URL (in-memory store if omitted)
    #[arg(long, env = "FRAMEFARM_BLOB_SERVICE_URL")]
    blob_service_url: Option<String>,

    /// Document service base URL (in-memory store if omitted)
    #[arg(long, env = "FRAMEFARM_DOCUMENT_SERVICE_URL")]
    document_service_url: Option<String>,

    /// Bucket workers upload rendered frames into
    #[arg(long, default_value = "rendered-frames-upload")]
    upload_bucket: String,

    /// Bucket rendered frames are moved to
    #[arg(long, default_value = "rendered-frames")]
    output_bucket: String,

    /// Scene for the in-memory document store, as customer:object:locator:first-last.
    /// May be repeated.
    #[arg(long = "scene")]
    scenes: Vec<SceneSeed>,

    /// Workers a new job asks for
    #[arg(long, default_value = "1")]
    desired_workers: usize,

    /// Base delay between demand attempts, in milliseconds
    #[arg(long, default_value = "20000")]
    demand_retry_ms: u64,

    /// Random jitter added to each demand delay, in milliseconds
    #[arg(long, default_value = "2000")]
    demand_retry_jitter_ms: u64,

    /// Demand attempts without any worker before a job fails
    #[arg(long, default_value = "30")]
    max_demand_attempts: u32,

    /// Finished jobs kept for status queries
    #[arg(long, default_value = "1000")]
    finished_history: usize,

    /// Largest frame range a single job may span
    #[arg(long, default_value = "100000")]
    max_frames_per_job: usize,

    /// Timeout for each call to the blob and document services, in milliseconds
    #[arg(long, default_value = "30000")]
    storage_timeout_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job and pool commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7500")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Start rendering a scene
    Submit {
        /// Owning customer
        customer_id: String,
        /// Scene object to render
        object_id: String,
        /// Workers to request (default: server setting)
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List live and recently finished jobs
    List {
        /// Only jobs of this customer
        #[arg(long)]
        customer: Option<String>,
    },
    /// Stop a job and forget it
    Stop {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Change how many workers a job wants
    Workers {
        /// The job ID (UUID)
        job_id: String,
        /// New desired worker count (at least 1)
        count: usize,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PoolCommands {
    /// Show idle workers, pending demands and assignments
    Status,
}

// =============================================================================
// HTTP Client
// =============================================================================

struct FarmClient {
    http: reqwest::Client,
    base_url: String,
}

impl FarmClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(format!("{} ({})", message, status.as_u16()).into())
    }

    async fn submit(
        &self,
        request: &StartJobRequest,
    ) -> Result<StartJobResponse, Box<dyn std::error::Error>> {
        let response = self
            .http
            .post(self.url("/api/jobs"))
            .json(request)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn status(&self, job_id: &str) -> Result<JobSnapshot, Box<dyn std::error::Error>> {
        let response = self
            .http
            .get(self.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await?;
        Self::read(response).await
    }

    async fn list(
        &self,
        customer: Option<&str>,
    ) -> Result<Vec<JobSnapshot>, Box<dyn std::error::Error>> {
        let mut request = self.http.get(self.url("/api/jobs"));
        if let Some(customer) = customer {
            request = request.query(&[("customer_id", customer)]);
        }
        Self::read(request.send().await?).await
    }

    async fn stop(&self, job_id: &str) -> Result<JobSnapshot, Box<dyn std::error::Error>> {
        let response = self
            .http
            .delete(self.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await?;
        Self::read(response).await
    }

    async fn set_workers(
        &self,
        job_id: &str,
        count: usize,
    ) -> Result<JobSnapshot, Box<dyn std::error::Error>> {
        let response = self
            .http
            .put(self.url(&format!("/api/jobs/{job_id}/workers")))
            .json(&SetWorkersRequest { count })
            .send()
            .await?;
        Self::read(response).await
    }

    async fn pool(&self) -> Result<PoolSnapshot, Box<dyn std::error::Error>> {
        let response = self.http.get(self.url("/api/workers")).send().await?;
        Self::read(response).await
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.desired_workers == 0 {
        return Err("--desired-workers must be at least 1".into());
    }
    if args.storage_timeout_ms == 0 {
        return Err("--storage-timeout-ms must be at least 1".into());
    }

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let config = FarmConfig::new(listen_addr)
        .with_scheduling(SchedulingConfig {
            default_desired_workers: args.desired_workers,
            demand_retry_interval_ms: args.demand_retry_ms,
            demand_retry_jitter_ms: args.demand_retry_jitter_ms,
            max_demand_attempts: args.max_demand_attempts,
            finished_history: args.finished_history,
            max_frames_per_job: args.max_frames_per_job,
        })
        .with_storage(StorageConfig {
            blob_service_url: args.blob_service_url,
            document_service_url: args.document_service_url,
            upload_bucket: args.upload_bucket,
            output_bucket: args.output_bucket,
            scenes: args.scenes,
            request_timeout_ms: args.storage_timeout_ms,
        });

    tracing::info!(
        listen_addr = %config.listen_addr,
        blob_service = ?config.storage.blob_service_url,
        document_service = ?config.storage.document_service_url,
        desired_workers = config.scheduling.default_desired_workers,
        max_demand_attempts = config.scheduling.max_demand_attempts,
        "Starting framefarm"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::from_config(config, shutdown).await?;
    node.run().await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job(job: &JobSnapshot) {
    println!("Job ID:          {}", job.job_id);
    println!("Customer:        {}", job.customer_id);
    println!("Object:          {}", job.object_id);
    println!("Status:          {}", job.status);
    if let (Some(first), Some(last)) = (job.first_frame, job.last_frame) {
        println!("Frames:          {}-{}", first, last);
    }
    println!(
        "Progress:        {}/{} rendered, {} remaining",
        job.rendered_frames, job.total_frames, job.remaining_frames
    );
    println!(
        "Workers:         {} attached, {} desired",
        job.workers.len(),
        job.desired_workers
    );
    for worker in &job.workers {
        println!("  {}", worker);
    }
    println!("Created:         {}", job.created_at.to_rfc3339());
    if let Some(finished) = job.finished_at {
        println!("Finished:        {}", finished.to_rfc3339());
    }
    if let Some(error) = &job.error {
        println!("Error:           {}", error);
    }
}

async fn handle_job_command(
    client: &FarmClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Submit {
            customer_id,
            object_id,
            workers,
        } => {
            let response = client
                .submit(&StartJobRequest {
                    customer_id,
                    object_id,
                    desired_workers: workers,
                })
                .await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                OutputFormat::Table => {
                    println!("Job submitted successfully!");
                    println!("Job ID: {}", response.job_id);
                }
            }
        }
        JobCommands::Status { job_id } => {
            let job = client.status(&job_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job(&job),
            }
        }
        JobCommands::List { customer } => {
            let jobs = client.list(customer.as_deref()).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<38} {:<14} {:<12} {:>9} {:>7}",
                            "JOB ID", "STATUS", "CUSTOMER", "FRAMES", "WORKERS"
                        );
                        println!("{}", "-".repeat(84));
                        for job in &jobs {
                            let customer = if job.customer_id.chars().count() > 12 {
                                let head: String = job.customer_id.chars().take(9).collect();
                                format!("{}...", head)
                            } else {
                                job.customer_id.clone()
                            };
                            println!(
                                "{:<38} {:<14} {:<12} {:>9} {:>7}",
                                job.job_id,
                                job.status.to_string(),
                                customer,
                                format!("{}/{}", job.rendered_frames, job.total_frames),
                                job.workers.len()
                            );
                        }
                        println!();
                        println!("{} jobs", jobs.len());
                    }
                }
            }
        }
        JobCommands::Stop { job_id } => {
            let job = client.stop(&job_id).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => {
                    println!("Job {} stopped ({})", job.job_id, job.status);
                }
            }
        }
        JobCommands::Workers { job_id, count } => {
            let job = client.set_workers(&job_id, count).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => {
                    println!(
                        "Job {} now wants {} workers ({} attached)",
                        job.job_id,
                        job.desired_workers,
                        job.workers.len()
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_pool_status(
    client: &FarmClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = client.pool().await?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&pool)?),
        OutputFormat::Table => {
            println!("Worker Pool");
            println!("{}", "=".repeat(40));
            println!("Registered jobs: {}", pool.registered_jobs);
            println!("Idle workers:    {}", pool.idle.len());
            for worker in &pool.idle {
                println!("  {}", worker);
            }
            println!();
            println!("Pending demands:");
            if pool.demands.is_empty() {
                println!("  (none)");
            }
            for demand in &pool.demands {
                println!("  {:<38} {}", demand.job_id, demand.count);
            }
            println!();
            println!("{:<38} JOB", "WORKER");
            println!("{}", "-".repeat(76));
            for (worker, job_id) in &pool.assignments {
                println!("{:<38} {}", worker.to_string(), job_id);
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
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let farm = FarmClient::new(&client.addr);
            if let Err(e) = handle_job_command(&farm, command, &client.output).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Pool { client, command } => {
            let farm = FarmClient::new(&client.addr);
            match command {
                PoolCommands::Status => {
                    if let Err(e) = handle_pool_status(&farm, &client.output).await {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    Ok(())
}
