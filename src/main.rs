use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use batchd::client::Client;
use batchd::config::{
    DeployConfig, ExoscaleConfig, FleetConfig, ServerConfig, SshConfig, WorkerConfig,
};
use batchd::fleet::ExoscaleProvider;
use batchd::node::Node;
use batchd::scheduler::{Task, TaskResult};
use batchd::shutdown::install_shutdown_handler;
use batchd::worker::SshShell;

#[derive(Parser, Debug)]
#[command(name = "batchd")]
#[command(version)]
#[command(about = "Run batch tasks on an elastic fleet of cloud instances")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the batch server
    Server(ServerArgs),

    /// Run one task and print its output
    Run {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        task: TaskArgs,

        /// Arguments passed to the executable, joined with spaces
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run one task per line of an arguments file
    Map {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        task: TaskArgs,

        /// File with one argument string per line ("-" for stdin)
        #[arg(long)]
        args_file: PathBuf,
    },

    /// Show queue and fleet status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Unix socket to accept submissions on
    #[arg(long, short = 's', env = "BATCHD_SOCKET", default_value = "batchd.sock")]
    socket: PathBuf,

    /// Exoscale API key
    #[arg(long, env = "EXOSCALE_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Exoscale API secret
    #[arg(long, env = "EXOSCALE_API_SECRET", hide_env_values = true)]
    api_secret: String,

    /// Exoscale zone instances are created in
    #[arg(long, default_value = "de-fra-1")]
    zone: String,

    /// Override the API endpoint derived from the zone
    #[arg(long)]
    endpoint: Option<String>,

    /// Private key used to reach instances (default: ~/.ssh/id_rsa)
    #[arg(long)]
    ssh_key: Option<PathBuf>,

    /// Account tasks run under on the instances
    #[arg(long, default_value = "batch")]
    ssh_user: String,

    /// Maximum number of instances, including launches in flight
    #[arg(long, default_value = "200")]
    max_instances: usize,

    /// Number of concurrent launchers
    #[arg(long, default_value = "16")]
    launchers: usize,

    /// Seconds between fleet reconciliations
    #[arg(long, default_value = "120")]
    reconcile_interval: u64,

    /// Seconds an instance may sit idle before it is retired
    #[arg(long, default_value = "120")]
    idle_timeout: u64,

    /// Prefix of the names of instances owned by this server
    #[arg(long, default_value = "batch-")]
    name_prefix: String,

    /// SSH key pair name registered with the provider
    #[arg(long, default_value = "batch")]
    key_pair: String,

    /// Instance type ID
    #[arg(long)]
    instance_type: Option<String>,

    /// Template ID to boot from
    #[arg(long)]
    template: Option<String>,

    /// Root disk size in GB
    #[arg(long, default_value = "50")]
    disk_size: u64,
}

// =============================================================================
// Client Arguments (shared by run, map and status)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server socket
    #[arg(long, short = 's', env = "BATCHD_SOCKET", default_value = "batchd.sock")]
    socket: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct TaskArgs {
    /// Environment variable for the task (NAME=VALUE, repeatable)
    #[arg(long = "env", short = 'e', value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Executable to upload and run
    executable: String,
}

impl TaskArgs {
    fn task(&self, args: String) -> Task {
        Task {
            executable: self.executable.clone(),
            env: self.env.iter().cloned().collect::<HashMap<_, _>>(),
            args,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct TaskResultOutput {
    args: String,
    code: i32,
    output: String,
}

#[derive(Serialize)]
struct InstanceOutput {
    id: String,
    address: String,
    registered_at_ms: i64,
}

#[derive(Serialize)]
struct FleetStatusOutput {
    queue_length: u64,
    launches_in_flight: u64,
    max_instances: u64,
    reconciled_at_ms: Option<i64>,
    instances: Vec<InstanceOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {:?}", s)),
    }
}

fn read_args_file(path: &Path) -> Result<Vec<String>, std::io::Error> {
    let content = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Process exit status mirroring a task's exit code.
fn exit_status(result: &TaskResult) -> i32 {
    match result.code {
        code @ 0..=255 => code,
        _ => 1,
    }
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.api_key.is_empty() || args.api_secret.is_empty() {
        return Err("Exoscale credentials missing (--api-key, --api-secret)".into());
    }

    let defaults = DeployConfig::default();
    let deploy = DeployConfig {
        name_prefix: args.name_prefix,
        disk_size_gb: args.disk_size,
        instance_type: args.instance_type.unwrap_or(defaults.instance_type),
        template: args.template.unwrap_or(defaults.template),
        key_pair: args.key_pair,
        bootstrap_script: defaults.bootstrap_script,
    };

    let ssh_key = match args.ssh_key {
        Some(path) => path,
        None => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
            .ok_or("HOME is not set; pass --ssh-key")?,
    };
    let ssh = SshConfig {
        key_path: ssh_key,
        user: args.ssh_user.clone(),
        ..SshConfig::default()
    };

    let exoscale = ExoscaleConfig {
        api_key: args.api_key,
        api_secret: args.api_secret,
        zone: args.zone,
        endpoint: args.endpoint,
        ..ExoscaleConfig::default()
    };

    let config = ServerConfig {
        socket_path: args.socket,
        fleet: FleetConfig {
            max_instances: args.max_instances,
            launchers: args.launchers,
            reconcile_interval: std::time::Duration::from_secs(args.reconcile_interval),
            deploy: deploy.clone(),
            ..FleetConfig::default()
        },
        worker: WorkerConfig {
            idle_timeout: std::time::Duration::from_secs(args.idle_timeout),
            remote_dir: format!("/home/{}/batch", args.ssh_user),
            ..WorkerConfig::default()
        },
        ..ServerConfig::default()
    };

    tracing::info!(
        socket = %config.socket_path.display(),
        zone = %exoscale.zone,
        max_instances = config.fleet.max_instances,
        launchers = config.fleet.launchers,
        "Starting batch server"
    );

    let provider = Arc::new(ExoscaleProvider::new(exoscale, deploy.name_prefix));
    let shell = Arc::new(SshShell::new(ssh));
    let shutdown = install_shutdown_handler()?;

    let node = Node::new(config, provider, shell);
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Handlers
// =============================================================================

async fn handle_run(
    client: &Client,
    task: Task,
    output_format: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let args = task.args.clone();
    let result = client.run(task).await?;

    match output_format {
        OutputFormat::Json => {
            let output = TaskResultOutput {
                args,
                code: result.code,
                output: result.output.clone(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            print!("{}", result.output);
            std::io::stdout().flush()?;
            if !result.is_success() {
                eprintln!("Task exited with code {}", result.code);
            }
        }
    }
    Ok(exit_status(&result))
}

async fn handle_map(
    client: &Client,
    task_args: &TaskArgs,
    args_file: &Path,
    output_format: &OutputFormat,
) -> Result<i32, Box<dyn std::error::Error>> {
    let lines = read_args_file(args_file)?;
    let tasks: Vec<Task> = lines.iter().map(|line| task_args.task(line.clone())).collect();

    let results = client
        .map_with_progress(tasks, |_, result| {
            eprint!("{}", if result.is_success() { "." } else { "X" });
        })
        .await;
    eprintln!();

    let failed = results.iter().filter(|r| !r.is_success()).count();
    match output_format {
        OutputFormat::Json => {
            let output: Vec<TaskResultOutput> = lines
                .into_iter()
                .zip(results)
                .map(|(args, result)| TaskResultOutput {
                    args,
                    code: result.code,
                    output: result.output,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            for (index, (args, result)) in lines.iter().zip(&results).enumerate() {
                println!("[{}] {} (exit code {})", index, args, result.code);
                for line in result.output.lines() {
                    println!("  {}", line);
                }
            }
            println!();
            println!("{} tasks, {} failed", results.len(), failed);
        }
    }
    Ok(if failed == 0 { 0 } else { 1 })
}

async fn handle_status(
    client: &Client,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.fleet_status().await?;

    match output_format {
        OutputFormat::Json => {
            let output = FleetStatusOutput {
                queue_length: response.queue_length,
                launches_in_flight: response.launches_in_flight,
                max_instances: response.max_instances,
                reconciled_at_ms: response.reconciled_at_ms,
                instances: response
                    .instances
                    .into_iter()
                    .map(|i| InstanceOutput {
                        id: i.id,
                        address: i.address,
                        registered_at_ms: i.registered_at_ms,
                    })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Fleet Status");
            println!("{}", "=".repeat(40));
            println!("Queued tasks:       {}", response.queue_length);
            println!("Launches in flight: {}", response.launches_in_flight);
            println!(
                "Instances:          {} / {}",
                response.instances.len(),
                response.max_instances
            );
            println!(
                "Last reconciled:    {}",
                response
                    .reconciled_at_ms
                    .map(format_timestamp)
                    .unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("{:<38} {:<18} REGISTERED", "ID", "ADDRESS");
            println!("{}", "-".repeat(80));
            for instance in response.instances {
                println!(
                    "{:<38} {:<18} {}",
                    instance.id,
                    instance.address,
                    format_timestamp(instance.registered_at_ms)
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
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Run { client, task, args } => {
            let grpc_client = Client::connect(&client.socket).await?;
            let code = handle_run(&grpc_client, task.task(args.join(" ")), &client.output).await?;
            std::process::exit(code);
        }
        Commands::Map {
            client,
            task,
            args_file,
        } => {
            let grpc_client = Client::connect(&client.socket).await?;
            let code = handle_map(&grpc_client, &task, &args_file, &client.output).await?;
            std::process::exit(code);
        }
        Commands::Status { client } => {
            let grpc_client = Client::connect(&client.socket).await?;
            handle_status(&grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
