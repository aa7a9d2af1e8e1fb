use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::queue::DEFAULT_QUEUE_CAPACITY;

/// Runs once on first boot of every instance. Prepares the account tasks run
/// under and touches the readiness marker polled by the worker.
pub const BOOTSTRAP_SCRIPT: &str = r#"#!/bin/bash
echo "* soft nofile 1000000" >> /etc/security/limits.conf
echo "* hard nofile 1000000" >> /etc/security/limits.conf
adduser --disabled-password --gecos "" batch
cp -r /root/.ssh /home/batch/
chown -R batch:batch /home/batch/.ssh
touch /batch.ready
"#;

/// Parameters for provisioning one worker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    /// Instances are named `<prefix><uuid>`; only instances carrying the
    /// prefix belong to the fleet.
    pub name_prefix: String,
    pub disk_size_gb: u64,
    pub instance_type: String,
    pub template: String,
    pub key_pair: String,
    pub bootstrap_script: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            name_prefix: "batch-".to_string(),
            disk_size_gb: 50,
            // 4 cores, 8 GB
            instance_type: "c6f99499-7f59-4138-9427-a09db13af2bc".to_string(),
            // Debian 10
            template: "b7ce66da-8bd1-4a02-8788-0bd880038b01".to_string(),
            key_pair: "batch".to_string(),
            bootstrap_script: BOOTSTRAP_SCRIPT.to_string(),
        }
    }
}

/// Fleet sizing and control loop timing.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Hard ceiling on known plus in-flight instances.
    pub max_instances: usize,
    /// Number of concurrent launcher loops.
    pub launchers: usize,
    pub reconcile_interval: Duration,
    /// Wait after a failed deploy before asking for authorization again.
    pub launch_failure_backoff: Duration,
    /// Wait after authorization was denied.
    pub launch_poll_interval: Duration,
    pub deploy: DeployConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_instances: 200,
            launchers: 16,
            reconcile_interval: Duration::from_secs(120),
            launch_failure_backoff: Duration::from_secs(30),
            launch_poll_interval: Duration::from_secs(1),
            deploy: DeployConfig::default(),
        }
    }
}

/// Per-instance lifecycle timing and remote layout.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path whose existence on the instance signals that bootstrap finished.
    pub ready_marker: String,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// An instance that sees no task for this long is retired.
    pub idle_timeout: Duration,
    pub retire_retry_delay: Duration,
    /// Remote working directory; recreated whenever a new executable is uploaded.
    pub remote_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ready_marker: "/batch.ready".to_string(),
            ready_poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            retire_retry_delay: Duration::from_secs(30),
            remote_dir: "/home/batch/batch".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Where the uploaded executable lives on the instance.
    pub fn remote_executable(&self) -> String {
        format!("{}/exe", self.remote_dir.trim_end_matches('/'))
    }
}

/// Remote shell access to worker instances.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub key_path: PathBuf,
    pub user: String,
    pub connect_timeout_secs: u64,
    /// Multiplexing socket location, in ssh `ControlPath` syntax.
    pub control_path: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("~/.ssh/id_rsa"),
            user: "batch".to_string(),
            connect_timeout_secs: 10,
            control_path: "/tmp/_batch-ssh-socket-%r@%h:%p".to_string(),
        }
    }
}

/// Credentials and placement for the Exoscale compute API.
#[derive(Debug, Clone)]
pub struct ExoscaleConfig {
    pub api_key: String,
    pub api_secret: String,
    pub zone: String,
    /// Overrides the zone-derived endpoint, e.g. for a proxy.
    pub endpoint: Option<String>,
    pub operation_poll_interval: Duration,
    pub operation_timeout: Duration,
}

impl Default for ExoscaleConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            zone: "de-fra-1".to_string(),
            endpoint: None,
            operation_poll_interval: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

impl ExoscaleConfig {
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://api-{}.exoscale.com/v2", self.zone),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub queue_capacity: usize,
    pub fleet: FleetConfig,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("batchd.sock"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            fleet: FleetConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }
}
