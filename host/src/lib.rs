//! The oscar host: configuration, the HTTP/WebSocket surface, and the wiring
//! that assembles the store, vault, sandbox driver and orchestrator into one
//! serving process.

pub mod error;
pub mod server;
pub mod service;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use oscar_engine::{EventBroadcaster, Orchestrator, OrchestratorConfig};

use crate::error::HostResult;
use crate::service::ExecutionService;

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("host/config/config.json")
}

fn default_max_log() -> usize {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_count() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    100
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_sandbox_image() -> String {
    oscar_sandbox::DEFAULT_IMAGE.to_string()
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_cpu_limit() -> f64 {
    oscar_sandbox::DEFAULT_CPU_LIMIT
}

fn default_memory_bytes() -> u64 {
    oscar_sandbox::DEFAULT_MEMORY_BYTES
}

fn default_encryption_secret() -> String {
    "oscar-dev-secret".to_string()
}

#[derive(Default, Clone, Serialize, Deserialize, Debug, Parser)]
#[command(name = "oscar", about = "Online schema change orchestrator", long_about = None)]
#[serde(default)]
pub struct Cli {
    #[arg(long, require_equals = true, default_value = "0.0.0.0:8080")]
    #[serde(default = "default_address")]
    /// Server bind address
    /// [default: 0.0.0.0:8080]
    pub address: String,

    #[arg(long, require_equals = true, default_value = "host/config/config.json")]
    #[serde(default = "default_config_path")]
    /// Path to a JSON config file; command line flags override its contents
    pub config_path: PathBuf,

    #[arg(long, require_equals = true)]
    /// Directory for rolling log files; stdout only when unset
    pub log_path: Option<PathBuf>,

    #[arg(long, require_equals = true, default_value = "7")]
    #[serde(default = "default_max_log")]
    /// Number of rolled log files to keep
    pub max_log: usize,

    #[arg(long, require_equals = true, env = "RUST_LOG", default_value = "info")]
    #[serde(default = "default_log_level")]
    /// Set the log level
    pub log_level: String,

    #[arg(long, require_equals = true, default_value = "10")]
    #[serde(default = "default_worker_count")]
    /// Fixed number of execution workers
    pub worker_count: usize,

    #[arg(long, require_equals = true, default_value = "100")]
    #[serde(default = "default_queue_capacity")]
    /// Capacity of the execution queue
    pub queue_capacity: usize,

    #[arg(long, require_equals = true, default_value = "docker")]
    #[serde(default = "default_docker_bin")]
    /// Container CLI used to run sandboxes
    pub docker_bin: String,

    #[arg(long, require_equals = true, default_value = "percona/percona-toolkit:latest")]
    #[serde(default = "default_sandbox_image")]
    /// Image the sandboxes run
    pub sandbox_image: String,

    #[arg(long, require_equals = true, default_value = "bridge")]
    #[serde(default = "default_network_mode")]
    pub sandbox_network_mode: String,

    #[arg(long, require_equals = true, default_value = "2.0")]
    #[serde(default = "default_cpu_limit")]
    /// CPU cores per sandbox
    pub sandbox_cpu_limit: f64,

    #[arg(long, require_equals = true, default_value = "2147483648")]
    #[serde(default = "default_memory_bytes")]
    /// Memory bytes per sandbox
    pub sandbox_memory_bytes: u64,

    #[arg(
        long,
        require_equals = true,
        env = "OSCAR_ENCRYPTION_SECRET",
        default_value = "oscar-dev-secret"
    )]
    #[serde(default = "default_encryption_secret")]
    /// Secret the credential vault derives its key from
    pub encryption_secret: String,

    #[arg(long, require_equals = true, value_delimiter = ',')]
    /// Tables whose changes always need extra approval
    pub important_tables: Option<Vec<String>>,
}

impl Cli {
    /// Read the options from a file and merge it with the current options.
    pub fn merge_from_file(&mut self) -> HostResult<()> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Value = serde_json::from_reader(reader)?;
        let this = serde_json::to_value(&self)?;
        merge(&mut config, &this);

        *self = serde_json::from_value(config)?;
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            sandbox_cpu_limit: self.sandbox_cpu_limit,
            sandbox_memory_bytes: self.sandbox_memory_bytes,
            sandbox_network_mode: self.sandbox_network_mode.clone(),
            ..Default::default()
        }
    }
}

/// Merges two json's together, overwriting `a` with the values of `b`
fn merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                merge(a.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a, b) if !b.is_null() => *a = b.clone(),
        // If b is null, just keep a (which means do nothing).
        _ => {}
    }
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct HostState {
    pub opts: Arc<Cli>,
    pub service: Arc<ExecutionService>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub orchestrator: Arc<Orchestrator>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_file_fills_in_what_flags_leave_null() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"queue_capacity": 5, "important_tables": ["orders"]}}"#
        )
        .unwrap();

        let mut opts = Cli::parse_from(["oscar"]);
        opts.config_path = file.path().to_path_buf();
        opts.merge_from_file().unwrap();

        // Flag defaults win over the file; unset options come from it.
        assert_eq!(opts.queue_capacity, 100);
        assert_eq!(opts.important_tables, Some(vec!["orders".to_string()]));
    }
}
