use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::pipeline::F1Mode;

/// TLS configuration for the coordinator's gRPC endpoint and its workers.
///
/// When enabled, all gRPC communication uses mutual TLS (mTLS):
/// - The coordinator presents its certificate and verifies worker certificates
/// - Workers present their certificate and verify the coordinator's
/// - Both sides must have certificates signed by the fleet CA
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this process's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to this process's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Allow insecure connections for development/testing.
    /// When true and TLS files are missing, runs in plaintext mode with warning.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// How the coordinator re-offers a stage whose claim never reached a worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClaimRetryPolicy {
    /// Give up and fail the job after this many consecutive delivery
    /// failures for the same stage. `None` re-queues forever.
    pub max_attempts: Option<u32>,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClaimRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ClaimRetryPolicy {
    /// Delay before the job may be offered again after `attempts` failures.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let delay = self.backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// Root of the durable job store (`<instance_dir>/jobs/<id>/`).
    pub instance_dir: PathBuf,
    /// Global in-flight limit per capability label. Missing labels get 1.
    pub parallelism: BTreeMap<String, u32>,
    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub claim_ack_timeout_ms: u64,
    pub scheduler_tick_ms: u64,
    pub claim_retry: ClaimRetryPolicy,
    /// Mode recorded on f1 jobs submitted without one.
    pub default_f1_mode: F1Mode,
    pub tls: TlsConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50061)),
            instance_dir: PathBuf::from("instance"),
            parallelism: BTreeMap::new(),
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
            claim_ack_timeout_ms: 5000,
            scheduler_tick_ms: 250,
            claim_retry: ClaimRetryPolicy::default(),
            default_f1_mode: F1Mode::SwEmu,
            tls: TlsConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr, instance_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            instance_dir: instance_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_parallelism(mut self, capability: impl Into<String>, limit: u32) -> Self {
        self.parallelism.insert(capability.into(), limit);
        self
    }

    /// Load from a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some((capability, _)) = self.parallelism.iter().find(|(_, limit)| **limit == 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "parallelism limit for '{}' must be positive",
                capability
            )));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(PipelineError::InvalidConfig(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parallelism_limit(&self, capability: &str) -> u32 {
        self.parallelism.get(capability).copied().unwrap_or(1)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn claim_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_ack_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

/// Site-specific knobs for the production command planner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainSettings {
    /// Prepended to every toolchain invocation (make, sds++, xocc, g++),
    /// e.g. `["nice", "-n", "10"]` or a container wrapper.
    pub command_prefix: Vec<String>,
    pub executable_name: String,
    pub default_platform: String,
    /// f1 target device. A value starting with `$` is read from the
    /// worker's environment.
    pub f1_device: String,
    /// Variables captured from the make database into the job's make_conf.
    pub make_conf_vars: Vec<String>,
    pub zynq_host: String,
    pub zynq_dest_dir: String,
    pub zynq_ssh_prefix: Vec<String>,
    pub zynq_reboot_delay_secs: u64,
    pub s3_bucket: String,
    pub s3_dcp_key: String,
    pub s3_logs_key: String,
    pub afi_check_interval_secs: u64,
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            command_prefix: Vec::new(),
            executable_name: "sdsoc".to_string(),
            default_platform: "zed".to_string(),
            f1_device: "$AWS_PLATFORM".to_string(),
            make_conf_vars: ["PLATFORM", "TARGET", "MODE", "DEVICE", "ESTIMATE", "DIRECTIVES"]
                .into_iter()
                .map(String::from)
                .collect(),
            zynq_host: "zb1".to_string(),
            zynq_dest_dir: "/mnt".to_string(),
            zynq_ssh_prefix: vec!["sshpass".to_string(), "-p".to_string(), "root".to_string()],
            zynq_reboot_delay_secs: 40,
            s3_bucket: "synthfleet".to_string(),
            s3_dcp_key: "dcp".to_string(),
            s3_logs_key: "logs".to_string(),
            afi_check_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Coordinator gRPC endpoint (use https:// for TLS).
    pub coordinator: String,
    /// Capability label -> number of concurrent stages this worker accepts.
    pub capabilities: BTreeMap<String, u32>,
    pub heartbeat_interval_ms: u64,
    pub log_flush_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Stage name -> wall-clock limit. Stages without an entry run unbounded.
    pub stage_timeouts_secs: BTreeMap<String, u64>,
    pub toolchain: ToolchainSettings,
    pub tls: TlsConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            coordinator: "http://127.0.0.1:50061".to_string(),
            capabilities: BTreeMap::new(),
            heartbeat_interval_ms: 1000,
            log_flush_interval_ms: 500,
            reconnect_delay_ms: 2000,
            stage_timeouts_secs: BTreeMap::new(),
            toolchain: ToolchainSettings::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>, slots: u32) -> Self {
        self.capabilities.insert(capability.into(), slots);
        self
    }

    pub fn with_stage_timeout(mut self, stage: impl Into<String>, secs: u64) -> Self {
        self.stage_timeouts_secs.insert(stage.into(), secs);
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "worker_id must not be empty".to_string(),
            ));
        }
        if self.capabilities.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "worker '{}' advertises no capabilities",
                self.worker_id
            )));
        }
        if let Some((capability, _)) = self.capabilities.iter().find(|(_, slots)| **slots == 0) {
            return Err(PipelineError::InvalidConfig(format!(
                "capability '{}' needs at least one slot",
                capability
            )));
        }
        Ok(())
    }

    pub fn stage_timeout(&self, stage: &str) -> Option<Duration> {
        self.stage_timeouts_secs
            .get(stage)
            .map(|secs| Duration::from_secs(*secs))
    }
}
