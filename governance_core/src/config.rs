//! Configuration management for the governance core
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde, plus `GOVERNANCE_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for a governance node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
    /// Node identity and election settings
    pub node: NodeConfig,
    /// Resource quotas and reclamation
    pub resources: ResourceConfig,
    /// Leader election lease settings
    pub election: ElectionConfig,
    /// Two-phase commit settings
    pub transaction: TransactionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID
    pub node_id: String,
    /// Election key this node competes for
    pub election_key: String,
    /// Run for leadership on startup
    pub run_for_leader: bool,
}

/// Resource manager quotas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Process memory ceiling in megabytes
    pub memory_limit_mb: u64,
    /// Maximum database connections
    pub max_connections: usize,
    /// Maximum open file handles
    pub max_file_handles: usize,
    /// Maximum network sockets
    pub max_sockets: usize,
    /// Maximum tracked threads
    pub max_threads: usize,
    /// Maximum custom resources (None = unlimited)
    pub max_custom: Option<usize>,
    /// Reclamation sweep interval in seconds
    pub cleanup_interval: u64,
    /// Idle time in seconds after which a resource is reclaimed
    pub idle_timeout: u64,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Lease TTL in seconds
    pub lease_ttl: u64,
    /// Lease renewal heartbeat in milliseconds
    pub renew_interval_ms: u64,
}

/// Two-phase commit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Per-participant vote timeout in seconds
    pub vote_timeout: u64,
    /// Roll back automatically when the prepare phase fails
    pub auto_rollback: bool,
    /// Key prefix for the transaction key space
    pub key_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional)
    pub file_path: Option<String>,
    /// Enable console output
    pub console: bool,
    /// Enable structured logging
    pub structured: bool,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics
    pub enabled: bool,
    /// Metrics bind address
    pub bind_address: String,
    /// Metrics port
    pub port: u16,
    /// Enable Prometheus exporter
    pub prometheus: bool,
    /// Custom labels
    pub labels: HashMap<String, String>,
}

impl GovernanceConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: GovernanceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: GovernanceConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load from either format, picking YAML for `.yaml`/`.yml` extensions
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let is_yaml = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);

        if is_yaml {
            Self::from_yaml_file(path)
        } else {
            Self::from_file(path)
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `GOVERNANCE_*` environment variable overrides.
    ///
    /// Unparseable values are reported as errors rather than ignored.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests and by
    /// `apply_env_overrides`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("invalid value for {}: {}", name, value))
        }

        if let Some(node_id) = lookup("GOVERNANCE_NODE_ID") {
            self.node.node_id = node_id;
        }
        if let Some(value) = lookup("GOVERNANCE_MEMORY_LIMIT_MB") {
            self.resources.memory_limit_mb = parse("GOVERNANCE_MEMORY_LIMIT_MB", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_MAX_CONNECTIONS") {
            self.resources.max_connections = parse("GOVERNANCE_MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_MAX_FILE_HANDLES") {
            self.resources.max_file_handles = parse("GOVERNANCE_MAX_FILE_HANDLES", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_MAX_SOCKETS") {
            self.resources.max_sockets = parse("GOVERNANCE_MAX_SOCKETS", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_MAX_THREADS") {
            self.resources.max_threads = parse("GOVERNANCE_MAX_THREADS", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_IDLE_TIMEOUT") {
            self.resources.idle_timeout = parse("GOVERNANCE_IDLE_TIMEOUT", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_LEASE_TTL") {
            self.election.lease_ttl = parse("GOVERNANCE_LEASE_TTL", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_VOTE_TIMEOUT") {
            self.transaction.vote_timeout = parse("GOVERNANCE_VOTE_TIMEOUT", value)?;
        }
        if let Some(value) = lookup("GOVERNANCE_LOG_LEVEL") {
            self.logging.level = value.parse()?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.node_id.is_empty() {
            errors.push("Node ID cannot be empty".to_string());
        }
        if self.node.election_key.is_empty() {
            errors.push("Election key cannot be empty".to_string());
        }

        if self.resources.memory_limit_mb == 0 {
            errors.push("Memory limit cannot be 0".to_string());
        }
        if self.resources.max_connections == 0 {
            errors.push("Max connections cannot be 0".to_string());
        }
        if self.resources.max_file_handles == 0 {
            errors.push("Max file handles cannot be 0".to_string());
        }
        if self.resources.max_sockets == 0 {
            errors.push("Max sockets cannot be 0".to_string());
        }
        if self.resources.max_threads == 0 {
            errors.push("Max threads cannot be 0".to_string());
        }
        if self.resources.cleanup_interval == 0 {
            errors.push("Cleanup interval cannot be 0".to_string());
        }
        if self.resources.idle_timeout == 0 {
            errors.push("Idle timeout cannot be 0".to_string());
        }

        if self.election.lease_ttl == 0 {
            errors.push("Lease TTL cannot be 0".to_string());
        }
        if self.election.renew_interval_ms == 0
            || self.election.renew_interval_ms >= self.election.lease_ttl.saturating_mul(1000)
        {
            errors.push("Renew interval must be shorter than the lease TTL".to_string());
        }

        if self.transaction.vote_timeout == 0 {
            errors.push("Vote timeout cannot be 0".to_string());
        }
        if !self.transaction.key_prefix.starts_with('/') {
            errors.push("Transaction key prefix must start with '/'".to_string());
        }

        if self.metrics.enabled && self.metrics.prometheus && self.metrics.port == 0 {
            errors.push("Metrics port cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get duration for the reclamation sweep interval
    pub fn cleanup_duration(&self) -> Duration {
        self.resources.cleanup_duration()
    }

    /// Get duration for the idle reclamation threshold
    pub fn idle_duration(&self) -> Duration {
        self.resources.idle_duration()
    }

    /// Get duration for the election lease TTL
    pub fn lease_duration(&self) -> Duration {
        self.election.lease_duration()
    }

    /// Get duration for the lease renewal heartbeat
    pub fn renew_duration(&self) -> Duration {
        self.election.renew_duration()
    }

    /// Get duration for the per-participant vote timeout
    pub fn vote_duration(&self) -> Duration {
        self.transaction.vote_duration()
    }

    /// Get duration for graceful shutdown timeout
    pub fn shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl ResourceConfig {
    pub fn cleanup_duration(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn idle_duration(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

impl ElectionConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_ttl)
    }

    pub fn renew_duration(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

impl TransactionConfig {
    pub fn vote_duration(&self) -> Duration {
        Duration::from_secs(self.vote_timeout)
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            resources: ResourceConfig::default(),
            election: ElectionConfig::default(),
            transaction: TransactionConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_timeout: 30,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            election_key: "/election/leader".to_string(),
            run_for_leader: false,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024,
            max_connections: 100,
            max_file_handles: 1000,
            max_sockets: 100,
            max_threads: 50,
            max_custom: None,
            cleanup_interval: 60,
            idle_timeout: 300, // 5 minutes
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl: 30,
            renew_interval_ms: 10_000,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            vote_timeout: 30,
            auto_rollback: true,
            key_prefix: "/transactions".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            file_path: None,
            console: true,
            structured: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 9090,
            prometheus: false,
            labels: HashMap::new(),
        }
    }
}
