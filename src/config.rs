use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::policy::{DEFAULT_ALLOWLIST_PATH, DEFAULT_BLOCKLIST_PATH};

/// Top-level configuration for the agent.
///
/// Loaded from an optional YAML file, then overridden from the environment
/// (the container deployment sets everything through env vars).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identifies this node in emitted events. Default: "primary".
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Path of the dnstap frame-stream UNIX socket.
    #[serde(default = "default_dnstap_socket")]
    pub dnstap_socket: PathBuf,

    /// host:port for the PowerDNS protobuf TCP listener.
    #[serde(default = "default_protobuf_listen")]
    pub protobuf_listen: String,

    /// Upstream ingest endpoint configuration.
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Durable buffer configuration.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// RPZ block/allow file paths.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Interval between flush/forward ticks. Default: 2s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Interval between buffer prune passes. Default: 5m.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,

    /// Emit periodic counter logs and per-message samples.
    #[serde(default)]
    pub debug: bool,
}

/// Upstream ingest service connection.
#[derive(Debug, Clone, Deserialize)]
pub struct PrimaryConfig {
    /// Base URL of the ingest service.
    #[serde(default = "default_primary_url")]
    pub url: String,

    /// Node API key, sent as X-PowerBlockade-Node-Key. Required.
    #[serde(default)]
    pub api_key: String,
}

/// Durable buffer sizing and location.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Store path. Default: /var/lib/dnstap-processor/buffer.db.
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,

    /// Size bound, reported by the debug tick. Default: 100MB.
    #[serde(default = "default_buffer_max_bytes")]
    pub max_bytes: u64,

    /// Event retention in seconds; prune removes older entries. Default: 24h.
    #[serde(default = "default_buffer_max_age")]
    pub max_age_seconds: u64,
}

impl BufferConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }
}

/// RPZ policy file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_blocklist_path")]
    pub blocklist_path: PathBuf,

    #[serde(default = "default_allowlist_path")]
    pub allowlist_path: PathBuf,
}

// --- Default value functions ---

fn default_node_name() -> String {
    "primary".to_string()
}

fn default_dnstap_socket() -> PathBuf {
    PathBuf::from("/var/run/dnstap/dnstap.sock")
}

fn default_protobuf_listen() -> String {
    "0.0.0.0:50001".to_string()
}

fn default_primary_url() -> String {
    "http://admin-ui:8080".to_string()
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("/var/lib/dnstap-processor/buffer.db")
}

fn default_buffer_max_bytes() -> u64 {
    100 * 1024 * 1024
}

fn default_buffer_max_age() -> u64 {
    86_400
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from(DEFAULT_BLOCKLIST_PATH)
}

fn default_allowlist_path() -> PathBuf {
    PathBuf::from(DEFAULT_ALLOWLIST_PATH)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(300)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            dnstap_socket: default_dnstap_socket(),
            protobuf_listen: default_protobuf_listen(),
            primary: PrimaryConfig::default(),
            buffer: BufferConfig::default(),
            policy: PolicyConfig::default(),
            flush_interval: default_flush_interval(),
            prune_interval: default_prune_interval(),
            debug: false,
        }
    }
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            url: default_primary_url(),
            api_key: String::new(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
            max_bytes: default_buffer_max_bytes(),
            max_age_seconds: default_buffer_max_age(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            blocklist_path: default_blocklist_path(),
            allowlist_path: default_allowlist_path(),
        }
    }
}

// --- Loading and validation ---

impl Config {
    /// Load configuration: defaults, then the optional YAML file, then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let data = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing config file {}", p.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Applies the env vars the container deployment sets. Unparseable
    /// numeric values are ignored with a warning, matching a missing var.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_str("NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = env_str("DNSTAP_SOCKET") {
            self.dnstap_socket = PathBuf::from(v);
        }
        if let Some(v) = env_str("PROTOBUF_LISTEN") {
            self.protobuf_listen = v;
        }
        if let Some(v) = env_str("PRIMARY_URL") {
            self.primary.url = v;
        }
        if let Some(v) = env_str("PRIMARY_API_KEY") {
            self.primary.api_key = v;
        }
        if let Some(v) = env_str("BUFFER_PATH") {
            self.buffer.path = PathBuf::from(v);
        }
        if let Some(v) = env_str("BUFFER_MAX_BYTES") {
            match parse_bytes(&v) {
                Ok(n) => self.buffer.max_bytes = n,
                Err(e) => warn!(value = %v, error = %e, "ignoring BUFFER_MAX_BYTES"),
            }
        }
        if let Some(v) = env_str("BUFFER_MAX_AGE") {
            match v.parse::<u64>() {
                Ok(n) => self.buffer.max_age_seconds = n,
                Err(e) => warn!(value = %v, error = %e, "ignoring BUFFER_MAX_AGE"),
            }
        }
        if let Some(v) = env_str("DEBUG_DNSTAP") {
            self.debug = parse_bool(&v);
        }
    }

    /// Validates required fields. Failures here are fatal at boot.
    pub fn validate(&self) -> Result<()> {
        if self.primary.api_key.is_empty() {
            bail!("primary.api_key is required (set PRIMARY_API_KEY)");
        }
        if self.primary.url.is_empty() {
            bail!("primary.url is required");
        }
        if self.node_name.is_empty() {
            bail!("node_name must not be empty");
        }
        if self.protobuf_listen.is_empty() {
            bail!("protobuf_listen must not be empty");
        }
        if self.dnstap_socket.as_os_str().is_empty() {
            bail!("dnstap_socket must not be empty");
        }
        Ok(())
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses a byte count with an optional K/KB/M/MB/G/GB suffix.
pub fn parse_bytes(s: &str) -> Result<u64> {
    let upper = s.trim().to_ascii_uppercase();

    let (digits, multiplier) = if let Some(rest) = upper.strip_suffix("GB") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix('G') {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix("MB") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix('M') {
        (rest, 1024 * 1024)
    } else if let Some(rest) = upper.strip_suffix("KB") {
        (rest, 1024)
    } else if let Some(rest) = upper.strip_suffix('K') {
        (rest, 1024)
    } else {
        (upper.as_str(), 1)
    };

    let n: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid byte count {s:?}"))?;
    Ok(n * multiplier)
}

fn parse_bool(s: &str) -> bool {
    s == "1" || s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes")
}
