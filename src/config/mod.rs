//! Configuration types and loading for the name services.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Default nameserv.yaml embedded at compile time
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../../nameserv.yaml");

/// Main configuration struct
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llmnr: Option<LlmnrConfig>,
    #[serde(default)]
    pub nbns: Option<NbnsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============== LLMNR Config ==============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmnrConfig {
    /// Address families to serve: "udp4", "udp6"
    #[serde(default = "default_llmnr_networks")]
    pub networks: Vec<String>,
    #[serde(default = "default_llmnr_port")]
    pub port: u16,
    /// Dump every decoded request through the logger sink
    #[serde(default)]
    pub debug: bool,
    /// Default timeout for client queries
    #[serde(default = "default_llmnr_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Names answered by the static host handler, with their addresses
    #[serde(default)]
    pub hosts: BTreeMap<String, Vec<String>>,
}

fn default_llmnr_networks() -> Vec<String> {
    vec!["udp4".to_string()]
}

fn default_llmnr_port() -> u16 {
    5355
}

fn default_llmnr_query_timeout_ms() -> u64 {
    2000
}

impl Default for LlmnrConfig {
    fn default() -> Self {
        LlmnrConfig {
            networks: default_llmnr_networks(),
            port: default_llmnr_port(),
            debug: false,
            query_timeout_ms: default_llmnr_query_timeout_ms(),
            hosts: BTreeMap::new(),
        }
    }
}

// ============== NBNS Config ==============

#[derive(Debug, Deserialize, Clone)]
pub struct NbnsConfig {
    #[serde(default = "default_nbns_listen")]
    pub listen: String,
    /// Also accept length-prefixed requests over TCP on the same address
    #[serde(default = "default_nbns_tcp")]
    pub tcp: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_read_timeout_ms: u64,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_write_timeout_ms: u64,
    #[serde(default = "default_tcp_timeout_seconds")]
    pub tcp_timeout_seconds: u64,
    /// Largest accepted TCP message; larger length prefixes drop the connection
    #[serde(default = "default_max_tcp_message")]
    pub max_tcp_message: usize,
    /// How often expired registrations are purged
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Treat release of an unknown name or owner as success
    #[serde(default)]
    pub lenient_release: bool,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,
}

fn default_nbns_listen() -> String {
    "0.0.0.0:137".to_string()
}

fn default_nbns_tcp() -> bool {
    true
}

fn default_udp_timeout_ms() -> u64 {
    5000
}

fn default_tcp_timeout_seconds() -> u64 {
    30
}

fn default_max_tcp_message() -> usize {
    65535
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

impl Default for NbnsConfig {
    fn default() -> Self {
        NbnsConfig {
            listen: default_nbns_listen(),
            tcp: default_nbns_tcp(),
            debug: false,
            udp_read_timeout_ms: default_udp_timeout_ms(),
            udp_write_timeout_ms: default_udp_timeout_ms(),
            tcp_timeout_seconds: default_tcp_timeout_seconds(),
            max_tcp_message: default_max_tcp_message(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            lenient_release: false,
            challenge: ChallengeConfig::default(),
            redirects: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChallengeConfig {
    /// Challenge the current owner before refusing a unique registration
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_challenge_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_challenge_attempts")]
    pub attempts: u32,
    /// Port queried on the putative owner
    #[serde(default = "default_challenge_port")]
    pub port: u16,
}

fn default_challenge_timeout_ms() -> u64 {
    2000
}

fn default_challenge_attempts() -> u32 {
    3
}

fn default_challenge_port() -> u16 {
    137
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        ChallengeConfig {
            enabled: false,
            timeout_ms: default_challenge_timeout_ms(),
            attempts: default_challenge_attempts(),
            port: default_challenge_port(),
        }
    }
}

/// Queries for names in `scope` are redirected to `server:port`
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RedirectConfig {
    pub scope: String,
    pub server: String,
    #[serde(default = "default_challenge_port")]
    pub port: u16,
}

// ============== Logging Config ==============

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// File logging configuration
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            enabled: default_logging_enabled(),
            level: default_log_level(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileLoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Days to keep old log files (0 = keep forever)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    /// Compress rotated log files with gzip
    #[serde(default = "default_compress")]
    pub compress: bool,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_file_prefix() -> String {
    "nameserv.log".to_string()
}

fn default_max_age_days() -> u64 {
    7
}

fn default_compress() -> bool {
    true
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        FileLoggingConfig {
            log_dir: default_log_dir(),
            file_prefix: default_log_file_prefix(),
            rotation: LogRotation::Daily,
            max_age_days: default_max_age_days(),
            compress: default_compress(),
        }
    }
}

// ============== Config Loading ==============

fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Load configuration from `path`, else `./nameserv.yaml`, else next to the
/// executable. With no file found the embedded `nameserv.yaml` applies;
/// unreadable or invalid files are errors.
pub fn load_config(path: Option<&str>) -> crate::error::Result<Config> {
    let config_paths = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => {
            let mut paths = vec![PathBuf::from("nameserv.yaml")];
            if let Some(dir) = exe_dir() {
                paths.push(dir.join("nameserv.yaml"));
            }
            paths
        }
    };

    load_first(&config_paths)
}

/// Parse the first of `paths` that exists, else the embedded default config
fn load_first(paths: &[PathBuf]) -> crate::error::Result<Config> {
    for config_path in paths {
        if config_path.exists() {
            tracing::info!(path = %config_path.display(), "Loading config");
            let content = fs::read_to_string(config_path)?;
            return parse_config(&content);
        }
    }

    tracing::info!("No config file found, using built-in defaults");
    parse_config(DEFAULT_CONFIG_YAML)
}

/// Parse YAML configuration text
pub fn parse_config(content: &str) -> crate::error::Result<Config> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml_ng::from_str(content).map_err(|e| crate::error::Error::Config(e.to_string()))
}

// ============== Unit Tests ==============
