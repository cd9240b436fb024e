use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bind address for the control HTTP server (/health, /status, /poll)
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL; supports ${ENV_VAR} expansion
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// How many devices are polled concurrently within one cycle
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-request network timeout against a device
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            request_timeout_secs: 10,
            retry_max_attempts: 3,
            retry_base_secs: 1,
            retry_max_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertingConfig {
    #[serde(default = "default_rate_per_min")]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self { rate_limit_per_minute: 10, webhook: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        // Expand environment variables
        let expanded = expand_env_vars(&content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

// Default value functions
fn default_log_level() -> String { "info".to_string() }
fn default_http_bind() -> String { "0.0.0.0:5000".to_string() }
fn default_max_connections() -> u32 { 5 }
fn default_connect_attempts() -> u32 { 30 }
fn default_connect_retry_secs() -> u64 { 2 }
fn default_concurrency() -> usize { 4 }
fn default_request_timeout() -> u64 { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_base_secs() -> u64 { 1 }
fn default_retry_max_secs() -> u64 { 10 }
fn default_rate_per_min() -> u32 { 10 }
