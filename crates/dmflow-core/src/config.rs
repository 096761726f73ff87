use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DmFlowError, Result};

/// Top-level dmflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "dmflow.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the platform's Graph API.
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    /// Fixed per-request timeout. All outbound calls carry it.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            timeout_secs: default_gateway_timeout(),
        }
    }
}

fn default_gateway_base_url() -> String {
    "https://graph.instagram.com/v24.0".to_string()
}

fn default_gateway_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret for the internal process-trigger endpoint.
    #[serde(default)]
    pub internal_api_key: String,
    /// Token echoed back during webhook subscription verification.
    #[serde(default)]
    pub verify_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            internal_api_key: String::new(),
            verify_token: String::new(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Cadence of the trigger-queue worker.
    #[serde(default = "default_queue_interval")]
    pub queue_interval_secs: u64,
    /// Cadence of the subscription enforcer.
    #[serde(default = "default_enforcer_interval")]
    pub enforcer_interval_secs: u64,
    /// Wall-clock budget of a single queue-worker run.
    #[serde(default = "default_run_budget")]
    pub run_budget_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            queue_interval_secs: default_queue_interval(),
            enforcer_interval_secs: default_enforcer_interval(),
            run_budget_secs: default_run_budget(),
        }
    }
}

fn default_queue_interval() -> u64 {
    300
}

fn default_enforcer_interval() -> u64 {
    86_400
}

fn default_run_budget() -> u64 {
    900
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Hard default when neither the plan nor the global config row sets a
    /// limit.
    #[serde(default = "default_rate_limit")]
    pub default_per_hour: u32,
    /// Calls held back from every account's hourly budget.
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: u32,
    /// Empirical API-call cost of replaying one trigger.
    #[serde(default = "default_trigger_cost")]
    pub per_trigger_cost: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_per_hour: default_rate_limit(),
            safety_buffer: default_safety_buffer(),
            per_trigger_cost: default_trigger_cost(),
        }
    }
}

fn default_rate_limit() -> u32 {
    200
}

fn default_safety_buffer() -> u32 {
    50
}

fn default_trigger_cost() -> u32 {
    10
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DmFlowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| DmFlowError::Config(e.to_string()))
    }

    pub fn storage_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.path)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
            server: ServerConfig::default(),
            workers: WorkersConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
