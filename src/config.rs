//! Proxy configuration: JSON file (path from argv) with env-var overrides
//! for the common deployment knobs. Durations are numeric seconds unless a
//! field says otherwise; the template refresh runs on milliseconds.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Instance identifier, used as the node-state key in the backend.
    pub name: String,
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
    #[serde(default = "default_upstream_check_secs")]
    pub upstream_check_interval_secs: u64,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProxyConfig {
    #[serde(default = "default_http_listen")]
    pub listen: String,
    #[serde(default = "default_limit_headers_size")]
    pub limit_headers_size: usize,
    #[serde(default = "default_limit_body_size")]
    pub limit_body_size: usize,
    #[serde(default)]
    pub behind_reverse_proxy: bool,
    /// Pool share difficulty served to miners.
    #[serde(default = "default_difficulty")]
    pub difficulty: u64,
    #[serde(default = "default_block_refresh_ms")]
    pub block_refresh_interval_ms: u64,
    #[serde(default = "default_state_update_secs")]
    pub state_update_interval_secs: u64,
    #[serde(default = "default_hashrate_expiration_secs")]
    pub hashrate_expiration_secs: u64,
    #[serde(default = "default_true")]
    pub health_check: bool,
    #[serde(default = "default_max_fails")]
    pub max_fails: i64,
    #[serde(default)]
    pub stratum: StratumConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StratumConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stratum_listen")]
    pub listen: String,
    #[serde(default = "default_stratum_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PolicyConfig {
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct BanningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ban_duration_secs")]
    pub duration_secs: u64,
    /// Reject when this share of a window is invalid.
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,
    /// Minimum shares in the window before the ratio is judged; doubles as
    /// the absolute invalid-count limit.
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u64,
    #[serde(default = "default_malformed_limit")]
    pub malformed_limit: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Connect-attempt budget per IP.
    #[serde(default = "default_limit")]
    pub limit: i32,
    #[serde(default = "default_limit_jump")]
    pub limit_jump: i32,
}

fn default_upstream_check_secs() -> u64 { 5 }
fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }
fn default_upstream_timeout_secs() -> u64 { 10 }
fn default_http_listen() -> String { "0.0.0.0:8888".to_string() }
fn default_limit_headers_size() -> usize { 1024 }
fn default_limit_body_size() -> usize { 256 }
fn default_difficulty() -> u64 { 2000 }
fn default_block_refresh_ms() -> u64 { 120 }
fn default_state_update_secs() -> u64 { 3 }
fn default_hashrate_expiration_secs() -> u64 { 10_800 }
fn default_true() -> bool { true }
fn default_max_fails() -> i64 { 100 }
fn default_stratum_listen() -> String { "0.0.0.0:8008".to_string() }
fn default_stratum_timeout_secs() -> u64 { 120 }
fn default_max_conn() -> usize { 8192 }
fn default_reset_interval_secs() -> u64 { 3600 }
fn default_refresh_interval_secs() -> u64 { 60 }
fn default_ban_duration_secs() -> u64 { 10_800 }
fn default_invalid_percent() -> f64 { 30.0 }
fn default_check_threshold() -> u64 { 30 }
fn default_malformed_limit() -> u32 { 5 }
fn default_limit() -> i32 { 30 }
fn default_limit_jump() -> i32 { 10 }

impl Default for ProxyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for StratumConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for BanningConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Config {
    /// Load from the given JSON file, then apply env overrides and validate.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let mut cfg: Config =
            serde_json::from_str(&text).with_context(|| format!("invalid config in {}", path))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("EMBER_REDIS_URL") {
            self.redis_url = v;
        }
        if let Ok(v) = std::env::var("EMBER_HTTP_LISTEN") {
            self.proxy.listen = v;
        }
        if let Ok(v) = std::env::var("EMBER_STRATUM_LISTEN") {
            self.proxy.stratum.listen = v;
        }
        if let Ok(v) = std::env::var("EMBER_DIFFICULTY") {
            if let Ok(d) = v.parse() {
                self.proxy.difficulty = d;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("you must set an instance name");
        }
        if self.upstream.is_empty() {
            bail!("at least one upstream is required");
        }
        if self.proxy.difficulty == 0 {
            bail!("proxy.difficulty must be positive");
        }
        if self.proxy.stratum.enabled && self.proxy.stratum.max_conn == 0 {
            bail!("proxy.stratum.max_conn must be positive");
        }
        Ok(())
    }
}
