//! Configuration for kquai-monitor.
//!
//! Loaded from a TOML file in which every section and key is optional. The
//! file comes from `--config <path>` or `KQUAI_MONITOR_CONFIG`; without
//! either, built-in defaults apply. `KQUAI_MONITOR_RPC_URL` overrides the
//! node endpoint after the file is read.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::poller::WindowSettings;
use crate::ratio::{RatioEngine, ONE_OVER_ALPHA};
use crate::rpc::{CallOptions, RetryPolicy};

pub const CONFIG_ENV: &str = "KQUAI_MONITOR_CONFIG";
pub const RPC_URL_ENV: &str = "KQUAI_MONITOR_RPC_URL";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub window: WindowConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
}

/// Node endpoint and request limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// JSON-RPC endpoint of the Prime chain
    pub url: String,
    /// Deadline per single call attempt
    pub timeout_secs: u64,
    /// Deadline per batch POST
    pub batch_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: u32,
    pub max_items_per_post: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9001".to_string(),
            timeout_secs: 120,
            batch_timeout_secs: 180,
            max_retries: 0,
            retry_base_delay_ms: 400,
            retry_multiplier: 2,
            max_items_per_post: 2000,
        }
    }
}

/// Series window and polling.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Blocks kept in the window
    pub size: usize,
    /// Blocks averaged per chunk
    pub chunk_size: usize,
    /// Reciprocal of the controller gain
    pub one_over_alpha: u64,
    pub poll_interval_secs: u64,
    pub auto_poll: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 4000,
            chunk_size: 200,
            one_over_alpha: ONE_OVER_ALPHA,
            poll_interval_secs: 10,
            auto_poll: true,
        }
    }
}

/// HTTP API; disabled unless `listen` is set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: Option<String>,
}

impl Config {
    /// Load from `path`, falling back to `KQUAI_MONITOR_CONFIG`, then to
    /// defaults; apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        if let Ok(url) = env::var(RPC_URL_ENV) {
            config.apply_rpc_url(url);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without overrides or validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_rpc_url(&mut self, url: String) {
        let url = url.trim();
        if !url.is_empty() {
            self.rpc.url = url.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let zeros = [
            ("window.size", self.window.size == 0),
            ("window.chunk_size", self.window.chunk_size == 0),
            ("window.one_over_alpha", self.window.one_over_alpha == 0),
            ("window.poll_interval_secs", self.window.poll_interval_secs == 0),
            ("rpc.max_items_per_post", self.rpc.max_items_per_post == 0),
            ("rpc.timeout_secs", self.rpc.timeout_secs == 0),
            ("rpc.batch_timeout_secs", self.rpc.batch_timeout_secs == 0),
            ("rpc.retry_multiplier", self.rpc.retry_multiplier == 0),
        ];
        if let Some((key, _)) = zeros.iter().find(|(_, zero)| *zero) {
            return Err(Error::Config(format!("{key} must be greater than zero")));
        }

        let url = self.rpc.url.to_ascii_lowercase();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "rpc.url must be an http(s) URL, got {:?}",
                self.rpc.url
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.rpc.max_retries,
            base_delay: Duration::from_millis(self.rpc.retry_base_delay_ms),
            backoff_multiplier: self.rpc.retry_multiplier,
        }
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(self.rpc.timeout_secs),
            batch_timeout: Duration::from_secs(self.rpc.batch_timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            size: self.window.size,
            chunk_size: self.window.chunk_size,
        }
    }

    /// Ratio engine with the configured gain. Call after [`validate`].
    ///
    /// [`validate`]: Config::validate
    pub fn engine(&self) -> RatioEngine {
        RatioEngine::new(self.window.one_over_alpha.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.window.poll_interval_secs)
    }
}
