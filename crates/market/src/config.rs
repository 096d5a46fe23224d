//! Configuration for marketplace services
//!
//! OAuth application credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file in the Bazaar config directory
//! 3. Runtime environment variables (fallback)
//!
//! Tunables live in `settings.json` in the same directory; every field has a
//! default so the file is optional.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::ResourceKind;

/// Credentials filename in the Bazaar config directory
const CREDENTIALS_FILE: &str = "market-credentials.json";

/// Settings filename in the Bazaar config directory
const SETTINGS_FILE: &str = "settings.json";

/// OAuth application credentials for the marketplace API
#[derive(Debug, Clone, Deserialize)]
pub struct MarketCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Redirect URI registered for the application; required by the
    /// authorization-code exchange
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl MarketCredentials {
    /// Load credentials using compile-time values, the config file, then env
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            return config::load_json(CREDENTIALS_FILE);
        }

        Self::from_env()
    }

    /// Credentials embedded at build time via `MARKET_CLIENT_ID` and
    /// `MARKET_CLIENT_SECRET`
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("MARKET_CLIENT_ID")?;
        let client_secret = option_env!("MARKET_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: option_env!("MARKET_REDIRECT_URI").map(str::to_string),
        })
    }

    /// Load credentials from runtime environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("MARKET_CLIENT_ID")
            .context("MARKET_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("MARKET_CLIENT_SECRET")
            .context("MARKET_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
            redirect_uri: std::env::var("MARKET_REDIRECT_URI").ok(),
        })
    }

    /// Default credentials file path inside the config directory
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Tunables for the sync control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Marketplace REST API root
    pub api_base_url: String,
    /// OAuth token endpoint
    pub token_url: String,
    pub http_timeout_secs: u64,
    /// Interval between background sweeps
    pub sweep_interval_secs: u64,
    pub worker_threads: usize,
    /// Maximum jobs queued or running at once
    pub queue_capacity: usize,
    /// Join budget for a sweep's jobs before they are abandoned
    pub run_timeout_secs: u64,
    /// Lazy renewal on read when less than this is left
    pub read_renew_margin_secs: i64,
    /// Proactive renewal from the sweep when less than this is left
    pub sweep_renew_margin_secs: i64,
    /// How far before the failed renewal a gap backfill reaches
    pub gap_lookback_days: i64,
    pub sales_lookback_days: i64,
    pub catalog_lookback_days: i64,
    pub page_size: u32,
    pub default_frequency_minutes: u32,
    /// Attempts per detail fetch when failures are transient
    pub fetch_retries: u32,
    /// When set, notifications for other applications are refused
    pub application_id: Option<String>,
    pub webhook_bind_addr: String,
    pub webhook_log_retention_days: i64,
    /// Database file; defaults to `market.db` in the config directory
    pub database_path: Option<PathBuf>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.mercadolibre.com".to_string(),
            token_url: "https://api.mercadolibre.com/oauth/token".to_string(),
            http_timeout_secs: 30,
            sweep_interval_secs: 60,
            worker_threads: 4,
            queue_capacity: 64,
            run_timeout_secs: 600,
            read_renew_margin_secs: 300,
            sweep_renew_margin_secs: 600,
            gap_lookback_days: 30,
            sales_lookback_days: 7,
            catalog_lookback_days: 30,
            page_size: 50,
            default_frequency_minutes: 15,
            fetch_retries: 3,
            application_id: None,
            webhook_bind_addr: "127.0.0.1:8787".to_string(),
            webhook_log_retention_days: 30,
            database_path: None,
        }
    }
}

impl SyncSettings {
    /// Load `settings.json` from the config directory, or defaults
    pub fn load() -> Result<Self> {
        config::load_json_or_default(SETTINGS_FILE)
    }

    pub fn read_renew_margin(&self) -> Duration {
        Duration::seconds(self.read_renew_margin_secs)
    }

    pub fn sweep_renew_margin(&self) -> Duration {
        Duration::seconds(self.sweep_renew_margin_secs)
    }

    pub fn gap_lookback(&self) -> Duration {
        Duration::days(self.gap_lookback_days)
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn run_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.run_timeout_secs)
    }

    /// First-run lookback for a kind, honouring per-kind overrides
    pub fn lookback_for(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Sales => Duration::days(self.sales_lookback_days),
            ResourceKind::Catalog => Duration::days(self.catalog_lookback_days),
            other => other.default_lookback(),
        }
    }

    /// Database location, resolved against the config directory
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| config::config_path("market.db"))
    }
}
