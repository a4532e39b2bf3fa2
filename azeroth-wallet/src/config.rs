//! Wallet configuration.
//!
//! Defaults are compiled in; `WalletConfig::load` layers an optional file (`AZEROTH_CONFIG`) and
//! `AZEROTH__`-prefixed environment variables on top, e.g.
//! `AZEROTH__SYNC__FORWARD__RERUN_COUNTDOWN=30`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};

/// Environment variable naming an optional config file.
pub const CONFIG_FILE_ENV: &str = "AZEROTH_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "AZEROTH";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SYNC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub forward: ForwardSyncConfig,
    #[serde(default)]
    pub backward: BackwardSyncConfig,
    /// Pause between two events in `process_cached_zk_events`.
    #[serde(default = "default_event_yield_ms")]
    pub event_yield_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            forward: ForwardSyncConfig::default(),
            backward: BackwardSyncConfig::default(),
            event_yield_ms: default_event_yield_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardSyncConfig {
    /// Ticks between two forward runs.
    #[serde(default = "default_rerun_countdown")]
    pub rerun_countdown: u32,
    #[serde(default = "default_forward_tick_ms")]
    pub tick_interval_ms: u64,
    /// Completed runs between two cache cleanups.
    #[serde(default = "default_cleanup_countdown")]
    pub cleanup_countdown: u32,
    #[serde(default = "default_blocks_per_fetch")]
    pub blocks_per_fetch: u64,
}

impl Default for ForwardSyncConfig {
    fn default() -> Self {
        Self {
            rerun_countdown: default_rerun_countdown(),
            tick_interval_ms: default_forward_tick_ms(),
            cleanup_countdown: default_cleanup_countdown(),
            blocks_per_fetch: default_blocks_per_fetch(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackwardSyncConfig {
    #[serde(default = "default_backward_tick_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_blocks_per_fetch")]
    pub blocks_per_fetch: u64,
    /// Lowest block a backward scan ever visits.
    #[serde(default = "default_contract_deploy_block")]
    pub contract_deploy_block: u64,
    /// Scan size used when the network reports a sub-second block time.
    #[serde(default = "default_dev_network_scan_blocks")]
    pub dev_network_scan_blocks: u64,
    /// Consecutive retryable window failures tolerated before the scan stops.
    #[serde(default = "default_backward_max_retries")]
    pub max_retries: u32,
}

impl Default for BackwardSyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_backward_tick_ms(),
            blocks_per_fetch: default_blocks_per_fetch(),
            contract_deploy_block: default_contract_deploy_block(),
            dev_network_scan_blocks: default_dev_network_scan_blocks(),
            max_retries: default_backward_max_retries(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT / TRANSFER / LOG
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Request timeout in multiples of the network's average block time.
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u64,
    #[serde(default = "default_min_timeout_secs")]
    pub min_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_multiplier: default_timeout_multiplier(),
            min_timeout_secs: default_min_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Receiver of the public leg when nothing leaves the shielded pool.
    #[serde(default = "default_zero_address")]
    pub zero_address: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            zero_address: default_zero_address(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_event_yield_ms() -> u64 {
    100
}
fn default_rerun_countdown() -> u32 {
    300
}
fn default_forward_tick_ms() -> u64 {
    1000
}
fn default_cleanup_countdown() -> u32 {
    10
}
fn default_blocks_per_fetch() -> u64 {
    1000
}
fn default_backward_tick_ms() -> u64 {
    500
}
fn default_contract_deploy_block() -> u64 {
    1
}
fn default_dev_network_scan_blocks() -> u64 {
    50
}
fn default_backward_max_retries() -> u32 {
    5
}
fn default_timeout_multiplier() -> u64 {
    3
}
fn default_min_timeout_secs() -> u64 {
    5
}
fn default_zero_address() -> String {
    format!("0x{}", "0".repeat(40))
}
fn default_log_filter() -> String {
    "azeroth_wallet=info".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOADING
// ═══════════════════════════════════════════════════════════════════════════════

impl WalletConfig {
    /// Defaults, then the optional file, then the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&WalletConfig::default())
            .map_err(|e| WalletError::InvalidConfig(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: WalletConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WalletError::InvalidConfig(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        let forward = &self.sync.forward;
        let backward = &self.sync.backward;
        if forward.tick_interval_ms == 0 || backward.tick_interval_ms == 0 {
            return Err(WalletError::InvalidConfig(
                "tick intervals must be non-zero".into(),
            ));
        }
        if forward.blocks_per_fetch == 0 || backward.blocks_per_fetch == 0 {
            return Err(WalletError::InvalidConfig(
                "blocks_per_fetch must be non-zero".into(),
            ));
        }
        if backward.dev_network_scan_blocks == 0 {
            return Err(WalletError::InvalidConfig(
                "dev_network_scan_blocks must be non-zero".into(),
            ));
        }
        if self.transport.timeout_multiplier == 0 {
            return Err(WalletError::InvalidConfig(
                "timeout_multiplier must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Per-request timeout for a network with the given average block time (seconds).
    pub fn request_timeout(&self, average_block_time: f64) -> Duration {
        let scaled = (self.transport.timeout_multiplier as f64 * average_block_time.max(0.0)).ceil();
        Duration::from_secs((scaled as u64).max(self.transport.min_timeout_secs))
    }

    pub fn forward_tick(&self) -> Duration {
        Duration::from_millis(self.sync.forward.tick_interval_ms)
    }

    pub fn backward_tick(&self) -> Duration {
        Duration::from_millis(self.sync.backward.tick_interval_ms)
    }

    pub fn event_yield(&self) -> Duration {
        Duration::from_millis(self.sync.event_yield_ms)
    }
}

/// Install a global subscriber. `RUST_LOG` wins over `log.filter`; a second call is a no-op.
pub fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
