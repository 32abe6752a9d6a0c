use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use helpdesk_api::{RetryConfig, WaitConfig};
use helpdesk_stream::{BackoffPolicy, OverflowMode, SnapshotLimits};
use serde::{Deserialize, Serialize};

// =============================================================================
// Layered config (figment: defaults / config.toml / env vars / CLI flags)
// =============================================================================
//
//   config.toml:     [retry]
//                    max_5xx_retries = 3
//
//   env var:         HDESK_RETRY__MAX_5XX_RETRIES=3   (double underscore = nesting)
//
//   top-level keys:  HDESK_BASE_URL, HDESK_API_TOKEN, HDESK_ACCOUNT_ID

/// Everything `hdesk` can be configured with.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub account_id: Option<u64>,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Pub/sub identity for the real-time channel.
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub pubsub_token: Option<String>,
    /// Defaults to `<base_url>/cable` with a ws/wss scheme.
    #[serde(default)]
    pub websocket_url: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub follow: FollowFileConfig,
}

/// Follower tunables (lives under `[follow]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowFileConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    /// 0 disables debouncing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub overflow: OverflowMode,
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_stability_secs")]
    pub stability_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// 0 disables the presence heartbeat.
    #[serde(default = "default_presence_interval_secs")]
    pub presence_interval_secs: u64,
    #[serde(default)]
    pub cursor_path: Option<PathBuf>,
    #[serde(default = "default_cursor_min_interval_ms")]
    pub cursor_min_interval_ms: u64,
    #[serde(default = "default_snapshot_messages")]
    pub snapshot_messages: usize,
    #[serde(default = "default_snapshot_max_pages")]
    pub snapshot_max_pages: usize,
}

impl Default for FollowFileConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            debounce_ms: default_debounce_ms(),
            max_batch: default_max_batch(),
            queue_size: default_queue_size(),
            overflow: OverflowMode::default(),
            reconnect_initial_secs: default_reconnect_initial_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            stability_secs: default_stability_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            presence_interval_secs: default_presence_interval_secs(),
            cursor_path: None,
            cursor_min_interval_ms: default_cursor_min_interval_ms(),
            snapshot_messages: default_snapshot_messages(),
            snapshot_max_pages: default_snapshot_max_pages(),
        }
    }
}

impl FollowFileConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.reconnect_initial_secs),
            max: Duration::from_secs(self.reconnect_max_secs),
            stability: Duration::from_secs(self.stability_secs),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn presence_interval(&self) -> Option<Duration> {
        (self.presence_interval_secs > 0).then(|| Duration::from_secs(self.presence_interval_secs))
    }

    pub fn snapshot_limits(&self) -> SnapshotLimits {
        SnapshotLimits {
            messages: self.snapshot_messages,
            max_pages: self.snapshot_max_pages,
        }
    }
}

fn default_channel() -> String {
    helpdesk_stream::ChannelDescriptor::DEFAULT_CHANNEL.to_string()
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_max_batch() -> usize {
    20
}
fn default_queue_size() -> usize {
    256
}
fn default_reconnect_initial_secs() -> u64 {
    2
}
fn default_reconnect_max_secs() -> u64 {
    30
}
fn default_stability_secs() -> u64 {
    60
}
fn default_max_reconnect_attempts() -> u32 {
    100
}
fn default_presence_interval_secs() -> u64 {
    20
}
fn default_cursor_min_interval_ms() -> u64 {
    2000
}
fn default_snapshot_messages() -> usize {
    20
}
fn default_snapshot_max_pages() -> usize {
    3
}

impl FileConfig {
    pub fn base_url(&self) -> Result<&str> {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url.trim_end_matches('/')),
            _ => bail!("base_url is not configured (set it in config.toml, HDESK_BASE_URL or --base-url)"),
        }
    }

    pub fn account_id(&self) -> Result<u64> {
        self.account_id
            .context("account_id is not configured (set it in config.toml, HDESK_ACCOUNT_ID or --account-id)")
    }

    /// Explicit `websocket_url`, else `/cable` on the API host.
    pub fn websocket_url(&self) -> Result<String> {
        if let Some(url) = &self.websocket_url {
            return Ok(url.clone());
        }
        let base = self.base_url()?;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            bail!("base_url must start with http:// or https://, got {base}");
        };
        Ok(format!("{ws}/cable"))
    }
}

/// Flags that override every other layer when given.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<u64>,
}

/// Build a figment that layers: defaults → config.toml → HDESK_* env vars → CLI flags.
pub fn load_config(config_dir: &Path, overrides: &CliOverrides) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("HDESK_").split("__"))
        .merge(Serialized::defaults(overrides))
}

/// `--config-dir`, or `hdesk` under the platform config directory.
pub fn config_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    match custom_dir {
        Some(dir) => Ok(dir),
        None => Ok(dirs::config_dir()
            .context("Could not find the user config directory")?
            .join("hdesk")),
    }
}

pub fn default_cursor_path(config_dir: &Path) -> PathBuf {
    config_dir.join("cursor.json")
}
