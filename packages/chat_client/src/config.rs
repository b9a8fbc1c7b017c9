use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use ws_supervisor::{ExponentialBackoff, FixedDelay, ReconnectPolicy, SupervisorConfig};

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [connection]
//                    reconnect_delay_ms = 500
//
//   env var:         CHAT_CONNECTION__RECONNECT_DELAY_MS=500   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub user: UserFileConfig,
}

/// Where the chat service lives (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Wait `reconnect_delay_ms` before every attempt
    #[default]
    Fixed,
    /// Double the delay after each failed attempt, up to `max_reconnect_delay_ms`
    Exponential,
}

/// Keepalive and reconnect tunables (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            backoff: Backoff::default(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserFileConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for UserFileConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8080/ws/chat".to_string()
}
fn default_api_url() -> String {
    "http://localhost:8080/api".to_string()
}
fn default_keepalive_secs() -> u64 {
    30
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}
fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}
fn default_user_id() -> String {
    "demo_user".to_string()
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_SERVER__WS_URL=ws://host/ws/chat`  →  `server.ws_url`
///   `CHAT_CONNECTION__BACKOFF=exponential`   →  `connection.backoff`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

/// `~/.chatsync`, unless overridden on the command line.
pub fn config_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    match custom_dir {
        Some(dir) => Ok(dir),
        None => Ok(dirs::home_dir()
            .context("Could not find home directory")?
            .join(".chatsync")),
    }
}

// =============================================================================
// Runtime config
// =============================================================================

/// Command-line values that win over every file/env layer.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub ws_url: Option<String>,
    pub api_url: Option<String>,
    pub user_id: Option<String>,
    pub backoff: Option<Backoff>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectConfig {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub ws_url: String,
    pub api_url: String,
    pub user_id: String,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn load(config_dir: &Path, overrides: Overrides) -> Result<Self> {
        let fc: FileConfig = load_config(config_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;
        Ok(Self::from_file(&fc).with_overrides(overrides))
    }

    pub fn from_file(fc: &FileConfig) -> Self {
        let delay = Duration::from_millis(fc.connection.reconnect_delay_ms);
        let reconnect = match fc.connection.backoff {
            Backoff::Fixed => ReconnectConfig::Fixed { delay },
            Backoff::Exponential => ReconnectConfig::Exponential {
                base: delay,
                max: Duration::from_millis(fc.connection.max_reconnect_delay_ms).max(delay),
            },
        };
        Self {
            ws_url: fc.server.ws_url.clone(),
            api_url: fc.server.api_url.trim_end_matches('/').to_string(),
            user_id: fc.user.user_id.clone(),
            // tokio intervals panic on a zero period.
            keepalive_interval: Duration::from_secs(fc.connection.keepalive_secs.max(1)),
            reconnect,
        }
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(ws_url) = overrides.ws_url {
            self.ws_url = ws_url;
        }
        if let Some(api_url) = overrides.api_url {
            self.api_url = api_url.trim_end_matches('/').to_string();
        }
        if let Some(user_id) = overrides.user_id {
            self.user_id = user_id;
        }
        self.reconnect = match (overrides.backoff, self.reconnect.clone()) {
            (Some(Backoff::Fixed), ReconnectConfig::Exponential { base, .. }) => {
                ReconnectConfig::Fixed { delay: base }
            }
            (Some(Backoff::Exponential), ReconnectConfig::Fixed { delay }) => {
                ReconnectConfig::Exponential {
                    base: delay,
                    max: Duration::from_millis(default_max_reconnect_delay_ms()).max(delay),
                }
            }
            (_, unchanged) => unchanged,
        };
        self
    }

    pub fn reconnect_policy(&self) -> Box<dyn ReconnectPolicy> {
        match self.reconnect {
            ReconnectConfig::Fixed { delay } => Box::new(FixedDelay(delay)),
            ReconnectConfig::Exponential { base, max } => Box::new(ExponentialBackoff { base, max }),
        }
    }

    pub fn supervisor_config(&self, session_id: &str) -> SupervisorConfig {
        SupervisorConfig::new(self.ws_url.clone(), session_id)
            .with_keepalive_interval(self.keepalive_interval)
    }
}
