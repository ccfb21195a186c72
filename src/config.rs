//! Bridge configuration.
//!
//! Loaded from a TOML file; any leaf may be overridden from the environment
//! with `MAUTRIX_WECHAT_<DOTTED_KEY>` where dots become underscores and the
//! key is uppercased (`wechat.port` -> `MAUTRIX_WECHAT_WECHAT_PORT`).

use crate::supervisor::Backoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "MAUTRIX_WECHAT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to re-encode config: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("{key} is still set to the example value {value:?}")]
    ForbiddenDefault { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings the wire client needs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// How long a correlated socket request waits for its answer.
    pub request_timeout: Duration,
    /// Bound on HTTP action calls.
    pub http_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            request_timeout: Duration::from_secs(30),
            http_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub appservice: AppServiceConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub wechat: WechatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    pub address: String,
    pub domain: String,
    pub as_token: String,
    #[serde(default)]
    pub async_media: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServiceConfig {
    #[serde(default = "default_bot_username")]
    pub bot_username: String,
    /// Path of the JSON store.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

fn default_bot_username() -> String {
    "wechatbot".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("wechat-bridge-data")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Relay,
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub relay: bool,
    pub user: bool,
    pub admin: bool,
    pub level: Option<PermissionLevel>,
}

impl Permissions {
    fn from_level(level: Option<PermissionLevel>) -> Self {
        Self {
            relay: level.is_some(),
            user: level >= Some(PermissionLevel::User),
            admin: level == Some(PermissionLevel::Admin),
            level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Prefix relayed messages with the local sender's name.
    pub show_sender: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            show_sender: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Unlimited when absent.
    pub max_attempts: Option<u32>,
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.initial_delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.max_attempts,
        )
    }

    fn reconnect() -> Self {
        Self {
            initial_delay_secs: 1,
            max_delay_secs: 60,
            max_attempts: None,
        }
    }

    fn startup() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 60,
            max_attempts: Some(12),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

fn default_startup_retry() -> BackoffConfig {
    BackoffConfig::startup()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Localpart template of puppets; `{userid}` is replaced by the escaped
    /// remote id.
    pub username_template: String,
    /// `{displayname}` is replaced by the remote name.
    pub displayname_template: String,
    pub delivery_error_reports: bool,
    pub message_status_events: bool,
    pub resend_bridge_info: bool,
    /// Directory the box stores received files in.
    pub files_dir: Option<PathBuf>,
    pub relay: RelayConfig,
    pub permissions: HashMap<String, PermissionLevel>,
    #[serde(default = "default_startup_retry")]
    pub startup_retry: BackoffConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            username_template: "wechat_{userid}".to_string(),
            displayname_template: "{displayname} (WeChat)".to_string(),
            delivery_error_reports: true,
            message_status_events: false,
            resend_bridge_info: false,
            files_dir: None,
            relay: RelayConfig::default(),
            permissions: HashMap::new(),
            startup_retry: BackoffConfig::startup(),
        }
    }
}

impl BridgeConfig {
    pub fn format_displayname(&self, name: &str) -> String {
        self.displayname_template.replace("{displayname}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 10,
            timeout_secs: 60,
        }
    }
}

impl HeartbeatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Account to assume for boxes that cannot report personal info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualLogin {
    pub wxid: String,
    #[serde(default)]
    pub wxcode: String,
    #[serde(default)]
    pub wxname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WechatConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local account that owns this box.
    pub admin: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: BackoffConfig,
    #[serde(default)]
    pub manual_login: Option<ManualLogin>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_request_timeout() -> u64 {
    30
}

fn default_http_timeout() -> u64 {
    5
}

impl WechatConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text, |key| std::env::var(key).ok())
    }

    /// Parses `text`, applying overrides from `env`.
    pub fn from_toml_str(
        text: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut table: toml::Table = toml::from_str(text)?;
        apply_env_overrides(&mut table, "", &env);
        let config: Config = toml::Value::Table(table).try_into()?;

        // Second pass so keys that were only filled in by defaults can be
        // overridden too.
        let mut value = toml::Value::try_from(&config)?;
        if let toml::Value::Table(table) = &mut value {
            apply_env_overrides(table, "", &env);
        }
        let config: Config = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let forbidden = [
            ("homeserver.address", &self.homeserver.address, "https://example.com"),
            ("homeserver.domain", &self.homeserver.domain, "example.com"),
        ];
        for (key, current, example) in forbidden {
            if current.trim_end_matches('/') == example {
                return Err(ConfigError::ForbiddenDefault {
                    key,
                    value: current.clone(),
                });
            }
        }
        if self.bridge.permissions.contains_key("example.com") {
            return Err(ConfigError::ForbiddenDefault {
                key: "bridge.permissions",
                value: "example.com".to_string(),
            });
        }
        if self.wechat.admin.is_empty() {
            return Err(ConfigError::Invalid("wechat.admin must be set".to_string()));
        }
        if !self.bridge.username_template.contains("{userid}") {
            return Err(ConfigError::Invalid(
                "bridge.username_template must contain {userid}".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the permission level of a local account: an exact match wins,
    /// then its server name, then `*`.
    pub fn permissions_for(&self, mxid: &str) -> Permissions {
        let perms = &self.bridge.permissions;
        let server = mxid.split_once(':').map(|(_, server)| server);
        let level = perms
            .get(mxid)
            .or_else(|| server.and_then(|s| perms.get(s)))
            .or_else(|| perms.get("*"))
            .copied();
        Permissions::from_level(level)
    }

    pub fn bot_mxid(&self) -> String {
        format!(
            "@{}:{}",
            self.appservice.bot_username, self.homeserver.domain
        )
    }
}

/// Replaces every scalar leaf that has a matching environment variable. The
/// override keeps the type of the value it replaces when it parses as such.
fn apply_env_overrides(
    table: &mut toml::Table,
    prefix: &str,
    env: &impl Fn(&str) -> Option<String>,
) {
    for (key, value) in table.iter_mut() {
        let dotted = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if let toml::Value::Table(inner) = value {
            apply_env_overrides(inner, &dotted, env);
            continue;
        }
        let var = env_key(&dotted);
        if let Some(raw) = env(&var) {
            log::debug!(target: "Config", "Overriding {dotted} from {var}");
            *value = coerce(value, raw);
        }
    }
}

pub fn env_key(dotted: &str) -> String {
    format!("{ENV_PREFIX}{}", dotted.replace('.', "_").to_uppercase())
}

fn coerce(current: &toml::Value, raw: String) -> toml::Value {
    match current {
        toml::Value::Integer(_) => raw
            .trim()
            .parse()
            .map(toml::Value::Integer)
            .unwrap_or(toml::Value::String(raw)),
        toml::Value::Float(_) => raw
            .trim()
            .parse()
            .map(toml::Value::Float)
            .unwrap_or(toml::Value::String(raw)),
        toml::Value::Boolean(_) => match raw.trim() {
            "true" | "1" | "yes" => toml::Value::Boolean(true),
            "false" | "0" | "no" => toml::Value::Boolean(false),
            _ => toml::Value::String(raw),
        },
        _ => toml::Value::String(raw),
    }
}
