//! Runtime configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! `RENDEZVOUS_*` environment variables (`RUST_LOG` for the log filter).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::{DeviceClass, LocalIdentity, PROTOCOL_VERSION};
use crate::reconnect::ReconnectPolicy;
use crate::registry::RegistryConfig;
use crate::signaling::ServerAddress;
use crate::transport::PinConfig;

pub const DEFAULT_SIGNALING_SERVER: &str = "wss://public.localsend.org/v1/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.localsend.org:5349";
pub const DEFAULT_LOG_FILTER: &str = "info,rendezvous=debug";
pub const DEFAULT_ALIAS: &str = "Rendezvous";
pub const DEFAULT_PIN_MAX_TRIES: u8 = 3;

const CONFIG_PATH_VAR: &str = "RENDEZVOUS_CONFIG";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Shape of the TOML file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub signaling_servers: Option<Vec<String>>,
    pub stun_servers: Option<Vec<String>>,
    pub log_filter: Option<String>,
    pub alias: Option<String>,
    pub device_model: Option<String>,
    pub device_class: Option<String>,
    pub fingerprint: Option<String>,
    pub pin: Option<String>,
    pub pin_max_tries: Option<u8>,
    pub reconnect: Option<ReconnectFile>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectFile {
    pub mode: Option<String>,
    pub initial_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub jitter: Option<bool>,
}

impl FileConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub signaling_servers: Vec<ServerAddress>,
    pub stun_servers: Vec<String>,
    pub log_filter: String,
    pub alias: String,
    pub device_model: Option<String>,
    pub device_class: DeviceClass,
    pub fingerprint: String,
    /// Offers must pass this PIN before their manifest is read.
    pub pin: Option<PinConfig>,
    pub reconnect: ReconnectPolicy,
}

impl AppConfig {
    /// Read the config file and the process environment. `file` replaces the
    /// platform config path lookup.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let path = file
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_PATH_VAR).map(PathBuf::from));
        let file = match path {
            Some(path) => FileConfig::load(&path)?,
            None => match default_config_path().filter(|path| path.is_file()) {
                Some(path) => FileConfig::load(&path)?,
                None => FileConfig::default(),
            },
        };
        Self::from_sources(file, lookup)
    }

    /// Layer `lookup` (environment-style key lookup) over `file`.
    pub fn from_sources(
        file: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let signaling_servers = lookup("RENDEZVOUS_SIGNALING_SERVERS")
            .map(|raw| split_list(&raw))
            .or(file.signaling_servers)
            .unwrap_or_else(|| vec![DEFAULT_SIGNALING_SERVER.to_string()])
            .into_iter()
            .map(ServerAddress::from)
            .collect();
        let stun_servers = lookup("RENDEZVOUS_STUN_SERVERS")
            .map(|raw| split_list(&raw))
            .or(file.stun_servers)
            .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]);
        let log_filter = lookup("RUST_LOG")
            .or(file.log_filter)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.into());
        let alias = lookup("RENDEZVOUS_ALIAS")
            .or(file.alias)
            .unwrap_or_else(|| DEFAULT_ALIAS.into());
        let device_model = lookup("RENDEZVOUS_DEVICE_MODEL").or(file.device_model);
        let device_class = match lookup("RENDEZVOUS_DEVICE_CLASS").or(file.device_class) {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "device_class",
                value: raw,
                reason,
            })?,
            None => DeviceClass::Headless,
        };
        let fingerprint = lookup("RENDEZVOUS_FINGERPRINT")
            .or(file.fingerprint)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let pin = match lookup("RENDEZVOUS_PIN").or(file.pin) {
            Some(pin) if !pin.trim().is_empty() => {
                let max_tries = match lookup("RENDEZVOUS_PIN_MAX_TRIES") {
                    Some(raw) => match raw.trim().parse::<u8>() {
                        Ok(tries) if tries > 0 => tries,
                        _ => {
                            return Err(ConfigError::Invalid {
                                key: "pin_max_tries",
                                value: raw,
                                reason: "expected a number between 1 and 255".into(),
                            });
                        }
                    },
                    None => file.pin_max_tries.unwrap_or(DEFAULT_PIN_MAX_TRIES),
                };
                Some(PinConfig {
                    pin: pin.trim().to_string(),
                    max_tries,
                })
            }
            _ => None,
        };
        let reconnect = reconnect_policy(file.reconnect.unwrap_or_default(), &lookup)?;

        Ok(Self {
            signaling_servers,
            stun_servers,
            log_filter,
            alias,
            device_model,
            device_class,
            fingerprint,
            pin,
            reconnect,
        })
    }

    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            alias: self.alias.clone(),
            protocol_version: PROTOCOL_VERSION.into(),
            device_model: self.device_model.clone(),
            device_class: self.device_class,
            fingerprint: self.fingerprint.clone(),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            configured_servers: self.signaling_servers.clone(),
            stun_servers: self.stun_servers.clone(),
            pin: self.pin.clone(),
            reconnect: self.reconnect.clone(),
        }
    }
}

/// `<config dir>/config.toml` for this application, when the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "localsend", "rendezvous")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn reconnect_policy(
    file: ReconnectFile,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<ReconnectPolicy, ConfigError> {
    let mode = lookup("RENDEZVOUS_RECONNECT")
        .or(file.mode)
        .unwrap_or_else(|| "never".into());
    match mode.trim().to_ascii_lowercase().as_str() {
        "never" | "off" | "none" => Ok(ReconnectPolicy::Never),
        "backoff" => {
            let initial_ms = lookup("RENDEZVOUS_RECONNECT_INITIAL_MS")
                .and_then(|v| v.parse().ok())
                .or(file.initial_ms)
                .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS);
            let max_delay_ms = lookup("RENDEZVOUS_RECONNECT_MAX_MS")
                .and_then(|v| v.parse().ok())
                .or(file.max_delay_ms)
                .unwrap_or(DEFAULT_RECONNECT_MAX_MS);
            let max_attempts = lookup("RENDEZVOUS_RECONNECT_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .or(file.max_attempts);
            let jitter = lookup("RENDEZVOUS_RECONNECT_JITTER")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .or(file.jitter)
                .unwrap_or(true);
            Ok(ReconnectPolicy::Backoff {
                initial: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_delay_ms.max(initial_ms)),
                max_attempts,
                jitter,
            })
        }
        _ => Err(ConfigError::Invalid {
            key: "reconnect",
            value: mode,
            reason: "expected `never` or `backoff`".into(),
        }),
    }
}
