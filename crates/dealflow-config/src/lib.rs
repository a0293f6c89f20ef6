//! Shared configuration for Dealflow admin tooling.
//!
//! TOML profiles with a `DEALFLOW_*` environment overlay, default
//! filesystem locations, token-slot resolution (file or OS keyring), and
//! translation into `dealflow_api::ClientConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dealflow_api::{
    ClientConfig, Error as ApiError, FileTokenStore, TOKEN_SLOT, TlsMode, TokenStore,
    TransportConfig,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no profile named '{profile}'")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no usable home directory for config/data paths")]
    NoProjectDirs,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named API deployment profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub insecure: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            insecure: false,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// Where the session token for a profile is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenBackend {
    /// One file under the app data dir.
    #[default]
    File,
    /// One entry in the OS credential store.
    Keyring,
}

/// A named API deployment profile.
#[derive(Debug, Deserialize, Serialize)]
pub struct Profile {
    /// GraphQL endpoint (e.g. `https://api.crm.dealflow.dev/graphql`).
    pub api_url: String,

    /// Realtime endpoint; omit for deployments without subscriptions.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Request timeout in seconds. Falls back to `defaults.timeout`.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Accept invalid TLS certificates. Falls back to `defaults.insecure`.
    #[serde(default)]
    pub insecure: Option<bool>,

    #[serde(default)]
    pub token_store: TokenBackend,

    /// Slot name for the persisted token. Defaults to `access_token`.
    #[serde(default)]
    pub token_slot: Option<String>,
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("dev", "Dealflow", "dealflow").ok_or(ConfigError::NoProjectDirs)
}

/// `~/.config/dealflow/config.toml` (platform equivalent).
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Per-profile data (file-backed token slots) lives under here.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

// ── Loading / saving ────────────────────────────────────────────────

/// Load from the default location, layered under the environment.
pub fn load() -> Result<Config, ConfigError> {
    load_from(config_path()?)
}

/// Load from an explicit path. Layering, lowest to highest precedence:
/// built-in defaults, the TOML file, `DEALFLOW_*` environment variables.
pub fn load_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(path.as_ref()))
        .merge(Env::prefixed("DEALFLOW_"))
        .extract()?;
    Ok(config)
}

/// Write the config back out as TOML.
pub fn save_to(config: &Config, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}

// ── Resolution ──────────────────────────────────────────────────────

impl Config {
    /// Look up a profile by name, falling back to `default_profile`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.to_owned(),
            })
    }
}

impl Profile {
    /// Translate this profile into the api crate's client config.
    pub fn client_config(&self, defaults: &Defaults) -> Result<ClientConfig, ConfigError> {
        let mut config = ClientConfig::new(&self.api_url).map_err(|e| ConfigError::Validation {
            field: "api_url".into(),
            reason: e.to_string(),
        })?;

        if let Some(ws_url) = &self.ws_url {
            config = config
                .with_ws_url(ws_url)
                .map_err(|e| ConfigError::Validation {
                    field: "ws_url".into(),
                    reason: e.to_string(),
                })?;
        }

        let insecure = self.insecure.unwrap_or(defaults.insecure);
        let timeout = self.timeout.unwrap_or(defaults.timeout);

        Ok(config.with_transport(TransportConfig {
            tls: if insecure {
                TlsMode::DangerAcceptInvalid
            } else {
                TlsMode::System
            },
            timeout: Duration::from_secs(timeout),
        }))
    }

    /// The slot name the token persists under.
    pub fn slot_name(&self) -> &str {
        self.token_slot.as_deref().unwrap_or(TOKEN_SLOT)
    }

    /// Resolve the token store backing this profile.
    ///
    /// File slots live at `<data dir>/<profile>/<slot>`; keyring slots
    /// are one entry per profile in the OS credential store.
    pub fn open_token_store(&self, profile_name: &str) -> Result<Arc<dyn TokenStore>, ConfigError> {
        match self.token_store {
            TokenBackend::File => {
                let path = data_dir()?.join(profile_name).join(self.slot_name());
                Ok(Arc::new(FileTokenStore::new(path)))
            }
            TokenBackend::Keyring => Ok(Arc::new(KeyringTokenStore::new(
                format!("dealflow:{profile_name}"),
                self.slot_name(),
            ))),
        }
    }
}

// ── Keyring-backed token slot ───────────────────────────────────────

/// Token slot stored as a single named entry in the OS credential store.
pub struct KeyringTokenStore {
    service: String,
    slot: String,
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            slot: slot.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, ApiError> {
        keyring::Entry::new(&self.service, &self.slot).map_err(|e| ApiError::TokenStore {
            message: e.to_string(),
        })
    }
}

impl TokenStore for KeyringTokenStore {
    fn get(&self) -> Option<SecretString> {
        let entry = match self.entry() {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "keyring unavailable");
                return None;
            }
        };
        match entry.get_password() {
            Ok(password) => Some(SecretString::from(password)),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read keyring slot");
                None
            }
        }
    }

    fn set(&self, token: SecretString) -> Result<(), ApiError> {
        self.entry()?
            .set_password(token.expose_secret())
            .map_err(|e| ApiError::TokenStore {
                message: e.to_string(),
            })
    }

    fn clear(&self) -> Result<(), ApiError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(ApiError::TokenStore {
                message: e.to_string(),
            }),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
