use crate::history::DEFAULT_HISTORY_CAPACITY;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const API_URL_ENV: &str = "TETHER_API_URL";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Always ends in `/` so relative endpoint paths join under it.
    pub base_url: Url,
    pub reconnect_delay: Duration,
    pub history_capacity: usize,
    pub request_timeout: Duration,
    pub username: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client not configured: create tether.yaml or set TETHER_API_URL.")]
    Missing,
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Client not configured: create tether.yaml or set TETHER_API_URL.".to_string()
            }
            Self::Invalid(detail) => format!("Client not configured: {detail}. Update tether.yaml."),
        }
    }
}

impl ClientSettings {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url: with_trailing_slash(base_url),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            username: None,
        }
    }

    pub fn parse(base_url: &str) -> Result<Self, ConfigError> {
        parse_base_url(base_url).map(Self::new)
    }

    /// Load `tether.yaml` from the usual locations, with `TETHER_API_URL`
    /// taking precedence over the file's `base_url`.
    pub fn load() -> Result<Self, ConfigError> {
        let env_url = std::env::var(API_URL_ENV).ok().filter(|v| !v.trim().is_empty());
        match locate_config_file() {
            Some(path) => {
                let section = read_client_section(&path)?;
                resolve_client_settings(section, env_url)
            }
            None => match env_url {
                Some(url) => Self::parse(&url),
                None => Err(ConfigError::Missing),
            },
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        resolve_client_settings(read_client_section(path)?, None)
    }
}

fn read_client_section(path: &Path) -> Result<ClientSection, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    let config: TetherConfig = serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid tether.yaml: {err}")))?;
    config
        .client
        .ok_or_else(|| ConfigError::Invalid("missing `client` section".to_string()))
}

fn resolve_client_settings(
    section: ClientSection,
    env_url: Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let raw_url = env_url.or(section.base_url).unwrap_or_default();
    if raw_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "missing base_url in tether.yaml".to_string(),
        ));
    }
    let mut settings = ClientSettings::parse(&raw_url)?;

    if let Some(millis) = section.reconnect_delay_ms {
        settings.reconnect_delay = Duration::from_millis(millis);
    }
    if let Some(capacity) = section.history_capacity {
        if capacity == 0 {
            return Err(ConfigError::Invalid(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        settings.history_capacity = capacity;
    }
    if let Some(secs) = section.request_timeout_secs {
        if secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        settings.request_timeout = Duration::from_secs(secs);
    }
    settings.username = section
        .username
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    Ok(settings)
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid base_url `{raw}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base_url must be http or https, got `{}`",
            url.scheme()
        )));
    }
    Ok(url)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn locate_config_file() -> Option<PathBuf> {
    tether_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn tether_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("tether");
        paths.push(config_dir.join("tether.yaml"));
        paths.push(config_dir.join("tether.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".tether").join("tether.yaml"));
        paths.push(home_dir.join(".tether").join("tether.yml"));
    } else {
        paths.push(PathBuf::from("tether.yaml"));
        paths.push(PathBuf::from("tether.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct TetherConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    reconnect_delay_ms: Option<u64>,
    history_capacity: Option<usize>,
    request_timeout_secs: Option<u64>,
    username: Option<String>,
}
