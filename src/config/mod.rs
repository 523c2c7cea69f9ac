pub mod credentials;

pub use credentials::{
    default_credentials_path, load_shared_credentials, parse_shared_credentials, SharedCredentials,
};

use crate::transfer::{TransferConfig, TransferConfigBuilder};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Endpoints, credentials and target bucket for one S3 deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// S3 endpoint URLs; parts are spread round-robin across them
    pub endpoints: Vec<String>,

    /// Empty when keys come from a shared credentials file
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Temporary-credential session token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    /// AWS region (default: us-east-1)
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// HTTP proxy all connections are tunnelled through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl Profile {
    pub fn has_keys(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Replace the keys and session token with `shared`
    pub fn apply_credentials(&mut self, shared: SharedCredentials) {
        self.access_key = shared.access_key;
        self.secret_key = shared.secret_key;
        self.session_token = shared.session_token;
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Worker pool, part size and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Retries per part
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_jobs() -> usize {
    4
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            part_size: default_part_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl TransferSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Transfer builder seeded with these settings and the profile's endpoints
    pub fn builder_for(&self, profile: &Profile) -> TransferConfigBuilder {
        TransferConfig::builder()
            .endpoints(profile.endpoints.iter().cloned())
            .jobs(self.jobs)
            .part_size(self.part_size)
            .max_retries(self.max_retries)
            .backoff(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            )
    }
}

/// Profiles plus transfer tuning, as read from YAML or the environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    #[serde(default)]
    pub transfer: TransferSettings,

    /// Profile used when none is named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name`, falling back to `default_profile` and then to any
    /// single configured profile.
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        match name.or(self.default_profile.as_deref()) {
            Some(name) => self.profiles.get(name),
            None => self.profiles.values().next(),
        }
    }
}

/// Parse a YAML config file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse YAML configuration in {}", path.display()))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} environment variable not set", name))
}

/// Unset and empty both count as absent
fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Build a single `default` profile from the environment
///
/// - S3_ENDPOINTS (comma-separated list of endpoints)
/// - AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN (all optional;
///   without keys the shared credentials file is used)
/// - AWS_REGION (optional, defaults to us-east-1)
/// - S3_BUCKET, S3_PROXY (optional)
/// - S3XFER_JOBS, S3XFER_PART_SIZE, S3XFER_MAX_RETRIES (optional)
///
/// A `.env` file in the working directory is loaded first when present.
pub fn load_from_env() -> Result<Config> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let endpoints: Vec<String> = env_required("S3_ENDPOINTS")?
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect();
    if endpoints.is_empty() {
        anyhow::bail!("S3_ENDPOINTS contains no valid endpoints");
    }

    let profile = Profile {
        endpoints,
        access_key: env_optional("AWS_ACCESS_KEY_ID").unwrap_or_default(),
        secret_key: env_optional("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
        session_token: env_optional("AWS_SESSION_TOKEN"),
        region: env_optional("AWS_REGION").unwrap_or_else(default_region),
        bucket: env_optional("S3_BUCKET"),
        proxy: env_optional("S3_PROXY"),
    };

    let mut transfer = TransferSettings::default();
    if let Some(jobs) = env_parse("S3XFER_JOBS")? {
        transfer.jobs = jobs;
    }
    if let Some(raw) = env_optional("S3XFER_PART_SIZE") {
        transfer.part_size = crate::cli::parse_size(&raw).context("invalid S3XFER_PART_SIZE")?;
    }
    if let Some(retries) = env_parse("S3XFER_MAX_RETRIES")? {
        transfer.max_retries = retries;
    }

    Ok(Config {
        profiles: HashMap::from([("default".to_string(), profile)]),
        transfer,
        default_profile: Some("default".to_string()),
    })
}

/// Load configuration from file or environment
///
/// A YAML file wins when given; `profile_name` then selects its default
/// profile. Without a file, everything comes from the environment.
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    let Some(path) = config_path else {
        return load_from_env();
    };

    let mut config = load_from_yaml(path)?;
    if let Some(name) = profile_name {
        if !config.profiles.contains_key(name) {
            anyhow::bail!("Profile '{}' not found in {}", name, path);
        }
        config.default_profile = Some(name.to_string());
    }
    Ok(config)
}
