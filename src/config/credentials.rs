//! AWS shared credentials file (`~/.aws/credentials`)
//!
//! ```ini
//! [default]
//! aws_access_key_id = AKIA...
//! aws_secret_access_key = ...
//!
//! [staging]
//! aws_access_key_id = AKIA...
//! aws_secret_access_key = ...
//! aws_session_token = ...
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Keys read from one section of a shared credentials file
#[derive(Clone, PartialEq, Eq)]
pub struct SharedCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for SharedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `~/.aws/credentials`, if a home directory is known
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

/// Read `profile` from the credentials file at `path`
pub fn load_shared_credentials(path: &Path, profile: &str) -> Result<SharedCredentials> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;
    parse_shared_credentials(&raw, profile)
        .with_context(|| format!("Invalid credentials file: {}", path.display()))
}

/// Parse the INI text of a credentials file and pick `profile`.
///
/// `[profile name]` headers, as written to `~/.aws/config`, are accepted too.
pub fn parse_shared_credentials(contents: &str, profile: &str) -> Result<SharedCredentials> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .with_context(|| format!("line {}: unterminated section header", n + 1))?
                .trim();
            let name = name.strip_prefix("profile ").map(str::trim).unwrap_or(name);
            sections.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected key = value", n + 1))?;
        if let Some(section) = &current {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut section = sections
        .remove(profile)
        .with_context(|| format!("profile '{}' not found", profile))?;
    let mut take = |key: &str| section.remove(key).filter(|v| !v.is_empty());

    Ok(SharedCredentials {
        access_key: take("aws_access_key_id")
            .with_context(|| format!("profile '{}' has no aws_access_key_id", profile))?,
        secret_key: take("aws_secret_access_key")
            .with_context(|| format!("profile '{}' has no aws_secret_access_key", profile))?,
        session_token: take("aws_session_token"),
    })
}
