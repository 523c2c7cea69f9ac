//! Command-line interface
//!
//! ```bash
//! # Presigned GET valid for an hour
//! s3xfer presign s3://bucket/report.pdf --expires 3600
//!
//! # Parallel upload, 16 parts in flight, 64 MiB parts
//! s3xfer upload ./image.iso s3://bucket/images/image.iso --jobs 16 --part-size 64M
//!
//! # Parallel download across two gateways
//! s3xfer --endpoints http://gw1:9000,http://gw2:9000 download s3://bucket/images/image.iso ./image.iso
//!
//! s3xfer stat s3://bucket/images/image.iso
//! s3xfer ls s3://bucket/images/ --recursive
//! s3xfer rm s3://bucket/images/image.iso
//!
//! # Raw signed request through an ssh tunnel, keys from ~/.aws/credentials
//! s3xfer --endpoints http://127.0.0.1:8080 --profile lab \
//!     request s3://bucket -p "list-type=2;prefix=logs/" -S https://s3.lab.internal:8080
//! ```

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, TransferArgs};
pub use commands::{format_bytes, parse_size, RawRequest};

use crate::config::{self, Profile, TransferSettings};
use crate::s3::{Credentials, S3Client, Signer};
use crate::transfer::TransferConfigBuilder;
use crate::transport::HyperTransport;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Resolved profile plus the client built from it
pub struct Session {
    client: S3Client,
    profile: Profile,
    settings: TransferSettings,
}

impl Session {
    /// Load configuration, apply command-line overrides and build the client.
    pub fn open(cli: &Cli) -> Result<Self> {
        let config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())
            .context("Failed to load configuration")?;

        let mut profile = config
            .get_profile(cli.profile.as_deref())
            .cloned()
            .context("No profile configured")?;
        if let Some(endpoints) = &cli.endpoints {
            profile.endpoints = endpoints.clone();
        }
        if cli.proxy.is_some() {
            profile.proxy = cli.proxy.clone();
        }
        if profile.endpoints.is_empty() {
            anyhow::bail!("Profile has no endpoints");
        }
        let section = cli.profile.as_deref().unwrap_or("default");
        apply_shared_credentials(&mut profile, cli.credentials.as_deref(), section)?;

        let mut credentials = Credentials::new(profile.access_key.clone(), profile.secret_key.clone())?;
        if let Some(token) = &profile.session_token {
            credentials = credentials.with_session_token(token.clone());
        }
        let signer = Signer::new(credentials, profile.region.clone())?;

        // a tunnel endpoint cannot present the signed host's certificate
        let tunneled = matches!(&cli.command, Commands::Request { sign_url: Some(_), .. });
        let transport = HyperTransport::builder()
            .timeout(config.transfer.request_timeout())
            .proxy(profile.proxy.clone())
            .insecure_tls(cli.insecure || tunneled)
            .build()
            .context("Failed to build HTTP transport")?;

        tracing::debug!(
            endpoints = ?profile.endpoints,
            region = %profile.region,
            proxy = ?profile.proxy,
            "session ready"
        );

        let client = S3Client::new(
            Arc::new(transport),
            Arc::new(signer),
            profile.bucket.clone().unwrap_or_default(),
        );

        Ok(Self {
            client,
            profile,
            settings: config.transfer,
        })
    }

    /// Client bound to `bucket`
    pub fn client_for(&self, bucket: &str) -> S3Client {
        self.client.clone().with_bucket(bucket)
    }

    /// Endpoint for single requests (stat, ls, rm, presign)
    pub fn primary_endpoint(&self) -> &str {
        self.profile
            .endpoints
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Transfer settings with per-command overrides applied
    pub fn transfer_builder(&self, args: &TransferArgs) -> Result<TransferConfigBuilder> {
        let mut settings = self.settings.clone();
        if let Some(jobs) = args.jobs {
            settings.jobs = jobs;
        }
        if let Some(part_size) = &args.part_size {
            settings.part_size = parse_size(part_size)?;
        }
        if let Some(retries) = args.retries {
            settings.max_retries = retries;
        }
        Ok(settings.builder_for(&self.profile))
    }
}

/// Take the profile's keys from a shared credentials file: the one given on
/// the command line, else `~/.aws/credentials` when the profile has no keys.
fn apply_shared_credentials(profile: &mut Profile, file: Option<&str>, section: &str) -> Result<()> {
    let path = match file {
        Some(file) => PathBuf::from(file),
        None if profile.has_keys() => return Ok(()),
        None => match config::default_credentials_path() {
            Some(path) if path.is_file() => path,
            _ => return Ok(()),
        },
    };

    let shared = config::load_shared_credentials(&path, section)?;
    tracing::debug!(path = %path.display(), section, "using shared credentials");
    profile.apply_credentials(shared);
    Ok(())
}

/// Run one command
pub async fn run(cli: Cli) -> Result<()> {
    let session = Session::open(&cli)?;

    match &cli.command {
        Commands::Presign {
            path,
            method,
            expires,
            params,
        } => commands::cmd_presign(&session, path, method, *expires, params),
        Commands::Upload {
            source,
            dest,
            metadata,
            transfer,
        } => commands::cmd_upload(&session, source, dest, metadata, transfer).await,
        Commands::Download {
            source,
            dest,
            transfer,
        } => commands::cmd_download(&session, source, dest, transfer).await,
        Commands::Stat { path } => commands::cmd_stat(&session, path).await,
        Commands::Ls {
            path,
            recursive,
            max_keys,
        } => commands::cmd_ls(&session, path, *recursive, *max_keys).await,
        Commands::Rm { path } => commands::cmd_rm(&session, path).await,
        Commands::Request {
            path,
            method,
            params,
            headers,
            value,
            out_file,
            sign_url,
        } => {
            let raw = RawRequest {
                path: path.as_deref(),
                method,
                params: params.as_deref(),
                headers: headers.as_deref(),
                value: value.as_deref(),
                out_file: out_file.as_deref(),
                sign_url: sign_url.as_deref(),
            };
            commands::cmd_request(&session, raw).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(access_key: &str) -> Profile {
        Profile {
            endpoints: vec!["http://s3:9000".to_string()],
            access_key: access_key.to_string(),
            secret_key: if access_key.is_empty() { "" } else { "secret" }.to_string(),
            session_token: None,
            region: "us-east-1".to_string(),
            bucket: None,
            proxy: None,
        }
    }

    #[test]
    fn test_shared_credentials_file_overrides_profile() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("credentials");
        std::fs::write(
            &file,
            "[default]\naws_access_key_id = AKIAFILE\naws_secret_access_key = filesecret\n\n\
             [lab]\naws_access_key_id = AKIALAB\naws_secret_access_key = labsecret\n",
        )
        .unwrap();
        let file = file.to_str().unwrap();

        let mut from_yaml = profile("AKIAYAML");
        apply_shared_credentials(&mut from_yaml, Some(file), "lab").unwrap();
        assert_eq!(from_yaml.access_key, "AKIALAB");
        assert_eq!(from_yaml.secret_key, "labsecret");

        let mut keyless = profile("");
        apply_shared_credentials(&mut keyless, Some(file), "default").unwrap();
        assert_eq!(keyless.access_key, "AKIAFILE");

        let mut missing = profile("");
        assert!(apply_shared_credentials(&mut missing, Some(file), "prod").is_err());
    }

    #[test]
    fn test_profile_with_keys_ignores_home_file() {
        let mut keyed = profile("AKIAYAML");
        apply_shared_credentials(&mut keyed, None, "default").unwrap();
        assert_eq!(keyed.access_key, "AKIAYAML");
    }
}
