//! Transfer configuration
//!
//! [`TransferConfig`] is built through [`TransferConfigBuilder`], which
//! validates everything up front so a running transfer never hits a
//! configuration error.

use crate::error::{Error, Result};
use crate::lb::EndpointSet;
use crate::s3::types::metadata_headers;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_JOBS: usize = 4;
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_millis(10_000);

/// Called with the byte count of each completed part
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Validated settings for one upload or download
#[derive(Clone)]
pub struct TransferConfig {
    pub jobs: usize,
    pub part_size: u64,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub endpoints: EndpointSet,
    /// `x-amz-meta-*` headers for uploads
    pub metadata: Vec<(String, String)>,
    /// Declared object size for downloads; discovered with HEAD when unset
    pub object_size: Option<u64>,
    pub progress: Option<ProgressFn>,
}

impl TransferConfig {
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }

    /// Delay before retry number `attempt` (1-based): exponential from the
    /// base, capped, plus up to the same amount of random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(max);
        let jitter = if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=capped)
        };
        Duration::from_millis(capped.saturating_add(jitter).min(max))
    }

    pub(crate) fn report_progress(&self, bytes: u64) {
        if let Some(progress) = &self.progress {
            progress(bytes);
        }
    }
}

impl fmt::Debug for TransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferConfig")
            .field("jobs", &self.jobs)
            .field("part_size", &self.part_size)
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("endpoints", &self.endpoints)
            .field("metadata", &self.metadata)
            .field("object_size", &self.object_size)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct TransferConfigBuilder {
    jobs: usize,
    part_size: u64,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    endpoints: Vec<String>,
    metadata: BTreeMap<String, String>,
    object_size: Option<u64>,
    progress: Option<ProgressFn>,
}

impl Default for TransferConfigBuilder {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            part_size: DEFAULT_PART_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            endpoints: Vec::new(),
            metadata: BTreeMap::new(),
            object_size: None,
            progress: None,
        }
    }
}

impl TransferConfigBuilder {
    /// Worker pool size
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Retries per part after the first attempt
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoints.push(url.into());
        self
    }

    pub fn endpoints<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints.extend(urls.into_iter().map(Into::into));
        self
    }

    /// User metadata; the `x-amz-meta-` prefix is added when missing
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn object_size(mut self, size: u64) -> Self {
        self.object_size = Some(size);
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<TransferConfig> {
        if self.jobs == 0 {
            return Err(Error::Configuration("jobs must be > 0".to_string()));
        }
        if self.part_size == 0 {
            return Err(Error::Configuration("part size must be > 0".to_string()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(Error::Configuration(format!(
                "backoff base {:?} exceeds backoff max {:?}",
                self.backoff_base, self.backoff_max
            )));
        }

        let endpoints = EndpointSet::new(&self.endpoints)?;
        let metadata = metadata_headers(&self.metadata)?;

        Ok(TransferConfig {
            jobs: self.jobs,
            part_size: self.part_size,
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            endpoints,
            metadata,
            object_size: self.object_size,
            progress: self.progress,
        })
    }
}
