use super::endpoint::Endpoint;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Endpoints a transfer spreads its parts across.
///
/// Initial assignment is round-robin by job index. Retries pick the next
/// healthy endpoint in rotation, so a retried part is not pinned to the
/// endpoint it first ran against.
pub struct EndpointSet {
    endpoints: Arc<Vec<Endpoint>>,
    /// Rotation counter for retry selection
    counter: AtomicUsize,
}

impl EndpointSet {
    /// Validate and build. Duplicates are reported, never dropped silently.
    pub fn new<S: AsRef<str>>(urls: &[S]) -> Result<Self> {
        if urls.is_empty() {
            return Err(Error::Configuration(
                "at least one endpoint is required".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(urls.len());
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            let endpoint = Endpoint::new(url.as_ref().trim());
            let lower = endpoint.url.to_ascii_lowercase();
            let host = lower
                .strip_prefix("https://")
                .or_else(|| lower.strip_prefix("http://"))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "endpoint must start with http:// or https://: {}",
                        endpoint.url
                    ))
                })?;
            if host.is_empty() {
                return Err(Error::Configuration(format!(
                    "endpoint has no host: {}",
                    endpoint.url
                )));
            }
            if !seen.insert(lower.clone()) {
                return Err(Error::Configuration(format!(
                    "duplicate endpoint: {}",
                    endpoint.url
                )));
            }
            endpoints.push(endpoint);
        }

        Ok(Self {
            endpoints: Arc::new(endpoints),
            counter: AtomicUsize::new(0),
        })
    }

    /// Endpoint for the job at `job_index` in submission order
    pub fn assign(&self, job_index: usize) -> usize {
        job_index % self.endpoints.len()
    }

    /// Endpoint for a retry: next healthy one in rotation, preferring one
    /// other than `previous` when there is a choice.
    pub fn select_for_retry(&self, previous: usize) -> usize {
        let len = self.endpoints.len();
        if len == 1 {
            return 0;
        }

        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;
        let healthy = (0..len)
            .map(|i| (start + i) % len)
            .filter(|&idx| self.endpoints[idx].is_healthy());

        let mut fallback = None;
        for idx in healthy {
            if idx != previous {
                return idx;
            }
            fallback = Some(idx);
        }

        // Nothing healthy: use the least unhealthy
        fallback.unwrap_or_else(|| self.least_unhealthy())
    }

    fn least_unhealthy(&self) -> usize {
        self.endpoints
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.health_score())
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    /// Endpoint at `index`, wrapping around the set
    pub fn endpoint(&self, index: usize) -> &Endpoint {
        &self.endpoints[index % self.endpoints.len()]
    }

    pub fn get(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Clone for EndpointSet {
    fn clone(&self) -> Self {
        Self {
            endpoints: Arc::clone(&self.endpoints),
            counter: AtomicUsize::new(self.counter.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for EndpointSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.endpoints.iter().map(|e| &e.url))
            .finish()
    }
}
