use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// One S3 endpoint with passive health and in-flight request tracking
#[derive(Debug)]
pub struct Endpoint {
    /// Base URL (e.g., "http://s3-1.example.com:9000")
    pub url: String,

    /// Requests currently dispatched to this endpoint
    in_flight: AtomicU32,

    /// Consecutive failures (reset on success)
    failure_count: AtomicU32,

    /// Health score from 0-100 (100 = perfectly healthy)
    health_score: AtomicU8,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            in_flight: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            health_score: AtomicU8::new(100),
        }
    }

    /// Mark a request as dispatched; the guard releases it on drop.
    pub fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight { endpoint: self }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Record a successful request (resets failure count)
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        let current = self.health_score.load(Ordering::Relaxed);
        self.health_score
            .store(current.saturating_add(10).min(100), Ordering::Relaxed);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let current = self.health_score.load(Ordering::Relaxed);
        self.health_score
            .store(current.saturating_sub(20), Ordering::Relaxed);
    }

    /// Record a transport failure. Drops the score to 30 or below so the
    /// endpoint is skipped by retry selection until it recovers.
    pub fn record_transport_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let current = self.health_score.load(Ordering::Relaxed);
        self.health_score
            .store(current.saturating_sub(70), Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn health_score(&self) -> u8 {
        self.health_score.load(Ordering::Relaxed)
    }

    pub fn set_health_score(&self, score: u8) {
        self.health_score.store(score.min(100), Ordering::Relaxed);
    }

    /// Healthy while the score is above 30
    pub fn is_healthy(&self) -> bool {
        self.health_score() > 30
    }
}

/// Decrements the in-flight counter when dropped
#[derive(Debug)]
pub struct InFlight<'a> {
    endpoint: &'a Endpoint,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.endpoint.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
