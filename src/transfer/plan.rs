//! Partitioning an object into transfer jobs

use crate::error::{Error, Result};
use crate::lb::EndpointSet;
use crate::s3::multipart::MAX_PART_NUMBER;
use std::fmt;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `Range` header value (inclusive end)
    pub fn http_range(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// One part of a transfer
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Position in submission order (ascending offset)
    pub index: usize,
    /// 1-based multipart part number
    pub part_number: u32,
    pub key: String,
    pub total_size: u64,
    pub part_size: u64,
    pub range: ByteRange,
    /// Index into the transfer's endpoint set
    pub endpoint: usize,
    pub retries_remaining: u32,
    pub attempts: u32,
    pub state: JobState,
}

impl TransferJob {
    pub fn offset(&self) -> u64 {
        self.range.start
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Jobs covering `[0, size)` exactly once, ordered by offset.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    key: String,
    size: u64,
    part_size: u64,
    jobs: Vec<TransferJob>,
}

impl TransferPlan {
    /// Split `size` bytes into `part_size` chunks, the last one possibly
    /// shorter. Each job gets its endpoint from [`EndpointSet::assign`].
    pub fn new(
        key: &str,
        size: u64,
        part_size: u64,
        endpoints: &EndpointSet,
        max_retries: u32,
    ) -> Result<Self> {
        if part_size == 0 {
            return Err(Error::Configuration("part size must be > 0".to_string()));
        }

        let count = size.div_ceil(part_size);
        if count > MAX_PART_NUMBER as u64 {
            return Err(Error::Configuration(format!(
                "{} bytes in {} byte parts needs {} parts, the limit is {}",
                size, part_size, count, MAX_PART_NUMBER
            )));
        }

        let jobs = (0..count as usize)
            .map(|index| {
                let start = index as u64 * part_size;
                let end = (start + part_size).min(size);
                TransferJob {
                    index,
                    part_number: index as u32 + 1,
                    key: key.to_string(),
                    total_size: size,
                    part_size,
                    range: ByteRange::new(start, end),
                    endpoint: endpoints.assign(index),
                    retries_remaining: max_retries,
                    attempts: 0,
                    state: JobState::Pending,
                }
            })
            .collect();

        Ok(Self {
            key: key.to_string(),
            size,
            part_size,
            jobs,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn jobs(&self) -> &[TransferJob] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<TransferJob> {
        self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
