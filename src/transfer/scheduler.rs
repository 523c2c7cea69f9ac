//! Parallel transfer scheduler
//!
//! An object is split into a [`TransferPlan`]; its jobs are queued in offset
//! order and drained by a fixed pool of `jobs` workers. Each worker runs one
//! job end to end before pulling the next.
//!
//! - Retryable failures re-enter the queue after a jittered backoff, on the
//!   next healthy endpoint
//! - The first permanent failure cancels the pool: in-flight jobs drain, queued
//!   jobs are dropped as failed
//! - Uploads that fail are aborted exactly once
//! - Downloads are assembled by offset and checked against the object size

use crate::error::{Error, Result};
use crate::s3::client::S3Client;
use crate::s3::multipart::MultipartUpload;
use crate::transfer::config::TransferConfig;
use crate::transfer::plan::{ByteRange, JobState, TransferJob, TransferPlan};
use crate::transport::{BodySource, ResponseSink};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Data to upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
}

impl UploadSource {
    async fn len(&self) -> Result<u64> {
        match self {
            UploadSource::Bytes(b) => Ok(b.len() as u64),
            UploadSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    fn body(&self, range: ByteRange) -> BodySource {
        match self {
            UploadSource::Bytes(b) => {
                BodySource::Bytes(b.slice(range.start as usize..range.end as usize))
            }
            UploadSource::File(path) => BodySource::File {
                path: path.clone(),
                offset: range.start,
                len: range.len(),
            },
        }
    }
}

/// Where downloaded data goes
#[derive(Debug, Clone)]
pub enum DownloadTarget {
    /// Assembled into [`TransferResult::data`]
    Memory,
    /// Created or truncated, sized to the object, then written range by range
    File(PathBuf),
}

/// Outcome of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub key: String,
    pub size: u64,
    pub parts: usize,
    /// ETag of the stored object (uploads)
    pub etag: Option<String>,
    /// Retries across all parts
    pub retries: u32,
    /// Object bytes for in-memory downloads
    pub data: Option<Bytes>,
}

#[derive(Debug)]
struct PartOutcome {
    bytes: u64,
    data: Option<Bytes>,
}

/// Queue bookkeeping shared by the workers
struct Shared {
    /// Dropped once nothing is outstanding, which closes the queue
    sender: Option<mpsc::UnboundedSender<TransferJob>>,
    outstanding: usize,
    cancelled: bool,
    completed: Vec<(TransferJob, PartOutcome)>,
    first_error: Option<Error>,
    retries: u32,
}

impl Shared {
    fn finish_one(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.sender = None;
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

struct PoolOutcome {
    completed: Vec<(TransferJob, PartOutcome)>,
    error: Option<Error>,
    retries: u32,
}

/// Drives uploads and downloads through an [`S3Client`]
#[derive(Debug, Clone)]
pub struct TransferScheduler {
    client: S3Client,
}

impl TransferScheduler {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    /// Upload `source` to `key` as a multipart upload.
    ///
    /// An empty source is stored with a single PUT. On a permanent part
    /// failure the upload is aborted once and
    /// [`Error::PartialTransferFailure`] is returned with an
    /// [`Error::AbortedUpload`] cause.
    pub async fn upload(
        &self,
        source: UploadSource,
        key: &str,
        config: &TransferConfig,
    ) -> Result<TransferResult> {
        let size = source.len().await?;
        let primary = config.endpoints.endpoint(0).url.clone();

        if size == 0 {
            let etag = self
                .client
                .put_object(&primary, key, BodySource::Empty, &config.metadata)
                .await?;
            tracing::info!(key, "uploaded empty object");
            return Ok(TransferResult {
                key: key.to_string(),
                size: 0,
                parts: 0,
                etag: Some(etag),
                retries: 0,
                data: None,
            });
        }

        let plan = TransferPlan::new(
            key,
            size,
            config.part_size,
            &config.endpoints,
            config.max_retries,
        )?;
        tracing::info!(
            key,
            size,
            parts = plan.len(),
            jobs = config.jobs,
            endpoints = config.endpoints.len(),
            "starting upload"
        );

        let upload = Arc::new(
            MultipartUpload::new(self.client.clone(), primary, key)
                .with_metadata(config.metadata.clone()),
        );
        let upload_id = upload.initiate().await?;

        let op = {
            let upload = Arc::clone(&upload);
            move |job: TransferJob, endpoint: String| {
                let upload = Arc::clone(&upload);
                let body = source.body(job.range);
                async move {
                    let bytes = body.len();
                    upload
                        .upload_part_via(&endpoint, job.part_number, body)
                        .await?;
                    Ok(PartOutcome { bytes, data: None })
                }
            }
        };

        let jobs = plan.jobs().to_vec();
        let outcome = run_pool(jobs, config, op).await;

        if let Some(cause) = outcome.error {
            let (completed_ranges, failed_ranges) = split_ranges(&plan, &outcome.completed);
            let orphaned = self.abort(&upload).await;
            return Err(Error::PartialTransferFailure {
                completed_ranges,
                failed_ranges,
                cause: Box::new(Error::AbortedUpload {
                    upload_id,
                    reason: cause.to_string(),
                    orphaned,
                }),
            });
        }

        let response = match upload.complete().await {
            Ok(response) => response,
            Err(e @ Error::CompletionAmbiguous { .. }) => return Err(e),
            Err(e) => {
                let orphaned = self.abort(&upload).await;
                return Err(Error::AbortedUpload {
                    upload_id,
                    reason: e.to_string(),
                    orphaned,
                });
            }
        };

        tracing::info!(
            key,
            size,
            parts = plan.len(),
            retries = outcome.retries,
            "upload complete"
        );
        Ok(TransferResult {
            key: key.to_string(),
            size,
            parts: plan.len(),
            etag: Some(response.etag),
            retries: outcome.retries,
            data: None,
        })
    }

    /// Abort after a failure. Returns whether the upload was left orphaned.
    async fn abort(&self, upload: &MultipartUpload) -> bool {
        match upload.abort().await {
            Ok(()) => false,
            Err(e) => {
                tracing::error!(key = upload.key(), error = %e, "upload left orphaned");
                true
            }
        }
    }

    /// Download `key` with parallel range requests.
    ///
    /// The object size comes from the config or from a HEAD request. Each
    /// range is checked on arrival: a short body is retried, a server that
    /// ignores `Range` fails the transfer, and an object whose length differs
    /// from the size is [`Error::SizeMismatch`].
    pub async fn download(
        &self,
        key: &str,
        target: DownloadTarget,
        config: &TransferConfig,
    ) -> Result<TransferResult> {
        let size = match config.object_size {
            Some(size) => size,
            None => {
                let primary = &config.endpoints.endpoint(0).url;
                self.client.head_object(primary, key).await?.size
            }
        };

        let plan = TransferPlan::new(
            key,
            size,
            config.part_size,
            &config.endpoints,
            config.max_retries,
        )?;
        tracing::info!(key, size, parts = plan.len(), jobs = config.jobs, "starting download");

        if let DownloadTarget::File(path) = &target {
            let file = tokio::fs::File::create(path).await?;
            file.set_len(size).await?;
        }

        let in_memory = matches!(target, DownloadTarget::Memory);
        let op = {
            let client = self.client.clone();
            let key = key.to_string();
            move |job: TransferJob, endpoint: String| {
                let client = client.clone();
                let key = key.clone();
                let sink = match &target {
                    DownloadTarget::Memory => ResponseSink::Memory,
                    DownloadTarget::File(path) => ResponseSink::File {
                        path: path.clone(),
                        offset: job.range.start,
                        len: Some(job.range.len()),
                    },
                };
                async move {
                    let meta = client
                        .get_range(&endpoint, &key, job.range, job.total_size, sink)
                        .await?;
                    Ok(PartOutcome {
                        bytes: meta.bytes_received,
                        data: in_memory.then_some(meta.body),
                    })
                }
            }
        };

        let jobs = plan.jobs().to_vec();
        let mut outcome = run_pool(jobs, config, op).await;

        match outcome.error {
            // the object is not the declared length; no range can fix that
            Some(e @ Error::SizeMismatch { .. }) => return Err(e),
            Some(cause) => {
                let (completed_ranges, failed_ranges) =
                    split_ranges(&plan, &outcome.completed);
                return Err(Error::PartialTransferFailure {
                    completed_ranges,
                    failed_ranges,
                    cause: Box::new(cause),
                });
            }
            None => {}
        }

        outcome.completed.sort_by_key(|(job, _)| job.range.start);
        let written: u64 = outcome.completed.iter().map(|(_, part)| part.bytes).sum();
        if written != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: written,
            });
        }

        let data = in_memory.then(|| {
            let mut buf = BytesMut::with_capacity(size as usize);
            for (_, part) in &outcome.completed {
                if let Some(bytes) = &part.data {
                    buf.extend_from_slice(bytes);
                }
            }
            buf.freeze()
        });

        tracing::info!(key, size, retries = outcome.retries, "download complete");
        Ok(TransferResult {
            key: key.to_string(),
            size,
            parts: plan.len(),
            etag: None,
            retries: outcome.retries,
            data,
        })
    }
}

/// Completed and failed ranges, each in offset order. Jobs that never
/// completed count as failed.
fn split_ranges(
    plan: &TransferPlan,
    completed: &[(TransferJob, PartOutcome)],
) -> (Vec<ByteRange>, Vec<ByteRange>) {
    let mut done = vec![false; plan.len()];
    for (job, _) in completed {
        done[job.index] = true;
    }
    plan.jobs()
        .iter()
        .map(|job| (job.range, done[job.index]))
        .fold((Vec::new(), Vec::new()), |(mut ok, mut failed), (range, succeeded)| {
            if succeeded {
                ok.push(range);
            } else {
                failed.push(range);
            }
            (ok, failed)
        })
}

/// Run `jobs` through a pool of `config.jobs` workers.
async fn run_pool<F, Fut>(jobs: Vec<TransferJob>, config: &TransferConfig, op: F) -> PoolOutcome
where
    F: Fn(TransferJob, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PartOutcome>> + Send + 'static,
{
    let total = jobs.len();
    if total == 0 {
        return PoolOutcome {
            completed: Vec::new(),
            error: None,
            retries: 0,
        };
    }

    let (tx, rx) = mpsc::unbounded_channel();
    for job in jobs {
        // receiver is alive; cannot fail
        let _ = tx.send(job);
    }

    let shared = Arc::new(Mutex::new(Shared {
        sender: Some(tx),
        outstanding: total,
        cancelled: false,
        completed: Vec::with_capacity(total),
        first_error: None,
        retries: 0,
    }));
    let queue = Arc::new(tokio::sync::Mutex::new(rx));
    let config = Arc::new(config.clone());
    let op = Arc::new(op);

    let mut workers = JoinSet::new();
    for id in 0..config.jobs.min(total) {
        workers.spawn(worker(
            id,
            Arc::clone(&queue),
            Arc::clone(&shared),
            Arc::clone(&config),
            Arc::clone(&op),
        ));
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "transfer worker died");
            let mut state = lock(&shared);
            state.cancelled = true;
            state.sender = None;
            if state.first_error.is_none() {
                state.first_error = Some(Error::Io(std::io::Error::other(format!(
                    "transfer worker died: {}",
                    e
                ))));
            }
        }
    }

    let mut state = lock(&shared);
    PoolOutcome {
        completed: std::mem::take(&mut state.completed),
        error: state.first_error.take(),
        retries: state.retries,
    }
}

async fn worker<F, Fut>(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TransferJob>>>,
    shared: Arc<Mutex<Shared>>,
    config: Arc<TransferConfig>,
    op: Arc<F>,
) where
    F: Fn(TransferJob, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<PartOutcome>> + Send + 'static,
{
    loop {
        let next = queue.lock().await.recv().await;
        let Some(mut job) = next else {
            break;
        };

        if lock(&shared).cancelled {
            job.state = JobState::Failed;
            tracing::debug!(worker = id, part = job.part_number, "dropping queued job after cancellation");
            lock(&shared).finish_one();
            continue;
        }

        job.state = JobState::InFlight;
        job.attempts += 1;
        let endpoint = config.endpoints.endpoint(job.endpoint);
        tracing::debug!(
            worker = id,
            part = job.part_number,
            range = %job.range,
            endpoint = %endpoint.url,
            attempt = job.attempts,
            "job started"
        );

        let result = {
            let _in_flight = endpoint.begin();
            op(job.clone(), endpoint.url.clone()).await
        };

        match result {
            Ok(outcome) => {
                endpoint.record_success();
                job.state = JobState::Succeeded;
                config.report_progress(outcome.bytes);
                let mut state = lock(&shared);
                state.completed.push((job, outcome));
                state.finish_one();
            }
            Err(e) => {
                if matches!(e, Error::Transport(_)) {
                    endpoint.record_transport_failure();
                } else {
                    endpoint.record_failure();
                }

                let mut state = lock(&shared);
                if e.is_retryable() && job.retries_remaining > 0 && !state.cancelled {
                    job.retries_remaining -= 1;
                    job.state = JobState::Pending;
                    state.retries += 1;

                    let previous = job.endpoint;
                    job.endpoint = config.endpoints.select_for_retry(previous);
                    let delay = config.backoff(job.attempts);
                    tracing::warn!(
                        part = job.part_number,
                        attempt = job.attempts,
                        retries_remaining = job.retries_remaining,
                        delay_ms = delay.as_millis() as u64,
                        endpoint = %config.endpoints.endpoint(job.endpoint).url,
                        error = %e,
                        "retrying part"
                    );

                    match state.sender.clone() {
                        Some(tx) => {
                            drop(state);
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = tx.send(job);
                            });
                        }
                        None => state.finish_one(),
                    }
                } else {
                    job.state = JobState::Failed;
                    tracing::warn!(
                        part = job.part_number,
                        attempts = job.attempts,
                        error = %e,
                        "part failed, cancelling transfer"
                    );
                    if state.first_error.is_none() {
                        state.first_error = Some(e);
                    }
                    state.cancelled = true;
                    state.finish_one();
                }
            }
        }
    }
}
