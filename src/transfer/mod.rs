//! Parallel multipart transfers
//!
//! - [`TransferPlan`]: an object partitioned into [`TransferJob`]s
//! - [`TransferConfig`]: validated pool size, part size, retry and endpoint settings
//! - [`TransferScheduler`]: worker pool that runs a plan for an upload or a download

pub mod config;
pub mod plan;
pub mod scheduler;

pub use config::{ProgressFn, TransferConfig, TransferConfigBuilder};
pub use plan::{ByteRange, JobState, TransferJob, TransferPlan};
pub use scheduler::{DownloadTarget, TransferResult, TransferScheduler, UploadSource};
