//! s3xfer - S3 request signing and parallel multipart transfers
//!
//! The signer ([`s3::Signer`]) produces SigV4 headers or presigned URLs. The
//! [`TransferScheduler`] splits large objects into parts and moves them over a
//! bounded worker pool, optionally spread across several endpoints.

pub mod cli;
pub mod config;
pub mod error;
pub mod lb;
pub mod s3;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use s3::{Credentials, S3Client, Signer};
pub use transfer::{TransferConfig, TransferScheduler};
pub use transport::{HyperTransport, Transport};
