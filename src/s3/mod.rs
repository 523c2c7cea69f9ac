//! S3 protocol layer
//!
//! - SigV4 signing in header and presigned-URL modes
//! - Typed single-request operations on an [`S3Client`]
//! - The multipart upload state machine

pub mod canonical;
pub mod client;
pub mod clock;
pub mod credentials;
pub mod multipart;
pub mod signer;
pub mod types;
pub mod xml;

pub use canonical::{CanonicalRequest, PayloadHash};
pub use client::S3Client;
pub use clock::{Clock, FixedClock, SystemClock};
pub use credentials::Credentials;
pub use multipart::{MultipartUpload, MultipartUploadSession, UploadState};
pub use signer::{Signature, Signed, SignedUrl, Signer, SigningMode, SigningRequest, SigningScope};
pub use types::{CompleteMultipartUploadResponse, CompletedPart, ListObjectsResponse, ObjectInfo};
pub use xml::{QuickXmlParser, ResponseParser};
