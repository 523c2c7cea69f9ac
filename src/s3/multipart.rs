//! Multipart upload lifecycle
//!
//! `Uninitiated -> Initiated -> PartsInFlight -> Completed`, with `Aborted`
//! reachable from any non-terminal state. Parts may be uploaded concurrently
//! through a shared `Arc<MultipartUpload>`; nothing here retries.

use crate::error::{Error, Result};
use crate::s3::client::S3Client;
use crate::s3::types::{CompleteMultipartUploadResponse, CompletedPart};
use crate::transport::BodySource;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Highest part number the service accepts
pub const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Uninitiated,
    Initiated,
    PartsInFlight,
    Completed,
    Aborted,
}

impl UploadState {
    pub fn name(self) -> &'static str {
        match self {
            UploadState::Uninitiated => "Uninitiated",
            UploadState::Initiated => "Initiated",
            UploadState::PartsInFlight => "PartsInFlight",
            UploadState::Completed => "Completed",
            UploadState::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Aborted)
    }
}

/// Snapshot of a session: upload id, target and the recorded parts in
/// part-number order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug)]
struct Session {
    state: UploadState,
    upload_id: Option<String>,
    /// part number -> ETag of the last successful attempt
    parts: BTreeMap<u32, String>,
}

/// Controller for one multipart upload
#[derive(Debug)]
pub struct MultipartUpload {
    client: S3Client,
    /// Endpoint for initiate, complete and abort
    endpoint: String,
    key: String,
    metadata: Vec<(String, String)>,
    session: Mutex<Session>,
}

impl MultipartUpload {
    pub fn new(client: S3Client, endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            key: key.into(),
            metadata: Vec::new(),
            session: Mutex::new(Session {
                state: UploadState::Uninitiated,
                upload_id: None,
                parts: BTreeMap::new(),
            }),
        }
    }

    /// `x-amz-meta-*` headers sent with the initiate request
    pub fn with_metadata(mut self, metadata: Vec<(String, String)>) -> Self {
        self.metadata = metadata;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> UploadState {
        self.lock().state
    }

    pub fn upload_id(&self) -> Option<String> {
        self.lock().upload_id.clone()
    }

    /// Current session, once initiated
    pub fn session(&self) -> Option<MultipartUploadSession> {
        let session = self.lock();
        let upload_id = session.upload_id.clone()?;
        Some(MultipartUploadSession {
            upload_id,
            bucket: self.client.bucket().to_string(),
            key: self.key.clone(),
            parts: session
                .parts
                .iter()
                .map(|(n, etag)| CompletedPart::new(*n, etag.clone()))
                .collect(),
        })
    }

    /// Start the upload. On failure the state stays `Uninitiated`.
    pub async fn initiate(&self) -> Result<String> {
        {
            let session = self.lock();
            if session.state != UploadState::Uninitiated {
                return Err(Error::InvalidState {
                    operation: "initiate",
                    state: session.state.name(),
                });
            }
        }

        let upload_id = self
            .client
            .create_multipart_upload(&self.endpoint, &self.key, &self.metadata)
            .await?;

        let mut session = self.lock();
        session.state = UploadState::Initiated;
        session.upload_id = Some(upload_id.clone());
        tracing::info!(key = %self.key, upload_id = %upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    /// Upload one part through the default endpoint.
    pub async fn upload_part(&self, part_number: u32, body: BodySource) -> Result<String> {
        let endpoint = self.endpoint.clone();
        self.upload_part_via(&endpoint, part_number, body).await
    }

    /// Upload one part through `endpoint`. Re-uploading a part number replaces
    /// its recorded ETag.
    pub async fn upload_part_via(
        &self,
        endpoint: &str,
        part_number: u32,
        body: BodySource,
    ) -> Result<String> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(Error::Configuration(format!(
                "part number must be between 1 and {}, got {}",
                MAX_PART_NUMBER, part_number
            )));
        }

        let upload_id = {
            let mut session = self.lock();
            match (session.state, session.upload_id.clone()) {
                (UploadState::Initiated | UploadState::PartsInFlight, Some(id)) => {
                    session.state = UploadState::PartsInFlight;
                    id
                }
                (state, _) => {
                    return Err(Error::InvalidState {
                        operation: "upload_part",
                        state: state.name(),
                    })
                }
            }
        };

        let etag = self
            .client
            .upload_part(endpoint, &self.key, &upload_id, part_number, body)
            .await?;

        let mut session = self.lock();
        if session.state != UploadState::PartsInFlight {
            // aborted while the part was in flight
            return Err(Error::InvalidState {
                operation: "upload_part",
                state: session.state.name(),
            });
        }
        session.parts.insert(part_number, etag.clone());
        tracing::debug!(key = %self.key, part_number, etag = %etag, "part uploaded");
        Ok(etag)
    }

    /// Finish the upload with every recorded part, sorted by part number.
    ///
    /// Fails with [`Error::IncompleteUpload`] before any network call when no
    /// part is recorded or the part numbers have a gap. A transport failure
    /// yields [`Error::CompletionAmbiguous`]: the server may have completed the
    /// upload, so check [`S3Client::object_exists`] before calling again.
    pub async fn complete(&self) -> Result<CompleteMultipartUploadResponse> {
        let (upload_id, parts) = {
            let session = self.lock();
            let upload_id = match (session.state, session.upload_id.clone()) {
                (UploadState::Initiated | UploadState::PartsInFlight, Some(id)) => id,
                (state, _) => {
                    return Err(Error::InvalidState {
                        operation: "complete",
                        state: state.name(),
                    })
                }
            };

            let missing = missing_parts(&session.parts);
            if !missing.is_empty() {
                return Err(Error::IncompleteUpload { missing });
            }

            let parts: Vec<CompletedPart> = session
                .parts
                .iter()
                .map(|(n, etag)| CompletedPart::new(*n, etag.clone()))
                .collect();
            (upload_id, parts)
        };

        let result = self
            .client
            .complete_multipart_upload(&self.endpoint, &self.key, &upload_id, &parts)
            .await;

        match result {
            Ok(response) => {
                self.lock().state = UploadState::Completed;
                tracing::info!(
                    key = %self.key,
                    upload_id = %upload_id,
                    parts = parts.len(),
                    "multipart upload completed"
                );
                Ok(response)
            }
            Err(e @ Error::Transport(_)) => Err(Error::CompletionAmbiguous {
                upload_id,
                cause: Box::new(e),
            }),
            Err(e) => Err(e),
        }
    }

    /// Abort the upload. An upload that was never initiated is aborted
    /// locally. A failed abort request leaves the session `Aborted` and
    /// reports [`Error::OrphanedUpload`]; the server-side upload must then be
    /// cleaned up out of band.
    pub async fn abort(&self) -> Result<()> {
        let upload_id = {
            let mut session = self.lock();
            if session.state.is_terminal() {
                return Err(Error::InvalidState {
                    operation: "abort",
                    state: session.state.name(),
                });
            }
            match session.upload_id.clone() {
                Some(id) => {
                    session.state = UploadState::Aborted;
                    id
                }
                None => {
                    session.state = UploadState::Aborted;
                    return Ok(());
                }
            }
        };

        match self
            .client
            .abort_multipart_upload(&self.endpoint, &self.key, &upload_id)
            .await
        {
            Ok(()) => {
                tracing::info!(key = %self.key, upload_id = %upload_id, "multipart upload aborted");
                Ok(())
            }
            Err(Error::Service { status: 404, .. }) => {
                tracing::debug!(upload_id = %upload_id, "upload already gone on abort");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    upload_id = %upload_id,
                    error = %e,
                    "abort failed, upload orphaned"
                );
                Err(Error::OrphanedUpload {
                    upload_id,
                    cause: Box::new(e),
                })
            }
        }
    }
}

/// Part numbers absent from `1..=max`. Zero parts reports part 1 missing.
fn missing_parts(parts: &BTreeMap<u32, String>) -> Vec<u32> {
    let max = match parts.keys().next_back() {
        Some(max) => *max,
        None => return vec![1],
    };
    (1..=max).filter(|n| !parts.contains_key(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::credentials::Credentials;
    use crate::s3::signer::Signer;
    use crate::transport::{HttpRequest, HttpResponse, Transport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method, StatusCode};
    use std::sync::Arc;

    /// Answers by method; counts requests.
    struct FakeS3 {
        requests: Mutex<Vec<HttpRequest>>,
        abort_status: StatusCode,
        fail_complete_transport: bool,
    }

    impl FakeS3 {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                abort_status: StatusCode::NO_CONTENT,
                fail_complete_transport: false,
            }
        }

        fn count(&self, method: Method) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method == method)
                .count()
        }
    }

    #[async_trait]
    impl Transport for FakeS3 {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let method = request.method.clone();
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);

            let mut headers = HeaderMap::new();
            let (status, body): (StatusCode, &str) = match method {
                Method::POST if url.contains("uploads=") => (
                    StatusCode::OK,
                    "<InitiateMultipartUploadResult><UploadId>u-1</UploadId></InitiateMultipartUploadResult>",
                ),
                Method::PUT => {
                    let part = url
                        .split("partNumber=")
                        .nth(1)
                        .and_then(|s| s.split('&').next())
                        .unwrap_or("0")
                        .to_string();
                    headers.insert("etag", format!("\"etag-{}\"", part).parse().unwrap());
                    (StatusCode::OK, "")
                }
                Method::POST => {
                    if self.fail_complete_transport {
                        return Err(Error::Transport("connection reset".into()));
                    }
                    (
                        StatusCode::OK,
                        "<CompleteMultipartUploadResult><ETag>\"final\"</ETag></CompleteMultipartUploadResult>",
                    )
                }
                Method::DELETE => (self.abort_status, ""),
                _ => (StatusCode::METHOD_NOT_ALLOWED, ""),
            };
            Ok(HttpResponse::from_bytes(status, headers, body.as_bytes().to_vec()))
        }
    }

    fn upload(fake: Arc<FakeS3>) -> MultipartUpload {
        let creds = Credentials::new("AKID", "secret").unwrap();
        let signer = Arc::new(Signer::new(creds, "us-east-1").unwrap());
        let client = S3Client::new(fake, signer, "bucket");
        MultipartUpload::new(client, "http://s3:9000", "big.bin")
    }

    fn body() -> BodySource {
        BodySource::Bytes(Bytes::from_static(b"data"))
    }

    #[tokio::test]
    async fn test_happy_path_sorts_parts() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake.clone());

        assert_eq!(up.state(), UploadState::Uninitiated);
        assert_eq!(up.initiate().await.unwrap(), "u-1");
        assert_eq!(up.state(), UploadState::Initiated);

        for n in [3, 1, 2] {
            up.upload_part(n, body()).await.unwrap();
        }
        assert_eq!(up.state(), UploadState::PartsInFlight);

        let resp = up.complete().await.unwrap();
        assert_eq!(resp.etag, "final");
        assert_eq!(up.state(), UploadState::Completed);

        let requests = fake.requests.lock().unwrap();
        let complete = requests.last().unwrap();
        let xml = String::from_utf8(complete.body.to_vec()).unwrap();
        let p1 = xml.find("<PartNumber>1<").unwrap();
        let p2 = xml.find("<PartNumber>2<").unwrap();
        let p3 = xml.find("<PartNumber>3<").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert!(xml.contains("<ETag>\"etag-2\"</ETag>"));
    }

    #[tokio::test]
    async fn test_gap_fails_before_network() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake.clone());
        up.initiate().await.unwrap();
        up.upload_part(1, body()).await.unwrap();
        up.upload_part(3, body()).await.unwrap();

        let before = fake.requests.lock().unwrap().len();
        match up.complete().await {
            Err(Error::IncompleteUpload { missing }) => assert_eq!(missing, vec![2]),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(fake.requests.lock().unwrap().len(), before);
        assert_eq!(up.state(), UploadState::PartsInFlight);
    }

    #[tokio::test]
    async fn test_zero_parts_rejected() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake.clone());
        up.initiate().await.unwrap();
        assert!(matches!(
            up.complete().await,
            Err(Error::IncompleteUpload { .. })
        ));
        assert_eq!(fake.count(Method::POST), 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake);

        assert!(matches!(
            up.upload_part(1, body()).await,
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(up.complete().await, Err(Error::InvalidState { .. })));

        up.initiate().await.unwrap();
        assert!(matches!(up.initiate().await, Err(Error::InvalidState { .. })));
        assert!(matches!(
            up.upload_part(0, body()).await,
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            up.upload_part(MAX_PART_NUMBER + 1, body()).await,
            Err(Error::Configuration(_))
        ));

        up.abort().await.unwrap();
        assert_eq!(up.state(), UploadState::Aborted);
        assert!(matches!(up.abort().await, Err(Error::InvalidState { .. })));
        assert!(matches!(
            up.upload_part(1, body()).await,
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_uninitiated_is_local() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake.clone());
        up.abort().await.unwrap();
        assert_eq!(up.state(), UploadState::Aborted);
        assert!(fake.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_failure_reports_orphan() {
        let fake = Arc::new(FakeS3 {
            abort_status: StatusCode::FORBIDDEN,
            ..FakeS3::new()
        });
        let up = upload(fake);
        up.initiate().await.unwrap();
        match up.abort().await {
            Err(Error::OrphanedUpload { upload_id, .. }) => assert_eq!(upload_id, "u-1"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(up.state(), UploadState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_of_missing_upload_is_ok() {
        let fake = Arc::new(FakeS3 {
            abort_status: StatusCode::NOT_FOUND,
            ..FakeS3::new()
        });
        let up = upload(fake);
        up.initiate().await.unwrap();
        up.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_failure_on_complete_is_ambiguous() {
        let fake = Arc::new(FakeS3 {
            fail_complete_transport: true,
            ..FakeS3::new()
        });
        let up = upload(fake);
        up.initiate().await.unwrap();
        up.upload_part(1, body()).await.unwrap();
        match up.complete().await {
            Err(Error::CompletionAmbiguous { upload_id, cause }) => {
                assert_eq!(upload_id, "u-1");
                assert!(matches!(*cause, Error::Transport(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(up.state(), UploadState::PartsInFlight);
    }

    #[tokio::test]
    async fn test_session_snapshot() {
        let fake = Arc::new(FakeS3::new());
        let up = upload(fake);
        assert!(up.session().is_none());
        up.initiate().await.unwrap();
        up.upload_part(2, body()).await.unwrap();
        up.upload_part(1, body()).await.unwrap();
        let session = up.session().unwrap();
        assert_eq!(session.bucket, "bucket");
        assert_eq!(session.key, "big.bin");
        assert_eq!(
            session.parts,
            vec![CompletedPart::new(1, "etag-1"), CompletedPart::new(2, "etag-2")]
        );
    }
}
