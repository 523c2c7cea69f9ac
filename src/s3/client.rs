//! S3 operations on top of the signer and the dispatcher
//!
//! - Path-style URLs (`endpoint/bucket/key`)
//! - Every request is signed just before dispatch (fresh timestamp per attempt)
//! - UNSIGNED-PAYLOAD for object and part bodies, real hash for XML bodies
//! - Non-2xx responses become [`Error::Service`] with the parsed code and message
//!
//! No retries happen here; the transfer scheduler owns retry policy.

use crate::error::{Error, Result};
use crate::s3::canonical::{self, PayloadHash};
use crate::s3::signer::{SignedUrl, Signer, SigningRequest};
use crate::s3::types::{
    complete_multipart_body, CompleteMultipartUploadResponse, CompletedPart, ContentRange,
    ListObjectsResponse, ObjectInfo,
};
use crate::s3::xml::{QuickXmlParser, ResponseParser};
use crate::transfer::ByteRange;
use crate::transport::{
    BodySource, Dispatcher, PreparedRequest, ResponseMeta, ResponseSink, Transport,
};
use bytes::Bytes;
use hyper::{Method, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;

/// S3 client bound to one bucket. Clone is cheap.
#[derive(Clone)]
pub struct S3Client {
    dispatcher: Dispatcher,
    signer: Arc<Signer>,
    parser: Arc<dyn ResponseParser>,
    bucket: String,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.bucket)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl S3Client {
    pub fn new(transport: Arc<dyn Transport>, signer: Arc<Signer>, bucket: impl Into<String>) -> Self {
        Self {
            dispatcher: Dispatcher::new(transport),
            signer,
            parser: Arc::new(QuickXmlParser::new()),
            bucket: bucket.into(),
        }
    }

    /// Replace the response parser
    pub fn with_parser(mut self, parser: Arc<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Override the bucket name
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    pub fn parser(&self) -> &dyn ResponseParser {
        self.parser.as_ref()
    }

    /// Full URL for a key, slashes in the key preserved
    pub fn object_url(&self, endpoint: &str, key: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        let mut url = String::with_capacity(endpoint.len() + self.bucket.len() + key.len() + 16);
        url.push_str(endpoint);
        url.push('/');
        url.push_str(&self.bucket);
        url.push('/');
        canonical::uri_encode_into(&mut url, key, false);
        url
    }

    /// Bucket URL (no key)
    pub fn bucket_url(&self, endpoint: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        let mut url = String::with_capacity(endpoint.len() + 1 + self.bucket.len());
        url.push_str(endpoint);
        url.push('/');
        url.push_str(&self.bucket);
        url
    }

    /// Sign a request and dispatch it once. The request's headers are both
    /// signed and sent.
    pub async fn execute(
        &self,
        request: SigningRequest,
        body: BodySource,
        sink: ResponseSink,
    ) -> Result<ResponseMeta> {
        let signed = self.signer.sign_headers(&request)?;

        let mut headers: BTreeMap<String, String> = request
            .header_list()
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        headers.extend(signed.headers);
        if request.host_overridden() {
            headers.insert("host".to_string(), request.host().to_string());
        }

        let prepared = PreparedRequest {
            method: request.method.clone(),
            url: signed.url,
            headers,
        };
        self.dispatcher.send(prepared, body, sink).await
    }

    /// Sign, dispatch and turn a non-2xx status into an error.
    async fn execute_checked(
        &self,
        request: SigningRequest,
        headers: Vec<(String, String)>,
        body: BodySource,
        sink: ResponseSink,
    ) -> Result<ResponseMeta> {
        let meta = self.execute(request.headers(headers), body, sink).await?;
        if meta.is_success() {
            Ok(meta)
        } else {
            Err(self.service_error(&meta))
        }
    }

    /// Parse a non-2xx response into [`Error::Service`].
    pub fn service_error(&self, meta: &ResponseMeta) -> Error {
        let status = meta.status;
        // HEAD responses and some proxies carry no error document
        let fallback_code = || {
            status
                .canonical_reason()
                .map(|r| r.replace(' ', ""))
                .unwrap_or_else(|| "Unknown".to_string())
        };

        let (code, message) = if meta.body.is_empty() {
            (fallback_code(), String::new())
        } else {
            let code = self.parser.text(&meta.body, "Error/Code").ok().flatten();
            let message = self.parser.text(&meta.body, "Error/Message").ok().flatten();
            match code {
                Some(code) => (code, message.unwrap_or_default()),
                None => (
                    fallback_code(),
                    String::from_utf8_lossy(&meta.body).into_owned(),
                ),
            }
        };

        Error::Service {
            status: status.as_u16(),
            code,
            message,
        }
    }

    fn etag(meta: &ResponseMeta) -> String {
        meta.header("etag")
            .map(|s| s.trim_matches('"').to_string())
            .unwrap_or_default()
    }

    /// Object metadata (HEAD)
    pub async fn head_object(&self, endpoint: &str, key: &str) -> Result<ObjectInfo> {
        let request = SigningRequest::new(Method::HEAD, &self.object_url(endpoint, key))?;
        let meta = self
            .execute_checked(request, Vec::new(), BodySource::Empty, ResponseSink::Discard)
            .await?;
        ObjectInfo::from_headers(key, &meta.headers)
    }

    /// Whether the key exists. A 404 is `Ok(false)`; other failures are errors.
    pub async fn object_exists(&self, endpoint: &str, key: &str) -> Result<bool> {
        match self.head_object(endpoint, key).await {
            Ok(_) => Ok(true),
            Err(Error::Service { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// GET an object or a byte range of it into `sink`.
    pub async fn get_object(
        &self,
        endpoint: &str,
        key: &str,
        range: Option<ByteRange>,
        sink: ResponseSink,
    ) -> Result<ResponseMeta> {
        let request = SigningRequest::new(Method::GET, &self.object_url(endpoint, key))?;
        let headers = match range {
            Some(range) => vec![("range".to_string(), range.http_range())],
            None => Vec::new(),
        };
        self.execute_checked(request, headers, BodySource::Empty, sink)
            .await
    }

    /// GET one range of an object whose length is expected to be `total`,
    /// checking the reply against the request.
    ///
    /// - `416`, or a `Content-Range` total other than `total`, is
    ///   [`Error::SizeMismatch`]
    /// - A `200` for a range that is not the whole object means the server
    ///   ignored `Range`; that is a permanent service error
    /// - A body shorter or longer than the range is a transport error
    pub async fn get_range(
        &self,
        endpoint: &str,
        key: &str,
        range: ByteRange,
        total: u64,
        sink: ResponseSink,
    ) -> Result<ResponseMeta> {
        let request = SigningRequest::new(Method::GET, &self.object_url(endpoint, key))?
            .header("range", range.http_range());
        let meta = self.execute(request, BodySource::Empty, sink).await?;
        let content_range = ContentRange::from_headers(&meta.headers);

        if meta.status == StatusCode::RANGE_NOT_SATISFIABLE {
            // the object ends before this range starts
            let actual = content_range
                .and_then(|c| c.total)
                .unwrap_or(range.start.min(total));
            return Err(Error::SizeMismatch {
                expected: total,
                actual,
            });
        }
        if !meta.is_success() {
            return Err(self.service_error(&meta));
        }

        if let Some(actual) = content_range.and_then(|c| c.total) {
            if actual != total {
                return Err(Error::SizeMismatch {
                    expected: total,
                    actual,
                });
            }
        }

        let whole_object = range.start == 0 && range.end == total;
        if meta.status != StatusCode::PARTIAL_CONTENT && !whole_object {
            return Err(Error::Service {
                status: meta.status.as_u16(),
                code: "RangeIgnored".to_string(),
                message: format!(
                    "expected 206 for {}, server sent the full object",
                    range.http_range()
                ),
            });
        }

        if let Some((first, last)) = content_range.and_then(|c| c.range) {
            if first != range.start || last + 1 != range.end {
                return Err(Error::Transport(format!(
                    "asked for {}, got bytes {}-{}",
                    range.http_range(),
                    first,
                    last
                )));
            }
        }

        if meta.bytes_received != range.len() {
            return Err(Error::Transport(format!(
                "{} returned {} of {} bytes",
                range.http_range(),
                meta.bytes_received,
                range.len()
            )));
        }

        Ok(meta)
    }

    /// Single-request upload. Returns the object's ETag.
    pub async fn put_object(
        &self,
        endpoint: &str,
        key: &str,
        body: BodySource,
        metadata: &[(String, String)],
    ) -> Result<String> {
        let request = SigningRequest::new(Method::PUT, &self.object_url(endpoint, key))?
            .payload(if body.is_empty() {
                PayloadHash::Empty
            } else {
                PayloadHash::Unsigned
            });

        let mut headers = vec![
            ("content-type".to_string(), "application/octet-stream".to_string()),
            ("content-length".to_string(), body.len().to_string()),
        ];
        headers.extend(metadata.iter().cloned());

        let meta = self
            .execute_checked(request, headers, body, ResponseSink::Discard)
            .await?;
        Ok(Self::etag(&meta))
    }

    pub async fn delete_object(&self, endpoint: &str, key: &str) -> Result<()> {
        let request = SigningRequest::new(Method::DELETE, &self.object_url(endpoint, key))?;
        self.execute_checked(request, Vec::new(), BodySource::Empty, ResponseSink::Discard)
            .await?;
        Ok(())
    }

    /// One page of ListObjectsV2
    pub async fn list_objects_v2(
        &self,
        endpoint: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
        max_keys: Option<u32>,
    ) -> Result<ListObjectsResponse> {
        let mut request = SigningRequest::new(Method::GET, &self.bucket_url(endpoint))?
            .query_param("list-type", "2");
        if let Some(prefix) = prefix {
            request = request.query_param("prefix", prefix);
        }
        if let Some(delimiter) = delimiter {
            request = request.query_param("delimiter", delimiter);
        }
        if let Some(token) = continuation_token {
            request = request.query_param("continuation-token", token);
        }
        if let Some(max_keys) = max_keys {
            request = request.query_param("max-keys", max_keys.to_string());
        }

        let meta = self
            .execute_checked(request, Vec::new(), BodySource::Empty, ResponseSink::Memory)
            .await?;
        ListObjectsResponse::parse(self.parser.as_ref(), &meta.body)
    }

    /// Initiate a multipart upload. Returns the server-issued upload id.
    pub async fn create_multipart_upload(
        &self,
        endpoint: &str,
        key: &str,
        metadata: &[(String, String)],
    ) -> Result<String> {
        let request = SigningRequest::new(Method::POST, &self.object_url(endpoint, key))?
            .query_param("uploads", "");

        let mut headers = vec![(
            "content-type".to_string(),
            "application/octet-stream".to_string(),
        )];
        headers.extend(metadata.iter().cloned());

        let meta = self
            .execute_checked(request, headers, BodySource::Empty, ResponseSink::Memory)
            .await?;

        self.parser
            .text(&meta.body, "InitiateMultipartUploadResult/UploadId")?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Xml("response has no UploadId".to_string()))
    }

    /// Upload one part. Returns the part's ETag without quotes.
    pub async fn upload_part(
        &self,
        endpoint: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: BodySource,
    ) -> Result<String> {
        let request = SigningRequest::new(Method::PUT, &self.object_url(endpoint, key))?
            .query_param("partNumber", part_number.to_string())
            .query_param("uploadId", upload_id)
            .payload(PayloadHash::Unsigned);

        let headers = vec![("content-length".to_string(), body.len().to_string())];
        let meta = self
            .execute_checked(request, headers, body, ResponseSink::Discard)
            .await?;

        let etag = Self::etag(&meta);
        if etag.is_empty() {
            return Err(Error::Service {
                status: meta.status.as_u16(),
                code: "MissingETag".to_string(),
                message: format!("part {} response has no ETag", part_number),
            });
        }
        Ok(etag)
    }

    /// Complete a multipart upload. `parts` must be sorted by part number.
    ///
    /// A 200 response carrying an `<Error>` document is reported as a service
    /// error.
    pub async fn complete_multipart_upload(
        &self,
        endpoint: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteMultipartUploadResponse> {
        let body = Bytes::from(complete_multipart_body(parts));
        let request = SigningRequest::new(Method::POST, &self.object_url(endpoint, key))?
            .query_param("uploadId", upload_id)
            .payload(PayloadHash::from_bytes(&body));

        let headers = vec![
            ("content-type".to_string(), "application/xml".to_string()),
            ("content-length".to_string(), body.len().to_string()),
        ];
        let meta = self
            .execute_checked(request, headers, BodySource::Bytes(body), ResponseSink::Memory)
            .await?;

        if let Some(code) = self.parser.text(&meta.body, "Error/Code")? {
            return Err(Error::Service {
                status: meta.status.as_u16(),
                code,
                message: self
                    .parser
                    .text(&meta.body, "Error/Message")?
                    .unwrap_or_default(),
            });
        }

        CompleteMultipartUploadResponse::parse(self.parser.as_ref(), &meta.body)
    }

    /// Abort a multipart upload, discarding uploaded parts.
    pub async fn abort_multipart_upload(
        &self,
        endpoint: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let request = SigningRequest::new(Method::DELETE, &self.object_url(endpoint, key))?
            .query_param("uploadId", upload_id);
        self.execute_checked(request, Vec::new(), BodySource::Empty, ResponseSink::Discard)
            .await?;
        Ok(())
    }

    /// Presigned URL for `method` on `key`.
    pub fn presign(
        &self,
        endpoint: &str,
        method: Method,
        key: &str,
        expires_in_secs: u64,
        params: &[(String, String)],
    ) -> Result<SignedUrl> {
        let mut request = SigningRequest::new(method, &self.object_url(endpoint, key))?;
        for (k, v) in params {
            request = request.query_param(k.clone(), v.clone());
        }
        self.signer.presign(&request, expires_in_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::credentials::Credentials;
    use crate::transport::{HttpRequest, HttpResponse};
    use async_trait::async_trait;
    use hyper::HeaderMap;
    use std::sync::Mutex;

    struct Recorder {
        status: StatusCode,
        headers: HeaderMap,
        body: &'static str,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Recorder {
        fn new(status: StatusCode, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                headers: HeaderMap::new(),
                body,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn with_header(status: StatusCode, name: &'static str, value: &str, body: &'static str) -> Arc<Self> {
            let mut headers = HeaderMap::new();
            headers.insert(name, value.parse().unwrap());
            Arc::new(Self {
                status,
                headers,
                body,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse::from_bytes(
                self.status,
                self.headers.clone(),
                self.body.as_bytes().to_vec(),
            ))
        }
    }

    fn client(transport: Arc<Recorder>) -> S3Client {
        let creds = Credentials::new("AKID", "secret").unwrap();
        let signer = Arc::new(Signer::new(creds, "us-east-1").unwrap());
        S3Client::new(transport, signer, "bucket")
    }

    #[test]
    fn test_object_url_encoding() {
        let c = client(Recorder::new(StatusCode::OK, ""));
        assert_eq!(
            c.object_url("http://s3:9000/", "dir/my file+1.txt"),
            "http://s3:9000/bucket/dir/my%20file%2B1.txt"
        );
        assert_eq!(c.bucket_url("http://s3:9000"), "http://s3:9000/bucket");
    }

    #[tokio::test]
    async fn test_service_error_parsed() {
        let transport = Recorder::new(
            StatusCode::FORBIDDEN,
            "<Error><Code>AccessDenied</Code><Message>nope</Message></Error>",
        );
        let err = client(transport)
            .delete_object("http://s3:9000", "k")
            .await
            .unwrap_err();
        match err {
            Error::Service { status, code, message } => {
                assert_eq!(status, 403);
                assert_eq!(code, "AccessDenied");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_object_exists_404() {
        let c = client(Recorder::new(StatusCode::NOT_FOUND, ""));
        assert!(!c.object_exists("http://s3:9000", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_multipart_upload() {
        let transport = Recorder::new(
            StatusCode::OK,
            "<InitiateMultipartUploadResult><Bucket>bucket</Bucket><Key>k</Key>\
             <UploadId>upload-123</UploadId></InitiateMultipartUploadResult>",
        );
        let c = client(transport.clone());
        let id = c
            .create_multipart_upload("http://s3:9000", "k", &[])
            .await
            .unwrap();
        assert_eq!(id, "upload-123");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].url, "http://s3:9000/bucket/k?uploads=");
        assert!(seen[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_complete_with_error_document() {
        let transport = Recorder::new(
            StatusCode::OK,
            "<Error><Code>InternalError</Code><Message>try again</Message></Error>",
        );
        let err = client(transport)
            .complete_multipart_upload("http://s3:9000", "k", "id", &[CompletedPart::new(1, "e")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Service { ref code, .. } if code == "InternalError"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_range_header() {
        let transport = Recorder::new(StatusCode::PARTIAL_CONTENT, "abc");
        let c = client(transport.clone());
        let meta = c
            .get_object(
                "http://s3:9000",
                "k",
                Some(ByteRange::new(10, 13)),
                ResponseSink::Memory,
            )
            .await
            .unwrap();
        assert_eq!(meta.body.as_ref(), b"abc");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].headers["range"], "bytes=10-12");
        assert!(seen[0].headers["authorization"].contains("range"));
    }

    #[tokio::test]
    async fn test_get_range_checks_reply() {
        let range = ByteRange::new(10, 13);
        let get = move |transport: Arc<Recorder>| async move {
            client(transport)
                .get_range("http://s3:9000", "k", range, 20, ResponseSink::Memory)
                .await
        };

        let ok = Recorder::with_header(StatusCode::PARTIAL_CONTENT, "content-range", "bytes 10-12/20", "abc");
        assert_eq!(get(ok).await.unwrap().body.as_ref(), b"abc");

        let short = Recorder::with_header(StatusCode::PARTIAL_CONTENT, "content-range", "bytes 10-12/20", "ab");
        let err = get(short).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_retryable());

        let shifted = Recorder::with_header(StatusCode::PARTIAL_CONTENT, "content-range", "bytes 11-13/20", "abc");
        assert!(matches!(get(shifted).await.unwrap_err(), Error::Transport(_)));

        let smaller = Recorder::with_header(StatusCode::PARTIAL_CONTENT, "content-range", "bytes 10-12/12", "abc");
        assert!(matches!(
            get(smaller).await.unwrap_err(),
            Error::SizeMismatch { expected: 20, actual: 12 }
        ));

        let past_end = Recorder::with_header(StatusCode::RANGE_NOT_SATISFIABLE, "content-range", "bytes */8", "");
        assert!(matches!(
            get(past_end).await.unwrap_err(),
            Error::SizeMismatch { expected: 20, actual: 8 }
        ));

        let ignored = Recorder::new(StatusCode::OK, "twenty bytes of data");
        let err = get(ignored).await.unwrap_err();
        assert!(matches!(err, Error::Service { status: 200, ref code, .. } if code == "RangeIgnored"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_execute_sends_signed_host() {
        let transport = Recorder::new(StatusCode::OK, "");
        let c = client(transport.clone());
        let request = SigningRequest::new(Method::GET, "http://127.0.0.1:8080/bucket/k")
            .unwrap()
            .sign_as("https://s3.internal")
            .unwrap();
        c.execute(request, BodySource::Empty, ResponseSink::Memory)
            .await
            .unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://127.0.0.1:8080/bucket/k");
        assert_eq!(seen[0].headers["host"], "s3.internal");
    }

    #[test]
    fn test_presign_with_params() {
        let c = client(Recorder::new(StatusCode::OK, ""));
        let url = c
            .presign(
                "http://s3:9000",
                Method::GET,
                "k",
                60,
                &[("response-content-type".to_string(), "text/plain".to_string())],
            )
            .unwrap();
        assert!(url.url.starts_with("http://s3:9000/bucket/k?X-Amz-Algorithm="));
        assert!(url.url.contains("response-content-type=text%2Fplain"));
    }
}
