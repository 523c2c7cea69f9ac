//! Request dispatch over a pluggable HTTP transport.
//!
//! The [`Dispatcher`] performs exactly one network exchange per call and never
//! retries. Non-2xx responses are returned, not raised; callers interpret the
//! status.

pub mod http;

pub use self::http::HyperTransport;

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::{HeaderMap, Method, StatusCode};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Request handed to the transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

/// Response from the transport. The body is a stream of chunks.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl HttpResponse {
    /// Response with a body already in memory.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let stream: BoxStream<'static, Result<Bytes>> = if body.is_empty() {
            futures::stream::empty().boxed()
        } else {
            futures::stream::once(async move { Ok(body) }).boxed()
        };
        Self {
            status,
            headers,
            body: stream,
        }
    }

    /// Read the whole body into memory.
    pub async fn collect(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Network capability consumed by the dispatcher.
///
/// Implementations report connect failures, timeouts and broken body streams
/// as [`Error::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Where the request body comes from.
#[derive(Debug, Clone)]
pub enum BodySource {
    Empty,
    Bytes(Bytes),
    /// `len` bytes of `path` starting at `offset`
    File { path: PathBuf, offset: u64, len: u64 },
}

impl BodySource {
    pub fn len(&self) -> u64 {
        match self {
            BodySource::Empty => 0,
            BodySource::Bytes(b) => b.len() as u64,
            BodySource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn load(self) -> Result<Bytes> {
        match self {
            BodySource::Empty => Ok(Bytes::new()),
            BodySource::Bytes(b) => Ok(b),
            BodySource::File { path, offset, len } => {
                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Where a successful response body goes.
#[derive(Debug, Clone)]
pub enum ResponseSink {
    Discard,
    /// Collected into [`ResponseMeta::body`]
    Memory,
    /// Written into a file starting at `offset`. With a `len`, bytes past
    /// `offset + len` are counted in [`ResponseMeta::bytes_received`] but
    /// never written.
    File {
        path: PathBuf,
        offset: u64,
        len: Option<u64>,
    },
}

/// Status, headers and (for memory sinks and non-2xx responses) the body.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Body bytes received, including any a bounded sink dropped
    pub bytes_received: u64,
}

impl ResponseMeta {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Signed request ready to send.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Single-exchange sender on top of a [`Transport`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send one request, streaming the response into `sink`.
    pub async fn send(
        &self,
        request: PreparedRequest,
        body: BodySource,
        sink: ResponseSink,
    ) -> Result<ResponseMeta> {
        let body = body.load().await?;
        let method = request.method.clone();
        let url = request.url.clone();

        tracing::debug!(%method, %url, body_len = body.len(), "dispatch");

        let response = self
            .transport
            .execute(HttpRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body,
            })
            .await?;

        let status = response.status;
        let headers = response.headers;
        let mut stream = response.body;

        // Error bodies are always kept so the caller can parse them.
        let sink = if status.is_success() {
            sink
        } else {
            ResponseSink::Memory
        };

        let (body, bytes_received) = match sink {
            ResponseSink::Discard => {
                let mut n = 0u64;
                while let Some(chunk) = stream.next().await {
                    n += chunk?.len() as u64;
                }
                (Bytes::new(), n)
            }
            ResponseSink::Memory => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                let n = buf.len() as u64;
                (buf.freeze(), n)
            }
            ResponseSink::File { path, offset, len } => {
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let limit = len.unwrap_or(u64::MAX);
                let mut n = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    let room = limit.saturating_sub(n).min(chunk.len() as u64) as usize;
                    if room > 0 {
                        file.write_all(&chunk[..room]).await?;
                    }
                    n += chunk.len() as u64;
                }
                file.flush().await?;
                if n > limit {
                    tracing::warn!(%url, limit, bytes_received = n, "response overran file range, excess dropped");
                }
                (Bytes::new(), n)
            }
        };

        tracing::debug!(%method, %url, status = status.as_u16(), bytes_received, "response");

        Ok(ResponseMeta {
            status,
            headers,
            body,
            bytes_received,
        })
    }
}

/// Transport-level failure helper.
pub(crate) fn transport_error(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Transport(format!("{}: {}", context, err))
}
