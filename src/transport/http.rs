//! hyper-based [`Transport`]
//!
//! - HTTP/1.1 only
//! - Tuned connection pool (1024 idle per host, 90s idle timeout)
//! - TCP_NODELAY, 90s keepalive, 10s connect timeout
//! - native-tls for TLS
//! - Optional HTTP CONNECT proxy

use super::{transport_error, HttpRequest, HttpResponse, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyStream, Full};
use hyper::{Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::time::Duration;

type DirectClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;
type ProxiedClient = HyperClient<HttpsConnector<Tunnel<HttpConnector>>, Full<Bytes>>;

#[derive(Clone)]
enum ClientKind {
    Direct(DirectClient),
    Proxied(ProxiedClient),
}

/// Production transport. Clone is cheap; the pool is shared.
#[derive(Clone)]
pub struct HyperTransport {
    client: ClientKind,
    timeout: Duration,
}

/// Builder for [`HyperTransport`].
#[derive(Debug, Clone)]
pub struct HyperTransportBuilder {
    timeout: Duration,
    proxy: Option<String>,
    insecure_tls: bool,
    pool_max_idle_per_host: usize,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            proxy: None,
            insecure_tls: false,
            pool_max_idle_per_host: 1024,
        }
    }
}

impl HyperTransportBuilder {
    /// Per-request timeout, covering connect and response headers
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tunnel every connection through this HTTP proxy
    pub fn proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.trim().is_empty());
        self
    }

    /// Disable certificate and hostname verification
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    pub fn pool_max_idle_per_host(mut self, n: usize) -> Self {
        self.pool_max_idle_per_host = n;
        self
    }

    pub fn build(self) -> Result<HyperTransport> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if self.insecure_tls {
            tracing::warn!("insecure TLS mode: certificate verification is disabled");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
        } else {
            TlsConnector::new()
        }
        .map_err(|e| Error::Configuration(format!("failed to build TLS connector: {}", e)))?;

        let mut builder = HyperClient::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .retry_canceled_requests(false)
            .set_host(true);

        let client = match self.proxy {
            Some(proxy) => {
                let proxy_uri: Uri = proxy
                    .parse()
                    .map_err(|e| Error::Configuration(format!("invalid proxy URL {}: {}", proxy, e)))?;
                tracing::info!(proxy = %proxy_uri, "using HTTP proxy");
                let tunnel = Tunnel::new(proxy_uri, http);
                ClientKind::Proxied(builder.build(HttpsConnector::from((tunnel, tls.into()))))
            }
            None => ClientKind::Direct(builder.build(HttpsConnector::from((http, tls.into())))),
        };

        Ok(HyperTransport {
            client,
            timeout: self.timeout,
        })
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    /// Direct transport with default settings
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<hyper::Response<hyper::body::Incoming>> {
        let fut = async {
            match &self.client {
                ClientKind::Direct(client) => client.request(request).await,
                ClientKind::Proxied(client) => client.request(request).await,
            }
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Transport(format!(
                "request timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut req = Request::builder()
            .method(request.method)
            .uri(&request.url);
        for (key, value) in request.headers.iter() {
            req = req.header(key, value);
        }
        let req = req
            .body(Full::new(request.body))
            .map_err(|e| Error::Configuration(format!("request build error: {}", e)))?;

        let response = self.send(req).await?;
        let (parts, body) = response.into_parts();

        let body = BodyStream::new(body)
            .filter_map(|frame| async move {
                match frame {
                    Ok(frame) => frame.into_data().ok().map(Ok),
                    Err(e) => Some(Err(transport_error("body error", e))),
                }
            })
            .boxed();

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let transport = HyperTransport::new().unwrap();
        assert_eq!(transport.timeout, Duration::from_secs(300));
        assert!(matches!(transport.client, ClientKind::Direct(_)));
    }

    #[tokio::test]
    async fn test_proxy_builder() {
        let transport = HyperTransport::builder()
            .proxy(Some("http://proxy.local:3128".to_string()))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert!(matches!(transport.client, ClientKind::Proxied(_)));

        let blank = HyperTransport::builder()
            .proxy(Some("  ".to_string()))
            .build()
            .unwrap();
        assert!(matches!(blank.client, ClientKind::Direct(_)));
    }

    /// Reads one request head from `socket`
    async fn read_head(socket: &mut tokio::net::TcpStream) -> bool {
        use tokio::io::AsyncReadExt;
        let mut head: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        true
    }

    #[tokio::test]
    async fn test_dropped_request_is_not_resent() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    // answer the first request, hang up on any later one
                    while read_head(&mut socket).await {
                        if seen.fetch_add(1, Ordering::SeqCst) > 0 {
                            return;
                        }
                        let _ = socket
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                            .await;
                    }
                });
            }
        });

        let transport = HyperTransport::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let request = || HttpRequest {
            method: hyper::Method::GET,
            url: format!("http://{}/bucket/key", addr),
            headers: Default::default(),
            body: Bytes::new(),
        };

        let first = transport.execute(request()).await.unwrap();
        assert_eq!(first.status, hyper::StatusCode::OK);
        drop(first);

        let err = transport.execute(request()).await.err().unwrap();
        assert!(matches!(err, Error::Transport(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_is_clone() {
        let transport = HyperTransport::new().unwrap();
        let _clone = transport.clone();
    }
}
