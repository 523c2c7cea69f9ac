//! In-memory S3 double for scheduler and multipart tests.
//!
//! Understands initiate, upload part, complete, abort, PUT, HEAD, ranged GET
//! and DELETE for a single bucket. Faults are injected per request through a
//! closure that sees the parsed request and its attempt number.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};
use s3xfer::s3::canonical::parse_query;
use s3xfer::transport::{HttpRequest, HttpResponse, Transport};
use s3xfer::{Credentials, Error, Result, S3Client, Signer, TransferConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const UPLOAD_ID: &str = "upload-1";

/// What a request looked like once parsed
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub host: String,
    pub key: String,
    pub query: BTreeMap<String, String>,
    pub part_number: Option<u32>,
    pub range: Option<(u64, u64)>,
    pub body_len: usize,
    pub attempt: u32,
}

impl Seen {
    pub fn is_initiate(&self) -> bool {
        self.method == Method::POST && self.query.contains_key("uploads")
    }

    pub fn is_complete(&self) -> bool {
        self.method == Method::POST && self.query.contains_key("uploadId")
    }

    pub fn is_abort(&self) -> bool {
        self.method == Method::DELETE && self.query.contains_key("uploadId")
    }

    pub fn is_part(&self) -> bool {
        self.part_number.is_some()
    }
}

pub enum Fault {
    Status(u16, &'static str),
    Transport,
    /// Serve the normal reply cut to this many body bytes
    Truncate(usize),
}

type FaultFn = Box<dyn Fn(&Seen) -> Option<Fault> + Send + Sync>;
type DelayFn = Box<dyn Fn(&Seen) -> Duration + Send + Sync>;

#[derive(Default)]
struct Store {
    objects: HashMap<String, Bytes>,
    parts: BTreeMap<u32, Bytes>,
    attempts: HashMap<String, u32>,
    completions: Vec<Vec<(u32, String)>>,
    aborts: usize,
    log: Vec<Seen>,
}

pub struct MockS3 {
    store: Mutex<Store>,
    fault: FaultFn,
    delay: Option<DelayFn>,
    ignore_ranges: bool,
}

impl MockS3 {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            fault: Box::new(|_| None),
            delay: None,
            ignore_ranges: false,
        }
    }

    /// Answer ranged GETs with the whole object and a 200
    pub fn with_ignored_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn with_fault<F>(mut self, f: F) -> Self
    where
        F: Fn(&Seen) -> Option<Fault> + Send + Sync + 'static,
    {
        self.fault = Box::new(f);
        self
    }

    pub fn with_delay<F>(mut self, f: F) -> Self
    where
        F: Fn(&Seen) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(f));
        self
    }

    pub fn put(&self, key: &str, data: impl Into<Bytes>) {
        self.store.lock().unwrap().objects.insert(key.to_string(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.store.lock().unwrap().objects.get(key).cloned()
    }

    pub fn log(&self) -> Vec<Seen> {
        self.store.lock().unwrap().log.clone()
    }

    pub fn completions(&self) -> Vec<Vec<(u32, String)>> {
        self.store.lock().unwrap().completions.clone()
    }

    pub fn aborts(&self) -> usize {
        self.store.lock().unwrap().aborts
    }

    pub fn count(&self, pred: impl Fn(&Seen) -> bool) -> usize {
        self.log().iter().filter(|s| pred(s)).count()
    }

    fn parse(&self, request: &HttpRequest) -> Seen {
        let rest = request
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&request.url);
        let (host, path_and_query) = rest.split_once('/').unwrap_or((rest, ""));
        let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
        // path is "bucket/key"
        let key = path.split_once('/').map(|(_, k)| k).unwrap_or("");
        let key = urlencoding::decode(key).unwrap().into_owned();
        let query: BTreeMap<String, String> = parse_query(query).into_iter().collect();

        let part_number = query.get("partNumber").and_then(|n| n.parse().ok());
        let range = request.headers.get("range").and_then(|r| {
            let (start, end) = r.strip_prefix("bytes=")?.split_once('-')?;
            Some((start.parse().ok()?, end.parse().ok()?))
        });

        let attempt_key = format!(
            "{} {} {:?} {:?} {}",
            request.method,
            key,
            part_number,
            range,
            query.contains_key("uploads")
        );
        let mut store = self.store.lock().unwrap();
        let attempt = store.attempts.entry(attempt_key).or_insert(0);
        *attempt += 1;

        Seen {
            method: request.method.clone(),
            host: host.to_string(),
            key,
            query,
            part_number,
            range,
            body_len: request.body.len(),
            attempt: *attempt,
        }
    }

    fn respond(&self, seen: &Seen, body: &Bytes) -> (StatusCode, HeaderMap, Bytes) {
        let mut headers = HeaderMap::new();
        let mut store = self.store.lock().unwrap();

        if seen.is_initiate() {
            store.parts.clear();
            let xml = format!(
                "<InitiateMultipartUploadResult><Bucket>bucket</Bucket><Key>{}</Key>\
                 <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                seen.key, UPLOAD_ID
            );
            return (StatusCode::OK, headers, Bytes::from(xml));
        }

        if let Some(n) = seen.part_number {
            store.parts.insert(n, body.clone());
            let etag = format!("\"etag-{}-a{}\"", n, seen.attempt);
            headers.insert("etag", etag.parse().unwrap());
            return (StatusCode::OK, headers, Bytes::new());
        }

        if seen.is_complete() {
            let xml = String::from_utf8_lossy(body);
            let listed: Vec<(u32, String)> = xml
                .split("<Part>")
                .skip(1)
                .map(|part| {
                    let n = between(part, "<PartNumber>", "</PartNumber>").parse().unwrap();
                    let etag = between(part, "<ETag>", "</ETag>").trim_matches('"').to_string();
                    (n, etag)
                })
                .collect();
            let mut object = Vec::new();
            for (n, _) in &listed {
                object.extend_from_slice(&store.parts[n]);
            }
            store.objects.insert(seen.key.clone(), Bytes::from(object));
            store.completions.push(listed);
            let xml = format!(
                "<CompleteMultipartUploadResult><Bucket>bucket</Bucket><Key>{}</Key>\
                 <ETag>\"final-etag\"</ETag></CompleteMultipartUploadResult>",
                seen.key
            );
            return (StatusCode::OK, headers, Bytes::from(xml));
        }

        if seen.is_abort() {
            store.aborts += 1;
            store.parts.clear();
            return (StatusCode::NO_CONTENT, headers, Bytes::new());
        }

        match seen.method {
            Method::PUT => {
                store.objects.insert(seen.key.clone(), body.clone());
                headers.insert("etag", "\"single-etag\"".parse().unwrap());
                (StatusCode::OK, headers, Bytes::new())
            }
            Method::HEAD => match store.objects.get(&seen.key) {
                Some(object) => {
                    headers.insert("content-length", object.len().into());
                    headers.insert("etag", "\"object-etag\"".parse().unwrap());
                    (StatusCode::OK, headers, Bytes::new())
                }
                None => (StatusCode::NOT_FOUND, headers, Bytes::new()),
            },
            Method::GET => match store.objects.get(&seen.key) {
                Some(object) => match seen.range {
                    Some((start, end)) if !self.ignore_ranges => {
                        let len = object.len() as u64;
                        if start >= len {
                            let unsatisfied = format!("bytes */{}", len);
                            headers.insert("content-range", unsatisfied.parse().unwrap());
                            return (
                                StatusCode::RANGE_NOT_SATISFIABLE,
                                headers,
                                error_xml("InvalidRange"),
                            );
                        }
                        let end = (end + 1).min(len);
                        let content_range = format!("bytes {}-{}/{}", start, end - 1, len);
                        headers.insert("content-range", content_range.parse().unwrap());
                        let body = object.slice(start as usize..end as usize);
                        (StatusCode::PARTIAL_CONTENT, headers, body)
                    }
                    _ => (StatusCode::OK, headers, object.clone()),
                },
                None => (StatusCode::NOT_FOUND, headers, error_xml("NoSuchKey")),
            },
            Method::DELETE => {
                store.objects.remove(&seen.key);
                (StatusCode::NO_CONTENT, headers, Bytes::new())
            }
            _ => (StatusCode::METHOD_NOT_ALLOWED, headers, Bytes::new()),
        }
    }
}

fn between<'a>(s: &'a str, open: &str, close: &str) -> &'a str {
    let start = s.find(open).map(|i| i + open.len()).unwrap_or(0);
    let end = s[start..].find(close).map(|i| start + i).unwrap_or(s.len());
    &s[start..end]
}

fn error_xml(code: &str) -> Bytes {
    Bytes::from(format!(
        "<Error><Code>{}</Code><Message>injected</Message></Error>",
        code
    ))
}

#[async_trait]
impl Transport for MockS3 {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        assert!(
            request.headers.contains_key("authorization"),
            "unsigned request to {}",
            request.url
        );

        let seen = self.parse(&request);
        self.store.lock().unwrap().log.push(seen.clone());

        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(&seen)).await;
        }

        let mut truncate = None;
        match (self.fault)(&seen) {
            Some(Fault::Transport) => {
                return Err(Error::Transport("injected connection reset".to_string()))
            }
            Some(Fault::Status(status, code)) => {
                return Ok(HttpResponse::from_bytes(
                    StatusCode::from_u16(status).unwrap(),
                    HeaderMap::new(),
                    error_xml(code),
                ))
            }
            Some(Fault::Truncate(n)) => truncate = Some(n),
            None => {}
        }

        let (status, headers, mut body) = self.respond(&seen, &request.body);
        if let Some(n) = truncate {
            body.truncate(n);
        }
        Ok(HttpResponse::from_bytes(status, headers, body))
    }
}

pub fn client(mock: Arc<MockS3>) -> S3Client {
    let credentials = Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY").unwrap();
    let signer = Arc::new(Signer::new(credentials, "us-east-1").unwrap());
    S3Client::new(mock, signer, "bucket")
}

/// Fast-retry config against the given endpoints
pub fn config(endpoints: &[&str], part_size: u64, jobs: usize) -> s3xfer::transfer::TransferConfigBuilder {
    TransferConfig::builder()
        .endpoints(endpoints.iter().copied())
        .part_size(part_size)
        .jobs(jobs)
        .max_retries(3)
        .backoff(Duration::from_millis(1), Duration::from_millis(5))
}

/// Deterministic non-repeating-ish test payload
pub fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_right(13) as u8)
        .collect::<Vec<u8>>()
        .into()
}
