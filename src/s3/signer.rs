//! AWS Signature Version 4 signer
//!
//! - Pre-computed `AWS4` + secret key bytes
//! - Daily signing key cache (the derived key only changes with the date stamp)
//! - Header mode returns the headers to attach; presign mode returns an
//!   expiring URL with the signature in the query string

use crate::error::{Error, Result};
use crate::s3::canonical::{self, CanonicalRequest, PayloadHash};
use crate::s3::clock::{Clock, SystemClock};
use crate::s3::credentials::Credentials;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use hyper::Method;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SCOPE_TERMINATOR: &str = "aws4_request";

/// Longest presigned URL lifetime the service accepts (7 days).
pub const MAX_PRESIGN_EXPIRATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Date, region and service binding a derived signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningScope {
    /// UTC date stamp, `YYYYMMDD`
    pub date: String,
    pub region: String,
    pub service: String,
}

impl SigningScope {
    pub fn new(at: DateTime<Utc>, region: &str, service: &str) -> Self {
        Self {
            date: at.format("%Y%m%d").to_string(),
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    /// `date/region/service/aws4_request`
    pub fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.date, self.region, self.service, SCOPE_TERMINATOR
        )
    }
}

/// Header-based or query-based signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningMode {
    Headers,
    Presigned { expires_in_secs: u64 },
}

/// Logical request to sign.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub method: Method,
    scheme: String,
    authority: String,
    host: String,
    host_override: bool,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    payload: PayloadHash,
}

impl SigningRequest {
    /// Start from an absolute URL. Query parameters in the URL are decoded and
    /// kept; default ports are dropped from the signed host.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let (scheme, authority, path, query) = split_url(url)?;

        Ok(Self {
            method,
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            host: signed_host(scheme, authority).to_string(),
            host_override: false,
            path: canonical::canonical_uri(path),
            query: canonical::parse_query(query),
            headers: Vec::new(),
            payload: PayloadHash::Empty,
        })
    }

    /// Add a decoded query parameter.
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn payload(mut self, payload: PayloadHash) -> Self {
        self.payload = payload;
        self
    }

    /// Sign for the host of `url` while still sending to the original one.
    /// Used through tunnels where the server sees a different host than
    /// the client dials.
    pub fn sign_as(mut self, url: &str) -> Result<Self> {
        let (scheme, authority, _, _) = split_url(url)?;
        let host = signed_host(scheme, authority);
        if host != self.host {
            self.host = host.to_string();
            self.host_override = true;
        }
        Ok(self)
    }

    /// True when the signed host differs from the one dialed
    pub fn host_overridden(&self) -> bool {
        self.host_override
    }

    /// Canonical (encoded) path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Caller-supplied headers, as added
    pub fn header_list(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Request URL carrying the canonical query string.
    pub fn url(&self) -> String {
        let query = canonical::canonical_query(&self.query);
        self.url_with_query(&query)
    }

    fn url_with_query(&self, query: &str) -> String {
        let mut url = String::with_capacity(
            self.scheme.len() + 3 + self.authority.len() + self.path.len() + query.len() + 1,
        );
        url.push_str(&self.scheme);
        url.push_str("://");
        url.push_str(&self.authority);
        url.push_str(&self.path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Host as signed: default ports are dropped
fn signed_host<'a>(scheme: &str, authority: &'a str) -> &'a str {
    match scheme {
        "https" => authority.strip_suffix(":443").unwrap_or(authority),
        _ => authority.strip_suffix(":80").unwrap_or(authority),
    }
}

/// Split `scheme://authority/path?query` without allocating.
fn split_url(url: &str) -> Result<(&str, &str, &str, &str)> {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        ("http", rest)
    } else {
        return Err(Error::Configuration(format!(
            "URL must start with http:// or https://: {}",
            url
        )));
    };

    let (authority, path_and_query) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => match rest.find('?') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        },
    };

    if authority.is_empty() {
        return Err(Error::Configuration(format!("URL has no host: {}", url)));
    }

    let (path, query) = match path_and_query.find('?') {
        Some(pos) => (&path_and_query[..pos], &path_and_query[pos + 1..]),
        None => (path_and_query, ""),
    };

    Ok((scheme, authority, if path.is_empty() { "/" } else { path }, query))
}

/// Result of header-mode signing.
#[derive(Debug, Clone)]
pub struct Signature {
    /// Hex HMAC of the string-to-sign
    pub signature: String,
    pub credential_scope: String,
    /// Semicolon-joined signed header names
    pub signed_headers: String,
    /// Headers to attach to the outgoing request, including `authorization`
    pub headers: BTreeMap<String, String>,
    /// URL to send the request to (canonical query string)
    pub url: String,
}

/// Presigned URL. Bound to one method and path; valid until `expires_at`.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub method: Method,
    pub path: String,
    pub expires_at: DateTime<Utc>,
}

impl SignedUrl {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at < self.expires_at
    }

    /// Whether this URL authorizes the given method on the given path.
    pub fn permits(&self, method: &Method, path: &str) -> bool {
        self.method == *method && self.path == canonical::canonical_uri(path)
    }
}

/// Output of [`Signer::sign`].
#[derive(Debug, Clone)]
pub enum Signed {
    Headers(Signature),
    Url(SignedUrl),
}

/// AWS Signature Version 4 signer
pub struct Signer {
    credentials: Credentials,
    region: String,
    service: String,
    clock: Arc<dyn Clock>,
    /// "AWS4" + secret key
    aws4_key: Vec<u8>,
    /// Derived key for the last date stamp seen
    cached_signing_key: Mutex<Option<(String, [u8; 32])>>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("credentials", &self.credentials)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

impl Signer {
    /// Signer for the `s3` service using the system clock.
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Result<Self> {
        let region = region.into();
        if region.trim().is_empty() {
            return Err(Error::Configuration("region must not be empty".to_string()));
        }
        let aws4_key = format!("AWS4{}", credentials.secret_key()).into_bytes();
        Ok(Self {
            credentials,
            region,
            service: "s3".to_string(),
            clock: Arc::new(SystemClock),
            aws4_key,
            cached_signing_key: Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self.cached_signing_key = Mutex::new(None);
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Scope for the given instant.
    pub fn scope_at(&self, at: DateTime<Utc>) -> SigningScope {
        SigningScope::new(at, &self.region, &self.service)
    }

    /// Sign at the clock's current instant.
    pub fn sign(&self, request: &SigningRequest, mode: SigningMode) -> Result<Signed> {
        self.sign_at(request, mode, self.clock.now())
    }

    pub fn sign_at(
        &self,
        request: &SigningRequest,
        mode: SigningMode,
        at: DateTime<Utc>,
    ) -> Result<Signed> {
        match mode {
            SigningMode::Headers => self.sign_headers_at(request, at).map(Signed::Headers),
            SigningMode::Presigned { expires_in_secs } => self
                .presign_at(request, expires_in_secs, at)
                .map(Signed::Url),
        }
    }

    /// Header-mode signing at the clock's current instant.
    pub fn sign_headers(&self, request: &SigningRequest) -> Result<Signature> {
        self.sign_headers_at(request, self.clock.now())
    }

    pub fn sign_headers_at(
        &self,
        request: &SigningRequest,
        at: DateTime<Utc>,
    ) -> Result<Signature> {
        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = self.scope_at(at);
        let payload_hash = request.payload.as_str().to_string();

        let mut attach = BTreeMap::new();
        attach.insert("x-amz-date".to_string(), amz_date.clone());
        attach.insert("x-amz-content-sha256".to_string(), payload_hash);
        if let Some(token) = self.credentials.session_token() {
            attach.insert("x-amz-security-token".to_string(), token.to_string());
        }

        let headers = canonical::canonical_headers(
            request
                .headers
                .iter()
                .filter(|(k, _)| {
                    let k = k.to_ascii_lowercase();
                    k != "host" && !attach.contains_key(&k)
                })
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .chain(std::iter::once(("host", request.host.as_str())))
                .chain(attach.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        );

        let canonical = CanonicalRequest::new(
            request.method.as_str(),
            &request.path,
            &request.query,
            &headers,
            &request.payload,
        )?;
        let signature = self.signature_for(&canonical, &amz_date, &scope);
        let credential_scope = scope.credential_scope();

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.credentials.access_key(),
            credential_scope,
            canonical.signed_headers,
            signature
        );
        attach.insert("authorization".to_string(), authorization);

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            signed_headers = %canonical.signed_headers,
            "signed request"
        );

        Ok(Signature {
            signature,
            credential_scope,
            signed_headers: canonical.signed_headers,
            headers: attach,
            url: request.url_with_query(&canonical.query),
        })
    }

    /// Presign at the clock's current instant.
    pub fn presign(&self, request: &SigningRequest, expires_in_secs: u64) -> Result<SignedUrl> {
        self.presign_at(request, expires_in_secs, self.clock.now())
    }

    pub fn presign_at(
        &self,
        request: &SigningRequest,
        expires_in_secs: u64,
        at: DateTime<Utc>,
    ) -> Result<SignedUrl> {
        if expires_in_secs == 0 || expires_in_secs > MAX_PRESIGN_EXPIRATION_SECS {
            return Err(Error::Configuration(format!(
                "presign expiration must be between 1 and {} seconds, got {}",
                MAX_PRESIGN_EXPIRATION_SECS, expires_in_secs
            )));
        }

        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = self.scope_at(at);
        let credential_scope = scope.credential_scope();

        let headers = canonical::canonical_headers(
            request
                .headers
                .iter()
                .filter(|(k, _)| !k.eq_ignore_ascii_case("host"))
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .chain(std::iter::once(("host", request.host.as_str()))),
        );
        let signed_headers = headers
            .keys()
            .filter(|k| canonical::is_signed_header(k))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");

        let mut query = request.query.clone();
        query.push(("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()));
        query.push((
            "X-Amz-Credential".to_string(),
            format!("{}/{}", self.credentials.access_key(), credential_scope),
        ));
        query.push(("X-Amz-Date".to_string(), amz_date.clone()));
        query.push(("X-Amz-Expires".to_string(), expires_in_secs.to_string()));
        if let Some(token) = self.credentials.session_token() {
            query.push(("X-Amz-Security-Token".to_string(), token.to_string()));
        }
        query.push(("X-Amz-SignedHeaders".to_string(), signed_headers));

        let canonical = CanonicalRequest::new(
            request.method.as_str(),
            &request.path,
            &query,
            &headers,
            &PayloadHash::Unsigned,
        )?;
        let signature = self.signature_for(&canonical, &amz_date, &scope);

        let mut full_query = canonical.query.clone();
        full_query.push_str("&X-Amz-Signature=");
        full_query.push_str(&signature);

        tracing::debug!(
            method = %request.method,
            path = %request.path,
            expires_in_secs,
            "presigned request"
        );

        Ok(SignedUrl {
            url: request.url_with_query(&full_query),
            method: request.method.clone(),
            path: request.path.clone(),
            expires_at: at + Duration::seconds(expires_in_secs as i64),
        })
    }

    /// String-to-sign for a canonical request.
    pub fn string_to_sign(
        canonical: &CanonicalRequest,
        amz_date: &str,
        scope: &SigningScope,
    ) -> String {
        format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope.credential_scope(),
            canonical.hash()
        )
    }

    fn signature_for(
        &self,
        canonical: &CanonicalRequest,
        amz_date: &str,
        scope: &SigningScope,
    ) -> String {
        let string_to_sign = Self::string_to_sign(canonical, amz_date, scope);
        tracing::trace!(canonical_request = %canonical, string_to_sign = %string_to_sign, "sigv4");
        self.calculate_signature(&scope.date, &string_to_sign)
    }

    /// HMAC of the string-to-sign with the (cached) daily key
    fn calculate_signature(&self, date_stamp: &str, string_to_sign: &str) -> String {
        let signing_key = {
            let mut cache = self
                .cached_signing_key
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match *cache {
                Some((ref cached_date, cached_key)) if cached_date == date_stamp => cached_key,
                _ => {
                    let key = self.derive_signing_key(date_stamp);
                    *cache = Some((date_stamp.to_string(), key));
                    key
                }
            }
        };

        hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()))
    }

    /// Four chained HMACs: date, region, service, terminator
    fn derive_signing_key(&self, date_stamp: &str) -> [u8; 32] {
        let k_date = hmac_sha256(&self.aws4_key, date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, SCOPE_TERMINATOR.as_bytes())
    }
}

/// HMAC-SHA256 into a fixed-size array
fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(msg);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}
