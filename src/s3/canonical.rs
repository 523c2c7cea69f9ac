//! Canonical request construction for Signature Version 4.
//!
//! Percent-encoding uses the RFC 3986 unreserved set (`A-Za-z0-9-_.~`) with
//! uppercase hex digits, both when canonicalizing and when building URLs, so
//! the query string the server sees is byte-identical to the signed one.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Hex lookup table for percent encoding
static HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// SHA256 of the empty payload
pub const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Payload hash sentinel for streamed or presigned requests
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Headers that are attached to a request but never signed.
const UNSIGNED_HEADERS: &[&str] = &["authorization", "user-agent"];

/// How the request body is represented in the canonical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadHash {
    Empty,
    Unsigned,
    Precomputed(String),
}

impl PayloadHash {
    /// Hash a body held in memory.
    pub fn from_bytes(payload: &[u8]) -> Self {
        if payload.is_empty() {
            PayloadHash::Empty
        } else {
            PayloadHash::Precomputed(hex::encode(Sha256::digest(payload)))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PayloadHash::Empty => EMPTY_SHA256,
            PayloadHash::Unsigned => UNSIGNED_PAYLOAD,
            PayloadHash::Precomputed(hash) => hash,
        }
    }
}

/// Percent-encode every byte outside the unreserved set.
///
/// `/` is left alone when `encode_slash` is false (paths).
pub fn uri_encode(s: &str, encode_slash: bool) -> String {
    let mut result = String::with_capacity(s.len() + 16);
    uri_encode_into(&mut result, s, encode_slash);
    result
}

/// Same as [`uri_encode`], writing into an existing buffer.
pub fn uri_encode_into(buf: &mut String, s: &str, encode_slash: bool) {
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                buf.push(byte as char);
            }
            b'/' if !encode_slash => {
                buf.push('/');
            }
            _ => {
                buf.push('%');
                buf.push(HEX_UPPER[(byte >> 4) as usize] as char);
                buf.push(HEX_UPPER[(byte & 0xf) as usize] as char);
            }
        }
    }
}

/// Percent-decode, falling back to the raw input on invalid UTF-8.
fn decode(s: &str) -> Cow<'_, str> {
    urlencoding::decode(s).unwrap_or(Cow::Borrowed(s))
}

/// Canonical form of an absolute path.
///
/// The path is decoded once and re-encoded, so an already-encoded path is
/// never double-encoded.
pub fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    let encoded = uri_encode(&decode(path), false);
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{}", encoded)
    }
}

/// Canonical query string from decoded key/value pairs.
///
/// Pairs are sorted by encoded key, then encoded value, so repeated keys are
/// ordered deterministically.
pub fn canonical_query(params: &[(String, String)]) -> String {
    if params.is_empty() {
        return String::new();
    }

    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort_unstable();

    let mut result = String::with_capacity(encoded.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
    for (i, (k, v)) in encoded.iter().enumerate() {
        if i > 0 {
            result.push('&');
        }
        result.push_str(k);
        result.push('=');
        result.push_str(v);
    }
    result
}

/// Split a raw query string into decoded pairs. Keys without `=` get an
/// empty value (`?uploads` becomes `uploads=`).
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    let query = query.strip_prefix('?').unwrap_or(query);
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.find('=') {
            Some(pos) => (
                decode(&pair[..pos]).into_owned(),
                decode(&pair[pos + 1..]).into_owned(),
            ),
            None => (decode(pair).into_owned(), String::new()),
        })
        .collect()
}

/// Canonicalize a raw (possibly partially encoded, possibly unsorted) query
/// string. Applying it twice gives the same result as applying it once.
pub fn normalize_query(query: &str) -> String {
    canonical_query(&parse_query(query))
}

/// Trim a header value and collapse inner runs of whitespace to one space.
fn normalize_header_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(word);
    }
    result
}

/// Canonical header map: lowercase names, normalized values, repeated names
/// joined with commas in the order given.
pub fn canonical_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut result: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.trim().to_ascii_lowercase();
        let value = normalize_header_value(value);
        result
            .entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    result
}

/// Whether a canonical header name takes part in the signature.
pub fn is_signed_header(name: &str) -> bool {
    !UNSIGNED_HEADERS.contains(&name)
}

/// The fixed-format request string both signer and verifier compute.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: String,
    pub uri: String,
    pub query: String,
    /// Signed headers only, keyed by lowercase name
    pub headers: BTreeMap<String, String>,
    pub signed_headers: String,
    pub payload_hash: String,
}

impl CanonicalRequest {
    /// Build from already canonical headers. Unsigned headers are dropped;
    /// `host` must be present.
    pub fn new(
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &BTreeMap<String, String>,
        payload: &PayloadHash,
    ) -> Result<Self> {
        if !headers.contains_key("host") {
            return Err(Error::Configuration(
                "host header is required for signing".to_string(),
            ));
        }

        let headers: BTreeMap<String, String> = headers
            .iter()
            .filter(|(k, _)| is_signed_header(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let signed_headers = headers.keys().map(String::as_str).collect::<Vec<_>>().join(";");

        Ok(Self {
            method: method.to_ascii_uppercase(),
            uri: canonical_uri(path),
            query: canonical_query(query),
            headers,
            signed_headers,
            payload_hash: payload.as_str().to_string(),
        })
    }

    /// Hex SHA256 of the canonical request string.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.to_string().as_bytes()))
    }
}

impl fmt::Display for CanonicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.method)?;
        writeln!(f, "{}", self.uri)?;
        writeln!(f, "{}", self.query)?;
        for (k, v) in &self.headers {
            writeln!(f, "{}:{}", k, v)?;
        }
        writeln!(f)?;
        writeln!(f, "{}", self.signed_headers)?;
        write!(f, "{}", self.payload_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("hello world", true), "hello%20world");
        assert_eq!(uri_encode("hello/world", true), "hello%2Fworld");
        assert_eq!(uri_encode("hello/world", false), "hello/world");
        assert_eq!(uri_encode("test@example.com", true), "test%40example.com");
        assert_eq!(uri_encode("a+b=c", true), "a%2Bb%3Dc");
        assert_eq!(uri_encode("caf\u{e9}", true), "caf%C3%A9");
    }

    #[test]
    fn test_canonical_uri_is_idempotent() {
        assert_eq!(canonical_uri(""), "/");
        assert_eq!(canonical_uri("/bucket/my file.txt"), "/bucket/my%20file.txt");
        assert_eq!(canonical_uri("/bucket/my%20file.txt"), "/bucket/my%20file.txt");

        let once = canonical_uri("/bucket/a b/c%2Bd");
        assert_eq!(canonical_uri(&once), once);
    }

    #[test]
    fn test_canonical_query_sorting() {
        assert_eq!(canonical_query(&[]), "");
        assert_eq!(
            canonical_query(&pairs(&[("zebra", "1"), ("alpha", "2")])),
            "alpha=2&zebra=1"
        );
        // repeated keys sort by value
        assert_eq!(
            canonical_query(&pairs(&[("k", "b"), ("k", "a"), ("j", "")])),
            "j=&k=a&k=b"
        );
    }

    #[test]
    fn test_query_round_trip() {
        let original = pairs(&[
            ("prefix", "photos/2024 summer"),
            ("delimiter", "/"),
            ("weird", "100%+done"),
            ("uploads", ""),
            ("k", "v2"),
            ("k", "v1"),
        ]);
        let mut parsed = parse_query(&canonical_query(&original));
        let mut expected = original.clone();
        parsed.sort();
        expected.sort();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_normalize_query_never_double_encodes() {
        let raw = "prefix=a%20b&list-type=2&uploads";
        let once = normalize_query(raw);
        assert_eq!(once, "list-type=2&prefix=a%20b&uploads=");
        assert_eq!(normalize_query(&once), once);
    }

    #[test]
    fn test_canonical_headers_merge() {
        let headers = canonical_headers(vec![
            ("X-Amz-Meta-Tag", "  one   two "),
            ("x-amz-meta-tag", "three"),
            ("Host", "example.com"),
        ]);
        assert_eq!(headers["x-amz-meta-tag"], "one two,three");
        assert_eq!(headers["host"], "example.com");
    }

    #[test]
    fn test_canonical_request_format() {
        let headers = canonical_headers(vec![
            ("host", "examplebucket.s3.amazonaws.com"),
            ("x-amz-date", "20130524T000000Z"),
            ("user-agent", "s3xfer"),
        ]);
        let req = CanonicalRequest::new(
            "get",
            "/test.txt",
            &[],
            &headers,
            &PayloadHash::Empty,
        )
        .unwrap();

        assert_eq!(req.signed_headers, "host;x-amz-date");
        assert_eq!(
            req.to_string(),
            format!(
                "GET\n/test.txt\n\nhost:examplebucket.s3.amazonaws.com\nx-amz-date:20130524T000000Z\n\nhost;x-amz-date\n{}",
                EMPTY_SHA256
            )
        );
    }

    #[test]
    fn test_canonical_request_requires_host() {
        let headers = canonical_headers(vec![("x-amz-date", "20130524T000000Z")]);
        let err = CanonicalRequest::new("GET", "/", &[], &headers, &PayloadHash::Empty);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_empty_sha256_constant() {
        let computed = hex::encode(Sha256::digest(b""));
        assert_eq!(EMPTY_SHA256, computed);
        assert_eq!(PayloadHash::from_bytes(b"").as_str(), EMPTY_SHA256);
    }
}
