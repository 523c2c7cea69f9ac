//! S3 types and response structures

use crate::error::{Error, Result};
use crate::s3::xml::{self, ResponseParser};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;

/// Maximum combined size of user metadata headers (`name:value` per entry).
pub const MAX_METADATA_SIZE: usize = 2048;

/// Prefix for user metadata headers
pub const METADATA_PREFIX: &str = "x-amz-meta-";

/// Object metadata from a listing entry or a HEAD response
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    pub last_modified: Option<String>,
    /// ETag without surrounding quotes
    pub etag: Option<String>,
    /// STANDARD, STANDARD_IA, GLACIER, etc.
    pub storage_class: Option<String>,
    pub content_type: Option<String>,
    /// User metadata with the `x-amz-meta-` prefix removed
    pub metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            ..Default::default()
        }
    }

    /// Build from a HEAD response's headers.
    pub fn from_headers(key: &str, headers: &hyper::HeaderMap) -> Result<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let size = header("content-length")
            .ok_or_else(|| Error::Xml("response has no Content-Length".to_string()))?
            .parse::<u64>()
            .map_err(|e| Error::Xml(format!("invalid Content-Length: {}", e)))?;

        let metadata = headers
            .iter()
            .filter_map(|(name, value)| {
                let name = name.as_str().strip_prefix(METADATA_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Ok(Self {
            key: key.to_string(),
            size,
            last_modified: header("last-modified"),
            etag: header("etag").map(|e| e.trim_matches('"').to_string()),
            storage_class: header("x-amz-storage-class"),
            content_type: header("content-type"),
            metadata,
        })
    }
}

/// Parsed `Content-Range` header: `bytes 0-9/30`, `bytes */30` or
/// `bytes 0-9/*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Inclusive first and last byte
    pub range: Option<(u64, u64)>,
    /// Full object length
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let (range, total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
        let range = match range.trim() {
            "*" => None,
            r => {
                let (first, last) = r.split_once('-')?;
                Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
            }
        };
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { range, total })
    }

    pub fn from_headers(headers: &hyper::HeaderMap) -> Option<Self> {
        headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }
}

/// Response from ListObjectsV2
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListObjectsResponse {
    pub contents: Vec<ObjectInfo>,
    /// Common prefixes (subdirectories when using delimiter)
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Continuation token for the next page
    pub next_continuation_token: Option<String>,
    pub prefix: Option<String>,
    pub key_count: Option<u32>,
}

impl ListObjectsResponse {
    const ROOT: &'static str = "ListBucketResult";

    pub fn parse(parser: &dyn ResponseParser, body: &[u8]) -> Result<Self> {
        let field = |name: &str| parser.text(body, &format!("{}/{}", Self::ROOT, name));

        let contents = parser
            .records(body, &format!("{}/Contents", Self::ROOT))?
            .into_iter()
            .map(|mut record| {
                let size = record
                    .get("Size")
                    .map(|s| s.parse::<u64>())
                    .transpose()
                    .map_err(|e| Error::Xml(format!("invalid Size: {}", e)))?
                    .unwrap_or(0);
                Ok(ObjectInfo {
                    key: record.remove("Key").unwrap_or_default(),
                    size,
                    last_modified: record.remove("LastModified"),
                    etag: record
                        .remove("ETag")
                        .map(|e| e.trim_matches('"').to_string()),
                    storage_class: record.remove("StorageClass").filter(|s| !s.is_empty()),
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            contents,
            common_prefixes: parser
                .texts(body, &format!("{}/CommonPrefixes/Prefix", Self::ROOT))?,
            is_truncated: field("IsTruncated")?.as_deref() == Some("true"),
            next_continuation_token: field("NextContinuationToken")?,
            prefix: field("Prefix")?.filter(|p| !p.is_empty()),
            key_count: field("KeyCount")?.and_then(|c| c.parse().ok()),
        })
    }
}

/// A completed part for CompleteMultipartUpload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number (1-indexed)
    pub part_number: u32,
    /// ETag returned by UploadPart, without quotes
    pub etag: String,
}

impl CompletedPart {
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into().trim_matches('"').to_string(),
        }
    }
}

/// Result of CompleteMultipartUpload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteMultipartUploadResponse {
    pub location: Option<String>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    /// ETag of the assembled object, without quotes
    pub etag: String,
}

impl CompleteMultipartUploadResponse {
    const ROOT: &'static str = "CompleteMultipartUploadResult";

    pub fn parse(parser: &dyn ResponseParser, body: &[u8]) -> Result<Self> {
        let field = |name: &str| parser.text(body, &format!("{}/{}", Self::ROOT, name));
        Ok(Self {
            location: field("Location")?,
            bucket: field("Bucket")?,
            key: field("Key")?,
            etag: field("ETag")?
                .map(|e| e.trim_matches('"').to_string())
                .unwrap_or_default(),
        })
    }
}

/// CompleteMultipartUpload request body. Parts must already be sorted.
pub fn complete_multipart_body(parts: &[CompletedPart]) -> String {
    let mut body = String::with_capacity(parts.len() * 100 + 100);
    body.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    body.push_str("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str("<Part><PartNumber>");
        let _ = write!(body, "{}", part.part_number);
        body.push_str("</PartNumber><ETag>\"");
        xml::escape_into(&mut body, part.etag.trim_matches('"'));
        body.push_str("\"</ETag></Part>");
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

/// Turn user metadata into `x-amz-meta-*` headers.
///
/// Names are lowercased and prefixed unless they already carry the prefix.
/// Fails when the combined `name:value` size exceeds [`MAX_METADATA_SIZE`].
pub fn metadata_headers(metadata: &BTreeMap<String, String>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::with_capacity(metadata.len());
    let mut size = 0usize;
    for (name, value) in metadata {
        let name = name.trim().to_ascii_lowercase();
        let name = if name.starts_with(METADATA_PREFIX) {
            name
        } else {
            format!("{}{}", METADATA_PREFIX, name)
        };
        size += name.len() + value.len() + 1;
        headers.push((name, value.clone()));
    }

    if size > MAX_METADATA_SIZE {
        return Err(Error::Configuration(format!(
            "metadata is {} bytes, limit is {} bytes",
            size, MAX_METADATA_SIZE
        )));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::xml::QuickXmlParser;

    #[test]
    fn test_complete_body_format() {
        let parts = vec![
            CompletedPart::new(1, "\"aaa\""),
            CompletedPart::new(2, "bbb"),
        ];
        assert_eq!(
            complete_multipart_body(&parts),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"aaa\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"bbb\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_metadata_headers() {
        let mut meta = BTreeMap::new();
        meta.insert("Owner".to_string(), "alice".to_string());
        meta.insert("x-amz-meta-team".to_string(), "storage".to_string());
        let headers = metadata_headers(&meta).unwrap();
        assert_eq!(
            headers,
            vec![
                ("x-amz-meta-owner".to_string(), "alice".to_string()),
                ("x-amz-meta-team".to_string(), "storage".to_string()),
            ]
        );
    }

    #[test]
    fn test_metadata_size_limit() {
        let mut meta = BTreeMap::new();
        meta.insert("blob".to_string(), "x".repeat(MAX_METADATA_SIZE));
        assert!(matches!(
            metadata_headers(&meta),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_list_response() {
        let body = br#"<ListBucketResult>
            <Prefix>logs/</Prefix><KeyCount>1</KeyCount><IsTruncated>false</IsTruncated>
            <Contents><Key>logs/a</Key><Size>10</Size><ETag>"e1"</ETag></Contents>
        </ListBucketResult>"#;
        let resp = ListObjectsResponse::parse(&QuickXmlParser::new(), body).unwrap();
        assert_eq!(resp.contents.len(), 1);
        assert_eq!(resp.contents[0].key, "logs/a");
        assert_eq!(resp.contents[0].size, 10);
        assert_eq!(resp.contents[0].etag.as_deref(), Some("e1"));
        assert_eq!(resp.prefix.as_deref(), Some("logs/"));
        assert_eq!(resp.key_count, Some(1));
        assert!(!resp.is_truncated);
    }

    #[test]
    fn test_object_info_from_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("content-length", "1234".parse().unwrap());
        headers.insert("etag", "\"abc\"".parse().unwrap());
        headers.insert("x-amz-meta-owner", "alice".parse().unwrap());
        let info = ObjectInfo::from_headers("k", &headers).unwrap();
        assert_eq!(info.size, 1234);
        assert_eq!(info.etag.as_deref(), Some("abc"));
        assert_eq!(info.metadata["owner"], "alice");
    }

    #[test]
    fn test_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 0-9/30"),
            Some(ContentRange {
                range: Some((0, 9)),
                total: Some(30)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes */30"),
            Some(ContentRange {
                range: None,
                total: Some(30)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes 5-5/*").unwrap().total,
            None
        );
        assert!(ContentRange::parse("items 0-9/30").is_none());
        assert!(ContentRange::parse("bytes 0-x/30").is_none());
    }
}
