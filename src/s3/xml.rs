//! Structured response parsing.
//!
//! Paths are slash-separated element local names from the document root,
//! e.g. `ListBucketResult/Contents/Key`. Namespaces are ignored.

use crate::error::Result;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Pure extraction of values from a service response body.
pub trait ResponseParser: Send + Sync {
    /// Text of the first element at `path`.
    fn text(&self, xml: &[u8], path: &str) -> Result<Option<String>>;

    /// Text of every element at `path`, in document order.
    fn texts(&self, xml: &[u8], path: &str) -> Result<Vec<String>>;

    /// For every element at `path`, its direct children as name -> text.
    fn records(&self, xml: &[u8], path: &str) -> Result<Vec<BTreeMap<String, String>>>;
}

/// [`ResponseParser`] backed by quick-xml's pull reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickXmlParser;

#[derive(Debug, Default)]
struct Node {
    text: String,
    children: BTreeMap<String, String>,
}

impl QuickXmlParser {
    pub fn new() -> Self {
        Self
    }

    fn scan(&self, xml: &[u8], path: &str) -> Result<Vec<Node>> {
        let target: Vec<&[u8]> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
            .collect();

        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text_start = true;
        reader.config_mut().trim_text_end = true;

        let mut stack: Vec<Vec<u8>> = Vec::with_capacity(8);
        let mut current: Option<Node> = None;
        let mut found = Vec::new();

        let at_target = |stack: &[Vec<u8>]| {
            stack.len() == target.len()
                && stack
                    .iter()
                    .map(Vec::as_slice)
                    .eq(target.iter().copied())
        };

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    stack.push(e.local_name().as_ref().to_vec());
                    if at_target(&stack) {
                        current = Some(Node::default());
                    }
                }
                Event::Empty(e) => {
                    stack.push(e.local_name().as_ref().to_vec());
                    if at_target(&stack) {
                        found.push(Node::default());
                    } else {
                        Self::touch_child(&mut current, &stack, target.len());
                    }
                    stack.pop();
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    Self::append(&mut current, &stack, target.len(), &text);
                }
                Event::CData(e) => {
                    let raw = e.into_inner();
                    let text = String::from_utf8_lossy(&raw);
                    Self::append(&mut current, &stack, target.len(), &text);
                }
                Event::End(_) => {
                    if at_target(&stack) {
                        if let Some(node) = current.take() {
                            found.push(node);
                        }
                    } else {
                        Self::touch_child(&mut current, &stack, target.len());
                    }
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(found)
    }

    fn append(current: &mut Option<Node>, stack: &[Vec<u8>], depth: usize, text: &str) {
        let Some(node) = current.as_mut() else {
            return;
        };
        if stack.len() == depth {
            node.text.push_str(text);
        } else if stack.len() == depth + 1 {
            if let Some(name) = stack.last() {
                node.children
                    .entry(String::from_utf8_lossy(name).into_owned())
                    .or_default()
                    .push_str(text);
            }
        }
    }

    /// Record a direct child even when it has no text.
    fn touch_child(current: &mut Option<Node>, stack: &[Vec<u8>], depth: usize) {
        if let (Some(node), Some(name)) = (current.as_mut(), stack.last()) {
            if stack.len() == depth + 1 {
                node.children
                    .entry(String::from_utf8_lossy(name).into_owned())
                    .or_default();
            }
        }
    }
}

impl ResponseParser for QuickXmlParser {
    fn text(&self, xml: &[u8], path: &str) -> Result<Option<String>> {
        Ok(self.scan(xml, path)?.into_iter().next().map(|n| n.text))
    }

    fn texts(&self, xml: &[u8], path: &str) -> Result<Vec<String>> {
        Ok(self.scan(xml, path)?.into_iter().map(|n| n.text).collect())
    }

    fn records(&self, xml: &[u8], path: &str) -> Result<Vec<BTreeMap<String, String>>> {
        Ok(self
            .scan(xml, path)?
            .into_iter()
            .map(|n| n.children)
            .collect())
    }
}

/// Escape XML special characters into an existing buffer
pub fn escape_into(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            '\'' => buf.push_str("&apos;"),
            _ => buf.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &[u8] = br#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>abc==</NextContinuationToken>
  <Contents>
    <Key>a &amp; b.txt</Key>
    <Size>42</Size>
    <ETag>&quot;etag-1&quot;</ETag>
  </Contents>
  <Contents>
    <Key>c.txt</Key>
    <Size>7</Size>
    <StorageClass/>
  </Contents>
  <CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn test_text_and_texts() {
        let parser = QuickXmlParser::new();
        assert_eq!(
            parser
                .text(LIST, "ListBucketResult/NextContinuationToken")
                .unwrap()
                .as_deref(),
            Some("abc==")
        );
        assert_eq!(
            parser.texts(LIST, "ListBucketResult/Contents/Key").unwrap(),
            vec!["a & b.txt".to_string(), "c.txt".to_string()]
        );
        assert_eq!(parser.text(LIST, "ListBucketResult/Missing").unwrap(), None);
    }

    #[test]
    fn test_records() {
        let parser = QuickXmlParser::new();
        let records = parser.records(LIST, "ListBucketResult/Contents").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Size"], "42");
        assert_eq!(records[0]["ETag"], "\"etag-1\"");
        assert_eq!(records[1]["StorageClass"], "");
    }

    #[test]
    fn test_error_document() {
        let body = br#"<Error><Code>NoSuchUpload</Code><Message>gone</Message></Error>"#;
        let parser = QuickXmlParser::new();
        assert_eq!(
            parser.text(body, "Error/Code").unwrap().as_deref(),
            Some("NoSuchUpload")
        );
        assert_eq!(
            parser.text(body, "Error/Message").unwrap().as_deref(),
            Some("gone")
        );
    }

    #[test]
    fn test_malformed_xml() {
        let parser = QuickXmlParser::new();
        assert!(parser.text(b"<a><b></a>", "a/b").is_err());
    }

    #[test]
    fn test_escape_into() {
        let mut buf = String::new();
        escape_into(&mut buf, "a<b>&'\"");
        assert_eq!(buf, "a&lt;b&gt;&amp;&apos;&quot;");
    }
}
