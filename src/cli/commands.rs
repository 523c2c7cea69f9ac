use super::args::{parse_delimited, parse_object_path, parse_pairs, parse_s3_path, TransferArgs};
use super::Session;
use crate::s3::{PayloadHash, SigningRequest};
use crate::transfer::{DownloadTarget, TransferResult, TransferScheduler, UploadSource};
use crate::transport::{BodySource, ResponseSink};
use anyhow::{Context, Result};
use bytes::Bytes;
use hyper::Method;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write as FmtWrite;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Print a presigned URL for one object
pub fn cmd_presign(
    session: &Session,
    path: &str,
    method: &str,
    expires: u64,
    params: &[String],
) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;
    let method = parse_method(method)?;
    let params = parse_pairs(params)?;

    let signed = session
        .client_for(&bucket)
        .presign(session.primary_endpoint(), method, &key, expires, &params)?;

    tracing::debug!(expires_at = %signed.expires_at, "presigned");
    println!("{}", signed.url);
    Ok(())
}

fn parse_method(method: &str) -> Result<Method> {
    method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("Invalid HTTP method: {}", method))
}

fn progress_bar(total: u64, hidden: bool, message: String) -> Result<Option<ProgressBar>> {
    if hidden {
        return Ok(None);
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message(message);
    Ok(Some(pb))
}

fn print_summary(verb: &str, bucket: &str, result: &TransferResult, started: Instant) {
    let secs = started.elapsed().as_secs_f64();
    let mut line = String::with_capacity(128);
    let _ = write!(
        line,
        "{} s3://{}/{} ({}, {} parts",
        verb,
        bucket,
        result.key,
        format_bytes(result.size),
        result.parts
    );
    if result.retries > 0 {
        let _ = write!(line, ", {} retries", result.retries);
    }
    let _ = write!(line, ") in {:.1}s", secs);
    if secs > 0.0 {
        let _ = write!(line, ", {}/s", format_bytes((result.size as f64 / secs) as u64));
    }
    println!("{}", line);
}

/// Parallel multipart upload of a local file
pub async fn cmd_upload(
    session: &Session,
    source: &str,
    dest: &str,
    metadata: &[String],
    args: &TransferArgs,
) -> Result<()> {
    let (bucket, key) = parse_object_path(dest)?;
    let path = PathBuf::from(source);

    let meta = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("Cannot read source file: {}", source))?;
    if !meta.is_file() {
        anyhow::bail!("Source is not a file: {}", source);
    }

    let pb = progress_bar(meta.len(), args.no_progress, format!("Uploading {}", key))?;

    let mut builder = session.transfer_builder(args)?;
    for (k, v) in parse_pairs(metadata)? {
        builder = builder.metadata(k, v);
    }
    if let Some(pb) = &pb {
        let pb = pb.clone();
        builder = builder.on_progress(move |n| pb.inc(n));
    }
    let config = builder.build()?;

    let scheduler = TransferScheduler::new(session.client_for(&bucket));
    let started = Instant::now();
    let result = scheduler.upload(UploadSource::File(path), &key, &config).await;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let result = result.with_context(|| format!("Upload to s3://{}/{} failed", bucket, key))?;

    print_summary("Uploaded", &bucket, &result, started);
    if let Some(etag) = &result.etag {
        tracing::info!(etag = %etag, "stored");
    }
    Ok(())
}

/// Parallel ranged download into a local file
pub async fn cmd_download(
    session: &Session,
    source: &str,
    dest: &str,
    args: &TransferArgs,
) -> Result<()> {
    let (bucket, key) = parse_object_path(source)?;
    let client = session.client_for(&bucket);

    let info = client
        .head_object(session.primary_endpoint(), &key)
        .await
        .with_context(|| format!("Cannot stat s3://{}/{}", bucket, key))?;

    let pb = progress_bar(info.size, args.no_progress, format!("Downloading {}", key))?;

    let mut builder = session.transfer_builder(args)?.object_size(info.size);
    if let Some(pb) = &pb {
        let pb = pb.clone();
        builder = builder.on_progress(move |n| pb.inc(n));
    }
    let config = builder.build()?;

    let scheduler = TransferScheduler::new(client);
    let started = Instant::now();
    let result = scheduler
        .download(&key, DownloadTarget::File(PathBuf::from(dest)), &config)
        .await;

    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }
    let result = result.with_context(|| format!("Download of s3://{}/{} failed", bucket, key))?;

    print_summary("Downloaded", &bucket, &result, started);
    Ok(())
}

/// Show object info
pub async fn cmd_stat(session: &Session, path: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;
    let info = session
        .client_for(&bucket)
        .head_object(session.primary_endpoint(), &key)
        .await
        .with_context(|| format!("Cannot stat s3://{}/{}", bucket, key))?;

    println!("Name      : {}", info.key);
    println!("Date      : {}", info.last_modified.as_deref().unwrap_or("-"));
    println!("Size      : {} ({} bytes)", format_bytes(info.size), info.size);
    println!("ETag      : {}", info.etag.as_deref().unwrap_or("-"));
    println!("Type      : {}", info.content_type.as_deref().unwrap_or("-"));
    if let Some(class) = &info.storage_class {
        println!("Class     : {}", class);
    }
    if !info.metadata.is_empty() {
        println!("Metadata  :");
        for (name, value) in &info.metadata {
            println!("  {}: {}", name, value);
        }
    }
    Ok(())
}

/// List objects, following continuation tokens
pub async fn cmd_ls(session: &Session, path: &str, recursive: bool, max_keys: usize) -> Result<()> {
    let (bucket, prefix) = parse_s3_path(path)?;
    let client = session.client_for(&bucket);
    let endpoint = session.primary_endpoint();
    let delimiter = if recursive { None } else { Some("/") };
    let limit = if max_keys == 0 { usize::MAX } else { max_keys };

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::with_capacity(64 * 1024, stdout.lock());
    let mut shown = 0usize;
    let mut token: Option<String> = None;
    let mut line = String::with_capacity(256);

    loop {
        let page = client
            .list_objects_v2(endpoint, prefix.as_deref(), delimiter, token.as_deref(), None)
            .await
            .with_context(|| format!("Listing s3://{} failed", bucket))?;

        for dir in &page.common_prefixes {
            if shown >= limit {
                break;
            }
            line.clear();
            let _ = write!(line, "[{:>23}] {:>7} {}", "", "DIR", dir);
            writeln!(out, "{}", line)?;
            shown += 1;
        }

        for object in &page.contents {
            if shown >= limit {
                break;
            }
            line.clear();
            line.push('[');
            write_s3_date(&mut line, object.last_modified.as_deref());
            line.push_str("] ");
            let _ = write!(line, "{:>7} {}", format_bytes_compact(object.size), object.key);
            writeln!(out, "{}", line)?;
            shown += 1;
        }

        token = page.next_continuation_token.filter(|_| page.is_truncated);
        if token.is_none() || shown >= limit {
            break;
        }
    }

    out.flush()?;
    Ok(())
}

/// Remove one object
pub async fn cmd_rm(session: &Session, path: &str) -> Result<()> {
    let (bucket, key) = parse_object_path(path)?;
    session
        .client_for(&bucket)
        .delete_object(session.primary_endpoint(), &key)
        .await
        .with_context(|| format!("Cannot remove s3://{}/{}", bucket, key))?;
    println!("Removed s3://{}/{}", bucket, key);
    Ok(())
}

/// Body for `--value`: literal text, or a file's contents with `@path`
async fn request_body(method: &Method, value: Option<&str>) -> Result<Bytes> {
    let Some(value) = value else {
        return Ok(Bytes::new());
    };
    anyhow::ensure!(
        *method == Method::PUT || *method == Method::POST,
        "--value needs PUT or POST, not {}",
        method
    );
    match value.strip_prefix('@') {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .with_context(|| format!("Cannot read request body from {}", path)),
        None => Ok(Bytes::copy_from_slice(value.as_bytes())),
    }
}

/// Options of the raw `request` command
#[derive(Debug, Default)]
pub struct RawRequest<'a> {
    pub path: Option<&'a str>,
    pub method: &'a str,
    pub params: Option<&'a str>,
    pub headers: Option<&'a str>,
    pub value: Option<&'a str>,
    pub out_file: Option<&'a str>,
    pub sign_url: Option<&'a str>,
}

/// Send one signed request and print what came back
pub async fn cmd_request(session: &Session, raw: RawRequest<'_>) -> Result<()> {
    let method = parse_method(raw.method)?;
    let allowed = [Method::GET, Method::PUT, Method::POST, Method::DELETE, Method::HEAD];
    anyhow::ensure!(
        allowed.contains(&method),
        "Unsupported method {}, expected GET, PUT, POST, DELETE or HEAD",
        method
    );

    let endpoint = session.primary_endpoint();
    let (client, url) = match raw.path {
        Some(path) => {
            let (bucket, key) = parse_s3_path(path)?;
            let client = session.client_for(&bucket);
            let url = match &key {
                Some(key) => client.object_url(endpoint, key),
                None => client.bucket_url(endpoint),
            };
            (client, url)
        }
        None => (session.client_for(""), format!("{}/", endpoint.trim_end_matches('/'))),
    };

    let body = request_body(&method, raw.value).await?;
    let mut request = SigningRequest::new(method.clone(), &url)?
        .headers(parse_delimited(raw.headers.unwrap_or_default(), ':', false)?)
        .payload(PayloadHash::from_bytes(&body));
    for (k, v) in parse_delimited(raw.params.unwrap_or_default(), '=', true)? {
        request = request.query_param(k, v);
    }
    if let Some(sign_url) = raw.sign_url {
        request = request.sign_as(sign_url)?;
        tracing::debug!(signed_host = request.host(), "signing for another host");
    }

    let sink = match raw.out_file {
        Some(path) => {
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Cannot create {}", path))?;
            ResponseSink::File {
                path: PathBuf::from(path),
                offset: 0,
                len: None,
            }
        }
        None => ResponseSink::Memory,
    };
    let body = if body.is_empty() {
        BodySource::Empty
    } else {
        BodySource::Bytes(body)
    };

    let meta = client
        .execute(request, body, sink)
        .await
        .with_context(|| format!("{} {} failed", method, url))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "Status: {}", meta.status)?;
    for (name, value) in &meta.headers {
        writeln!(out, "{}: {}", name, value.to_str().unwrap_or("<binary>"))?;
    }
    if !meta.body.is_empty() {
        writeln!(out)?;
        out.write_all(&meta.body)?;
        writeln!(out)?;
    } else if let (Some(path), true) = (raw.out_file, meta.is_success()) {
        writeln!(out, "\nWrote {} to {}", format_bytes(meta.bytes_received), path)?;
    }
    out.flush()?;

    anyhow::ensure!(meta.is_success(), "Request failed with status {}", meta.status);
    Ok(())
}

/// Format bytes in human-readable form (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let value = bytes as f64;
    let exponent = ((value.ln() / 1024_f64.ln()).floor() as usize).min(UNITS.len() - 1);

    if exponent == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value / 1024_f64.powi(exponent as i32), UNITS[exponent])
    }
}

/// Compact size for listings (0B, 1.0KiB, 10MiB)
pub fn format_bytes_compact(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        return "0B".to_string();
    }

    let value = bytes as f64;
    let exponent = ((value.ln() / 1024_f64.ln()).floor() as usize).min(UNITS.len() - 1);
    let scaled = value / 1024_f64.powi(exponent as i32);

    if exponent == 0 {
        format!("{}B", bytes)
    } else if scaled >= 10.0 {
        format!("{:.0}{}", scaled, UNITS[exponent])
    } else {
        format!("{:.1}{}", scaled, UNITS[exponent])
    }
}

/// RFC 3339 timestamps ("2026-01-22T20:44:33.219Z") become
/// "2026-01-22 20:44:33 UTC". Anything else, such as the RFC 1123
/// `Last-Modified` header of a HEAD, passes through unchanged.
fn write_s3_date(w: &mut String, date: Option<&str>) {
    let Some(date) = date else {
        return;
    };
    match chrono::DateTime::parse_from_rfc3339(date) {
        Ok(parsed) => {
            let _ = write!(
                w,
                "{}",
                parsed.with_timezone(&chrono::Utc).format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Err(_) => w.push_str(date),
    }
}

/// Parse a size like "512", "10K", "8M", "1G"
pub fn parse_size(size: &str) -> Result<u64> {
    let upper = size.trim().to_ascii_uppercase();
    let upper = upper.trim_end_matches("IB").trim_end_matches('B');
    let (digits, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1024u64),
        Some('M') => (&upper[..upper.len() - 1], 1024u64.pow(2)),
        Some('G') => (&upper[..upper.len() - 1], 1024u64.pow(3)),
        Some('T') => (&upper[..upper.len() - 1], 1024u64.pow(4)),
        _ => (upper, 1u64),
    };

    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size format: {}", size))?;

    n.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size too large: {}", size))
}
