use clap::{Parser, Subcommand};

/// s3xfer - S3 request signing and parallel multipart transfers
#[derive(Parser, Debug)]
#[command(name = "s3xfer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (YAML); the environment is used when absent
    #[arg(long, global = true, env = "S3XFER_CONFIG")]
    pub config: Option<String>,

    /// Profile to use from the config file and the credentials file
    #[arg(long, global = true, env = "S3XFER_PROFILE")]
    pub profile: Option<String>,

    /// AWS shared credentials file; ~/.aws/credentials is read when the
    /// profile carries no keys
    #[arg(long, global = true, env = "AWS_SHARED_CREDENTIALS_FILE", value_name = "FILE")]
    pub credentials: Option<String>,

    /// Override the profile's endpoints (comma-separated)
    #[arg(long, global = true, value_delimiter = ',')]
    pub endpoints: Option<Vec<String>>,

    /// Override the profile's HTTP proxy
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG wins when set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Disable TLS certificate verification
    #[arg(long, global = true)]
    pub insecure: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Transfer tuning shared by upload and download
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TransferArgs {
    /// Parallel part transfers
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Part size (e.g. 8M, 64M, 1G)
    #[arg(long)]
    pub part_size: Option<String>,

    /// Retries per part
    #[arg(long)]
    pub retries: Option<u32>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a presigned URL
    Presign {
        /// Object path (s3://bucket/key)
        #[arg(value_name = "PATH")]
        path: String,

        /// HTTP method the URL is valid for
        #[arg(long, default_value = "GET")]
        method: String,

        /// Validity in seconds (max 604800)
        #[arg(long, default_value = "3600")]
        expires: u64,

        /// Extra signed query parameter (k=v), repeatable
        #[arg(long = "param", value_name = "K=V")]
        params: Vec<String>,
    },

    /// Upload a local file with a parallel multipart upload
    Upload {
        /// Local file
        #[arg(value_name = "FILE")]
        source: String,

        /// Destination (s3://bucket/key)
        #[arg(value_name = "PATH")]
        dest: String,

        /// User metadata (k=v), repeatable
        #[arg(long = "meta", value_name = "K=V")]
        metadata: Vec<String>,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Download an object with parallel range requests
    Download {
        /// Source (s3://bucket/key)
        #[arg(value_name = "PATH")]
        source: String,

        /// Local file
        #[arg(value_name = "FILE")]
        dest: String,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Show object info
    Stat {
        /// Object path (s3://bucket/key)
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// List objects
    Ls {
        /// Bucket or prefix (s3://bucket/prefix)
        #[arg(value_name = "PATH")]
        path: String,

        /// List recursively
        #[arg(short, long)]
        recursive: bool,

        /// Maximum number of results to show (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_keys: usize,
    },

    /// Remove an object
    Rm {
        /// Object path (s3://bucket/key)
        #[arg(value_name = "PATH")]
        path: String,
    },

    /// Send one signed request and print the status, headers and body
    Request {
        /// Bucket or object (s3://bucket[/key]); the service root when absent
        #[arg(value_name = "PATH")]
        path: Option<String>,

        /// HTTP method: GET, PUT, POST, DELETE or HEAD
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Query parameters: k1=v1;k2=v2 (a bare key has an empty value)
        #[arg(short, long)]
        params: Option<String>,

        /// Extra headers: name1:value1;name2:value2
        #[arg(short = 'H', long)]
        headers: Option<String>,

        /// Request body for PUT and POST; @path reads a file
        #[arg(short = 'v', long)]
        value: Option<String>,

        /// Write a successful response body here instead of stdout
        #[arg(short, long)]
        out_file: Option<String>,

        /// Sign for this URL's host while sending to the endpoint, for tunnels.
        /// Certificate checks are skipped.
        #[arg(short = 'S', long, value_name = "URL")]
        sign_url: Option<String>,
    },
}

/// Parse S3 path into bucket and key components
///
/// Accepts both `s3/bucket/key` and URI-style `s3://bucket/key`.
pub fn parse_s3_path(path: &str) -> anyhow::Result<(String, Option<String>)> {
    let stripped = ["s3://", "s3/"]
        .iter()
        .find_map(|scheme| path.trim().strip_prefix(scheme))
        .ok_or_else(|| anyhow::anyhow!("Invalid S3 path {:?}, expected s3://bucket/key", path))?;

    let (bucket, key) = match stripped.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (stripped, ""),
    };

    anyhow::ensure!(!bucket.is_empty(), "Bucket name cannot be empty in {:?}", path);

    let key = (!key.is_empty()).then(|| key.to_string());
    Ok((bucket.to_string(), key))
}

/// Bucket and key of a path that must name an object
pub fn parse_object_path(path: &str) -> anyhow::Result<(String, String)> {
    let (bucket, key) = parse_s3_path(path)?;
    let key = key.ok_or_else(|| anyhow::anyhow!("Path must include an object key: {}", path))?;
    Ok((bucket, key))
}

/// Split `k=v` pairs
pub fn parse_pairs(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow::anyhow!("Expected k=v, got {:?}", pair))
        })
        .collect()
}

/// Split `a=1;b=2` style lists. Entries without `sep` are kept with an
/// empty value when `bare_ok`, else rejected.
pub fn parse_delimited(raw: &str, sep: char, bare_ok: bool) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (k, v) = match entry.split_once(sep) {
                Some((k, v)) => (k.trim(), v.trim()),
                None if bare_ok => (entry, ""),
                None => anyhow::bail!("Expected name{}value, got {:?}", sep, entry),
            };
            anyhow::ensure!(!k.is_empty(), "Empty name in {:?}", entry);
            Ok((k.to_string(), v.to_string()))
        })
        .collect()
}
