//! TOML configuration.
//!
//! One file drives the CLI and the HTTP server. Secrets (OpenAI key, blob
//! signing secret, AWS credentials) are read from the environment and never
//! appear here.
//!
//! ```toml
//! [db]
//! path = "./data/unitdocs.sqlite"
//!
//! [chunking]
//! max_tokens = 700
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [oracle]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [blob]
//! backend = "local"
//! root = "./data/blobs"
//! public_base_url = "http://127.0.0.1:7340"
//!
//! [rate_limits.train]
//! max_requests = 10
//! window_secs = 60
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::extract::{MIME_CSV, MIME_DOCX, MIME_JSON, MIME_PDF, MIME_TEXT};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Limits applied to every upload batch before any processing starts.
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    /// Files processed at once by the training orchestrator.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_files: default_max_files(),
            allowed_types: default_allowed_types(),
            max_concurrent: default_max_concurrent(),
            file_timeout_secs: default_file_timeout_secs(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_max_files() -> usize {
    10
}
fn default_allowed_types() -> Vec<String> {
    [MIME_PDF, MIME_DOCX, MIME_CSV, MIME_JSON, MIME_TEXT]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_concurrent() -> usize {
    2
}
fn default_file_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default = "default_oracle_model")]
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_oracle_provider(),
            model: default_oracle_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_oracle_provider() -> String {
    "disabled".to_string()
}
fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    /// Root directory for the local backend.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
    /// Base URL that signed local URLs are built on (the server's address).
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub prefix: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            root: default_blob_root(),
            public_base_url: default_public_base_url(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            bucket: None,
            region: default_region(),
            prefix: String::new(),
            endpoint_url: None,
        }
    }
}

fn default_blob_backend() -> String {
    "local".to_string()
}
fn default_blob_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_public_base_url() -> String {
    "http://127.0.0.1:7340".to_string()
}
fn default_signed_url_ttl_secs() -> u64 {
    3600
}
fn default_region() -> String {
    "us-east-1".to_string()
}

/// Longest accepted rate-limit window (one year).
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 3600;

/// A single fixed-window limit.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl LimitConfig {
    const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

/// One entry per logical resource. Missing sections fall back to defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitsConfig {
    #[serde(default = "default_admin_limit")]
    pub admin: LimitConfig,
    #[serde(default = "default_developer_limit")]
    pub developer: LimitConfig,
    #[serde(default = "default_developer_burst_limit")]
    pub developer_burst: LimitConfig,
    #[serde(default = "default_homeowner_limit")]
    pub homeowner: LimitConfig,
    #[serde(default = "default_ip_limit")]
    pub ip: LimitConfig,
    #[serde(default = "default_chat_limit")]
    pub chat: LimitConfig,
    #[serde(default = "default_train_limit")]
    pub train: LimitConfig,
    #[serde(default = "default_upload_limit")]
    pub upload: LimitConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            admin: default_admin_limit(),
            developer: default_developer_limit(),
            developer_burst: default_developer_burst_limit(),
            homeowner: default_homeowner_limit(),
            ip: default_ip_limit(),
            chat: default_chat_limit(),
            train: default_train_limit(),
            upload: default_upload_limit(),
        }
    }
}

impl RateLimitsConfig {
    fn entries(&self) -> [(&'static str, LimitConfig); 8] {
        [
            ("admin", self.admin),
            ("developer", self.developer),
            ("developer_burst", self.developer_burst),
            ("homeowner", self.homeowner),
            ("ip", self.ip),
            ("chat", self.chat),
            ("train", self.train),
            ("upload", self.upload),
        ]
    }
}

fn default_admin_limit() -> LimitConfig {
    LimitConfig::new(100, 60)
}
fn default_developer_limit() -> LimitConfig {
    LimitConfig::new(60, 60)
}
fn default_developer_burst_limit() -> LimitConfig {
    LimitConfig::new(10, 1)
}
fn default_homeowner_limit() -> LimitConfig {
    LimitConfig::new(30, 60)
}
fn default_ip_limit() -> LimitConfig {
    LimitConfig::new(120, 60)
}
fn default_chat_limit() -> LimitConfig {
    LimitConfig::new(20, 60)
}
fn default_train_limit() -> LimitConfig {
    LimitConfig::new(10, 60)
}
fn default_upload_limit() -> LimitConfig {
    LimitConfig::new(20, 60)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.upload.max_files == 0 {
        bail!("upload.max_files must be > 0");
    }
    if config.upload.max_file_bytes == 0 {
        bail!("upload.max_file_bytes must be > 0");
    }
    if config.upload.max_concurrent == 0 {
        bail!("upload.max_concurrent must be > 0");
    }
    if config.upload.allowed_types.is_empty() {
        bail!("upload.allowed_types must not be empty");
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.blob.backend.as_str() {
        "local" => {}
        "s3" => {
            if config.blob.bucket.as_deref().unwrap_or("").is_empty() {
                bail!("blob.bucket must be set when blob.backend is 's3'");
            }
        }
        other => bail!("Unknown blob backend: '{}'. Must be local or s3.", other),
    }
    if config.blob.signed_url_ttl_secs == 0 {
        bail!("blob.signed_url_ttl_secs must be > 0");
    }

    for (name, limit) in config.rate_limits.entries() {
        if limit.max_requests == 0 {
            bail!("rate_limits.{}.max_requests must be > 0", name);
        }
        if limit.window_secs == 0 || limit.window_secs > MAX_WINDOW_SECS {
            bail!(
                "rate_limits.{}.window_secs must be between 1 and {}",
                name,
                MAX_WINDOW_SECS
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/unitdocs.sqlite"

[chunking]
max_tokens = 700

[server]
bind = "127.0.0.1:7340"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.upload.max_files, 10);
        assert_eq!(config.upload.max_file_bytes, 50 * 1024 * 1024);
        assert_eq!(config.upload.max_concurrent, 2);
        assert_eq!(config.rate_limits.train, LimitConfig::new(10, 60));
        assert!(!config.oracle.is_enabled());
        assert_eq!(config.blob.signed_url_ttl_secs, 3600);
    }

    #[test]
    fn partial_rate_limit_section_keeps_other_defaults() {
        let text = format!("{}\n[rate_limits.chat]\nmax_requests = 3\nwindow_secs = 5\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.rate_limits.chat, LimitConfig::new(3, 5));
        assert_eq!(config.rate_limits.admin, LimitConfig::new(100, 60));
    }

    #[test]
    fn rejects_zero_window() {
        let text = format!("{}\n[rate_limits.ip]\nmax_requests = 3\nwindow_secs = 0\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("rate_limits.ip.window_secs"));
    }

    #[test]
    fn rejects_oversized_window() {
        let text = format!(
            "{}\n[rate_limits.homeowner]\nmax_requests = 3\nwindow_secs = 10000000000000000\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("rate_limits.homeowner.window_secs"));
    }

    #[test]
    fn rejects_s3_without_bucket() {
        let text = format!("{}\n[blob]\nbackend = \"s3\"\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_unknown_oracle() {
        let text = format!("{}\n[oracle]\nprovider = \"llama\"\n", MINIMAL);
        let config: Config = toml::from_str(&text).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown oracle provider"));
    }
}
