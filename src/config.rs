use std::{path::PathBuf, time::Duration};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_WORK_DIR: &str = "temp_downloads";
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS: u64 = 120;
const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub metadata: Duration,
    /// Bounds both the wait for the first streamed byte and a full temp-file run.
    pub download: Duration,
    /// Longest gap between two relayed chunks.
    pub stream_idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECONDS),
            download: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            stream_idle: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub yt_dlp_bin: PathBuf,
    pub work_dir: PathBuf,
    pub no_check_certificates: bool,
    pub timeouts: Timeouts,
    /// Job directories older than this are swept at startup. Zero disables it.
    pub stale_job_age: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let seconds = |name: &str, default: u64| {
            Duration::from_secs(read_u64(&lookup, name).unwrap_or(default))
        };

        Self {
            bind_addr: resolve_bind_addr(&lookup),
            yt_dlp_bin: lookup("YT_DLP_BIN")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_YT_DLP_BIN)
                .into(),
            work_dir: lookup("WORK_DIR")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_WORK_DIR)
                .into(),
            no_check_certificates: read_bool(&lookup, "YT_DLP_NO_CHECK_CERTIFICATES")
                .unwrap_or(true),
            timeouts: Timeouts {
                metadata: seconds("METADATA_TIMEOUT_SECONDS", DEFAULT_METADATA_TIMEOUT_SECONDS),
                download: seconds("DOWNLOAD_TIMEOUT_SECONDS", DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
                stream_idle: seconds(
                    "STREAM_IDLE_TIMEOUT_SECONDS",
                    DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS,
                ),
            },
            stale_job_age: seconds("STALE_JOB_SECONDS", DEFAULT_STALE_JOB_SECONDS),
        }
    }
}

fn resolve_bind_addr(lookup: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = lookup("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    let port = lookup("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let value = lookup(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
