//! The external media tool, behind a trait so the executor can be driven by a
//! fake in tests.

use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    pin::Pin,
    process::Stdio,
};

use async_stream::stream;
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    error::DownloadError,
    model::{ExtractionPlan, VideoInfo},
};

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoInfo, DownloadError>;

    /// Starts the tool for a [`Sink::Stream`](crate::model::Sink::Stream) plan
    /// and returns its standard output. The stream ends with an error if the
    /// tool exits unsuccessfully.
    async fn extract_stream(&self, plan: &ExtractionPlan) -> Result<ByteStream, DownloadError>;

    /// Runs the tool for a [`Sink::TempFile`](crate::model::Sink::TempFile)
    /// plan to completion. On success the file named by the plan is complete.
    async fn extract_to_file(&self, plan: &ExtractionPlan) -> Result<(), DownloadError>;
}

/// Drives the `yt-dlp` command line.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    no_check_certificates: bool,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>, no_check_certificates: bool) -> Self {
        Self {
            binary: binary.into(),
            no_check_certificates,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The tool starts ffmpeg to merge and convert. Its own group lets
        // `ToolGroup` stop those helpers together with it.
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, String> {
        debug!("Running {:?} {:?}", self.binary, args);
        let child = self
            .command(args)
            .spawn()
            .map_err(|error| self.launch_error(error))?;
        let group = ToolGroup::new(&child);
        let output = child
            .wait_with_output()
            .await
            .map_err(|error| format!("could not wait for {:?}: {error}", self.binary))?;
        group.disarm();

        if !output.status.success() {
            return Err(run_error_message(&output.stderr));
        }

        Ok(output)
    }

    fn launch_error(&self, error: io::Error) -> String {
        if error.kind() == ErrorKind::NotFound {
            format!("{:?} is not installed or not on PATH", self.binary)
        } else {
            format!("could not run {:?}: {error}", self.binary)
        }
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        if self.no_check_certificates {
            args.push("--no-check-certificates".to_string());
        }
        args.push(url.to_string());

        let output = self.run(&args).await.map_err(DownloadError::MetadataFetch)?;
        serde_json::from_slice(&output.stdout).map_err(|error| {
            DownloadError::MetadataFetch(format!("unreadable metadata dump: {error}"))
        })
    }

    async fn extract_stream(&self, plan: &ExtractionPlan) -> Result<ByteStream, DownloadError> {
        debug!("Streaming {:?} {:?}", self.binary, plan.tool_arguments);
        let mut child = self
            .command(&plan.tool_arguments)
            .spawn()
            .map_err(|error| DownloadError::ExtractionStart(self.launch_error(error)))?;
        let group = ToolGroup::new(&child);

        let stdout = child.stdout.take().ok_or_else(|| {
            DownloadError::ExtractionStart("standard output was not captured".to_string())
        })?;
        // Drained concurrently so a chatty tool cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer).await;
                buffer
            })
        });

        Ok(Box::pin(stream! {
            let mut chunks = ReaderStream::new(stdout);
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => yield Ok(bytes),
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }

            let status = match child.wait().await {
                Ok(status) => status,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            group.disarm();
            if !status.success() {
                let stderr = match stderr {
                    Some(task) => task.await.unwrap_or_default(),
                    None => Vec::new(),
                };
                yield Err(io::Error::other(format!(
                    "yt-dlp exited with {status}: {}",
                    run_error_message(&stderr)
                )));
            }
        }))
    }

    async fn extract_to_file(&self, plan: &ExtractionPlan) -> Result<(), DownloadError> {
        self.run(&plan.tool_arguments)
            .await
            .map(drop)
            .map_err(DownloadError::ExtractionStart)
    }
}

/// Kills the process group of a spawned tool when dropped before the tool
/// has exited. `kill_on_drop` alone reaches only the tool, not the ffmpeg it
/// spawned, which would keep writing into a job directory that is gone.
#[derive(Debug)]
struct ToolGroup {
    id: Option<u32>,
}

impl ToolGroup {
    fn new(child: &Child) -> Self {
        Self { id: child.id() }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for ToolGroup {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            kill_process_group(id);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(id: u32) {
    let result = std::process::Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{id}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match result {
        Ok(status) if status.success() => debug!("Killed process group {id}"),
        // Nothing left in the group.
        Ok(_) => {}
        Err(error) => warn!("Could not stop process group {id}: {error}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_id: u32) {}

/// The last non-empty line the tool wrote to stderr, which is where it puts
/// its `ERROR:` summary.
pub fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "Unsupported or invalid video URL".to_string()
    } else if lower.contains("video unavailable") || lower.contains("private video") {
        "This video is unavailable".to_string()
    } else {
        message
    }
}
