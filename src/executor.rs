use std::{io, path::Path, sync::Arc};

use async_stream::stream;
use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use tokio::{fs::File, time::timeout};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::{
    artifact::{CleanupTracker, TempArtifact},
    config::Timeouts,
    error::DownloadError,
    extractor::{ByteStream, MediaExtractor},
    model::ExtractionPlan,
};

/// Runs an [`ExtractionPlan`] and turns the extractor's output into a
/// download response.
///
/// `execute` returns `Err` only while nothing has been committed to the
/// client. Once it returns a [`Response`] the headers are fixed, and any later
/// failure can only end the body early.
#[derive(Clone)]
pub struct Executor {
    extractor: Arc<dyn MediaExtractor>,
    timeouts: Timeouts,
    cleanup: CleanupTracker,
}

impl Executor {
    pub fn new(extractor: Arc<dyn MediaExtractor>, timeouts: Timeouts, cleanup: CleanupTracker) -> Self {
        Self {
            extractor,
            timeouts,
            cleanup,
        }
    }

    pub async fn execute(&self, plan: &ExtractionPlan) -> Result<Response, DownloadError> {
        let headers = attachment_headers(plan)?;
        info!(
            url = %plan.url,
            filename = %plan.output_filename,
            sink = ?plan.sink,
            "Starting extraction"
        );

        match plan.temp_path() {
            None => self.stream_directly(plan, headers).await,
            Some(path) => self.stream_through_file(plan, path, headers).await,
        }
    }

    async fn stream_directly(
        &self,
        plan: &ExtractionPlan,
        headers: HeaderMap,
    ) -> Result<Response, DownloadError> {
        let (first, rest) = timeout(self.timeouts.download, self.first_chunk(plan))
            .await
            .map_err(|_| DownloadError::Timeout {
                stage: "Starting the download",
                seconds: self.timeouts.download.as_secs(),
            })??;

        let body = self.relay(&plan.output_filename, Some(first), rest, None);
        Ok((headers, Body::from_stream(body)).into_response())
    }

    /// Waits for the first non-empty chunk, so that a tool that dies straight
    /// away still gets an error page.
    async fn first_chunk(&self, plan: &ExtractionPlan) -> Result<(Bytes, ByteStream), DownloadError> {
        let mut output = self.extractor.extract_stream(plan).await?;

        loop {
            match output.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok((chunk, output)),
                Some(Err(error)) => return Err(DownloadError::ExtractionStart(error.to_string())),
                None => {
                    return Err(DownloadError::ExtractionStart(
                        "the extractor produced no output".to_string(),
                    ));
                }
            }
        }
    }

    async fn stream_through_file(
        &self,
        plan: &ExtractionPlan,
        path: &Path,
        mut headers: HeaderMap,
    ) -> Result<Response, DownloadError> {
        let job_dir = path.parent().ok_or_else(|| {
            DownloadError::ExtractionStart(format!("temp path {path:?} has no job directory"))
        })?;
        let artifact = TempArtifact::create(job_dir.to_path_buf(), self.cleanup.clone()).await?;

        let (file, length) = match self.produce_file(plan, path).await {
            Ok(prepared) => prepared,
            Err(error) => {
                artifact.remove().await;
                return Err(error);
            }
        };

        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        let body = self.relay(
            &plan.output_filename,
            None,
            Box::pin(ReaderStream::new(file)),
            Some(artifact),
        );
        Ok((headers, Body::from_stream(body)).into_response())
    }

    async fn produce_file(&self, plan: &ExtractionPlan, path: &Path) -> Result<(File, u64), DownloadError> {
        timeout(self.timeouts.download, self.extractor.extract_to_file(plan))
            .await
            .map_err(|_| DownloadError::Timeout {
                stage: "Downloading and merging",
                seconds: self.timeouts.download.as_secs(),
            })??;

        let file = File::open(path).await.map_err(|error| {
            DownloadError::ExtractionStart(format!(
                "the extractor finished but its output could not be opened: {error}"
            ))
        })?;
        let length = file
            .metadata()
            .await
            .map_err(DownloadError::io("Could not read the temporary download"))?
            .len();

        Ok((file, length))
    }

    /// Forwards chunks to the response body as they arrive. Once the source
    /// ends, fails, or stalls, the artifact (if any) is removed before the
    /// body finishes.
    fn relay(
        &self,
        filename: &str,
        first: Option<Bytes>,
        mut rest: ByteStream,
        artifact: Option<TempArtifact>,
    ) -> ByteStream {
        let idle = self.timeouts.stream_idle;
        let filename = filename.to_string();

        Box::pin(stream! {
            let mut sent: u64 = 0;
            if let Some(first) = first {
                sent += first.len() as u64;
                yield Ok(first);
            }

            let outcome = loop {
                match timeout(idle, rest.next()).await {
                    Ok(Some(Ok(chunk))) => {
                        sent += chunk.len() as u64;
                        yield Ok(chunk);
                    }
                    Ok(Some(Err(error))) => break Err(DownloadError::MidStream(error.to_string())),
                    Ok(None) => break Ok(()),
                    Err(_) => {
                        break Err(DownloadError::MidStream(format!(
                            "no output for {} seconds",
                            idle.as_secs_f32()
                        )));
                    }
                }
            };

            // Stops the extractor before its output directory goes away.
            drop(rest);
            if let Some(artifact) = artifact {
                artifact.remove().await;
            }

            match outcome {
                Ok(()) => info!(bytes = sent, "Finished sending {filename:?}"),
                Err(failure) => {
                    error!(bytes = sent, "Aborting {filename:?} after headers were sent: {failure}");
                    yield Err(io::Error::other(failure.to_string()));
                }
            }
        })
    }
}

fn attachment_headers(plan: &ExtractionPlan) -> Result<HeaderMap, DownloadError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(plan.content_type));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&plan.output_filename)).map_err(|_| {
            DownloadError::ExtractionStart("the download file name is not a valid header".to_string())
        })?,
    );
    Ok(headers)
}

/// Planned names are already ASCII word characters, so this only guards the
/// quoted value against characters that would break the header.
pub fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"",
        sanitize_ascii_filename(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_' | ' ') {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

// Used by tests that need an executor without a config.
#[cfg(test)]
pub(crate) fn short_timeouts() -> Timeouts {
    Timeouts {
        metadata: std::time::Duration::from_secs(5),
        download: std::time::Duration::from_secs(5),
        stream_idle: std::time::Duration::from_millis(200),
    }
}
