//! Validation of submitted form fields and the pure decision logic that turns
//! a request plus fetched metadata into an [`ExtractionPlan`].

use std::path::Path;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    error::DownloadError,
    model::{DownloadForm, DownloadRequest, ExtractionPlan, MediaFormat, Quality, Sink, VideoInfo},
};

/// Pre-muxed 360p/480p mp4 in the extractor's YouTube catalog.
pub const PROGRESSIVE_480P: &str = "18";
/// Pre-muxed 720p mp4 in the extractor's YouTube catalog.
pub const PROGRESSIVE_720P: &str = "22";
/// 1080p avc video (137) with m4a audio (140). No progressive variant exists.
pub const SELECTION_1080P: &str = "137+140";
pub const SELECTION_BEST: &str = "bestvideo+bestaudio";

const AUDIO_SELECTION: &str = "bestaudio";
const TEMP_FILE_NAME: &str = "download.mp4";
const FALLBACK_STEM: &str = "download";
const MAX_STEM_CHARS: usize = 140;

const SUPPORTED_DOMAINS: [&str; 4] = [
    "youtube.com",
    "youtu.be",
    "youtube-nocookie.com",
    "youtube.googleapis.com",
];

/// Inputs to [`plan`] that do not come from the request itself.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub work_dir: &'a Path,
    pub job_token: &'a str,
    pub no_check_certificates: bool,
}

/// The stream-selection expression for a request and whether it names a
/// single pre-muxed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub expression: String,
    pub progressive: bool,
}

impl Selection {
    fn progressive(format_id: &str) -> Self {
        Self {
            expression: format_id.to_string(),
            progressive: true,
        }
    }

    fn combined(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            progressive: false,
        }
    }

    fn capped(height: u32) -> Self {
        Self::combined(format!(
            "bestvideo[height<={height}]+bestaudio/best[height<={height}]"
        ))
    }
}

pub fn validate(form: &DownloadForm) -> Result<DownloadRequest, DownloadError> {
    let url = form
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| DownloadError::invalid_input("Enter a YouTube URL"))?;
    if !is_supported_video_url(url) {
        return Err(DownloadError::invalid_input("Invalid YouTube URL"));
    }

    let format = form
        .format
        .as_deref()
        .and_then(MediaFormat::parse)
        .ok_or_else(|| DownloadError::invalid_input("Choose either MP3 or MP4"))?;

    let quality = match format {
        MediaFormat::Audio => Quality::Best,
        MediaFormat::Video => Quality::parse(form.quality.as_deref()).ok_or_else(|| {
            DownloadError::invalid_input("Choose a quality of 480p, 720p, 1080p or best")
        })?,
    };

    Ok(DownloadRequest {
        url: url.to_string(),
        format,
        quality,
    })
}

pub fn is_supported_video_url(input: &str) -> bool {
    let Ok(parsed) = Url::parse(input) else {
        return false;
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

/// Reduces a title to ASCII word characters (`[A-Za-z0-9_]`) and single
/// spaces so that it can be used as a filename stem and inside a header.
pub fn sanitize_title(title: &str) -> String {
    let mut sanitized = String::with_capacity(title.len());

    for character in title.chars() {
        if character.is_ascii_alphanumeric() || character == '_' {
            sanitized.push(character);
        } else if character.is_whitespace() && !sanitized.ends_with(' ') {
            sanitized.push(' ');
        }
    }

    let stem: String = sanitized.trim().chars().take(MAX_STEM_CHARS).collect();
    let stem = stem.trim_end();
    if stem.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        stem.to_string()
    }
}

pub fn resolve_selection(quality: Quality, info: &VideoInfo) -> Selection {
    match quality {
        Quality::Q480 if info.advertises_progressive(PROGRESSIVE_480P) => {
            Selection::progressive(PROGRESSIVE_480P)
        }
        Quality::Q480 => Selection::capped(480),
        Quality::Q720 if info.advertises_progressive(PROGRESSIVE_720P) => {
            Selection::progressive(PROGRESSIVE_720P)
        }
        Quality::Q720 => Selection::capped(720),
        Quality::Q1080 => Selection::combined(SELECTION_1080P),
        Quality::Best => Selection::combined(SELECTION_BEST),
    }
}

/// A token unique to one request, used to name its job directory.
pub fn job_token() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        Uuid::new_v4().simple()
    )
}

pub fn plan(request: &DownloadRequest, info: &VideoInfo, context: &PlanContext<'_>) -> ExtractionPlan {
    let stem = sanitize_title(info.title.as_deref().unwrap_or_default());
    let output_filename = format!("{stem}.{}", request.format.extension());

    let mut args = vec!["--no-playlist".to_string(), "--no-warnings".to_string()];
    if context.no_check_certificates {
        args.push("--no-check-certificates".to_string());
    }

    let sink = match request.format {
        MediaFormat::Audio => {
            args.extend(
                [
                    "-f",
                    AUDIO_SELECTION,
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "0",
                ]
                .map(String::from),
            );
            Sink::Stream
        }
        MediaFormat::Video => {
            let selection = resolve_selection(request.quality, info);
            args.push("-f".to_string());
            args.push(selection.expression);
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());

            if selection.progressive {
                Sink::Stream
            } else {
                Sink::TempFile(context.work_dir.join(context.job_token).join(TEMP_FILE_NAME))
            }
        }
    };

    args.push("-o".to_string());
    args.push(match &sink {
        Sink::Stream => "-".to_string(),
        Sink::TempFile(path) => path.to_string_lossy().into_owned(),
    });
    args.push(request.url.clone());

    ExtractionPlan {
        url: request.url.clone(),
        output_filename,
        content_type: request.format.content_type(),
        tool_arguments: args,
        sink,
    }
}
