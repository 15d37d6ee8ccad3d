use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Raw fields of the download form, as submitted.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DownloadForm {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Audio,
    Video,
}

impl MediaFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Audio),
            "mp4" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video => "video/mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Q480,
    Q720,
    Q1080,
    Best,
}

impl Quality {
    /// `None` for values that are neither a known tier nor an explicit request
    /// for the best available stream.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let value = value.map(str::trim).unwrap_or_default().to_ascii_lowercase();
        match value.as_str() {
            "480p" => Some(Self::Q480),
            "720p" => Some(Self::Q720),
            "1080p" => Some(Self::Q1080),
            "" | "best" | "default" => Some(Self::Best),
            _ => None,
        }
    }
}

/// A validated download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
}

/// Subset of the extractor's single-JSON dump the planner looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub formats: Vec<StreamVariant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamVariant {
    pub format_id: String,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
}

impl StreamVariant {
    fn lacks_video(&self) -> bool {
        self.vcodec.as_deref() == Some("none")
    }

    fn lacks_audio(&self) -> bool {
        self.acodec.as_deref() == Some("none")
    }
}

impl VideoInfo {
    pub fn max_height(&self) -> Option<u32> {
        self.formats.iter().filter_map(|item| item.height).max()
    }

    /// Whether the variant `format_id` is listed and is not known to be a
    /// video-only or audio-only stream.
    pub fn advertises_progressive(&self, format_id: &str) -> bool {
        self.formats
            .iter()
            .any(|item| item.format_id == format_id && !item.lacks_video() && !item.lacks_audio())
    }
}

/// Where the extractor's output goes before it reaches the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    /// The tool writes to its standard output, relayed as it arrives.
    Stream,
    /// The tool muxes into this file, which is relayed once complete.
    TempFile(PathBuf),
}

/// Everything the executor needs to serve one download. Built once by the
/// planner and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionPlan {
    pub url: String,
    pub output_filename: String,
    pub content_type: &'static str,
    pub tool_arguments: Vec<String>,
    pub sink: Sink,
}

impl ExtractionPlan {
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.sink {
            Sink::Stream => None,
            Sink::TempFile(path) => Some(path),
        }
    }
}
