use std::{path::PathBuf, sync::Arc};

use axum::{
    Form, Json, Router,
    extract::{State, rejection::FormRejection},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    artifact::CleanupTracker,
    config::Timeouts,
    error::DownloadError,
    executor::Executor,
    extractor::MediaExtractor,
    model::DownloadForm,
    pages::Pages,
    planner::{self, PlanContext},
};

#[derive(Clone)]
pub struct AppState {
    extractor: Arc<dyn MediaExtractor>,
    executor: Executor,
    pages: Arc<Pages>,
    cleanup: CleanupTracker,
    work_dir: PathBuf,
    timeouts: Timeouts,
    no_check_certificates: bool,
}

impl AppState {
    pub fn new(
        extractor: Arc<dyn MediaExtractor>,
        pages: Pages,
        work_dir: PathBuf,
        timeouts: Timeouts,
        no_check_certificates: bool,
    ) -> Self {
        let cleanup = CleanupTracker::default();
        Self {
            executor: Executor::new(extractor.clone(), timeouts, cleanup.clone()),
            extractor,
            pages: Arc::new(pages),
            cleanup,
            work_dir,
            timeouts,
            no_check_certificates,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download", post(download))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn index(State(state): State<AppState>) -> Response {
    state.pages.form(StatusCode::OK, None, None)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "cleanup_failures": state.cleanup.failures(),
    }))
}

async fn download(
    State(state): State<AppState>,
    form: Result<Form<DownloadForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            info!("Rejected unreadable form submission: {rejection}");
            return state.pages.form(
                StatusCode::BAD_REQUEST,
                Some("The submitted form could not be read"),
                None,
            );
        }
    };

    match start_download(&state, &form).await {
        Ok(response) => response,
        Err(failure) => {
            match &failure {
                DownloadError::InvalidInput(message) => {
                    info!("Rejected download request: {message}")
                }
                other => error!(url = ?form.url, "Download failed before sending: {other}"),
            }
            state
                .pages
                .form(failure.status(), Some(&failure.to_string()), form.url.as_deref())
        }
    }
}

/// Validates, plans and executes one download. Any `Err` means no part of the
/// download response has been produced, so the caller may still render the
/// form instead.
async fn start_download(state: &AppState, form: &DownloadForm) -> Result<Response, DownloadError> {
    let request = planner::validate(form)?;
    info!(
        url = %request.url,
        format = ?request.format,
        quality = ?request.quality,
        "Download requested"
    );

    let info = timeout(
        state.timeouts.metadata,
        state.extractor.fetch_metadata(&request.url),
    )
    .await
    .map_err(|_| DownloadError::Timeout {
        stage: "Fetching video information",
        seconds: state.timeouts.metadata.as_secs(),
    })??;
    if info.title.is_none() {
        warn!(url = %request.url, "Extractor returned no title, using a generic file name");
    }
    info!(
        variants = info.formats.len(),
        max_height = ?info.max_height(),
        "Fetched video information"
    );

    let job_token = planner::job_token();
    let plan = planner::plan(
        &request,
        &info,
        &PlanContext {
            work_dir: &state.work_dir,
            job_token: &job_token,
            no_check_certificates: state.no_check_certificates,
        },
    );
    state.executor.execute(&plan).await
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use axum::{
        body::{Body, to_bytes},
        extract::{FromRequest, Request},
        http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    };

    use super::*;
    use crate::{
        executor::short_timeouts,
        extractor::fake::{FakeExtractor, FileScript, StreamScript},
        model::Sink,
    };

    const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    struct TestApp {
        work: tempfile::TempDir,
        fake: Arc<FakeExtractor>,
        state: AppState,
    }

    impl TestApp {
        fn new(fake: FakeExtractor) -> Self {
            let work = tempfile::tempdir().unwrap();
            let fake = Arc::new(fake);
            let state = AppState::new(
                fake.clone(),
                Pages::new().unwrap(),
                work.path().to_path_buf(),
                short_timeouts(),
                false,
            );
            Self { work, fake, state }
        }

        async fn submit(&self, url: &str, format: &str, quality: &str) -> Response {
            let form = DownloadForm {
                url: Some(url.to_string()),
                format: Some(format.to_string()),
                quality: Some(quality.to_string()),
            };
            download(State(self.state.clone()), Ok(Form(form))).await
        }

        fn work_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.work.path()).unwrap().next().is_none()
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn index_renders_the_form() {
        let app = TestApp::new(FakeExtractor::new("x", &[]));
        let response = index(State(app.state.clone())).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("name=\"quality\""));
    }

    #[tokio::test]
    async fn unsupported_urls_never_reach_the_extractor() {
        let app = TestApp::new(FakeExtractor::new("x", &[]));

        for url in ["https://vimeo.com/1", "not a url", "", "https://example.com/youtube.com"] {
            let response = app.submit(url, "mp4", "720p").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert!(body_text(response).await.contains("class=\"error\""));
        }

        assert_eq!(app.fake.metadata_calls(), 0);
        assert_eq!(app.fake.extract_calls(), 0);
    }

    async fn rejected_form(content_type: &str, body: &str) -> FormRejection {
        let request = Request::builder()
            .method("POST")
            .uri("/download")
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body.to_string()))
            .unwrap();
        Form::<DownloadForm>::from_request(request, &())
            .await
            .err()
            .unwrap()
    }

    #[tokio::test]
    async fn unreadable_submissions_render_the_form() {
        let app = TestApp::new(FakeExtractor::new("x", &[]));

        for rejection in [
            rejected_form("application/json", r#"{"url":"x"}"#).await,
            rejected_form(
                "application/x-www-form-urlencoded",
                "url=https%3A%2F%2Fyoutu.be%2Fa&url=https%3A%2F%2Fyoutu.be%2Fb",
            )
            .await,
        ] {
            let response = download(State(app.state.clone()), Err(rejection)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let html = body_text(response).await;
            assert!(html.contains("class=\"error\""));
            assert!(html.contains("<form method=\"post\" action=\"/download\">"));
        }

        assert_eq!(app.fake.metadata_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_quality_is_rejected() {
        let app = TestApp::new(FakeExtractor::new("x", &[]));

        let response = app.submit(VIDEO_URL, "mp4", "8k").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.fake.metadata_calls(), 0);
    }

    #[tokio::test]
    async fn metadata_failure_renders_the_form_without_extracting() {
        let app = TestApp::new(FakeExtractor::failing_metadata("ERROR: Video unavailable"));

        let response = app.submit(VIDEO_URL, "mp4", "best").await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let html = body_text(response).await;
        assert!(html.contains("Failed to fetch video information"));
        assert!(html.contains("dQw4w9WgXcQ"));
        assert_eq!(app.fake.metadata_calls(), 1);
        assert_eq!(app.fake.extract_calls(), 0);
    }

    #[tokio::test]
    async fn extraction_start_failure_renders_the_form() {
        let app = TestApp::new(
            FakeExtractor::new("Song", &[])
                .with_stream(StreamScript::FailToStart("yt-dlp is not installed".to_string())),
        );

        let response = app.submit(VIDEO_URL, "mp3", "").await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("yt-dlp is not installed"));
    }

    #[tokio::test]
    async fn audio_failing_mid_stream_keeps_committed_headers() {
        let app = TestApp::new(FakeExtractor::new("My Song! (Live)", &[]).with_stream(
            StreamScript::ChunksThenError(vec![vec![0xFF; 10]], "ffmpeg crashed".to_string()),
        ));

        let response = app.submit(VIDEO_URL, "mp3", "").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"My Song Live.mp3\""
        );
        assert_eq!(response.headers().get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(response.headers().get_all(CONTENT_DISPOSITION).iter().count(), 1);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert_eq!(app.fake.extract_calls(), 1);
    }

    #[tokio::test]
    async fn default_video_is_muxed_to_a_temp_file_and_cleaned_up() {
        let content: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let app = TestApp::new(
            FakeExtractor::new("Big Buck Bunny", &["18", "22"])
                .with_file(FileScript::Write(content.clone())),
        );

        let response = app.submit(VIDEO_URL, "mp4", "").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"Big Buck Bunny.mp4\""
        );
        let plan = app.fake.last_plan().unwrap();
        let temp_path = plan.temp_path().unwrap().to_path_buf();
        assert!(temp_path.starts_with(app.work.path()));
        assert!(plan.tool_arguments.contains(&"bestvideo+bestaudio".to_string()));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &content[..]);
        assert!(!temp_path.exists());
        assert!(app.work_dir_is_empty());
    }

    #[tokio::test]
    async fn full_hd_goes_through_a_temp_file_even_when_it_fails() {
        let app = TestApp::new(
            FakeExtractor::new("Clip", &["18", "22"])
                .with_file(FileScript::Fail("Requested format is not available".to_string())),
        );

        let response = app.submit(VIDEO_URL, "mp4", "1080p").await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let plan = app.fake.last_plan().unwrap();
        assert!(matches!(plan.sink, Sink::TempFile(_)));
        assert!(plan.tool_arguments.contains(&"137+140".to_string()));
        assert!(app.work_dir_is_empty());
    }

    #[tokio::test]
    async fn advertised_progressive_stream_is_relayed_directly() {
        let app = TestApp::new(
            FakeExtractor::new("Clip", &["18"])
                .with_stream(StreamScript::Chunks(vec![b"ftyp".to_vec(), b"moov".to_vec()])),
        );

        let response = app.submit(VIDEO_URL, "mp4", "480p").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.fake.last_plan().unwrap().sink, Sink::Stream);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ftypmoov");
        assert!(app.work_dir_is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_use_distinct_temp_paths() {
        let app = TestApp::new(
            FakeExtractor::new("Clip", &[]).with_file(FileScript::Write(b"data".to_vec())),
        );

        let first = app.submit(VIDEO_URL, "mp4", "720p").await;
        let first_path = app.fake.last_plan().unwrap().temp_path().map(Path::to_path_buf);
        let second = app.submit(VIDEO_URL, "mp4", "720p").await;
        let second_path = app.fake.last_plan().unwrap().temp_path().map(Path::to_path_buf);

        assert!(first_path.is_some());
        assert_ne!(first_path, second_path);
        drop((first, second));
        assert!(app.work_dir_is_empty());
    }

    #[tokio::test]
    async fn health_reports_cleanup_failures() {
        let app = TestApp::new(FakeExtractor::new("x", &[]));
        let Json(body) = health(State(app.state.clone())).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["cleanup_failures"], 0);
    }
}
