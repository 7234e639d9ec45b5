use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    process::Stdio,
    sync::{Arc, LazyLock},
    time::SystemTime,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    process::Command,
    sync::{Mutex, Semaphore},
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Clone)]
struct AppState {
    progress: Arc<ProgressStore>,
    download_semaphore: Arc<Semaphore>,
    download_dir: PathBuf,
    delegate: Arc<DelegateOptions>,
    download_timeout: Duration,
}

type ProgressMap = HashMap<String, ProgressEntry>;

const CANONICAL_HEIGHTS: [u32; 8] = [2160, 1440, 1080, 720, 480, 360, 240, 144];
const POSTPROCESSED_EXTENSIONS: [&str; 4] = ["mp4", "mp3", "m4a", "webm"];
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const METADATA_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 30 * 60;
const DEFAULT_DELEGATE_RETRIES: u32 = 10;
const AUDIO_TARGET_BITRATE: &str = "192K";
const AUDIO_SENTINEL: &str = "bestaudio";
const AUDIO_SELECTOR: &str = "bestaudio/best";
const FALLBACK_VIDEO_SELECTOR: &str = "bestvideo+bestaudio/best";
const PROGRESS_ENTRY_TTL_SECONDS: i64 = 30 * 60;
const MAX_PROGRESS_ENTRIES: usize = 1024;
// rendered by the delegate as "[ytfetch]  42.1% 1.25MiB/s 00:32"
const PROGRESS_LINE_TAG: &str = "[ytfetch]";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pipeline {
    AudioExtract,
    VideoConvert,
}

#[derive(Debug, Deserialize)]
struct VideoInfoRequest {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfoResponse {
    id: String,
    title: Option<String>,
    thumbnail: Option<String>,
    duration: String,
    duration_seconds: u64,
    uploader: Option<String>,
    view_count: Option<u64>,
    formats: Vec<QualityTier>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
struct QualityTier {
    format_id: String,
    quality: String,
    ext: String,
    filesize: u64,
    filesize_str: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fps: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vcodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abr: Option<f32>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    filename: String,
    download_id: String,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ProgressSnapshot {
    Downloading {
        percent: String,
        speed: String,
        eta: String,
    },
    Finished {
        filename: String,
    },
    NotFound,
}

#[derive(Debug, Clone)]
struct ProgressEntry {
    snapshot: ProgressSnapshot,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct ProgressStore {
    entries: Mutex<ProgressMap>,
}

impl ProgressStore {
    async fn record(&self, video_id: &str, snapshot: ProgressSnapshot) {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        prune_progress_entries(&mut entries, now);
        entries.insert(
            video_id.to_string(),
            ProgressEntry {
                snapshot,
                updated_at: now,
            },
        );
        trim_progress_entries(&mut entries);
    }

    async fn snapshot(&self, video_id: &str) -> ProgressSnapshot {
        let entries = self.entries.lock().await;
        entries
            .get(video_id)
            .map(|entry| entry.snapshot.clone())
            .unwrap_or(ProgressSnapshot::NotFound)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    fn delegate(message: String) -> Self {
        let code = classify_delegate_error(&message);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
            code,
        }
    }

    fn timeout(deadline: Duration) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("yt-dlp timed out after {} seconds", deadline.as_secs()),
            code: Some("TIMEOUT"),
        }
    }

    fn file_missing() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Download completed but file not found".to_string(),
            code: Some("FILE_MISSING"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct YtDlpFormat {
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    tbr: Option<f32>,
    abr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Debug, Clone)]
struct DelegateOptions {
    retries: u32,
    force_ipv4: bool,
    geo_bypass: bool,
    user_agent: String,
}

impl DelegateOptions {
    fn from_env() -> Self {
        Self {
            retries: read_usize_env("YTDLP_RETRIES")
                .map(|value| value as u32)
                .unwrap_or(DEFAULT_DELEGATE_RETRIES),
            force_ipv4: read_bool_env("FORCE_IPV4").unwrap_or(true),
            geo_bypass: read_bool_env("GEO_BYPASS").unwrap_or(true),
            user_agent: std::env::var("USER_AGENT")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        }
    }

    fn network_args(&self) -> Vec<String> {
        let mut args = vec![
            "--retries".to_string(),
            self.retries.to_string(),
            "--user-agent".to_string(),
            self.user_agent.clone(),
        ];

        if self.force_ipv4 {
            args.push("--force-ipv4".to_string());
        }
        if self.geo_bypass {
            args.push("--geo-bypass".to_string());
        }

        args
    }
}

#[derive(Debug)]
struct DownloadRun {
    reported_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytfetch_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let download_dir = std::env::var("DOWNLOAD_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("downloads"));

    tokio::fs::create_dir_all(&download_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not create the downloads directory: {error}"))
    })?;

    let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);
    let download_timeout = read_usize_env("DOWNLOAD_TIMEOUT_SECONDS")
        .filter(|value| *value > 0)
        .map(|value| Duration::from_secs(value as u64))
        .unwrap_or(Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS));
    let delegate = DelegateOptions::from_env();

    info!(
        "Delegate options: retries={} force_ipv4={} geo_bypass={}",
        delegate.retries, delegate.force_ipv4, delegate.geo_bypass
    );
    info!("Download directory: {:?}", download_dir);

    let state = AppState {
        progress: Arc::new(ProgressStore::default()),
        download_semaphore: Arc::new(Semaphore::new(max_concurrent_downloads)),
        download_dir,
        delegate: Arc::new(delegate),
        download_timeout,
    };

    let cors = build_cors_layer()?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/video-info", post(fetch_video_info))
        .route("/download", post(start_download))
        .route("/download-file/{filename}", get(download_file))
        .route("/progress/{video_id}", get(get_progress))
        .route("/cleanup", post(cleanup_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "message": "Backend is running"}))
}

async fn fetch_video_info(
    State(state): State<AppState>,
    Json(payload): Json<VideoInfoRequest>,
) -> Result<Json<VideoInfoResponse>, ApiError> {
    let url = required_url(payload.url.as_deref())?;
    let video_id =
        extract_video_id(&url).ok_or_else(|| ApiError::bad_request("Invalid YouTube URL"))?;

    let mut args = vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    args.extend(state.delegate.network_args());
    args.push(url);

    let output = run_yt_dlp(args, Duration::from_secs(METADATA_TIMEOUT_SECONDS)).await?;
    let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::internal(format!("Could not parse yt-dlp metadata: {error}"))
    })?;

    debug!(
        "Metadata for {video_id}: {} raw formats reported",
        info.formats.len()
    );

    Ok(Json(build_video_info_response(video_id, info)))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = required_url(payload.url.as_deref())?;
    let video_id =
        extract_video_id(&url).ok_or_else(|| ApiError::bad_request("Invalid YouTube URL"))?;

    let format_id = payload.format_id.as_deref().and_then(non_empty);
    let quality = payload.quality.as_deref().unwrap_or_default();
    let pipeline = select_pipeline(format_id, quality);

    info!("Download request for {video_id}: pipeline={pipeline:?} selector={format_id:?}");

    let _download_permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity"))?;

    let args = build_download_args(
        &state.download_dir,
        &state.delegate,
        &video_id,
        format_id,
        pipeline,
        &url,
    );

    let run = run_yt_dlp_download(
        args,
        &video_id,
        Arc::clone(&state.progress),
        state.download_timeout,
    )
    .await;

    match run {
        Ok(outcome) => {
            let resolved = locate_downloaded_file(
                &state.download_dir,
                &video_id,
                outcome.reported_path.as_deref(),
            )
            .await?;

            let filename = resolved
                .file_name()
                .and_then(|name| name.to_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| "download.bin".to_string());

            state
                .progress
                .record(
                    &video_id,
                    ProgressSnapshot::Finished {
                        filename: filename.clone(),
                    },
                )
                .await;

            info!("Download finished for {video_id}: {filename}");

            Ok(Json(DownloadResponse {
                success: true,
                filename,
                download_id: video_id,
            }))
        }
        Err(error) => {
            warn!("Download failed for {video_id}: {}", error.message);
            remove_partial_artifacts(&state.download_dir, &video_id).await;
            Err(error)
        }
    }
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> Result<Response, ApiError> {
    let filename = safe_filename(&filename)?;
    let file_path = state.download_dir.join(&filename);

    let metadata = match tokio::fs::metadata(&file_path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(ApiError::not_found("File not found")),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!("Could not read the file: {error}")));
        }
    };

    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open the file: {error}")))?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the content length header"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header"))?,
    );

    Ok((headers, body).into_response())
}

async fn get_progress(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> Json<ProgressSnapshot> {
    Json(state.progress.snapshot(&video_id).await)
}

async fn cleanup_file(
    State(state): State<AppState>,
    Json(payload): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let filename = payload
        .filename
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    let filename = safe_filename(filename)?;
    let file_path = state.download_dir.join(&filename);

    match tokio::fs::remove_file(&file_path).await {
        Ok(()) => {
            info!("Deleted downloaded file {filename}");
            Ok(Json(CleanupResponse {
                success: true,
                message: "File deleted".to_string(),
            }))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            Err(ApiError::not_found("File not found"))
        }
        Err(error) => Err(ApiError::internal(format!("Could not delete the file: {error}"))),
    }
}

fn required_url(value: Option<&str>) -> Result<String, ApiError> {
    value
        .and_then(non_empty)
        .map(ToString::to_string)
        .ok_or_else(|| ApiError::bad_request("URL is required"))
}

fn extract_video_id(url: &str) -> Option<String> {
    let patterns = [
        r"(?:youtube\.com/watch\?v=|youtu\.be/)([^&\n?#]+)",
        r"youtube\.com/embed/([^&\n?#]+)",
        r"youtube\.com/v/([^&\n?#]+)",
    ];

    for pattern in patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        if let Some(found) = re.captures(url).and_then(|captures| captures.get(1)) {
            return Some(found.as_str().to_string());
        }
    }

    None
}

fn build_video_info_response(video_id: String, info: YtDlpVideoInfo) -> VideoInfoResponse {
    let duration_seconds = info.duration.unwrap_or_default().max(0.0) as u64;
    let formats = build_quality_tiers(&info.formats, duration_seconds);

    VideoInfoResponse {
        id: video_id,
        title: info.title,
        thumbnail: info.thumbnail,
        duration: format_duration(duration_seconds),
        duration_seconds,
        uploader: info.uploader,
        view_count: info.view_count,
        formats,
    }
}

fn build_quality_tiers(formats: &[YtDlpFormat], duration_seconds: u64) -> Vec<QualityTier> {
    let mut best_by_height: HashMap<u32, &YtDlpFormat> = HashMap::new();
    for format in formats.iter().filter(|item| has_video(item)) {
        let Some(height) = format.height else {
            continue;
        };
        let entry = best_by_height.entry(height).or_insert(format);
        if format.tbr.unwrap_or_default() > entry.tbr.unwrap_or_default() {
            *entry = format;
        }
    }

    let mut tiers = Vec::new();
    for height in CANONICAL_HEIGHTS {
        let Some(format) = best_by_height.get(&height) else {
            continue;
        };

        let filesize = resolve_variant_size(
            format.filesize,
            format.filesize_approx,
            format.tbr,
            duration_seconds,
        );

        // tiers describe the merged mp4 output, not the raw variant container
        tiers.push(QualityTier {
            format_id: selection_expression(height),
            quality: format!("{height}p"),
            ext: "mp4".to_string(),
            filesize,
            filesize_str: format_bytes(filesize),
            fps: Some(format.fps.unwrap_or(30.0)),
            vcodec: Some(format.vcodec.clone().unwrap_or_else(|| "h264".to_string())),
            acodec: Some("aac".to_string()),
            abr: None,
        });
    }

    let mut best_audio: Option<&YtDlpFormat> = None;
    for format in formats.iter().filter(|item| has_audio_only(item)) {
        let replace = match best_audio {
            Some(current) => format.abr.unwrap_or_default() > current.abr.unwrap_or_default(),
            None => true,
        };
        if replace {
            best_audio = Some(format);
        }
    }

    if let Some(audio) = best_audio {
        let filesize = resolve_variant_size(
            audio.filesize,
            audio.filesize_approx,
            audio.abr,
            duration_seconds,
        );

        tiers.push(QualityTier {
            format_id: AUDIO_SENTINEL.to_string(),
            quality: "Audio Only".to_string(),
            ext: "mp3".to_string(),
            filesize,
            filesize_str: format_bytes(filesize),
            fps: None,
            vcodec: None,
            acodec: audio.acodec.clone(),
            abr: audio.abr,
        });
    }

    tiers
}

fn selection_expression(height: u32) -> String {
    format!(
        "bestvideo[height={height}]+bestaudio/bestvideo[height<={height}]+bestaudio/best[height<={height}]"
    )
}

fn resolve_variant_size(
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    bitrate_kbps: Option<f32>,
    duration_seconds: u64,
) -> u64 {
    if let Some(reported) = filesize
        .filter(|value| *value > 0.0)
        .or_else(|| filesize_approx.filter(|value| *value > 0.0))
    {
        return reported as u64;
    }

    match bitrate_kbps {
        // kbps over the duration to bytes
        Some(bitrate) if bitrate > 0.0 && duration_seconds > 0 => {
            (bitrate as f64 * duration_seconds as f64 * 1024.0 / 8.0) as u64
        }
        _ => 0,
    }
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn has_audio_only(format: &YtDlpFormat) -> bool {
    !has_video(format) && has_audio(format)
}

fn format_duration(total_seconds: u64) -> String {
    if total_seconds == 0 {
        return "0:00".to_string();
    }

    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "Unknown".to_string();
    }

    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }

    format!("{size:.2} TB")
}

fn select_pipeline(format_id: Option<&str>, quality: &str) -> Pipeline {
    if quality.to_ascii_lowercase().contains("audio") || format_id == Some(AUDIO_SENTINEL) {
        Pipeline::AudioExtract
    } else {
        Pipeline::VideoConvert
    }
}

fn build_download_args(
    download_dir: &Path,
    delegate: &DelegateOptions,
    video_id: &str,
    format_id: Option<&str>,
    pipeline: Pipeline,
    url: &str,
) -> Vec<String> {
    let output_template = format!(
        "{}/{video_id}_%(title)s.%(ext)s",
        download_dir.to_string_lossy()
    );

    let mut args = vec![
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_LINE_TAG} %(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s"
        ),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "--fragment-retries".to_string(),
        delegate.retries.to_string(),
        "-o".to_string(),
        output_template,
    ];
    args.extend(delegate.network_args());

    match pipeline {
        Pipeline::AudioExtract => {
            args.push("-f".to_string());
            args.push(AUDIO_SELECTOR.to_string());
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push(AUDIO_TARGET_BITRATE.to_string());
        }
        Pipeline::VideoConvert => {
            args.push("-f".to_string());
            args.push(format_id.unwrap_or(FALLBACK_VIDEO_SELECTOR).to_string());
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
            args.push("--recode-video".to_string());
            args.push("mp4".to_string());
        }
    }

    args.push(url.to_string());
    args
}

async fn run_yt_dlp(
    args: Vec<String>,
    deadline: Duration,
) -> Result<std::process::Output, ApiError> {
    let command_future = Command::new("yt-dlp").args(args).kill_on_drop(true).output();
    let output = timeout(deadline, command_future)
        .await
        .map_err(|_| ApiError::timeout(deadline))?
        .map_err(map_spawn_error)?;

    if !output.status.success() {
        return Err(ApiError::delegate(run_error_message(&output.stderr)));
    }

    Ok(output)
}

async fn run_yt_dlp_download(
    args: Vec<String>,
    video_id: &str,
    progress: Arc<ProgressStore>,
    deadline: Duration,
) -> Result<DownloadRun, ApiError> {
    let mut child = Command::new("yt-dlp")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(map_spawn_error)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ApiError::internal("Could not capture yt-dlp stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ApiError::internal("Could not capture yt-dlp stderr"))?;

    let reader_id = video_id.to_string();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut reported_path = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            if let Some(snapshot) = parse_progress_line(&line) {
                progress.record(&reader_id, snapshot).await;
            } else if let Some(destination) = parse_destination_line(&line) {
                reported_path = Some(PathBuf::from(destination));
            } else if !line.starts_with('[') {
                // a line without a [tag] prefix is --print output: the final filepath
                reported_path = Some(PathBuf::from(line));
            }
        }

        reported_path
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut collected = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push(line);
        }
        collected.join("\n")
    });

    let status = match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(error)) => {
            return Err(ApiError::internal(format!("Could not wait for yt-dlp: {error}")));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(ApiError::timeout(deadline));
        }
    };

    let reported_path = stdout_task.await.unwrap_or_default();
    let captured_stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(ApiError::delegate(run_error_message(captured_stderr.as_bytes())));
    }

    Ok(DownloadRun { reported_path })
}

fn map_spawn_error(error: std::io::Error) -> ApiError {
    if error.kind() == ErrorKind::NotFound {
        ApiError::internal("yt-dlp is not installed. Install yt-dlp and restart the backend.")
    } else {
        ApiError::internal(format!("Could not execute yt-dlp: {error}"))
    }
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not complete the operation")
        .to_string()
}

fn classify_delegate_error(message: &str) -> Option<&'static str> {
    let lower = message.to_ascii_lowercase();

    if lower.contains("available in your country") || lower.contains("geo restriction") {
        Some("GEO_RESTRICTED")
    } else if lower.contains("sign in to confirm") || lower.contains("age-restricted") {
        Some("LOGIN_REQUIRED")
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("has been removed")
    {
        Some("VIDEO_UNAVAILABLE")
    } else if lower.contains("unsupported url") {
        Some("UNSUPPORTED_URL")
    } else if lower.contains("unable to download webpage")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("network")
    {
        Some("NETWORK")
    } else {
        None
    }
}

fn parse_progress_line(line: &str) -> Option<ProgressSnapshot> {
    if let Some(rest) = line.strip_prefix(PROGRESS_LINE_TAG) {
        let mut parts = rest.split_whitespace();
        let percent = parts.next()?.to_string();
        let speed = parts.next().unwrap_or("N/A").to_string();
        let eta = parts.next().unwrap_or("N/A").to_string();

        return Some(ProgressSnapshot::Downloading { percent, speed, eta });
    }

    static FALLBACK_PROGRESS_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
        Regex::new(r"\[download\]\s+(\d+\.?\d*%)\s+of\s+~?\s*\S+\s+at\s+(\S+)\s+ETA\s+(\S+)").ok()
    });

    let captures = FALLBACK_PROGRESS_RE.as_ref()?.captures(line)?;

    Some(ProgressSnapshot::Downloading {
        percent: captures.get(1)?.as_str().to_string(),
        speed: captures.get(2)?.as_str().to_string(),
        eta: captures.get(3)?.as_str().to_string(),
    })
}

fn parse_destination_line(line: &str) -> Option<String> {
    line.strip_prefix("[download] Destination: ")
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
}

async fn locate_downloaded_file(
    download_dir: &Path,
    video_id: &str,
    reported_path: Option<&Path>,
) -> Result<PathBuf, ApiError> {
    let mut candidates = Vec::new();
    if let Some(reported) = reported_path {
        candidates.push(reported.to_path_buf());
        for extension in POSTPROCESSED_EXTENSIONS {
            candidates.push(reported.with_extension(extension));
        }
    }

    for candidate in candidates {
        match tokio::fs::metadata(&candidate).await {
            Ok(metadata) if metadata.is_file() => return Ok(candidate),
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return Err(ApiError::internal(format!(
                    "Could not inspect downloaded file: {error}"
                )));
            }
        }
    }

    if let Some(newest) = newest_prefixed_file(download_dir, &format!("{video_id}_")).await? {
        return Ok(newest);
    }

    Err(ApiError::file_missing())
}

async fn newest_prefixed_file(
    download_dir: &Path,
    prefix: &str,
) -> Result<Option<PathBuf>, ApiError> {
    let mut entries = tokio::fs::read_dir(download_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not open the downloads directory: {error}"))
    })?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::internal(format!("Could not scan the downloads directory: {error}"))
    })? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if !metadata.is_file() {
            continue;
        }

        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let is_newer = newest
            .as_ref()
            .is_none_or(|(current, _)| created_at > *current);
        if is_newer {
            newest = Some((created_at, entry.path()));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

async fn remove_partial_artifacts(download_dir: &Path, video_id: &str) {
    let prefix = format!("{video_id}_");
    let mut entries = match tokio::fs::read_dir(download_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open the downloads directory for cleanup: {error}");
            }
            return;
        }
    };

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not scan partial downloads: {error}");
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        if !(name.ends_with(".part") || name.ends_with(".ytdl")) {
            continue;
        }

        if let Err(error) = tokio::fs::remove_file(entry.path()).await
            && error.kind() != ErrorKind::NotFound
        {
            warn!("Could not remove partial file {:?}: {error}", entry.path());
        }
    }
}

fn safe_filename(value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::not_found("File not found"));
    }

    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(trimmed.to_string()),
        _ => Err(ApiError::not_found("File not found")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn prune_progress_entries(entries: &mut ProgressMap, now: DateTime<Utc>) {
    entries.retain(|_, entry| (now - entry.updated_at).num_seconds() <= PROGRESS_ENTRY_TTL_SECONDS);
}

fn trim_progress_entries(entries: &mut ProgressMap) {
    if entries.len() <= MAX_PROGRESS_ENTRIES {
        return;
    }

    let overflow = entries.len() - MAX_PROGRESS_ENTRIES;
    let mut stalest = entries
        .iter()
        .map(|(id, entry)| (id.clone(), entry.updated_at))
        .collect::<Vec<_>>();
    stalest.sort_by_key(|(_, updated_at)| *updated_at);

    for (id, _) in stalest.into_iter().take(overflow) {
        entries.remove(&id);
    }
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:5000".to_string()
}

fn build_cors_layer() -> Result<CorsLayer, ApiError> {
    let configured = std::env::var("ALLOWED_ORIGINS")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        debug!("ALLOWED_ORIGINS is not set; allowing any origin");
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]));
    }

    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(normalize_origin)
                .is_some_and(|value| allowed_origins.contains(&value))
        }
    });

    info!("CORS allow-list loaded with {} origin(s)", allowed_origins.len());

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };
    let port = parsed.port();

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    let include_port = port.is_some_and(|explicit| explicit != default_port);

    if include_port {
        Some(format!("{scheme}://{host}:{}", port?))
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
