//! Video rendering: a fire-and-forget ffmpeg pipeline with an in-memory
//! job tracker.
//!
//! `POST /render` answers immediately and the composition runs in a spawned
//! task: scene images (and optional narration audio) are fetched over HTTP,
//! stitched with ffmpeg's concat demuxer, and, when a bucket is configured,
//! uploaded to S3 as a public object. Job state lives only in this process;
//! a restart forgets every job. Two concurrent renders for the same id will
//! race and the later writer wins, which is acceptable at this scale.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use axum::{
    Json, Router,
    body::Body,
    extract::{Extension, Path},
    http::{StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::select;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;

use crate::config;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStatus {
    Rendering,
    Done,
    Error,
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub status: RenderStatus,
    pub local_path: Option<PathBuf>,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl RenderJob {
    fn rendering() -> Self {
        Self {
            status: RenderStatus::Rendering,
            local_path: None,
            url: None,
            error: None,
        }
    }
}

/// videoId -> last known job state. Lost on restart by design.
#[derive(Default)]
pub struct RenderTracker {
    jobs: RwLock<HashMap<String, RenderJob>>,
}

impl RenderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, video_id: &str) -> Option<RenderJob> {
        self.jobs.read().await.get(video_id).cloned()
    }

    /// Overwrites whatever was there before.
    pub async fn start(&self, video_id: &str) {
        self.jobs
            .write()
            .await
            .insert(video_id.to_string(), RenderJob::rendering());
    }

    pub async fn mark_done(&self, video_id: &str, local_path: PathBuf, url: Option<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(video_id) {
            if job.status == RenderStatus::Rendering {
                job.status = RenderStatus::Done;
                job.local_path = Some(local_path);
                job.url = url;
            }
        }
    }

    pub async fn mark_error(&self, video_id: &str, message: impl Into<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(video_id) {
            if job.status == RenderStatus::Rendering {
                job.status = RenderStatus::Error;
                job.error = Some(message.into());
            }
        }
    }
}

/// The composition request: an ordered list of scenes, each an image shown
/// for a number of seconds, plus an optional narration track.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSpec {
    #[allow(dead_code)]
    pub title: Option<String>,
    pub scenes: Vec<RenderScene>,
    pub audio_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderScene {
    pub image_url: String,
    pub duration: Option<f64>,
}

const DEFAULT_SCENE_SECONDS: f64 = 5.0;

pub fn routes() -> Router {
    Router::new()
        .route("/render", post(start_render))
        .route("/status/{video_id}", get(render_status))
        .route("/download/{video_id}", get(download_video))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest {
    video_id: Option<String>,
    video_data: Option<RenderSpec>,
    force: Option<bool>,
}

async fn start_render(
    Extension(tracker): Extension<Arc<RenderTracker>>,
    Json(payload): Json<RenderRequest>,
) -> Result<Response, ApiError> {
    let Some(video_id) = payload.video_id.filter(|id| !id.is_empty()) else {
        return Err(ApiError::bad_request("videoId is required"));
    };
    let Some(spec) = payload.video_data else {
        return Err(ApiError::bad_request("videoData is required"));
    };
    if spec.scenes.is_empty() {
        return Err(ApiError::bad_request("videoData.scenes must not be empty"));
    }

    let existing = tracker.get(&video_id).await;
    if !should_start(existing.as_ref(), payload.force.unwrap_or(false)) {
        let status = existing.map(|j| j.status).unwrap_or(RenderStatus::Rendering);
        return Ok(Json(serde_json::json!({
            "message": "Render already in progress or done",
            "status": status,
        }))
        .into_response());
    }

    tracker.start(&video_id).await;
    tracing::info!("render started for {} ({} scenes)", video_id, spec.scenes.len());

    let task_tracker = tracker.clone();
    let task_id = video_id.clone();
    tokio::spawn(async move {
        run_render(task_tracker, task_id, spec).await;
    });

    Ok(Json(serde_json::json!({
        "message": "Render started",
        "videoId": video_id,
        "status": RenderStatus::Rendering,
    }))
    .into_response())
}

/// A new render may begin unless one is already in flight or finished,
/// except that failed jobs are always retryable and `force` overrides all.
fn should_start(existing: Option<&RenderJob>, force: bool) -> bool {
    match existing {
        None => true,
        Some(job) => force || job.status == RenderStatus::Error,
    }
}

async fn render_status(
    Extension(tracker): Extension<Arc<RenderTracker>>,
    Path(video_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(job) = tracker.get(&video_id).await else {
        return Err(ApiError::not_found("Render job not found"));
    };

    Ok(Json(serde_json::json!({
        "videoId": video_id,
        "status": job.status,
        "url": job.url,
        "error": job.error,
    }))
    .into_response())
}

async fn download_video(
    Extension(tracker): Extension<Arc<RenderTracker>>,
    Path(video_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(job) = tracker.get(&video_id).await else {
        return Err(ApiError::not_found("Render job not found"));
    };
    if job.status != RenderStatus::Done {
        return Err(ApiError::not_found("Video is not ready"));
    }

    if let Some(url) = &job.url {
        return Ok(Redirect::temporary(url).into_response());
    }

    let Some(path) = &job.local_path else {
        return Err(ApiError::not_found("Video is not ready"));
    };
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        tracing::error!("rendered file for {} is gone: {}", video_id, e);
        ApiError::not_found("Video is not ready")
    })?;

    let stream = ReaderStream::new(file);
    let headers = [
        (header::CONTENT_TYPE, "video/mp4".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.mp4\"", video_id),
        ),
    ];
    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

/// Drive one render to completion and record the outcome. Never propagates;
/// every failure lands in the tracker.
async fn run_render(tracker: Arc<RenderTracker>, video_id: String, spec: RenderSpec) {
    match render_video(&video_id, &spec).await {
        Ok(local_path) => {
            let url = match config::s3_bucket() {
                Some(bucket) => match upload_to_s3(&bucket, &local_path, &video_id).await {
                    Ok(url) => {
                        if let Err(e) = tokio::fs::remove_file(&local_path).await {
                            tracing::warn!("could not remove {} after upload: {}", local_path.display(), e);
                        }
                        Some(url)
                    }
                    Err(e) => {
                        // Keep the local file; download falls back to it.
                        tracing::error!("s3 upload failed for {}: {}", video_id, e);
                        None
                    }
                },
                None => None,
            };
            tracing::info!("render finished for {}", video_id);
            tracker.mark_done(&video_id, local_path, url).await;
        }
        Err(message) => {
            tracing::error!("render failed for {}: {}", video_id, message);
            tracker.mark_error(&video_id, message).await;
        }
    }
}

async fn render_video(video_id: &str, spec: &RenderSpec) -> Result<PathBuf, String> {
    let workdir = PathBuf::from(config::render_output_dir()).join(video_id);
    tokio::fs::create_dir_all(&workdir)
        .await
        .map_err(|e| format!("failed to create work directory: {}", e))?;

    let mut scene_entries = Vec::new();
    for (i, scene) in spec.scenes.iter().enumerate() {
        let file_name = format!("scene_{:03}.{}", i, url_extension(&scene.image_url, "png"));
        download_file(&scene.image_url, &workdir.join(&file_name)).await?;
        scene_entries.push((file_name, scene.duration.unwrap_or(DEFAULT_SCENE_SECONDS)));
    }

    let audio_file = match &spec.audio_url {
        Some(url) => {
            let file_name = format!("audio.{}", url_extension(url, "mp3"));
            download_file(url, &workdir.join(&file_name)).await?;
            Some(file_name)
        }
        None => None,
    };

    let list_path = workdir.join("scenes.txt");
    tokio::fs::write(&list_path, build_concat_list(&scene_entries))
        .await
        .map_err(|e| format!("failed to write scene list: {}", e))?;

    let output_name = format!("{}.mp4", video_id);
    let ffmpeg_str = build_ffmpeg_args(audio_file.as_deref(), &output_name);
    tracing::info!("composing {}: ffmpeg {}", video_id, ffmpeg_str);

    run_ffmpeg(&workdir, &ffmpeg_str).await?;

    Ok(workdir.join(output_name))
}

/// Concat demuxer input: one `file`/`duration` pair per scene. The final
/// file is repeated because the demuxer ignores the last duration otherwise.
fn build_concat_list(scenes: &[(String, f64)]) -> String {
    let mut list = String::new();
    for (file, duration) in scenes {
        list.push_str(&format!("file '{}'\nduration {}\n", file, duration));
    }
    if let Some((last, _)) = scenes.last() {
        list.push_str(&format!("file '{}'\n", last));
    }
    list
}

fn build_ffmpeg_args(audio_file: Option<&str>, output_name: &str) -> String {
    let mut args = String::from("-y -f concat -safe 0 -i scenes.txt");

    if let Some(audio) = audio_file {
        args += &format!(" -i {}", audio);
    }

    args += " -c:v libx264 -r 30 -pix_fmt yuv420p -vf scale=trunc(iw/2)*2:trunc(ih/2)*2";

    if audio_file.is_some() {
        args += " -c:a aac -b:a 128k -shortest";
    }

    args += &format!(" {}", output_name);
    args
}

fn url_extension(url: &str, default: &str) -> String {
    url.rsplit('/')
        .next()
        .and_then(|name| name.split('?').next())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| default.to_string())
}

/// Fetch an asset to disk. Rendering via a local copy is far more reliable
/// than handing remote URLs to ffmpeg directly.
async fn download_file(url: &str, path: &FsPath) -> Result<(), String> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("failed to download {}: {}", url, e))?;

    let mut output_file = tokio::fs::File::create(path)
        .await
        .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| format!("failed to read from {}: {}", url, e))?;
        output_file
            .write_all(&chunk)
            .await
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    }

    output_file
        .flush()
        .await
        .map_err(|e| format!("failed to flush {}: {}", path.display(), e))?;

    Ok(())
}

async fn run_ffmpeg(workdir: &FsPath, ffmpeg_string: &str) -> Result<(), String> {
    let args = shlex::split(ffmpeg_string).ok_or("unsplittable ffmpeg command string")?;

    let mut child = Command::new("ffmpeg")
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to start ffmpeg: {}", e))?;

    let stdout = child.stdout.take().ok_or("failed to capture ffmpeg stdout")?;
    let stderr = child.stderr.take().ok_or("failed to capture ffmpeg stderr")?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let mut stderr_lines = vec![];

    loop {
        select! {
            line = stdout_reader.next_line() => {
                match line.map_err(|e| format!("ffmpeg stdout read failed: {}", e))? {
                    Some(line) => tracing::debug!("ffmpeg: {}", line),
                    None => break,
                }
            }
            line = stderr_reader.next_line() => {
                match line.map_err(|e| format!("ffmpeg stderr read failed: {}", e))? {
                    Some(line) => stderr_lines.push(line),
                    None => break,
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("ffmpeg wait failed: {}", e))?;
    if !status.success() {
        let tail: Vec<&str> = stderr_lines
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|s| s.as_str())
            .collect();
        return Err(format!("ffmpeg exited with {}: {}", status, tail.join(" | ")));
    }

    Ok(())
}

/// Multipart upload of the finished mp4, made public so the client can play
/// it straight from the bucket.
async fn upload_to_s3(bucket: &str, path: &FsPath, video_id: &str) -> Result<String, String> {
    let s3_config = aws_config::load_from_env().await;
    let client = S3Client::new(&s3_config);

    let key = format!("videos/{}.mp4", video_id);

    let multi_part_upload = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(&key)
        .acl(ObjectCannedAcl::PublicRead)
        .content_type("video/mp4")
        .send()
        .await
        .map_err(|e| format!("failed to create multipart upload: {}", e))?;

    let upload_id = multi_part_upload
        .upload_id()
        .ok_or("multipart upload id missing")?
        .to_string();

    const CHUNK_SIZE: usize = 5 * 1024 * 1024; // S3 minimum part size
    const BYTES_TO_READ: usize = 64 * 1024;

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    let mut read_buffer = [0u8; BYTES_TO_READ];
    let mut buffer = vec![];
    let mut part_number = 1;
    let mut completed_parts: Vec<CompletedPart> = Vec::new();

    loop {
        let read_bytes = reader
            .read(&mut read_buffer)
            .await
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        if read_bytes == 0 {
            break;
        }

        buffer.extend_from_slice(&read_buffer[..read_bytes]);

        if buffer.len() > CHUNK_SIZE {
            upload_chunk(&client, bucket, &key, &upload_id, part_number, std::mem::take(&mut buffer), &mut completed_parts).await?;
            part_number += 1;
        }
    }

    if !buffer.is_empty() {
        upload_chunk(&client, bucket, &key, &upload_id, part_number, buffer, &mut completed_parts).await?;
    }

    let completed: CompletedMultipartUpload = CompletedMultipartUpload::builder()
        .set_parts(Some(completed_parts))
        .build();

    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(&key)
        .multipart_upload(completed)
        .upload_id(&upload_id)
        .send()
        .await
        .map_err(|e| format!("failed to complete multipart upload: {}", e))?;

    Ok(format!("https://{}.s3.amazonaws.com/{}", bucket, key))
}

async fn upload_chunk(
    client: &S3Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: i32,
    buffer: Vec<u8>,
    completed_parts: &mut Vec<CompletedPart>,
) -> Result<(), String> {
    let bytes = ByteStream::from(buffer);
    let part = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .part_number(part_number)
        .upload_id(upload_id)
        .body(bytes)
        .send()
        .await
        .map_err(|e| format!("failed to upload part {}: {}", part_number, e))?;

    completed_parts.push(
        CompletedPart::builder()
            .part_number(part_number)
            .e_tag(part.e_tag().unwrap_or("not set").to_string())
            .build(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_transitions_to_done() {
        let tracker = RenderTracker::new();
        tracker.start("vid-1").await;
        assert_eq!(tracker.get("vid-1").await.unwrap().status, RenderStatus::Rendering);

        tracker
            .mark_done("vid-1", PathBuf::from("/tmp/vid-1.mp4"), Some("https://cdn/vid-1".into()))
            .await;
        let job = tracker.get("vid-1").await.unwrap();
        assert_eq!(job.status, RenderStatus::Done);
        assert_eq!(job.url.as_deref(), Some("https://cdn/vid-1"));
    }

    #[tokio::test]
    async fn tracker_transitions_to_error() {
        let tracker = RenderTracker::new();
        tracker.start("vid-2").await;
        tracker.mark_error("vid-2", "ffmpeg exploded").await;

        let job = tracker.get("vid-2").await.unwrap();
        assert_eq!(job.status, RenderStatus::Error);
        assert_eq!(job.error.as_deref(), Some("ffmpeg exploded"));
    }

    #[tokio::test]
    async fn finished_jobs_do_not_revert() {
        let tracker = RenderTracker::new();
        tracker.start("vid-3").await;
        tracker.mark_done("vid-3", PathBuf::from("/tmp/vid-3.mp4"), None).await;
        tracker.mark_error("vid-3", "late failure").await;

        assert_eq!(tracker.get("vid-3").await.unwrap().status, RenderStatus::Done);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let tracker = RenderTracker::new();
        assert!(tracker.get("nope").await.is_none());
    }

    #[test]
    fn start_rules() {
        let rendering = RenderJob::rendering();
        let mut done = RenderJob::rendering();
        done.status = RenderStatus::Done;
        let mut failed = RenderJob::rendering();
        failed.status = RenderStatus::Error;

        assert!(should_start(None, false));
        assert!(!should_start(Some(&rendering), false));
        assert!(!should_start(Some(&done), false));
        assert!(should_start(Some(&failed), false));
        assert!(should_start(Some(&rendering), true));
        assert!(should_start(Some(&done), true));
    }

    #[test]
    fn concat_list_repeats_final_frame() {
        let scenes = vec![
            ("scene_000.png".to_string(), 3.0),
            ("scene_001.png".to_string(), 4.5),
        ];
        let list = build_concat_list(&scenes);

        assert!(list.contains("file 'scene_000.png'\nduration 3\n"));
        assert!(list.contains("file 'scene_001.png'\nduration 4.5\n"));
        assert!(list.ends_with("file 'scene_001.png'\n"));
    }

    #[test]
    fn ffmpeg_args_with_audio() {
        let args = build_ffmpeg_args(Some("audio.mp3"), "vid.mp4");
        assert!(args.contains("-i audio.mp3"));
        assert!(args.contains("-c:a aac"));
        assert!(args.contains("-shortest"));
        assert!(args.ends_with("vid.mp4"));
        assert!(shlex::split(&args).is_some());
    }

    #[test]
    fn ffmpeg_args_without_audio() {
        let args = build_ffmpeg_args(None, "vid.mp4");
        assert!(!args.contains("-c:a"));
        assert!(!args.contains("-shortest"));
        assert!(shlex::split(&args).is_some());
    }

    #[test]
    fn extension_extraction() {
        assert_eq!(url_extension("https://cdn/x/slide.PNG", "png"), "png");
        assert_eq!(url_extension("https://cdn/x/track.mp3?sig=abc", "mp3"), "mp3");
        assert_eq!(url_extension("https://cdn/x/noext", "png"), "png");
        assert_eq!(url_extension("https://cdn/x/odd.tar.gz2000", "png"), "png");
    }
}
