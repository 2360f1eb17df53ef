//! Encode capability seam and the FFmpeg-backed implementation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use encnode_models::EncodingProfile;

use crate::error::{WorkerError, WorkerResult};

/// Playlist written for each rendition.
pub const VARIANT_PLAYLIST: &str = "index.m3u8";

/// Progress callback, percent in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EncodeRequest {
    /// URI or content address of the source video
    pub source_ref: String,
    pub profile: EncodingProfile,
    /// Directory that receives the rendition's playlist and segments
    pub output_dir: PathBuf,
    pub max_duration_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedOutput {
    pub dir: PathBuf,
    /// Playlist file name inside `dir`
    pub playlist: String,
    pub profile: EncodingProfile,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, request: &EncodeRequest, progress: ProgressFn) -> WorkerResult<EncodedOutput>;
}

/// Runs an FFmpeg-compatible binary producing one HLS rendition.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    command: String,
    ipfs_gateway_url: String,
    timeout: Duration,
}

impl CommandEncoder {
    pub fn new(command: impl Into<String>, ipfs_gateway_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            ipfs_gateway_url: ipfs_gateway_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Map `ipfs://` references onto the HTTP gateway; other references pass through.
    pub fn resolve_source(&self, source_ref: &str) -> String {
        match source_ref.strip_prefix("ipfs://") {
            Some(path) => format!("{}/ipfs/{}", self.ipfs_gateway_url, path),
            None => source_ref.to_string(),
        }
    }

    pub fn build_args(&self, request: &EncodeRequest) -> Vec<String> {
        let profile = &request.profile;
        let dir = &request.output_dir;
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-progress".into(),
            "pipe:2".into(),
            "-i".into(),
            self.resolve_source(&request.source_ref),
        ];
        if let Some(limit) = request.max_duration_secs {
            args.push("-t".into());
            args.push(limit.to_string());
        }
        args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-vf".to_string(),
            format!("scale=-2:{}", profile.height),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-b:v".to_string(),
            format!("{}k", profile.video_bitrate_kbps),
            "-maxrate".to_string(),
            format!("{}k", profile.video_bitrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", profile.video_bitrate_kbps * 2),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", profile.audio_bitrate_kbps),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            "6".to_string(),
            "-hls_playlist_type".to_string(),
            "vod".to_string(),
            "-hls_segment_filename".to_string(),
            dir.join("segment_%03d.ts").to_string_lossy().into_owned(),
            dir.join(VARIANT_PLAYLIST).to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn encode(&self, request: &EncodeRequest, progress: ProgressFn) -> WorkerResult<EncodedOutput> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let args = self.build_args(request);
        debug!("Running encoder: {} {}", self.command, args.join(" "));

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::encode_failed(format!("cannot start {}: {}", self.command, e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::encode_failed("encoder stderr not captured"))?;
        let limit_us = request.max_duration_secs.map(|s| u64::from(s) * 1_000_000);
        let reporter = Arc::clone(&progress);
        let reader_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail: Vec<String> = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_progress(&line, limit_us) {
                    reporter(percent);
                } else if !line.contains('=') {
                    tail.push(line);
                    if tail.len() > 20 {
                        tail.remove(0);
                    }
                }
            }
            tail
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Encoder timed out, killing process");
                let _ = child.kill().await;
                return Err(WorkerError::encode_failed(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        let tail = reader_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(WorkerError::encode_failed(format!(
                "{} exited with {:?}: {}",
                self.command,
                status.code(),
                tail.join(" | ")
            )));
        }
        if !Path::new(&request.output_dir.join(VARIANT_PLAYLIST)).exists() {
            return Err(WorkerError::encode_failed("encoder produced no playlist"));
        }

        progress(100);
        Ok(EncodedOutput {
            dir: request.output_dir.clone(),
            playlist: VARIANT_PLAYLIST.to_string(),
            profile: request.profile.clone(),
        })
    }
}

/// Percent complete from one `-progress` line, when it can be derived.
fn parse_progress(line: &str, limit_us: Option<u64>) -> Option<u8> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(100),
        "out_time_us" | "out_time_ms" => {
            // FFmpeg reports both keys in microseconds.
            let done: u64 = value.parse().ok()?;
            let total = limit_us.filter(|t| *t > 0)?;
            Some(((done.min(total) * 100) / total) as u8)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max: Option<u32>) -> EncodeRequest {
        EncodeRequest {
            source_ref: "ipfs://QmSource".into(),
            profile: EncodingProfile::p720(),
            output_dir: PathBuf::from("/tmp/out/720p"),
            max_duration_secs: max,
        }
    }

    #[test]
    fn test_args_for_short_job() {
        let encoder = CommandEncoder::new("ffmpeg", "http://127.0.0.1:8080/", Duration::from_secs(10));
        let args = encoder.build_args(&request(Some(60)));

        assert!(args.contains(&"http://127.0.0.1:8080/ipfs/QmSource".to_string()));
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert_eq!(args[t + 1], "60");
        assert!(args.contains(&"scale=-2:720".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out/720p/index.m3u8");
    }

    #[test]
    fn test_http_source_passes_through() {
        let encoder = CommandEncoder::new("ffmpeg", "http://gw", Duration::from_secs(10));
        assert_eq!(encoder.resolve_source("https://cdn/x.mp4"), "https://cdn/x.mp4");
        assert!(!encoder.build_args(&request(None)).contains(&"-t".to_string()));
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("progress=end", None), Some(100));
        assert_eq!(parse_progress("out_time_us=30000000", Some(60_000_000)), Some(50));
        assert_eq!(parse_progress("out_time_us=30000000", None), None);
        assert_eq!(parse_progress("frame=12", Some(1)), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_encode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = CommandEncoder::new("/nonexistent/encoder-bin", "http://gw", Duration::from_secs(5));
        let mut req = request(None);
        req.output_dir = dir.path().join("720p");

        let err = encoder.encode(&req, Arc::new(|_| {})).await.unwrap_err();
        assert!(matches!(err, WorkerError::EncodeFailed(_)));
    }
}
