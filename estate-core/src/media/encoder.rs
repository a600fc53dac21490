use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::VideoSection;

use super::error::{MediaError, MediaResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    /// Frames already in playback order.
    pub frames: Vec<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub output: PathBuf,
}

#[async_trait]
pub trait FrameEncoder: Send + Sync {
    fn name(&self) -> &str;

    async fn encode(&self, request: &EncodeRequest) -> MediaResult<()>;

    /// Container-reported duration of an encoded file, when the encoder can measure it.
    async fn probe_duration(&self, _path: &Path) -> Option<f64> {
        None
    }
}

/// H.264/MP4 encoder backed by the `ffmpeg` binary.
///
/// Frames are staged under sequential names in a temporary directory and read
/// with the image2 demuxer, so the output holds exactly one frame per input.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
    probe_binary: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(config: &VideoSection) -> Self {
        Self {
            binary: PathBuf::from(&config.ffmpeg_binary),
            probe_binary: PathBuf::from(&config.ffprobe_binary),
            timeout: Duration::from_secs(config.timeout_seconds.max(1)),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    pub fn build_args(staging: &Path, request: &EncodeRequest) -> Vec<OsString> {
        let (w, h) = (request.width, request.height);
        let filter = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color=black,setsar=1"
        );
        let mut args: Vec<OsString> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-framerate".into(),
            request.frame_rate.to_string().into(),
            "-start_number".into(),
            "1".into(),
            "-i".into(),
        ];
        args.push(staging.join("frame_%06d.png").into_os_string());
        for arg in [
            "-vf",
            filter.as_str(),
            "-an",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-r",
        ] {
            args.push(arg.into());
        }
        args.push(request.frame_rate.to_string().into());
        args.push("-movflags".into());
        args.push("+faststart".into());
        args.push(request.output.clone().into_os_string());
        args
    }

    async fn stage_frames(&self, request: &EncodeRequest) -> MediaResult<TempDir> {
        let staging = tempfile::Builder::new()
            .prefix("estate-frames-")
            .tempdir()
            .map_err(|err| MediaError::io(std::env::temp_dir(), err))?;
        for (index, frame) in request.frames.iter().enumerate() {
            let target = staging.path().join(format!("frame_{:06}.png", index + 1));
            if fs::hard_link(frame, &target).await.is_err() {
                fs::copy(frame, &target)
                    .await
                    .map_err(|err| MediaError::io(frame, err))?;
            }
        }
        Ok(staging)
    }
}

#[async_trait]
impl FrameEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn encode(&self, request: &EncodeRequest) -> MediaResult<()> {
        if request.frames.is_empty() {
            return Err(MediaError::NoFrames);
        }
        let staging = self.stage_frames(request).await?;
        let args = Self::build_args(staging.path(), request);
        info!(
            frames = request.frames.len(),
            fps = request.frame_rate,
            width = request.width,
            height = request.height,
            output = %request.output.display(),
            "encoding video"
        );
        debug!(binary = %self.binary.display(), ?args, "ffmpeg invocation");

        let mut command = Command::new(&self.binary);
        command.args(&args).kill_on_drop(true);
        let output = match timeout(self.timeout, command.output()).await {
            Err(_) => return Err(MediaError::EncoderTimeout(self.timeout)),
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(MediaError::EncoderUnavailable(
                    self.binary.display().to_string(),
                ))
            }
            Ok(Err(err)) => return Err(MediaError::io(&self.binary, err)),
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            return Err(MediaError::EncoderFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match fs::metadata(&request.output).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(MediaError::EncoderFailed {
                status: output.status.to_string(),
                stderr: "encoder produced no output file".into(),
            }),
        }
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let mut command = Command::new(&self.probe_binary);
        command
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .kill_on_drop(true);
        let output = timeout(Duration::from_secs(30), command.output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}
