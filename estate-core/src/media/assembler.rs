use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::config::VideoSection;

use super::encoder::{EncodeRequest, FrameEncoder};
use super::error::{MediaError, MediaResult};
use super::recorder::{city_slug, Screenshot};

#[derive(Debug, Clone, Serialize)]
pub struct VideoArtifact {
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    pub session_id: String,
    pub frame_count: usize,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub sha256: String,
    pub probed_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct ManifestFrame<'a> {
    sequence: u64,
    label: String,
    path: &'a Path,
}

#[derive(Debug, Clone, Serialize)]
struct VideoManifest<'a> {
    session_id: &'a str,
    city: &'a str,
    created_at: DateTime<Utc>,
    encoder: &'a str,
    frame_rate: u32,
    width: u32,
    height: u32,
    duration_seconds: f64,
    sha256: &'a str,
    frames: Vec<ManifestFrame<'a>>,
}

/// Exact playback length of `frame_count` frames at `frame_rate`.
pub fn expected_duration(frame_count: usize, frame_rate: u32) -> Duration {
    if frame_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(frame_count as u64 * 1_000_000_000 / frame_rate as u64)
}

#[derive(Clone)]
pub struct VideoAssembler {
    encoder: Arc<dyn FrameEncoder>,
    output_dir: PathBuf,
    width: u32,
    height: u32,
    frame_rate: u32,
}

impl VideoAssembler {
    pub fn new(config: &VideoSection, encoder: Arc<dyn FrameEncoder>) -> Self {
        Self {
            encoder,
            output_dir: PathBuf::from(&config.output_dir),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
        }
    }

    /// Orders and validates the frames, hands them to the encoder and describes the result.
    pub async fn assemble(
        &self,
        screenshots: &[Screenshot],
        city: &str,
    ) -> MediaResult<VideoArtifact> {
        let frames = order_frames(screenshots)?;
        for frame in &frames {
            validate_frame(&frame.path)?;
        }
        let session_id = frames[0].session_id.clone();

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| MediaError::io(&self.output_dir, err))?;
        let stem = format!(
            "{}_{}",
            city_slug(city),
            session_id
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(8)
                .collect::<String>()
        );
        let output = self.output_dir.join(format!("{stem}.mp4"));
        let manifest_path = self.output_dir.join(format!("{stem}.json"));

        let request = EncodeRequest {
            frames: frames.iter().map(|frame| frame.path.clone()).collect(),
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            output: output.clone(),
        };
        self.encoder.encode(&request).await?;

        let size_bytes = fs::metadata(&output)
            .await
            .map_err(|err| MediaError::io(&output, err))?
            .len();
        let sha256 = compute_sha256(&output).await?;
        let duration_seconds = expected_duration(frames.len(), self.frame_rate).as_secs_f64();
        let probed_duration_seconds = self.encoder.probe_duration(&output).await;

        let manifest = VideoManifest {
            session_id: &session_id,
            city,
            created_at: Utc::now(),
            encoder: self.encoder.name(),
            frame_rate: self.frame_rate,
            width: self.width,
            height: self.height,
            duration_seconds,
            sha256: &sha256,
            frames: frames
                .iter()
                .map(|frame| ManifestFrame {
                    sequence: frame.sequence,
                    label: frame.label.to_string(),
                    path: &frame.path,
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, json)
            .await
            .map_err(|err| MediaError::io(&manifest_path, err))?;

        info!(
            session = %session_id,
            frames = frames.len(),
            duration_seconds,
            size_bytes,
            path = %output.display(),
            "video assembled"
        );
        Ok(VideoArtifact {
            path: output,
            manifest_path,
            session_id,
            frame_count: frames.len(),
            frame_rate: self.frame_rate,
            width: self.width,
            height: self.height,
            duration_seconds,
            size_bytes,
            sha256,
            probed_duration_seconds,
        })
    }
}

/// Sorts by sequence number and enforces a single session with unique sequences.
pub fn order_frames(screenshots: &[Screenshot]) -> MediaResult<Vec<&Screenshot>> {
    if screenshots.is_empty() {
        return Err(MediaError::NoFrames);
    }
    let sessions = screenshots
        .iter()
        .map(|shot| shot.session_id.as_str())
        .collect::<BTreeSet<_>>();
    if sessions.len() > 1 {
        return Err(MediaError::MixedSessions(
            sessions.into_iter().map(str::to_string).collect(),
        ));
    }
    let mut frames = screenshots.iter().collect::<Vec<_>>();
    frames.sort_by_key(|shot| shot.sequence);
    if let Some(pair) = frames.windows(2).find(|pair| pair[0].sequence == pair[1].sequence) {
        return Err(MediaError::DuplicateSequence(pair[0].sequence));
    }
    Ok(frames)
}

fn validate_frame(path: &Path) -> MediaResult<()> {
    image::image_dimensions(path)
        .map(|_| ())
        .map_err(|err| MediaError::MalformedFrame {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

async fn compute_sha256(path: &Path) -> MediaResult<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|err| MediaError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| MediaError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::recorder::CheckpointLabel;
    use crate::workflow::StepName;
    use async_trait::async_trait;
    use image::{ImageBuffer, Rgb};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingEncoder {
        requests: Mutex<Vec<EncodeRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameEncoder for RecordingEncoder {
        fn name(&self) -> &str {
            "recording"
        }

        async fn encode(&self, request: &EncodeRequest) -> MediaResult<()> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(MediaError::EncoderFailed {
                    status: "exit status: 1".into(),
                    stderr: "Invalid data found when processing input".into(),
                });
            }
            std::fs::write(&request.output, b"fake mp4").unwrap();
            Ok(())
        }
    }

    fn write_frames(dir: &Path, count: usize, session: &str) -> Vec<Screenshot> {
        (1..=count as u64)
            .map(|sequence| {
                let path = dir.join(format!("{sequence:03}_scroll.png"));
                ImageBuffer::from_pixel(4, 4, Rgb([sequence as u8, 0u8, 0u8]))
                    .save(&path)
                    .unwrap();
                Screenshot {
                    session_id: session.into(),
                    sequence,
                    label: CheckpointLabel::new(
                        StepName::Scroll,
                        format!("scroll_{sequence:02}"),
                    ),
                    path,
                    captured_at: Utc::now(),
                }
            })
            .collect()
    }

    fn assembler(dir: &Path, encoder: Arc<RecordingEncoder>) -> VideoAssembler {
        VideoAssembler::new(
            &VideoSection {
                output_dir: dir.join("videos").to_string_lossy().to_string(),
                ..VideoSection::default()
            },
            encoder,
        )
    }

    #[tokio::test]
    async fn twenty_four_frames_at_two_fps_last_twelve_seconds() {
        let dir = tempdir().unwrap();
        let mut frames = write_frames(dir.path(), 24, "session-a");
        frames.reverse();
        let encoder = Arc::new(RecordingEncoder::default());
        let artifact = assembler(dir.path(), Arc::clone(&encoder))
            .assemble(&frames, "Bristol")
            .await
            .unwrap();

        assert_eq!(artifact.frame_count, 24);
        assert_eq!(artifact.duration_seconds, 12.0);
        assert_eq!(expected_duration(24, 2), Duration::from_secs(12));
        assert_eq!((artifact.width, artifact.height), (1280, 720));
        assert_eq!(artifact.size_bytes, 8);
        assert_eq!(artifact.sha256.len(), 64);
        assert!(artifact.manifest_path.exists());

        let requests = encoder.requests.lock().unwrap();
        let ordered = requests[0]
            .frames
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        let mut sorted = ordered.clone();
        sorted.sort();
        assert_eq!(ordered, sorted);
        assert_eq!(requests[0].frame_rate, 2);
    }

    #[tokio::test]
    async fn rejects_empty_and_mixed_input() {
        let dir = tempdir().unwrap();
        let encoder = Arc::new(RecordingEncoder::default());
        let assembler = assembler(dir.path(), Arc::clone(&encoder));
        assert!(matches!(
            assembler.assemble(&[], "Bristol").await,
            Err(MediaError::NoFrames)
        ));

        let mut frames = write_frames(dir.path(), 2, "session-a");
        frames[1].session_id = "session-b".into();
        assert!(matches!(
            assembler.assemble(&frames, "Bristol").await,
            Err(MediaError::MixedSessions(_))
        ));
        assert!(encoder.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_fail_before_encoding() {
        let dir = tempdir().unwrap();
        let frames = write_frames(dir.path(), 2, "session-a");
        std::fs::write(&frames[1].path, b"not a png").unwrap();
        let encoder = Arc::new(RecordingEncoder::default());
        let err = assembler(dir.path(), Arc::clone(&encoder))
            .assemble(&frames, "Bristol")
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::MalformedFrame { .. }));
        assert!(encoder.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn encoder_failure_is_surfaced() {
        let dir = tempdir().unwrap();
        let frames = write_frames(dir.path(), 3, "session-a");
        let encoder = Arc::new(RecordingEncoder {
            fail: true,
            ..RecordingEncoder::default()
        });
        let err = assembler(dir.path(), encoder)
            .assemble(&frames, "Bristol")
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::EncoderFailed { .. }));
    }
}
