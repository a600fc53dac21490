use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::ProviderSession;
use crate::workflow::StepName;

use super::error::{MediaError, MediaResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointLabel {
    pub step: StepName,
    pub sub: Option<String>,
}

impl CheckpointLabel {
    pub fn new(step: StepName, sub: impl Into<String>) -> Self {
        Self {
            step,
            sub: Some(sub.into()),
        }
    }

    pub fn step(step: StepName) -> Self {
        Self { step, sub: None }
    }

    fn file_stem(&self) -> String {
        match &self.sub {
            Some(sub) => format!("{}_{}", self.step.slug(), sanitize(sub)),
            None => self.step.slug().to_string(),
        }
    }
}

impl fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub {
            Some(sub) => write!(f, "{}/{}", self.step.slug(), sub),
            None => f.write_str(self.step.slug()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub session_id: String,
    pub sequence: u64,
    pub label: CheckpointLabel,
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScreenshotValidation {
    pub total: usize,
    pub valid: usize,
    pub missing: Vec<PathBuf>,
    pub empty: Vec<PathBuf>,
}

impl ScreenshotValidation {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.empty.is_empty()
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    next_sequence: u64,
    frames: Vec<Screenshot>,
}

/// Session-scoped frame collection. Sequence numbers start at 1 and advance
/// only when a frame has been written to disk.
#[derive(Debug)]
pub struct ScreenshotRecorder {
    session_id: String,
    directory: PathBuf,
    settle_delay: Duration,
    state: Mutex<RecorderState>,
}

impl ScreenshotRecorder {
    pub async fn create(
        base_dir: impl AsRef<Path>,
        city: &str,
        session_id: &str,
        settle_delay: Duration,
    ) -> MediaResult<Self> {
        let directory = base_dir
            .as_ref()
            .join(session_directory_name(city, session_id, Utc::now()));
        fs::create_dir_all(&directory)
            .await
            .map_err(|err| MediaError::io(&directory, err))?;
        info!(session = session_id, dir = %directory.display(), "screenshot session started");
        Ok(Self {
            session_id: session_id.to_string(),
            directory,
            settle_delay,
            state: Mutex::new(RecorderState {
                next_sequence: 1,
                frames: Vec::new(),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub async fn capture(
        &self,
        session: &mut dyn ProviderSession,
        label: CheckpointLabel,
    ) -> MediaResult<Screenshot> {
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }
        let bytes = session.screenshot().await?;
        if bytes.is_empty() {
            return Err(MediaError::MalformedFrame {
                path: self.directory.clone(),
                reason: format!("provider returned an empty screenshot for {label}"),
            });
        }

        let staging = self
            .directory
            .join(format!(".{}_{}.partial", label.file_stem(), Uuid::new_v4().simple()));
        fs::write(&staging, &bytes)
            .await
            .map_err(|err| MediaError::io(&staging, err))?;

        // Reserve, rename and commit under one lock.
        let screenshot = {
            let mut state = self.state.lock().unwrap();
            let sequence = state.next_sequence;
            let path = self
                .directory
                .join(format!("{sequence:03}_{}.png", label.file_stem()));
            if let Err(err) = std::fs::rename(&staging, &path) {
                let _ = std::fs::remove_file(&staging);
                return Err(MediaError::io(&path, err));
            }
            let screenshot = Screenshot {
                session_id: self.session_id.clone(),
                sequence,
                label,
                path,
                captured_at: Utc::now(),
            };
            state.next_sequence = sequence + 1;
            state.frames.push(screenshot.clone());
            screenshot
        };
        let sequence = screenshot.sequence;
        debug!(
            session = %self.session_id,
            sequence,
            label = %screenshot.label,
            bytes = bytes.len(),
            "screenshot captured"
        );
        Ok(screenshot)
    }

    pub fn frames(&self) -> Vec<Screenshot> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn validate(&self) -> ScreenshotValidation {
        let frames = self.frames();
        let mut report = ScreenshotValidation {
            total: frames.len(),
            ..ScreenshotValidation::default()
        };
        for frame in frames {
            match fs::metadata(&frame.path).await {
                Ok(meta) if meta.len() > 0 => report.valid += 1,
                Ok(_) => report.empty.push(frame.path),
                Err(_) => report.missing.push(frame.path),
            }
        }
        if !report.is_complete() {
            warn!(
                session = %self.session_id,
                missing = report.missing.len(),
                empty = report.empty.len(),
                "screenshot collection is incomplete"
            );
        }
        report
    }
}

pub fn session_directory_name(city: &str, session_id: &str, at: DateTime<Utc>) -> String {
    let short_id = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>();
    format!(
        "{}_{}_{}",
        city_slug(city),
        at.format("%Y%m%d_%H%M%S"),
        short_id
    )
}

pub fn city_slug(city: &str) -> String {
    let slug = sanitize(&city.trim().to_lowercase());
    if slug.is_empty() {
        "unknown".into()
    } else {
        slug
    }
}

fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Removes session directories under `base_dir` that are at least `keep` old.
pub fn prune_sessions(base_dir: impl AsRef<Path>, keep: Duration) -> MediaResult<usize> {
    let base_dir = base_dir.as_ref();
    if !base_dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let mut removed = 0;
    let entries = std::fs::read_dir(base_dir).map_err(|err| MediaError::io(base_dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| MediaError::io(base_dir, err))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(|err| MediaError::io(&path, err))?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= keep {
            std::fs::remove_dir_all(&path).map_err(|err| MediaError::io(&path, err))?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(removed, dir = %base_dir.display(), "pruned old screenshot sessions");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{
        ActionOutcome, ActionSpec, AutomationError, AutomationResult, PageSnapshot, PageState,
    };
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StaticCamera {
        frames: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl ProviderSession for StaticCamera {
        fn id(&self) -> &str {
            "camera"
        }

        async fn perform(&mut self, _action: &ActionSpec) -> AutomationResult<ActionOutcome> {
            Ok(ActionOutcome::default())
        }

        async fn page_state(&mut self) -> AutomationResult<PageState> {
            Ok(PageState::default())
        }

        async fn screenshot(&mut self) -> AutomationResult<Vec<u8>> {
            if self.frames.is_empty() {
                return Err(AutomationError::Transport("camera offline".into()));
            }
            Ok(self.frames.remove(0))
        }

        async fn snapshot(&mut self) -> AutomationResult<PageSnapshot> {
            Ok(PageSnapshot::default())
        }

        async fn current_url(&mut self) -> AutomationResult<Option<String>> {
            Ok(None)
        }

        async fn close(self: Box<Self>) -> AutomationResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sequence_starts_at_one_without_gaps() {
        let dir = tempdir().unwrap();
        let recorder = ScreenshotRecorder::create(
            dir.path(),
            "Milton Keynes",
            "abcd-1234-ef",
            Duration::ZERO,
        )
        .await
        .unwrap();
        let mut camera = StaticCamera {
            frames: vec![vec![1], vec![], vec![2]],
        };

        let first = recorder
            .capture(&mut camera, CheckpointLabel::step(StepName::Navigate))
            .await
            .unwrap();
        let empty = recorder
            .capture(&mut camera, CheckpointLabel::new(StepName::SearchCity, "typed"))
            .await;
        assert!(empty.is_err());
        let second = recorder
            .capture(&mut camera, CheckpointLabel::new(StepName::SearchCity, "typed"))
            .await
            .unwrap();
        let offline = recorder
            .capture(&mut camera, CheckpointLabel::new(StepName::SearchCity, "clicked"))
            .await
            .unwrap_err();
        assert!(matches!(offline, MediaError::Capture(_)));

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.path.ends_with("002_search_city_typed.png"));
        assert_eq!(recorder.len(), 2);
        let dir_name = recorder.directory().file_name().unwrap().to_string_lossy().to_string();
        assert!(dir_name.starts_with("milton_keynes_"));
        assert!(dir_name.ends_with("_abcd1234"));

        let validation = recorder.validate().await;
        assert!(validation.is_complete());
        assert_eq!(validation.valid, 2);
    }

    #[tokio::test]
    async fn concurrent_captures_get_distinct_sequences() {
        let dir = tempdir().unwrap();
        let recorder = ScreenshotRecorder::create(dir.path(), "York", "s2", Duration::ZERO)
            .await
            .unwrap();
        let camera = |fill: u8| StaticCamera {
            frames: vec![vec![fill; 64]],
        };
        let (mut a, mut b, mut c) = (camera(1), camera(2), camera(3));

        let (first, second, third) = tokio::join!(
            recorder.capture(&mut a, CheckpointLabel::new(StepName::Scroll, "scroll_01")),
            recorder.capture(&mut b, CheckpointLabel::new(StepName::Scroll, "scroll_02")),
            recorder.capture(&mut c, CheckpointLabel::new(StepName::Scroll, "scroll_03")),
        );

        let mut sequences = vec![
            first.unwrap().sequence,
            second.unwrap().sequence,
            third.unwrap().sequence,
        ];
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3]);
        let frames = recorder.frames();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|frame| frame.path.exists()));
        let leftovers = std::fs::read_dir(recorder.directory())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn validation_reports_missing_frames() {
        let dir = tempdir().unwrap();
        let recorder = ScreenshotRecorder::create(dir.path(), "Leeds", "s1", Duration::ZERO)
            .await
            .unwrap();
        let mut camera = StaticCamera {
            frames: vec![vec![7, 7]],
        };
        let shot = recorder
            .capture(&mut camera, CheckpointLabel::step(StepName::Navigate))
            .await
            .unwrap();
        std::fs::remove_file(&shot.path).unwrap();
        let validation = recorder.validate().await;
        assert_eq!(validation.missing, vec![shot.path]);
        assert!(!validation.is_complete());
    }

    #[test]
    fn prune_removes_only_old_sessions() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("leeds_20240101_000000_aaaa")).unwrap();
        std::fs::write(dir.path().join("loose.png"), b"x").unwrap();
        assert_eq!(prune_sessions(dir.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(prune_sessions(dir.path(), Duration::ZERO).unwrap(), 1);
        assert!(dir.path().join("loose.png").exists());
        assert_eq!(prune_sessions(dir.path().join("absent"), Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn slugs_are_filesystem_safe() {
        assert_eq!(city_slug("  Stoke-on-Trent "), "stoke_on_trent");
        assert_eq!(city_slug("!!!"), "unknown");
    }
}
