use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::browser::{AutomationResult, PropertyRecord, Session, SessionMetrics};
use crate::config::PrimaryObjective;
use crate::media::{city_slug, Screenshot, VideoArtifact};

use super::step::{StepName, StepOutcome, StepRecord};

/// Outcome of one workflow execution. Built once by [`RunReportBuilder`] and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    city: String,
    success: bool,
    objective: PrimaryObjective,
    session: Option<Session>,
    steps: Vec<StepRecord>,
    steps_completed: Vec<String>,
    screenshots: Vec<Screenshot>,
    property: Option<PropertyRecord>,
    property_url: Option<String>,
    video: Option<VideoArtifact>,
    error: Option<String>,
    aborted_at: Option<StepName>,
    metrics: SessionMetrics,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
}

impl RunResult {
    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn objective(&self) -> PrimaryObjective {
        self.objective
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::id)
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn step(&self, name: StepName) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.name == name)
    }

    /// Descriptions of the steps that succeeded, in execution order.
    pub fn steps_completed(&self) -> &[String] {
        &self.steps_completed
    }

    pub fn screenshots(&self) -> &[Screenshot] {
        &self.screenshots
    }

    pub fn screenshot_paths(&self) -> Vec<&Path> {
        self.screenshots.iter().map(|shot| shot.path.as_path()).collect()
    }

    pub fn property(&self) -> Option<&PropertyRecord> {
        self.property.as_ref()
    }

    pub fn property_url(&self) -> Option<&str> {
        self.property_url.as_deref()
    }

    pub fn video(&self) -> Option<&VideoArtifact> {
        self.video.as_ref()
    }

    pub fn video_path(&self) -> Option<&Path> {
        self.video.as_ref().map(|video| video.path.as_path())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn aborted_at(&self) -> Option<StepName> {
        self.aborted_at
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn results_file_name(&self) -> String {
        format!("automation_results_{}.json", city_slug(&self.city))
    }

    /// Writes the result as pretty JSON into `dir` and returns the file path.
    pub async fn write_json(&self, dir: impl AsRef<Path>) -> AutomationResult<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(self.results_file_name());
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::from)?;
        fs::write(&path, json).await?;
        info!(city = %self.city, path = %path.display(), "run result written");
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct RunReportBuilder {
    city: String,
    objective: PrimaryObjective,
    started_at: DateTime<Utc>,
    session: Option<Session>,
    steps: Vec<StepRecord>,
    screenshots: Vec<Screenshot>,
    property: Option<PropertyRecord>,
    property_url: Option<String>,
    video: Option<VideoArtifact>,
    error: Option<String>,
    aborted_at: Option<StepName>,
    metrics: SessionMetrics,
}

impl RunReportBuilder {
    pub fn new(city: impl Into<String>, objective: PrimaryObjective) -> Self {
        Self {
            city: city.into(),
            objective,
            started_at: Utc::now(),
            session: None,
            steps: Vec::new(),
            screenshots: Vec::new(),
            property: None,
            property_url: None,
            video: None,
            error: None,
            aborted_at: None,
            metrics: SessionMetrics::default(),
        }
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }

    pub fn session(mut self, session: Option<Session>) -> Self {
        self.session = session;
        self
    }

    pub fn steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.steps = steps;
        self
    }

    pub fn screenshots(mut self, mut screenshots: Vec<Screenshot>) -> Self {
        screenshots.sort_by_key(|shot| shot.sequence);
        self.screenshots = screenshots;
        self
    }

    pub fn property(mut self, property: Option<PropertyRecord>) -> Self {
        self.property = property;
        self
    }

    pub fn property_url(mut self, url: Option<String>) -> Self {
        self.property_url = url;
        self
    }

    pub fn video(mut self, video: Option<VideoArtifact>) -> Self {
        self.video = video;
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn aborted_at(mut self, step: Option<StepName>) -> Self {
        self.aborted_at = step;
        self
    }

    pub fn metrics(mut self, metrics: SessionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> RunResult {
        let finished_at = Utc::now();
        let steps_completed = self
            .steps
            .iter()
            .filter(|record| record.outcome == StepOutcome::Success)
            .map(|record| record.name.description().to_string())
            .collect();
        let success = objective_met(self.objective, self.property.is_some(), self.video.is_some());
        RunResult {
            city: self.city,
            success,
            objective: self.objective,
            session: self.session,
            steps: self.steps,
            steps_completed,
            screenshots: self.screenshots,
            property: self.property,
            property_url: self.property_url,
            video: self.video,
            error: self.error,
            aborted_at: self.aborted_at,
            metrics: self.metrics,
            started_at: self.started_at,
            finished_at,
            duration_ms: (finished_at - self.started_at).num_milliseconds(),
        }
    }
}

fn objective_met(objective: PrimaryObjective, property: bool, video: bool) -> bool {
    match objective {
        PrimaryObjective::PropertySelected => property,
        PrimaryObjective::VideoProduced => video,
        PrimaryObjective::PropertyOrVideo => property || video,
        PrimaryObjective::PropertyAndVideo => property && video,
    }
}
