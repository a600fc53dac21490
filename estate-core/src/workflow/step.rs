use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::browser::{AttemptRecord, FailureClass, RetryFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Navigate,
    SearchCity,
    OpenListings,
    Scroll,
    SelectProperty,
    ExtractData,
    GenerateVideo,
}

impl StepName {
    pub const ALL: [StepName; 7] = [
        StepName::Navigate,
        StepName::SearchCity,
        StepName::OpenListings,
        StepName::Scroll,
        StepName::SelectProperty,
        StepName::ExtractData,
        StepName::GenerateVideo,
    ];

    /// 1-based position in the workflow.
    pub fn ordinal(self) -> usize {
        match self {
            StepName::Navigate => 1,
            StepName::SearchCity => 2,
            StepName::OpenListings => 3,
            StepName::Scroll => 4,
            StepName::SelectProperty => 5,
            StepName::ExtractData => 6,
            StepName::GenerateVideo => 7,
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            StepName::Navigate => "navigate",
            StepName::SearchCity => "search_city",
            StepName::OpenListings => "open_listings",
            StepName::Scroll => "scroll",
            StepName::SelectProperty => "select_property",
            StepName::ExtractData => "extract_data",
            StepName::GenerateVideo => "generate_video",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            StepName::Navigate => "Navigate to site",
            StepName::SearchCity => "Search for city",
            StepName::OpenListings => "Open listings",
            StepName::Scroll => "Scroll results",
            StepName::SelectProperty => "Select property",
            StepName::ExtractData => "Extract property data",
            StepName::GenerateVideo => "Generate video",
        }
    }

    /// Steps that act on the live page; the last one needs no session.
    pub fn touches_page(self) -> bool {
        !matches!(self, StepName::GenerateVideo)
    }

    pub fn next(self) -> Option<StepName> {
        StepName::ALL.get(self.ordinal()).copied()
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    Running(StepName),
    Done,
    Aborted(StepName),
}

impl WorkflowState {
    /// Successor on success; `Aborted` and `Done` are terminal.
    pub fn advance(self) -> WorkflowState {
        match self {
            WorkflowState::Init => WorkflowState::Running(StepName::Navigate),
            WorkflowState::Running(step) => match step.next() {
                Some(next) => WorkflowState::Running(next),
                None => WorkflowState::Done,
            },
            terminal => terminal,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Aborted(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: StepName,
    pub ordinal: usize,
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub screenshots: Vec<u64>,
    pub attempt_log: Vec<AttemptRecord>,
}

impl StepRecord {
    fn pending(name: StepName) -> Self {
        Self {
            name,
            ordinal: name.ordinal(),
            outcome: StepOutcome::Pending,
            attempts: 0,
            last_error: None,
            failure_class: None,
            started_at: None,
            finished_at: None,
            screenshots: Vec::new(),
            attempt_log: Vec::new(),
        }
    }
}

/// Failure of a single step after the retry controller gave up.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: String,
    pub class: FailureClass,
    pub cancelled: bool,
}

impl From<&RetryFailure> for StepFailure {
    fn from(failure: &RetryFailure) -> Self {
        Self {
            error: failure.error.to_string(),
            class: failure.class,
            cancelled: failure.cancelled,
        }
    }
}

/// Mutable per-run step table; always holds every step in definition order.
#[derive(Debug, Clone)]
pub struct StepLedger {
    records: Vec<StepRecord>,
}

impl Default for StepLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLedger {
    pub fn new() -> Self {
        Self {
            records: StepName::ALL.iter().copied().map(StepRecord::pending).collect(),
        }
    }

    fn record_mut(&mut self, step: StepName) -> &mut StepRecord {
        &mut self.records[step.ordinal() - 1]
    }

    pub fn get(&self, step: StepName) -> &StepRecord {
        &self.records[step.ordinal() - 1]
    }

    pub fn begin(&mut self, step: StepName) {
        self.record_mut(step).started_at.get_or_insert_with(Utc::now);
    }

    pub fn add_attempts(&mut self, step: StepName, history: Vec<AttemptRecord>) {
        let record = self.record_mut(step);
        record.attempts += history.len() as u32;
        if let Some(error) = history.iter().rev().find_map(|entry| entry.error.clone()) {
            record.last_error = Some(error);
        }
        record.attempt_log.extend(history);
    }

    pub fn add_screenshot(&mut self, step: StepName, sequence: u64) {
        self.record_mut(step).screenshots.push(sequence);
    }

    pub fn succeed(&mut self, step: StepName) {
        let record = self.record_mut(step);
        record.outcome = StepOutcome::Success;
        record.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, step: StepName, failure: &StepFailure) {
        let record = self.record_mut(step);
        record.outcome = StepOutcome::Failed;
        record.last_error = Some(failure.error.clone());
        record.failure_class = Some(failure.class);
        record.finished_at = Some(Utc::now());
    }

    pub fn skip_pending(&mut self) {
        for record in &mut self.records {
            if record.outcome == StepOutcome::Pending {
                record.outcome = StepOutcome::Skipped;
            }
        }
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }
}
