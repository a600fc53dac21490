use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::{AutomationError, AutomationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidInput,
    Authentication,
    Configuration,
    Environment,
    ResourceExhausted,
    RateLimited,
    Transport,
    NetworkTimeout,
    Challenge,
    ChallengeTimeout,
    ElementMissing,
    ExtractionFailed,
    Encoder,
    Cancelled,
    Unexpected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Fatal,
}

impl ErrorCategory {
    pub fn class(self) -> FailureClass {
        match self {
            ErrorCategory::RateLimited
            | ErrorCategory::Transport
            | ErrorCategory::NetworkTimeout
            | ErrorCategory::Challenge
            | ErrorCategory::ChallengeTimeout
            | ErrorCategory::ElementMissing
            | ErrorCategory::Unexpected => FailureClass::Retryable,
            ErrorCategory::InvalidInput
            | ErrorCategory::Authentication
            | ErrorCategory::Configuration
            | ErrorCategory::Environment
            | ErrorCategory::ResourceExhausted
            | ErrorCategory::ExtractionFailed
            | ErrorCategory::Encoder
            | ErrorCategory::Cancelled => FailureClass::Fatal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Environment => "environment",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Transport => "transport",
            ErrorCategory::NetworkTimeout => "network_timeout",
            ErrorCategory::Challenge => "challenge",
            ErrorCategory::ChallengeTimeout => "challenge_timeout",
            ErrorCategory::ElementMissing => "element_missing",
            ErrorCategory::ExtractionFailed => "extraction_failed",
            ErrorCategory::Encoder => "encoder",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unexpected => "unexpected",
        }
    }
}

pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn categorize(error: &AutomationError) -> ErrorCategory {
        match error {
            AutomationError::InvalidInput(_) => ErrorCategory::InvalidInput,
            AutomationError::Authentication(_) => ErrorCategory::Authentication,
            AutomationError::Configuration(_) => ErrorCategory::Configuration,
            AutomationError::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            AutomationError::RateLimited(_) => ErrorCategory::RateLimited,
            AutomationError::Timeout(_) => ErrorCategory::NetworkTimeout,
            AutomationError::Challenge(_) => ErrorCategory::Challenge,
            AutomationError::ChallengeTimeout { .. } => ErrorCategory::ChallengeTimeout,
            AutomationError::ElementNotFound(_) => ErrorCategory::ElementMissing,
            AutomationError::Extraction(_) => ErrorCategory::ExtractionFailed,
            AutomationError::Encoder(_) => ErrorCategory::Encoder,
            AutomationError::Cancelled => ErrorCategory::Cancelled,
            AutomationError::Telemetry(_) => ErrorCategory::Unexpected,
            AutomationError::Launch(message) => {
                let text = message.to_lowercase();
                if text.contains("no such file")
                    || text.contains("not found")
                    || text.contains("could not auto detect")
                    || text.contains("permission")
                {
                    ErrorCategory::Environment
                } else {
                    ErrorCategory::Transport
                }
            }
            AutomationError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                if text.contains("timeout") || text.contains("timed out") {
                    ErrorCategory::NetworkTimeout
                } else if text.contains("captcha") {
                    ErrorCategory::Challenge
                } else {
                    ErrorCategory::Transport
                }
            }
            AutomationError::Io(err) => match err.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => ErrorCategory::Environment,
                ErrorKind::TimedOut => ErrorCategory::NetworkTimeout,
                _ if err.to_string().to_lowercase().contains("no space left") => {
                    ErrorCategory::ResourceExhausted
                }
                _ => ErrorCategory::Transport,
            },
            AutomationError::Transport(message) => {
                categorize_text(message).unwrap_or(ErrorCategory::Transport)
            }
            AutomationError::Unexpected(message) => {
                categorize_text(message).unwrap_or(ErrorCategory::Unexpected)
            }
        }
    }
}

fn status_regex() -> &'static Regex {
    static STATUS: OnceLock<Regex> = OnceLock::new();
    STATUS.get_or_init(|| {
        Regex::new(r"(?i)\b(?:status(?:\s+code)?|http(?:/\d(?:\.\d)?)?)\s*[:=]?\s*(\d{3})\b")
            .expect("valid regex")
    })
}

/// Status code carried by a message as `status 429`, `HTTP 401`, `HTTP/1.1 403`...
/// Bare digits (listing ids in URLs) are ignored.
fn status_code(text: &str) -> Option<u16> {
    status_regex()
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|code| code.as_str().parse().ok())
}

fn categorize_text(message: &str) -> Option<ErrorCategory> {
    let text = message.to_lowercase();
    match status_code(&text) {
        Some(429) => return Some(ErrorCategory::RateLimited),
        Some(401 | 403) => return Some(ErrorCategory::Authentication),
        Some(408 | 504) => return Some(ErrorCategory::NetworkTimeout),
        _ => {}
    }
    if text.contains("captcha") || text.contains("bot detection") {
        Some(ErrorCategory::Challenge)
    } else if text.contains("too many requests") {
        Some(ErrorCategory::RateLimited)
    } else if text.contains("unauthorized") || text.contains("invalid api key") {
        Some(ErrorCategory::Authentication)
    } else if text.contains("timed out") || text.contains("timeout") {
        Some(ErrorCategory::NetworkTimeout)
    } else {
        None
    }
}

pub fn map_category(error: &AutomationError) -> ErrorCategory {
    ErrorCategorizer::categorize(error)
}

pub fn classify(error: &AutomationError) -> FailureClass {
    map_category(error).class()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemediationAction {
    RetryScheduled { delay_ms: u64 },
    ShortCircuit,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub session_id: String,
    pub label: String,
    pub category: ErrorCategory,
    pub class: FailureClass,
    pub error_message: String,
    pub attempt: u32,
    pub action: RemediationAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub timestamp: DateTime<Utc>,
    pub city: String,
    pub session_id: String,
    pub success: bool,
    pub duration_ms: i64,
    pub screenshots: usize,
    pub video_path: Option<PathBuf>,
    pub aborted_step: Option<String>,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<TelemetryError> for AutomationError {
    fn from(error: TelemetryError) -> Self {
        AutomationError::Telemetry(error.to_string())
    }
}

/// Append-only failure log plus the sqlite tables `estatectl runs` reads from.
#[derive(Debug)]
pub struct AutomationTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AutomationTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attempt_failures (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                city TEXT,
                session_id TEXT,
                label TEXT,
                category TEXT,
                class TEXT,
                error_message TEXT,
                attempt INTEGER,
                remediation TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attempt_failures_ts ON attempt_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS workflow_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                city TEXT,
                session_id TEXT,
                success INTEGER,
                duration_ms INTEGER,
                screenshots INTEGER,
                video_path TEXT,
                aborted_step TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_runs_ts ON workflow_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_failure(&self, failure: &FailureContext) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO attempt_failures (
                city, session_id, label, category, class, error_message, attempt, remediation
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                failure.city,
                failure.session_id,
                failure.label,
                failure.category.as_str(),
                format!("{:?}", failure.class),
                failure.error_message,
                failure.attempt as i64,
                serde_json::to_string(&failure.action)?,
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunContext) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO workflow_runs (
                city, session_id, success, duration_ms, screenshots, video_path, aborted_step
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.city,
                run.session_id,
                if run.success { 1 } else { 0 },
                run.duration_ms,
                run.screenshots as i64,
                run.video_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
                run.aborted_step.clone().unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttemptScope {
    pub city: String,
    pub session_id: String,
}

pub fn telemetry_failure(
    telemetry: &AutomationTelemetry,
    scope: &AttemptScope,
    label: &str,
    error: &AutomationError,
    attempt: u32,
    action: RemediationAction,
) -> AutomationResult<()> {
    let category = map_category(error);
    let entry = FailureContext {
        timestamp: Utc::now(),
        city: scope.city.clone(),
        session_id: scope.session_id.clone(),
        label: label.to_string(),
        category,
        class: category.class(),
        error_message: error.to_string(),
        attempt,
        action,
    };
    telemetry.record_failure(&entry)?;
    Ok(())
}
