use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use estate_core::browser::TelemetryError;
use estate_core::media::prune_sessions;
use estate_core::{
    load_automation_config, AutomationConfig, AutomationError, AutomationTelemetry,
    CancellationToken, ChromiumProvider, FfmpegEncoder, RunResult, StepOutcome, WorkflowEngine,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] estate_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("automation error: {0}")]
    Automation(#[from] AutomationError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("run for '{city}' did not meet its objective: {reason}")]
    RunFailed { city: String, reason: String },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Listing capture engine control interface", long_about = None)]
pub struct Cli {
    /// Path to estate.toml
    #[arg(long, default_value = "configs/estate.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter (overrides RUST_LOG), e.g. `info` or `estate_core=debug`
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the capture workflow for one city
    Run(RunArgs),
    /// Inspects recorded workflow runs
    #[command(subcommand)]
    Runs(RunsCommands),
    /// Checks encoder, browser and directories
    Health,
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// City to search for; several words are joined with spaces
    #[arg(required = true, num_args = 1..)]
    pub city: Vec<String>,
    /// Shows the browser window
    #[arg(long, default_value_t = false)]
    pub headful: bool,
    /// Directory for the results JSON (overrides workflow.results_dir)
    #[arg(long)]
    pub results_dir: Option<PathBuf>,
}

impl RunArgs {
    pub fn city_query(&self) -> String {
        self.city.join(" ").trim().to_string()
    }
}

#[derive(Subcommand, Debug)]
pub enum RunsCommands {
    /// Lists the most recent workflow runs
    List(RunsListArgs),
}

#[derive(Args, Debug)]
pub struct RunsListArgs {
    /// Only runs for this city
    #[arg(long)]
    pub city: Option<String>,
    /// Maximum number of rows
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Installs the fmt subscriber on stderr. `level` wins over `RUST_LOG`.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        clap_complete::generate(
            args.shell,
            &mut Cli::command(),
            "estatectl",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let report = context.run_workflow(args)?;
            render(&report, cli.format)?;
            if !report.result.success() {
                return Err(AppError::RunFailed {
                    city: report.result.city().to_string(),
                    reason: report
                        .result
                        .error()
                        .unwrap_or("primary objective not reached")
                        .to_string(),
                });
            }
        }
        Commands::Runs(RunsCommands::List(args)) => {
            let runs = context.runs_list(args)?;
            render(&runs, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check()?;
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: AutomationConfig,
    config_path: PathBuf,
    metrics_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let mut config = load_automation_config(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        let metrics_db = config.metrics_db_path();
        Ok(Self {
            config,
            config_path,
            metrics_db,
        })
    }

    fn run_workflow(&self, args: &RunArgs) -> Result<RunReport> {
        let city = args.city_query();
        let mut config = self.config.clone();
        if let Some(dir) = &args.results_dir {
            config.workflow.results_dir = dir.to_string_lossy().into_owned();
        }
        self.prune_screenshots();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async move {
            let telemetry = Arc::new(AutomationTelemetry::new(
                config.failure_log_path(),
                config.metrics_db_path(),
            )?);
            let provider = Arc::new(ChromiumProvider::new(&config).with_headless(!args.headful));
            let encoder = Arc::new(FfmpegEncoder::new(&config.video));
            let results_dir = PathBuf::from(&config.workflow.results_dir);
            let engine = WorkflowEngine::new(config, provider, encoder).with_telemetry(telemetry);

            let signal = CancellationToken::new();
            let handle = signal.clone();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; cancelling run");
                    handle.cancel();
                }
            });
            let result = engine.run_with_cancel(&city, signal).await;
            interrupt.abort();

            let results_path = result.write_json(&results_dir).await?;
            Ok::<_, AppError>(RunReport {
                result,
                results_path,
            })
        })
    }

    fn prune_screenshots(&self) {
        let days = self.config.recorder.retention_days;
        if days == 0 {
            return;
        }
        let keep = Duration::from_secs(days * 24 * 60 * 60);
        match prune_sessions(&self.config.recorder.screenshots_dir, keep) {
            Ok(removed) if removed > 0 => info!(removed, days, "old screenshot sessions pruned"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to prune screenshot sessions"),
        }
    }

    fn runs_list(&self, args: &RunsListArgs) -> Result<RunList> {
        let conn = self.open_database(&self.metrics_db)?;
        let mut stmt = conn.prepare(
            "SELECT ts, city, session_id, success, duration_ms, screenshots, video_path, aborted_step \
             FROM workflow_runs \
             WHERE (?1 IS NULL OR city = ?1) \
             ORDER BY ts DESC, rowid DESC \
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map((args.city.as_ref(), args.limit as i64), |row| {
                Ok(RunEntry {
                    timestamp: row.get::<_, Option<String>>(0)?,
                    city: row.get(1)?,
                    session_id: row.get::<_, Option<String>>(2)?,
                    success: row.get::<_, i64>(3)? != 0,
                    duration_ms: row.get::<_, Option<i64>>(4)?,
                    screenshots: row.get::<_, Option<i64>>(5)?,
                    video_path: non_empty(row.get::<_, Option<String>>(6)?),
                    aborted_step: non_empty(row.get::<_, Option<String>>(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(RunList { rows })
    }

    fn health_check(&self) -> Result<Vec<HealthEntry>> {
        let mut results = vec![self.check_path("estate.toml", &self.config_path)];

        let encoder = FfmpegEncoder::new(&self.config.video);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        if runtime.block_on(encoder.is_available()) {
            results.push(HealthEntry::ok("ffmpeg", encoder.binary().display().to_string()));
        } else {
            results.push(HealthEntry::error(
                "ffmpeg",
                format!("{} not runnable", encoder.binary().display()),
            ));
        }

        match &self.config.provider.executable_path {
            Some(path) => results.push(self.check_path("chromium", Path::new(path))),
            None => results.push(HealthEntry::warn(
                "chromium",
                "no executable_path configured; detected at launch",
            )),
        }

        let recorder = &self.config.recorder;
        results.push(self.check_directory("screenshots", Path::new(&recorder.screenshots_dir)));
        results.push(self.check_directory("videos", Path::new(&self.config.video.output_dir)));
        results.push(self.check_directory(
            "logs",
            Path::new(&self.config.observability.logs_dir),
        ));
        results.push(self.check_database("automation.sqlite", &self.metrics_db));
        Ok(results)
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not found; created on first run", path = path.display()),
            ),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(name, format!("{path} not found", path = path.display()));
        }
        match self.open_database(path) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
        }
    }

    fn open_database(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "database missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub result: RunResult,
    pub results_path: PathBuf,
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let result = &self.result;
        let mut lines = vec![format!(
            "{city}: {status} in {secs:.1}s (session {session})",
            city = result.city(),
            status = if result.success() { "SUCCESS" } else { "FAILED" },
            secs = result.duration_ms() as f64 / 1000.0,
            session = result.session_id().unwrap_or("-"),
        )];
        for step in result.steps() {
            let marker = match step.outcome {
                StepOutcome::Success => "ok",
                StepOutcome::Failed => "FAILED",
                StepOutcome::Skipped => "skipped",
                StepOutcome::Pending => "pending",
            };
            let mut line = format!(
                "  {}. {} [{marker}] attempts={} screenshots={}",
                step.ordinal,
                step.name.description(),
                step.attempts,
                step.screenshots.len()
            );
            if let Some(error) = &step.last_error {
                if step.outcome == StepOutcome::Failed {
                    line.push_str(&format!(" error={error}"));
                }
            }
            lines.push(line);
        }
        match result.property() {
            Some(property) => {
                lines.push("Property:".to_string());
                lines.push(format!(
                    "  - Title: {}",
                    property.title.as_deref().unwrap_or("-")
                ));
                lines.push(format!(
                    "  - Price: {}",
                    property
                        .price
                        .as_ref()
                        .map(|price| price.display.as_str())
                        .unwrap_or("-")
                ));
                lines.push(format!(
                    "  - Address: {}",
                    property.address.as_deref().unwrap_or("-")
                ));
                lines.push(format!("  - URL: {}", property.source_url));
            }
            None => lines.push("Property: unavailable".to_string()),
        }
        lines.push(format!("Screenshots: {}", result.screenshots().len()));
        let metrics = result.metrics();
        lines.push(format!(
            "Retries: {} | Challenges: {} detected, {:.0}% resolved",
            metrics.retries,
            metrics.challenges_detected,
            metrics.challenge_resolution_rate()
        ));
        match result.video() {
            Some(video) => lines.push(format!(
                "Video: {} ({} frames, {:.1}s)",
                video.path.display(),
                video.frame_count,
                video.duration_seconds
            )),
            None => lines.push("Video: none".to_string()),
        }
        lines.push(format!("Results: {}", self.results_path.display()));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub rows: Vec<RunEntry>,
}

#[derive(Debug, Serialize)]
pub struct RunEntry {
    pub timestamp: Option<String>,
    pub city: String,
    pub session_id: Option<String>,
    pub success: bool,
    pub duration_ms: Option<i64>,
    pub screenshots: Option<i64>,
    pub video_path: Option<String>,
    pub aborted_step: Option<String>,
}

impl DisplayFallback for RunList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs recorded".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let duration = entry
                .duration_ms
                .map(|v| format!("{:.1}s", v as f64 / 1000.0))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{ts} | {city} | {status} | shots={shots} | dur={duration}{aborted}",
                ts = entry.timestamp.as_deref().unwrap_or("-"),
                city = entry.city,
                status = if entry.success { "success" } else { "failed" },
                shots = entry.screenshots.unwrap_or(0),
                aborted = entry
                    .aborted_step
                    .as_deref()
                    .map(|step| format!(" | aborted at {step}"))
                    .unwrap_or_default(),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| {
                format!(
                    "[{status}] {name}: {detail}",
                    status = entry.status,
                    name = entry.name,
                    detail = entry.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
