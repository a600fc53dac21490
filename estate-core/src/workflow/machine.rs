use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::browser::{
    classify, AutomationError, AutomationTelemetry, ChallengeHandler, ErrorCategory,
    PropertyExtractor, PropertyRecord, ProviderSession, RetryController, RetryFailure,
    RetryOutcome, RetryPolicy, RunContext, Session, SessionMetrics, SessionProvider,
};
use crate::config::AutomationConfig;
use crate::media::{
    CheckpointLabel, FrameEncoder, MediaError, Screenshot, ScreenshotRecorder, VideoArtifact,
    VideoAssembler,
};

use tokio_util::sync::CancellationToken;
use super::executor::StepExecutor;
use super::report::{RunReportBuilder, RunResult};
use super::step::{StepFailure, StepLedger, StepName, WorkflowState};

/// Drives one city through every workflow step. Holds no per-run state, so a
/// single engine can serve concurrent runs.
pub struct WorkflowEngine {
    config: AutomationConfig,
    provider: Arc<dyn SessionProvider>,
    executor: StepExecutor,
    challenge: ChallengeHandler,
    extractor: PropertyExtractor,
    assembler: VideoAssembler,
    policy: RetryPolicy,
    telemetry: Option<Arc<AutomationTelemetry>>,
}

impl WorkflowEngine {
    pub fn new(
        config: AutomationConfig,
        provider: Arc<dyn SessionProvider>,
        encoder: Arc<dyn FrameEncoder>,
    ) -> Self {
        Self {
            executor: StepExecutor::new(&config),
            challenge: ChallengeHandler::new(&config.challenge, &config.site),
            extractor: PropertyExtractor::new(&config.site),
            assembler: VideoAssembler::new(&config.video, encoder),
            policy: RetryPolicy::new(config.retry.clone()),
            telemetry: None,
            provider,
            config,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<AutomationTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &AutomationConfig {
        &self.config
    }

    pub async fn run(&self, city: &str) -> RunResult {
        self.run_with_cancel(city, CancellationToken::new()).await
    }

    /// Executes the workflow for `city`. Always returns a result; failures are
    /// reflected in the step records and the success flag.
    pub async fn run_with_cancel(&self, city: &str, cancel: CancellationToken) -> RunResult {
        let city = city.trim();
        let builder = RunReportBuilder::new(city, self.config.workflow.primary_objective);
        let mut run = RunState::default();

        if city.is_empty() {
            let error = AutomationError::InvalidInput("city name is empty".into());
            warn!(error = %error, "rejecting workflow run");
            run.error = Some(error.to_string());
        } else {
            info!(city, provider = self.provider.name(), "workflow started");
            self.drive(city, &cancel, &mut run).await;
        }

        run.ledger.skip_pending();
        let result = run.into_result(builder);
        self.record_run(&result);
        info!(
            city,
            session = result.session_id().unwrap_or("-"),
            success = result.success(),
            screenshots = result.screenshots().len(),
            duration_ms = result.duration_ms(),
            "workflow finished"
        );
        result
    }

    async fn drive(&self, city: &str, cancel: &CancellationToken, run: &mut RunState) {
        let retry = RetryController::new(self.policy.clone())
            .with_telemetry(self.telemetry.clone())
            .with_scope(city, "");

        run.ledger.begin(StepName::Navigate);
        let opened = retry
            .guard("open_session", cancel, |_| self.provider.open_session())
            .await;
        let provider_session = match run.absorb(StepName::Navigate, opened) {
            Ok(session) => session,
            Err(failure) => {
                error!(city, error = %failure.error, "could not open a browser session");
                run.abort(StepName::Navigate, failure);
                return;
            }
        };
        let session_id = provider_session.id().to_string();
        run.session = Some(Session::new(session_id.as_str()));
        let retry = retry.with_scope(city, &session_id);
        info!(city, session = %session_id, "session opened");

        let recorder = match ScreenshotRecorder::create(
            &self.config.recorder.screenshots_dir,
            city,
            &session_id,
            Duration::from_millis(self.config.recorder.settle_delay_ms),
        )
        .await
        {
            Ok(recorder) => recorder,
            Err(err) => {
                let error = AutomationError::from(err);
                error!(city, session = %session_id, error = %error, "screenshot directory unavailable");
                run.abort(
                    StepName::Navigate,
                    StepFailure {
                        class: classify(&error),
                        error: error.to_string(),
                        cancelled: false,
                    },
                );
                close_session(provider_session, run).await;
                return;
            }
        };

        let live = LiveSession {
            city,
            id: session_id,
            cancel,
            retry: &retry,
            recorder: &recorder,
            session: AsyncMutex::new(provider_session),
        };

        let mut state = WorkflowState::Init.advance();
        while let WorkflowState::Running(step) = state {
            if !step.touches_page() {
                break;
            }
            run.ledger.begin(step);
            info!(
                city,
                session = %live.id,
                step = %step,
                ordinal = step.ordinal(),
                "step started"
            );
            let outcome = match step {
                StepName::ExtractData => self.extract_step(&live, run).await,
                _ => self.page_step(step, &live, run).await,
            };
            state = match outcome {
                Ok(()) => {
                    run.ledger.succeed(step);
                    info!(city, session = %live.id, step = %step, "step succeeded");
                    state.advance()
                }
                Err(failure) => {
                    error!(
                        city,
                        session = %live.id,
                        step = %step,
                        class = ?failure.class,
                        cancelled = failure.cancelled,
                        error = %failure.error,
                        "step failed; aborting workflow"
                    );
                    run.abort(step, failure);
                    WorkflowState::Aborted(step)
                }
            };
        }

        close_session(live.session.into_inner(), run).await;
        run.screenshots = recorder.frames();

        if state == WorkflowState::Running(StepName::GenerateVideo) {
            state = self.video_step(city, cancel, &retry, &recorder, run).await;
        }
        debug!(city, ?state, "workflow reached terminal state");
    }

    async fn page_step(
        &self,
        step: StepName,
        live: &LiveSession<'_>,
        run: &mut RunState,
    ) -> Result<(), StepFailure> {
        let current_url = if step == StepName::OpenListings {
            live.session.lock().await.current_url().await.ok().flatten()
        } else {
            None
        };
        let plan = self
            .executor
            .plan(step, live.city, current_url.as_deref())
            .map_err(|error| StepFailure {
                class: classify(&error),
                error: error.to_string(),
                cancelled: false,
            })?;

        for action in plan {
            let label = match &action.checkpoint {
                Some(sub) => format!("{step}/{sub}"),
                None => format!("{step}/{}", action.spec.command.kind()),
            };
            let spec = &action.spec;
            let guarded = live
                .retry
                .guard(&label, live.cancel, |attempt| async move {
                    debug!(
                        city = live.city,
                        session = %live.id,
                        step = %step,
                        attempt,
                        command = spec.command.kind(),
                        "performing action"
                    );
                    let mut session = live.session.lock().await;
                    let outcome = self.executor.execute(&mut **session, spec).await?;
                    let report = if spec.command.touches_page() {
                        Some(self.challenge.settle(&mut **session, live.cancel).await?)
                    } else {
                        None
                    };
                    Ok((outcome, report))
                })
                .await;
            let (outcome, report) = run.absorb(step, guarded)?;
            run.metrics.record_action();
            if let Some(report) = report {
                run.metrics.record_challenge(&report);
                if let Some(session) = run.session.as_mut() {
                    session.mark_page(report.page_tag);
                }
            }
            if step == StepName::SelectProperty && outcome.url.is_some() {
                run.property_url = outcome.url;
            }
            if let Some(sub) = action.checkpoint {
                self.checkpoint(live, run, CheckpointLabel::new(step, sub))
                    .await?;
            }
        }

        if step == StepName::SelectProperty && run.property_url.is_none() {
            run.property_url = live.session.lock().await.current_url().await.ok().flatten();
        }
        Ok(())
    }

    async fn extract_step(
        &self,
        live: &LiveSession<'_>,
        run: &mut RunState,
    ) -> Result<(), StepFailure> {
        let guarded = live
            .retry
            .guard("extract_data", live.cancel, |_| async move {
                let mut session = live.session.lock().await;
                self.extractor.extract(&mut **session).await
            })
            .await;
        let record = run.absorb(StepName::ExtractData, guarded)?;
        if record.is_partial() {
            warn!(
                city = live.city,
                session = %live.id,
                title = record.title.is_some(),
                price = record.price.is_some(),
                address = record.address.is_some(),
                "property record is partial"
            );
        }
        run.property = Some(record);
        self.checkpoint(live, run, CheckpointLabel::new(StepName::ExtractData, "details"))
            .await
    }

    async fn checkpoint(
        &self,
        live: &LiveSession<'_>,
        run: &mut RunState,
        label: CheckpointLabel,
    ) -> Result<(), StepFailure> {
        let step = label.step;
        let guard_label = format!("capture:{label}");
        let label = &label;
        let guarded = live
            .retry
            .guard(&guard_label, live.cancel, |_| async move {
                let mut session = live.session.lock().await;
                live.recorder
                    .capture(&mut **session, label.clone())
                    .await
                    .map_err(capture_error)
            })
            .await;
        let shot = run.absorb(step, guarded)?;
        run.ledger.add_screenshot(step, shot.sequence);
        run.metrics.record_screenshot();
        info!(
            city = live.city,
            session = %live.id,
            step = %step,
            sequence = shot.sequence,
            label = %shot.label,
            "checkpoint captured"
        );
        Ok(())
    }

    async fn video_step(
        &self,
        city: &str,
        cancel: &CancellationToken,
        retry: &RetryController,
        recorder: &ScreenshotRecorder,
        run: &mut RunState,
    ) -> WorkflowState {
        let step = StepName::GenerateVideo;
        run.ledger.begin(step);
        let validation = recorder.validate().await;
        debug!(
            city,
            session = recorder.session_id(),
            total = validation.total,
            valid = validation.valid,
            "frames validated"
        );

        let frames = recorder.frames();
        let frames = frames.as_slice();
        let guarded = retry
            .guard("generate_video", cancel, |_| async move {
                self.assembler
                    .assemble(frames, city)
                    .await
                    .map_err(AutomationError::from)
            })
            .await;
        match run.absorb(step, guarded) {
            Ok(artifact) => {
                info!(
                    city,
                    session = recorder.session_id(),
                    path = %artifact.path.display(),
                    duration_seconds = artifact.duration_seconds,
                    "video generated"
                );
                run.ledger.succeed(step);
                run.video = Some(artifact);
                WorkflowState::Running(step).advance()
            }
            Err(failure) => {
                warn!(
                    city,
                    session = recorder.session_id(),
                    error = %failure.error,
                    "video generation failed; screenshots and data are kept"
                );
                run.abort(step, failure);
                WorkflowState::Aborted(step)
            }
        }
    }

    fn record_run(&self, result: &RunResult) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let context = RunContext {
            timestamp: result.finished_at(),
            city: result.city().to_string(),
            session_id: result.session_id().unwrap_or_default().to_string(),
            success: result.success(),
            duration_ms: result.duration_ms(),
            screenshots: result.screenshots().len(),
            video_path: result.video_path().map(Path::to_path_buf),
            aborted_step: result.aborted_at().map(|step| step.slug().to_string()),
        };
        if let Err(err) = telemetry.record_run(&context) {
            warn!(error = %err, city = result.city(), "failed to record run telemetry");
        }
    }
}

/// Per-run handles shared by the guarded operations of one session.
struct LiveSession<'a> {
    city: &'a str,
    id: String,
    cancel: &'a CancellationToken,
    retry: &'a RetryController,
    recorder: &'a ScreenshotRecorder,
    session: AsyncMutex<Box<dyn ProviderSession>>,
}

#[derive(Default)]
struct RunState {
    ledger: StepLedger,
    metrics: SessionMetrics,
    session: Option<Session>,
    screenshots: Vec<Screenshot>,
    property: Option<PropertyRecord>,
    property_url: Option<String>,
    video: Option<VideoArtifact>,
    error: Option<String>,
    aborted_at: Option<StepName>,
}

impl RunState {
    /// Folds one guarded invocation into the step's attempt log and the session metrics.
    fn absorb<T>(
        &mut self,
        step: StepName,
        guarded: Result<RetryOutcome<T>, RetryFailure>,
    ) -> Result<T, StepFailure> {
        let (attempts, succeeded, history) = match &guarded {
            Ok(outcome) => (outcome.attempts, true, &outcome.history),
            Err(failure) => (failure.attempts, false, &failure.history),
        };
        self.metrics.record_attempts(attempts, succeeded);
        let timeouts = history
            .iter()
            .filter(|entry| entry.category == Some(ErrorCategory::ChallengeTimeout))
            .count();
        for _ in 0..timeouts {
            self.metrics.record_challenge_timeout();
        }

        match guarded {
            Ok(outcome) => {
                self.ledger.add_attempts(step, outcome.history);
                Ok(outcome.result)
            }
            Err(failure) => {
                let step_failure = StepFailure::from(&failure);
                self.ledger.add_attempts(step, failure.history);
                Err(step_failure)
            }
        }
    }

    fn abort(&mut self, step: StepName, failure: StepFailure) {
        self.ledger.fail(step, &failure);
        self.aborted_at = Some(step);
        self.error = Some(failure.error);
    }

    fn into_result(self, builder: RunReportBuilder) -> RunResult {
        builder
            .session(self.session)
            .steps(self.ledger.into_records())
            .screenshots(self.screenshots)
            .property(self.property)
            .property_url(self.property_url)
            .video(self.video)
            .error(self.error)
            .aborted_at(self.aborted_at)
            .metrics(self.metrics)
            .build()
    }
}

async fn close_session(session: Box<dyn ProviderSession>, run: &mut RunState) {
    let id = session.id().to_string();
    if let Err(err) = session.close().await {
        warn!(session = %id, error = %err, "failed to close browser session");
    }
    if let Some(session) = run.session.as_mut() {
        session.terminate();
    }
    debug!(session = %id, "session closed");
}

/// Empty frames are retried like transport errors.
fn capture_error(error: MediaError) -> AutomationError {
    match error {
        MediaError::MalformedFrame { reason, .. } => AutomationError::Transport(reason),
        other => other.into(),
    }
}
