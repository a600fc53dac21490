use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use rusqlite::Connection;
use tempfile::TempDir;

use estate_core::browser::{
    ActionCommand, ActionOutcome, ActionSpec, AutomationError, AutomationResult,
    AutomationTelemetry, ErrorCategory, PageSnapshot, PageState, ProviderSession, SessionProvider,
};
use estate_core::media::{EncodeRequest, FrameEncoder, MediaResult};
use estate_core::{
    AutomationConfig, CancellationToken, PrimaryObjective, StepName, StepOutcome, WorkflowEngine,
};

const HOME: &str = "https://www.zoopla.co.uk/";
const DETAILS: &str = "https://www.zoopla.co.uk/for-sale/details/67120341/";

#[derive(Clone)]
struct Script {
    /// Page reads that still show an interstitial after the first navigation.
    challenge_reads: usize,
    /// Provider actions that fail with a transport error before succeeding.
    transient_failures: usize,
    transient_error: String,
    detail_url: String,
    snapshot: PageSnapshot,
    honour_waits: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            challenge_reads: 0,
            transient_failures: 0,
            transient_error: "connection reset by peer".into(),
            detail_url: DETAILS.to_string(),
            snapshot: PageSnapshot {
                title: "2 bed flat for sale in Deansgate - Zoopla".into(),
                headings: vec!["2 bed flat for sale".into()],
                price_candidates: vec!["£350,000".into()],
                address_candidates: vec!["Deansgate, Manchester M3 4LQ".into()],
                ..PageSnapshot::default()
            },
            honour_waits: false,
        }
    }
}

#[derive(Default)]
struct Journal {
    commands: Vec<String>,
    opened: usize,
    closed: usize,
}

struct MockProvider {
    script: Script,
    journal: Arc<Mutex<Journal>>,
}

impl MockProvider {
    fn new(script: Script) -> (Arc<Self>, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let provider = Arc::new(Self {
            script,
            journal: Arc::clone(&journal),
        });
        (provider, journal)
    }
}

#[async_trait]
impl SessionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_session(&self) -> AutomationResult<Box<dyn ProviderSession>> {
        let mut journal = self.journal.lock().unwrap();
        journal.opened += 1;
        Ok(Box::new(MockSession {
            id: format!("mock-session-{}", journal.opened),
            url: "about:blank".into(),
            script: self.script.clone(),
            challenge_armed: false,
            journal: Arc::clone(&self.journal),
            frame: 0,
        }))
    }
}

struct MockSession {
    id: String,
    url: String,
    script: Script,
    challenge_armed: bool,
    journal: Arc<Mutex<Journal>>,
    frame: u8,
}

#[async_trait]
impl ProviderSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn perform(&mut self, action: &ActionSpec) -> AutomationResult<ActionOutcome> {
        if self.script.transient_failures > 0 {
            self.script.transient_failures -= 1;
            return Err(AutomationError::Transport(self.script.transient_error.clone()));
        }
        self.journal
            .lock()
            .unwrap()
            .commands
            .push(action.command.kind().to_string());
        match &action.command {
            ActionCommand::Goto { url } => {
                self.url = url.clone();
                self.challenge_armed = true;
            }
            ActionCommand::Click { .. } if self.url.contains("/for-sale/property/") => {}
            ActionCommand::Click { .. } => {
                self.url = "https://www.zoopla.co.uk/for-sale/property/manchester/".into();
            }
            ActionCommand::SelectListing { .. } => self.url = self.script.detail_url.clone(),
            ActionCommand::Wait { millis } if self.script.honour_waits => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            _ => {}
        }
        Ok(ActionOutcome {
            url: Some(self.url.clone()),
            detail: None,
        })
    }

    async fn page_state(&mut self) -> AutomationResult<PageState> {
        if self.challenge_armed && self.script.challenge_reads > 0 {
            self.script.challenge_reads -= 1;
            return Ok(PageState {
                url: self.url.clone(),
                title: "Just a moment...".into(),
                text: "Please verify you are human before continuing".into(),
            });
        }
        Ok(PageState {
            url: self.url.clone(),
            title: "Zoopla > Search Property to Buy, Rent, House Prices".into(),
            text: "Search homes for sale and to rent across the UK".into(),
        })
    }

    async fn screenshot(&mut self) -> AutomationResult<Vec<u8>> {
        self.frame = self.frame.wrapping_add(1);
        let image = ImageBuffer::from_pixel(16, 9, Rgb([self.frame, 64u8, 128u8]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .map_err(|err| AutomationError::Unexpected(err.to_string()))?;
        Ok(bytes)
    }

    async fn snapshot(&mut self) -> AutomationResult<PageSnapshot> {
        Ok(PageSnapshot {
            url: self.url.clone(),
            ..self.script.snapshot.clone()
        })
    }

    async fn current_url(&mut self) -> AutomationResult<Option<String>> {
        Ok(Some(self.url.clone()))
    }

    async fn close(self: Box<Self>) -> AutomationResult<()> {
        self.journal.lock().unwrap().closed += 1;
        Ok(())
    }
}

#[derive(Default)]
struct MockEncoder {
    requests: Mutex<Vec<EncodeRequest>>,
    fail: bool,
}

#[async_trait]
impl FrameEncoder for MockEncoder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn encode(&self, request: &EncodeRequest) -> MediaResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(estate_core::media::MediaError::EncoderFailed {
                status: "exit status: 1".into(),
                stderr: "Conversion failed!".into(),
            });
        }
        tokio::fs::write(&request.output, vec![0u8; 64])
            .await
            .map_err(|err| estate_core::media::MediaError::io(&request.output, err))
    }
}

fn test_config(root: &Path) -> AutomationConfig {
    let mut config = AutomationConfig::default();
    config.recorder.screenshots_dir = root.join("screenshots").to_string_lossy().into_owned();
    config.recorder.settle_delay_ms = 0;
    config.video.output_dir = root.join("videos").to_string_lossy().into_owned();
    config.workflow.results_wait_ms = 0;
    config.workflow.results_dir = root.to_string_lossy().into_owned();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.challenge.poll_interval_ms = 5;
    config.challenge.timeout_seconds = 1;
    config.observability.logs_dir = root.join("logs").to_string_lossy().into_owned();
    config
}

fn engine(
    config: AutomationConfig,
    script: Script,
) -> (WorkflowEngine, Arc<Mutex<Journal>>, Arc<MockEncoder>) {
    let (provider, journal) = MockProvider::new(script);
    let encoder = Arc::new(MockEncoder::default());
    let engine = WorkflowEngine::new(config, provider, encoder.clone());
    (engine, journal, encoder)
}

#[tokio::test]
async fn manchester_run_succeeds_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let (engine, journal, encoder) = engine(config, Script::default());

    let result = engine.run("Manchester").await;

    assert!(result.success(), "run failed: {:?}", result.error());
    assert_eq!(result.city(), "Manchester");
    assert_eq!(result.steps().len(), 7);
    for step in result.steps() {
        assert_eq!(step.outcome, StepOutcome::Success, "{} did not succeed", step.name);
        if step.name.touches_page() {
            assert!(!step.screenshots.is_empty(), "{} has no screenshot", step.name);
        }
    }
    assert_eq!(result.steps_completed().len(), 7);

    let property = result.property().expect("property record");
    assert_eq!(property.source_url, DETAILS);
    assert_eq!(property.price.as_ref().map(|price| price.amount), Some(350_000));
    assert_eq!(result.property_url(), Some(DETAILS));

    let video = result.video().expect("video artifact");
    assert!(video.path.exists());
    assert_eq!(video.frame_count, result.screenshots().len());
    assert_eq!(
        video.duration_seconds,
        result.screenshots().len() as f64 / 2.0
    );
    assert_eq!(encoder.requests.lock().unwrap().len(), 1);

    let session = result.session().expect("session");
    assert!(!session.is_active());
    let journal = journal.lock().unwrap();
    assert_eq!((journal.opened, journal.closed), (1, 1));
}

#[tokio::test]
async fn steps_and_screenshots_follow_definition_order() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.workflow.scroll_count = 2;
    let (engine, journal, encoder) = engine(config, Script::default());

    let result = engine.run("Manchester").await;
    assert!(result.success());

    let names = result.steps().iter().map(|step| step.name).collect::<Vec<_>>();
    assert_eq!(names, StepName::ALL.to_vec());

    let sequences = result
        .screenshots()
        .iter()
        .map(|shot| shot.sequence)
        .collect::<Vec<_>>();
    let expected = (1..=sequences.len() as u64).collect::<Vec<_>>();
    assert_eq!(sequences, expected);

    let steps = result
        .screenshots()
        .iter()
        .map(|shot| shot.label.step.ordinal())
        .collect::<Vec<_>>();
    assert!(steps.windows(2).all(|pair| pair[0] <= pair[1]));
    let labels = result
        .screenshots()
        .iter()
        .map(|shot| shot.label.to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        labels,
        vec![
            "navigate/homepage",
            "search_city/typed",
            "search_city/clicked",
            "search_city/results",
            "open_listings/listings",
            "scroll/scroll_01",
            "scroll/scroll_02",
            "select_property/selected",
            "extract_data/details",
        ]
    );

    let request = encoder.requests.lock().unwrap()[0].clone();
    let paths = result
        .screenshot_paths()
        .into_iter()
        .map(Path::to_path_buf)
        .collect::<Vec<_>>();
    assert_eq!(request.frames, paths);

    // The search landed on a listings URL, so no listings click was issued.
    let commands = journal.lock().unwrap().commands.clone();
    assert_eq!(
        commands,
        vec![
            "goto",
            "dismiss_consent",
            "type",
            "click",
            "wait",
            "wait",
            "scroll",
            "scroll",
            "select_listing",
        ]
    );
}

#[tokio::test]
async fn challenge_is_waited_out_and_transient_errors_retried() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let script = Script {
        challenge_reads: 3,
        transient_failures: 1,
        ..Script::default()
    };
    let (engine, _journal, _encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(result.success(), "run failed: {:?}", result.error());
    let navigate = result.step(StepName::Navigate).unwrap();
    assert!(navigate.attempts >= 3);
    assert!(navigate
        .attempt_log
        .iter()
        .any(|entry| !entry.succeeded && entry.backoff_ms.is_some()));
    let metrics = result.metrics();
    assert!(metrics.challenges_detected >= 1);
    assert!(metrics.challenges_resolved >= 1);
    assert_eq!(metrics.challenge_timeouts, 0);
    assert!(metrics.retries >= 1);
}

#[tokio::test]
async fn provider_captcha_error_is_not_a_challenge_timeout() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let script = Script {
        transient_failures: 1,
        transient_error: "captcha served by upstream".into(),
        ..Script::default()
    };
    let (engine, _journal, _encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(result.success(), "run failed: {:?}", result.error());
    let metrics = result.metrics();
    assert_eq!(metrics.challenge_timeouts, 0);
    assert_eq!(metrics.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn settle_timeout_is_counted_and_retried() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    // 1 s ceiling at a 5 ms poll: the first settle reads the page 201 times.
    let script = Script {
        challenge_reads: 250,
        ..Script::default()
    };
    let (engine, _journal, _encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(result.success(), "run failed: {:?}", result.error());
    let metrics = result.metrics();
    assert_eq!(metrics.challenge_timeouts, 1);
    assert!(metrics.challenges_resolved >= 1);
    let navigate = result.step(StepName::Navigate).unwrap();
    let timed_out = navigate
        .attempt_log
        .iter()
        .filter(|entry| entry.category == Some(ErrorCategory::ChallengeTimeout))
        .count();
    assert_eq!(timed_out, 1);
    assert_eq!(navigate.outcome, StepOutcome::Success);
}

#[tokio::test]
async fn unresolvable_page_aborts_but_keeps_screenshots() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let script = Script {
        detail_url: "https://www.zoopla.co.uk/new-homes/".into(),
        snapshot: PageSnapshot::default(),
        ..Script::default()
    };
    let (engine, journal, encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(!result.success());
    assert_eq!(result.aborted_at(), Some(StepName::ExtractData));
    let extract = result.step(StepName::ExtractData).unwrap();
    assert_eq!(extract.outcome, StepOutcome::Failed);
    assert_eq!(extract.attempts, 1);
    assert_eq!(
        result.step(StepName::GenerateVideo).unwrap().outcome,
        StepOutcome::Skipped
    );
    assert!(result.property().is_none());
    assert!(result.video().is_none());
    assert_eq!(result.screenshots().len(), 7);
    assert!(result.screenshots().iter().all(|shot| shot.path.exists()));
    assert!(encoder.requests.lock().unwrap().is_empty());
    assert_eq!(journal.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn listing_click_that_stays_on_results_aborts_extraction() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let script = Script {
        detail_url: "https://www.zoopla.co.uk/for-sale/property/manchester/".into(),
        snapshot: PageSnapshot {
            title: "Property for sale in Manchester | Zoopla".into(),
            headings: vec!["Property for sale in Manchester".into()],
            price_candidates: vec!["£250,000".into()],
            ..PageSnapshot::default()
        },
        ..Script::default()
    };
    let (engine, _journal, encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(!result.success());
    assert_eq!(result.aborted_at(), Some(StepName::ExtractData));
    assert!(result.property().is_none());
    let extract = result.step(StepName::ExtractData).unwrap();
    assert_eq!(extract.outcome, StepOutcome::Failed);
    assert!(extract
        .last_error
        .as_deref()
        .unwrap()
        .contains("not a property detail page"));
    assert!(encoder.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn partial_property_still_counts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.workflow.primary_objective = PrimaryObjective::PropertySelected;
    let mut script = Script::default();
    script.snapshot.price_candidates.clear();
    let (engine, _journal, _encoder) = engine(config, script);

    let result = engine.run("Manchester").await;

    assert!(result.success());
    let property = result.property().unwrap();
    assert!(property.price.is_none());
    assert!(property.title.is_some());
    assert!(property.address.is_some());
    assert!(property.is_partial());
    assert_eq!(
        result.step(StepName::ExtractData).unwrap().outcome,
        StepOutcome::Success
    );
}

#[tokio::test]
async fn encoder_failure_keeps_data() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.workflow.primary_objective = PrimaryObjective::PropertyOrVideo;
    let (provider, _journal) = MockProvider::new(Script::default());
    let encoder = Arc::new(MockEncoder {
        fail: true,
        ..MockEncoder::default()
    });
    let engine = WorkflowEngine::new(config, provider, encoder.clone());

    let result = engine.run("Manchester").await;

    assert!(result.success());
    assert!(result.property().is_some());
    assert!(result.video().is_none());
    let video = result.step(StepName::GenerateVideo).unwrap();
    assert_eq!(video.outcome, StepOutcome::Failed);
    assert_eq!(video.attempts, 1);
    assert_eq!(encoder.requests.lock().unwrap().len(), 1);
    assert_eq!(result.aborted_at(), Some(StepName::GenerateVideo));
}

#[tokio::test]
async fn empty_city_is_rejected_without_a_session() {
    let dir = TempDir::new().unwrap();
    let (engine, journal, _encoder) = engine(test_config(dir.path()), Script::default());

    let result = engine.run("   ").await;

    assert!(!result.success());
    assert!(result.error().unwrap().contains("city name is empty"));
    assert!(result
        .steps()
        .iter()
        .all(|step| step.outcome == StepOutcome::Skipped));
    assert!(result.session().is_none());
    assert_eq!(journal.lock().unwrap().opened, 0);
}

#[tokio::test]
async fn concurrent_cities_do_not_share_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let (engine, journal, _encoder) = engine(config, Script::default());

    let (leeds, york) = tokio::join!(engine.run("Leeds"), engine.run("York"));

    assert!(leeds.success() && york.success());
    assert_ne!(leeds.session_id(), york.session_id());
    for result in [&leeds, &york] {
        assert_eq!(result.screenshots()[0].sequence, 1);
        let session = result.session_id().unwrap();
        assert!(result
            .screenshots()
            .iter()
            .all(|shot| shot.session_id == session));
    }
    assert_eq!(journal.lock().unwrap().opened, 2);
}

#[tokio::test]
async fn cancellation_aborts_with_partial_result() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.workflow.results_wait_ms = 300;
    let script = Script {
        honour_waits: true,
        ..Script::default()
    };
    let (engine, journal, encoder) = engine(config, script);
    let signal = CancellationToken::new();

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        signal.cancel();
    };
    let (result, _) = tokio::join!(engine.run_with_cancel("Manchester", signal.clone()), canceller);

    assert!(!result.success());
    let aborted = result.aborted_at().expect("aborted step");
    let failed = result.step(aborted).unwrap();
    assert_eq!(failed.outcome, StepOutcome::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("cancelled"));
    assert!(!result.screenshots().is_empty());
    assert_eq!(
        result.step(StepName::GenerateVideo).unwrap().outcome,
        StepOutcome::Skipped
    );
    assert!(encoder.requests.lock().unwrap().is_empty());
    assert_eq!(journal.lock().unwrap().closed, 1);
}

#[tokio::test]
async fn runs_are_recorded_in_telemetry() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let telemetry = Arc::new(
        AutomationTelemetry::new(config.failure_log_path(), config.metrics_db_path()).unwrap(),
    );
    let script = Script {
        transient_failures: 1,
        ..Script::default()
    };
    let (provider, _journal) = MockProvider::new(script);
    let engine = WorkflowEngine::new(config, provider, Arc::new(MockEncoder::default()))
        .with_telemetry(Arc::clone(&telemetry));

    let result = engine.run("Bristol").await;
    assert!(result.success());
    let written = result.write_json(dir.path()).await.unwrap();
    assert!(written.ends_with("automation_results_bristol.json"));

    let conn = Connection::open(telemetry.database_path()).unwrap();
    let (city, success): (String, i64) = conn
        .query_row("SELECT city, success FROM workflow_runs", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap();
    assert_eq!((city.as_str(), success), ("Bristol", 1));
    let failures: i64 = conn
        .query_row("SELECT COUNT(*) FROM attempt_failures", [], |row| row.get(0))
        .unwrap();
    assert_eq!(failures, 1);
}
