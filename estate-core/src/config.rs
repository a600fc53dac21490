use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AutomationConfig {
    pub site: SiteSection,
    pub provider: ProviderSection,
    pub pacing: PacingSection,
    pub selectors: SelectorSection,
    pub retry: RetrySection,
    pub challenge: ChallengeSection,
    pub recorder: RecorderSection,
    pub video: VideoSection,
    pub workflow: WorkflowSection,
    pub observability: ObservabilitySection,
}

impl AutomationConfig {
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Applies `ESTATE_*` overrides from an arbitrary key/value source.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                "ESTATE_VIDEO_WIDTH" => self.video.width = parse_override(key, value)?,
                "ESTATE_VIDEO_HEIGHT" => self.video.height = parse_override(key, value)?,
                "ESTATE_VIDEO_FPS" => self.video.frame_rate = parse_override(key, value)?,
                "ESTATE_MAX_RETRIES" => self.retry.max_attempts = parse_override(key, value)?,
                "ESTATE_RETRY_DELAY_MS" => self.retry.base_delay_ms = parse_override(key, value)?,
                "ESTATE_VIDEOS_DIR" => self.video.output_dir = value.to_string(),
                "ESTATE_LOGS_DIR" => {
                    self.observability.logs_dir = value.to_string();
                }
                "ESTATE_CHROMIUM_PATH" if !value.is_empty() => {
                    self.provider.executable_path = Some(value.to_string());
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.video.frame_rate == 0 {
            return Err(ConfigError::Invalid("video.frame_rate must be positive".into()));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid(
                "video resolution must be non-zero".into(),
            ));
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "video resolution {}x{} must use even dimensions for yuv420p",
                self.video.width, self.video.height
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.challenge.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "challenge.poll_interval_ms must be positive".into(),
            ));
        }
        if self.workflow.selection == SelectionPolicy::Random && self.workflow.random_max == 0 {
            return Err(ConfigError::Invalid(
                "workflow.random_max must be positive for random selection".into(),
            ));
        }
        Url::parse(&self.site.base_url).map_err(|err| {
            ConfigError::Invalid(format!("site.base_url '{}': {err}", self.site.base_url))
        })?;
        Ok(())
    }

    pub fn failure_log_path(&self) -> PathBuf {
        Path::new(&self.observability.logs_dir).join(&self.observability.failure_log)
    }

    pub fn metrics_db_path(&self) -> PathBuf {
        Path::new(&self.observability.logs_dir).join(&self.observability.metrics_db)
    }
}

fn parse_override<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| ConfigError::Override {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub base_url: String,
    /// Keyword expected in the title of a genuine site page.
    pub name: String,
    pub listings_url_markers: Vec<String>,
    pub detail_url_markers: Vec<String>,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            base_url: "https://www.zoopla.co.uk".into(),
            name: "zoopla".into(),
            listings_url_markers: vec!["/for-sale/".into(), "/to-rent/".into()],
            detail_url_markers: vec!["/details/".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: true,
            disable_gpu: true,
            user_agent: None,
            lang: Some("en-GB".into()),
            request_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub typing_cadence_cpm: [u32; 2],
    pub typing_jitter_ms: [u32; 2],
    pub click_hesitation_ms: [u32; 2],
    pub scroll_pause_ms: [u32; 2],
    pub page_settle_ms: [u32; 2],
}

impl Default for PacingSection {
    fn default() -> Self {
        Self {
            typing_cadence_cpm: [220, 320],
            typing_jitter_ms: [15, 60],
            click_hesitation_ms: [120, 400],
            scroll_pause_ms: [600, 1400],
            page_settle_ms: [1500, 3000],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub consent_buttons: Vec<String>,
    pub search_input: Vec<String>,
    pub search_button: Vec<String>,
    pub listings_link: Vec<String>,
    pub property_cards: Vec<String>,
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub address: Vec<String>,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            consent_buttons: vec![
                "#onetrust-accept-btn-handler".into(),
                "button[aria-label*='Accept']".into(),
            ],
            search_input: vec![
                "input[name='autosuggest-input']".into(),
                "input[type='search']".into(),
            ],
            search_button: vec![
                "button[type='submit']".into(),
                "button[data-testid='search-button']".into(),
            ],
            listings_link: vec!["a[href*='/for-sale/']".into()],
            property_cards: vec![
                "a[data-testid='listing-details-link']".into(),
                "a[href*='/details/']".into(),
            ],
            title: vec!["h1".into(), "[data-testid='title-label']".into()],
            price: vec![
                "[data-testid='price']".into(),
                "p[data-testid='price']".into(),
            ],
            address: vec![
                "address".into(),
                "[data-testid='address-label']".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChallengeSection {
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
    pub signatures: Vec<String>,
    pub short_page_markers: Vec<String>,
    pub short_page_threshold: usize,
    pub trusted_title_keywords: Vec<String>,
}

impl Default for ChallengeSection {
    fn default() -> Self {
        let signatures = [
            "access denied",
            "captcha required",
            "verify you are human",
            "rate limit exceeded",
            "too many requests",
            "suspicious activity detected",
            "bot detection enabled",
            "automated requests blocked",
            "you have been blocked",
            "access to this page has been denied",
            "please complete the captcha",
            "rate limit has been exceeded",
            "automated requests are not allowed",
        ];
        Self {
            poll_interval_ms: 1_000,
            timeout_seconds: 30,
            signatures: signatures.iter().map(|s| s.to_string()).collect(),
            short_page_markers: vec!["blocked".into(), "denied".into(), "captcha".into()],
            short_page_threshold: 200,
            trusted_title_keywords: vec![
                "property".into(),
                "search".into(),
                "buy".into(),
                "rent".into(),
                "house".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderSection {
    pub screenshots_dir: String,
    pub settle_delay_ms: u64,
    pub retention_days: u64,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            screenshots_dir: "screenshots".into(),
            settle_delay_ms: 1_000,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoSection {
    pub output_dir: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub timeout_seconds: u64,
}

impl Default for VideoSection {
    fn default() -> Self {
        Self {
            output_dir: "videos".into(),
            width: 1280,
            height: 720,
            frame_rate: 2,
            ffmpeg_binary: "ffmpeg".into(),
            ffprobe_binary: "ffprobe".into(),
            timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    First,
    Random,
}

/// Condition that decides `RunResult::success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryObjective {
    PropertySelected,
    VideoProduced,
    PropertyOrVideo,
    #[default]
    PropertyAndVideo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub scroll_count: u32,
    pub scroll_delta_px: f64,
    pub results_wait_ms: u64,
    pub selection: SelectionPolicy,
    pub random_max: usize,
    pub primary_objective: PrimaryObjective,
    pub results_dir: String,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            scroll_count: 1,
            scroll_delta_px: 800.0,
            results_wait_ms: 4_000,
            selection: SelectionPolicy::First,
            random_max: 6,
            primary_objective: PrimaryObjective::default(),
            results_dir: ".".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub logs_dir: String,
    pub failure_log: String,
    pub metrics_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            logs_dir: "logs".into(),
            failure_log: "failures.ndjson".into(),
            metrics_db: "automation.sqlite".into(),
        }
    }
}

pub fn load_automation_config<P: AsRef<Path>>(path: P) -> Result<AutomationConfig> {
    let config: AutomationConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
