pub mod browser;
pub mod config;
pub mod error;
pub mod media;
pub mod workflow;

pub use browser::{
    AutomationError, AutomationResult, AutomationTelemetry, ChromiumProvider, PropertyRecord,
    ProviderSession, SessionProvider,
};
pub use config::{
    load_automation_config, AutomationConfig, PrimaryObjective, SelectionPolicy,
};
pub use error::{ConfigError, Result};
pub use media::{FfmpegEncoder, FrameEncoder, VideoArtifact};
pub use tokio_util::sync::CancellationToken;
pub use workflow::{RunResult, StepName, StepOutcome, WorkflowEngine};
