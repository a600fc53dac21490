mod automation;
mod challenge;
mod error;
mod error_handler;
mod human;
mod metadata;
mod metrics;
mod retry;
mod session;

pub use automation::{ChromiumProvider, ChromiumSession};
pub use challenge::{ChallengeHandler, ChallengeReport, ChallengeSignatures, ChallengeState};
pub use error::{AutomationError, AutomationResult};
pub use error_handler::{
    classify, map_category, telemetry_failure, AttemptScope, AutomationTelemetry, ErrorCategorizer,
    ErrorCategory, FailureClass, FailureContext, RemediationAction, RunContext, TelemetryError,
};
pub use human::HumanPacing;
pub use metadata::{snapshot_script, PageSnapshot, Price, PropertyExtractor, PropertyRecord};
pub use metrics::SessionMetrics;
pub use retry::{AttemptRecord, RetryController, RetryFailure, RetryOutcome, RetryPolicy, RetryState};
pub use session::{
    ActionCommand, ActionOutcome, ActionSpec, PageState, PageTag, ProviderSession, Session,
    SessionProvider,
};
