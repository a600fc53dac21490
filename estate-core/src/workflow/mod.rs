mod executor;
mod machine;
mod report;
mod step;

pub use executor::{PlannedAction, StepExecutor};
pub use machine::WorkflowEngine;
pub use report::{RunReportBuilder, RunResult};
pub use step::{StepFailure, StepLedger, StepName, StepOutcome, StepRecord, WorkflowState};
