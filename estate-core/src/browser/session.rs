use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AutomationResult;
use super::metadata::PageSnapshot;

/// Structured half of an action; the instruction text travels alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ActionCommand {
    Goto { url: String },
    DismissConsent { selectors: Vec<String> },
    Type { selectors: Vec<String>, text: String },
    Click { selectors: Vec<String> },
    Wait { millis: u64 },
    Scroll { delta_y: f64 },
    SelectListing { selectors: Vec<String>, ordinal: usize },
}

impl ActionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionCommand::Goto { .. } => "goto",
            ActionCommand::DismissConsent { .. } => "dismiss_consent",
            ActionCommand::Type { .. } => "type",
            ActionCommand::Click { .. } => "click",
            ActionCommand::Wait { .. } => "wait",
            ActionCommand::Scroll { .. } => "scroll",
            ActionCommand::SelectListing { .. } => "select_listing",
        }
    }

    /// Whether the command can land the session on a new document.
    pub fn touches_page(&self) -> bool {
        !matches!(self, ActionCommand::Wait { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub instruction: String,
    pub command: ActionCommand,
}

impl ActionSpec {
    pub fn new(instruction: impl Into<String>, command: ActionCommand) -> Self {
        Self {
            instruction: instruction.into(),
            command,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub url: Option<String>,
    pub detail: Option<String>,
}

/// Raw view of the current document used for challenge detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum PageTag {
    #[default]
    Unknown,
    Navigable,
    Challenge { signature: String },
}

impl PageTag {
    pub fn is_challenge(&self) -> bool {
        matches!(self, PageTag::Challenge { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
    page_tag: PageTag,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            terminated_at: None,
            page_tag: PageTag::Unknown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn terminated_at(&self) -> Option<DateTime<Utc>> {
        self.terminated_at
    }

    pub fn page_tag(&self) -> &PageTag {
        &self.page_tag
    }

    pub fn is_active(&self) -> bool {
        self.terminated_at.is_none()
    }

    pub fn mark_page(&mut self, tag: PageTag) {
        self.page_tag = tag;
    }

    pub fn terminate(&mut self) {
        if self.terminated_at.is_none() {
            self.terminated_at = Some(Utc::now());
        }
    }
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn open_session(&self) -> AutomationResult<Box<dyn ProviderSession>>;
}

/// Capability over one live session. Owned by a single workflow run.
#[async_trait]
pub trait ProviderSession: Send {
    fn id(&self) -> &str;

    async fn perform(&mut self, action: &ActionSpec) -> AutomationResult<ActionOutcome>;

    async fn page_state(&mut self) -> AutomationResult<PageState>;

    async fn screenshot(&mut self) -> AutomationResult<Vec<u8>>;

    async fn snapshot(&mut self) -> AutomationResult<PageSnapshot>;

    async fn current_url(&mut self) -> AutomationResult<Option<String>>;

    async fn close(self: Box<Self>) -> AutomationResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_terminates_once() {
        let mut session = Session::new("abc");
        assert!(session.is_active());
        session.terminate();
        let first = session.terminated_at();
        session.terminate();
        assert_eq!(session.terminated_at(), first);
        assert!(!session.is_active());
    }

    #[test]
    fn action_spec_serializes_with_command_tag() {
        let spec = ActionSpec::new(
            "scroll down the results",
            ActionCommand::Scroll { delta_y: 800.0 },
        );
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["command"]["command"], "scroll");
        assert!(spec.command.touches_page());
        assert!(!ActionCommand::Wait { millis: 5 }.touches_page());
    }
}
