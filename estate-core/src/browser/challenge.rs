use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ChallengeSection, SiteSection};

use super::error::{AutomationError, AutomationResult};
use super::session::{PageState, PageTag, ProviderSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Unchallenged,
    ChallengeDetected,
    Resolving,
    Resolved,
    TimedOut,
}

impl ChallengeState {
    fn can_advance_to(self, next: ChallengeState) -> bool {
        matches!(
            (self, next),
            (ChallengeState::Unchallenged, ChallengeState::ChallengeDetected)
                | (ChallengeState::ChallengeDetected, ChallengeState::Resolving)
                | (ChallengeState::Resolving, ChallengeState::Resolved)
                | (ChallengeState::Resolving, ChallengeState::TimedOut)
        )
    }
}

/// Text markers that identify an interstitial instead of site content.
#[derive(Debug, Clone)]
pub struct ChallengeSignatures {
    signatures: Vec<String>,
    short_page_markers: Vec<String>,
    short_page_threshold: usize,
    site_keyword: String,
    trusted_title_keywords: Vec<String>,
}

impl ChallengeSignatures {
    pub fn new(config: &ChallengeSection, site: &SiteSection) -> Self {
        Self {
            signatures: lowercase_all(&config.signatures),
            short_page_markers: lowercase_all(&config.short_page_markers),
            short_page_threshold: config.short_page_threshold,
            site_keyword: site.name.trim().to_lowercase(),
            trusted_title_keywords: lowercase_all(&config.trusted_title_keywords),
        }
    }

    pub fn classify(&self, state: &PageState) -> PageTag {
        let title = state.title.to_lowercase();
        if !self.site_keyword.is_empty()
            && title.contains(&self.site_keyword)
            && self
                .trusted_title_keywords
                .iter()
                .any(|keyword| title.contains(keyword))
        {
            return PageTag::Navigable;
        }

        let text = state.text.to_lowercase();
        if let Some(signature) = self
            .signatures
            .iter()
            .find(|signature| text.contains(signature.as_str()) || title.contains(signature.as_str()))
        {
            return PageTag::Challenge {
                signature: signature.clone(),
            };
        }

        if state.text.trim().len() < self.short_page_threshold {
            if let Some(marker) = self
                .short_page_markers
                .iter()
                .find(|marker| text.contains(marker.as_str()))
            {
                return PageTag::Challenge {
                    signature: marker.clone(),
                };
            }
        }

        PageTag::Navigable
    }
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ChallengeReport {
    pub final_state: ChallengeState,
    pub transitions: Vec<ChallengeState>,
    pub signature: Option<String>,
    pub polls: u32,
    pub waited_ms: u64,
    pub page_tag: PageTag,
}

impl ChallengeReport {
    pub fn was_challenged(&self) -> bool {
        self.signature.is_some()
    }
}

#[derive(Debug)]
struct ChallengeTracker {
    state: ChallengeState,
    transitions: Vec<ChallengeState>,
}

impl ChallengeTracker {
    fn new() -> Self {
        Self {
            state: ChallengeState::Unchallenged,
            transitions: vec![ChallengeState::Unchallenged],
        }
    }

    fn advance(&mut self, next: ChallengeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal challenge transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "challenge transition");
        self.state = next;
        self.transitions.push(next);
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeHandler {
    signatures: ChallengeSignatures,
    poll_interval: Duration,
    timeout: Duration,
}

impl ChallengeHandler {
    pub fn new(config: &ChallengeSection, site: &SiteSection) -> Self {
        Self {
            signatures: ChallengeSignatures::new(config, site),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self.timeout = timeout;
        self
    }

    pub fn signatures(&self) -> &ChallengeSignatures {
        &self.signatures
    }

    /// Inspects the page and, if an interstitial is showing, waits passively until
    /// it clears or the ceiling is reached. A timeout surfaces as a retryable error.
    pub async fn settle(
        &self,
        session: &mut dyn ProviderSession,
        cancel: &CancellationToken,
    ) -> AutomationResult<ChallengeReport> {
        let mut tracker = ChallengeTracker::new();
        let state = session.page_state().await?;
        let tag = self.signatures.classify(&state);
        let signature = match tag {
            PageTag::Challenge { signature } => signature,
            other => {
                return Ok(ChallengeReport {
                    final_state: tracker.state,
                    transitions: tracker.transitions,
                    signature: None,
                    polls: 0,
                    waited_ms: 0,
                    page_tag: other,
                });
            }
        };

        warn!(
            session = session.id(),
            url = %state.url,
            signature = %signature,
            "anti-bot challenge detected; waiting for the page to clear"
        );
        tracker.advance(ChallengeState::ChallengeDetected);
        tracker.advance(ChallengeState::Resolving);

        let started = Instant::now();
        let mut polls = 0u32;
        loop {
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(AutomationError::Cancelled),
            }
            polls += 1;
            let state = session.page_state().await?;
            let tag = self.signatures.classify(&state);
            let waited = started.elapsed();
            if !tag.is_challenge() {
                tracker.advance(ChallengeState::Resolved);
                info!(
                    session = session.id(),
                    polls,
                    waited_ms = waited.as_millis() as u64,
                    "challenge cleared"
                );
                return Ok(ChallengeReport {
                    final_state: tracker.state,
                    transitions: tracker.transitions,
                    signature: Some(signature),
                    polls,
                    waited_ms: waited.as_millis() as u64,
                    page_tag: tag,
                });
            }
            if waited >= self.timeout {
                tracker.advance(ChallengeState::TimedOut);
                warn!(
                    session = session.id(),
                    polls,
                    waited_ms = waited.as_millis() as u64,
                    "challenge did not clear before the timeout"
                );
                return Err(AutomationError::ChallengeTimeout {
                    signature,
                    waited_secs: waited.as_secs(),
                });
            }
        }
    }
}
