use rand::Rng;
use tracing::debug;

use crate::browser::{
    ActionCommand, ActionOutcome, ActionSpec, AutomationError, AutomationResult, ProviderSession,
};
use crate::config::{AutomationConfig, SelectionPolicy, SelectorSection, SiteSection, WorkflowSection};

use super::step::StepName;

/// One provider action plus the checkpoint sub-label captured after it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub spec: ActionSpec,
    pub checkpoint: Option<String>,
}

impl PlannedAction {
    fn new(spec: ActionSpec, checkpoint: Option<&str>) -> Self {
        Self {
            spec,
            checkpoint: checkpoint.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    site: SiteSection,
    selectors: SelectorSection,
    workflow: WorkflowSection,
}

impl StepExecutor {
    pub fn new(config: &AutomationConfig) -> Self {
        Self {
            site: config.site.clone(),
            selectors: config.selectors.clone(),
            workflow: config.workflow.clone(),
        }
    }

    /// Expands a page step into provider actions. `current_url` lets
    /// OpenListings skip its click when the search already landed on results.
    pub fn plan(
        &self,
        step: StepName,
        city: &str,
        current_url: Option<&str>,
    ) -> AutomationResult<Vec<PlannedAction>> {
        let actions = match step {
            StepName::Navigate => {
                let goto = ActionSpec::new(
                    format!("Open {}", self.site.base_url),
                    ActionCommand::Goto {
                        url: self.site.base_url.clone(),
                    },
                );
                if self.selectors.consent_buttons.is_empty() {
                    vec![PlannedAction::new(goto, Some("homepage"))]
                } else {
                    vec![
                        PlannedAction::new(goto, None),
                        PlannedAction::new(
                            ActionSpec::new(
                                "Accept the cookie consent prompt if one is shown",
                                ActionCommand::DismissConsent {
                                    selectors: self.selectors.consent_buttons.clone(),
                                },
                            ),
                            Some("homepage"),
                        ),
                    ]
                }
            }
            StepName::SearchCity => {
                let city = city.trim();
                if city.is_empty() {
                    return Err(AutomationError::InvalidInput("city name is empty".into()));
                }
                vec![
                    PlannedAction::new(
                        ActionSpec::new(
                            format!("Type '{city}' into the location search box"),
                            ActionCommand::Type {
                                selectors: self.selectors.search_input.clone(),
                                text: city.to_string(),
                            },
                        ),
                        Some("typed"),
                    ),
                    PlannedAction::new(
                        ActionSpec::new(
                            "Click the search button",
                            ActionCommand::Click {
                                selectors: self.selectors.search_button.clone(),
                            },
                        ),
                        Some("clicked"),
                    ),
                    PlannedAction::new(
                        ActionSpec::new(
                            "Wait for the search results to load",
                            ActionCommand::Wait {
                                millis: self.workflow.results_wait_ms,
                            },
                        ),
                        Some("results"),
                    ),
                ]
            }
            StepName::OpenListings => {
                if current_url.is_some_and(|url| self.is_listings_url(url)) {
                    debug!(url = current_url, "already on listings; skipping click");
                    vec![PlannedAction::new(
                        ActionSpec::new(
                            "Stay on the current listings page",
                            ActionCommand::Wait { millis: 0 },
                        ),
                        Some("listings"),
                    )]
                } else {
                    vec![PlannedAction::new(
                        ActionSpec::new(
                            "Click the 'For Sale' link to open property listings",
                            ActionCommand::Click {
                                selectors: self.selectors.listings_link.clone(),
                            },
                        ),
                        Some("listings"),
                    )]
                }
            }
            StepName::Scroll => (1..=self.workflow.scroll_count.max(1))
                .map(|index| {
                    PlannedAction::new(
                        ActionSpec::new(
                            "Scroll down to reveal more property listings",
                            ActionCommand::Scroll {
                                delta_y: self.workflow.scroll_delta_px,
                            },
                        ),
                        Some(&format!("scroll_{index:02}")),
                    )
                })
                .collect(),
            StepName::SelectProperty => {
                let ordinal = self.selection_ordinal();
                vec![PlannedAction::new(
                    ActionSpec::new(
                        format!("Click property listing number {ordinal} to open its details"),
                        ActionCommand::SelectListing {
                            selectors: self.selectors.property_cards.clone(),
                            ordinal,
                        },
                    ),
                    Some("selected"),
                )]
            }
            StepName::ExtractData | StepName::GenerateVideo => {
                return Err(AutomationError::Unexpected(format!(
                    "{step} has no provider actions"
                )))
            }
        };
        Ok(actions)
    }

    pub async fn execute(
        &self,
        session: &mut dyn ProviderSession,
        spec: &ActionSpec,
    ) -> AutomationResult<ActionOutcome> {
        debug!(
            session = session.id(),
            command = spec.command.kind(),
            instruction = %spec.instruction,
            "executing action"
        );
        session.perform(spec).await
    }

    pub fn is_listings_url(&self, url: &str) -> bool {
        self.site
            .listings_url_markers
            .iter()
            .any(|marker| !marker.is_empty() && url.contains(marker.as_str()))
    }

    fn selection_ordinal(&self) -> usize {
        match self.workflow.selection {
            SelectionPolicy::First => 1,
            SelectionPolicy::Random => {
                rand::thread_rng().gen_range(1..=self.workflow.random_max.max(1))
            }
        }
    }
}
