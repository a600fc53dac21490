use std::ops::RangeInclusive;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;

use chromiumoxide::element::Element;
use chromiumoxide::page::Page;

use crate::config::PacingSection;

use super::error::{AutomationError, AutomationResult};

/// Human-like timing for provider actions. Holds no RNG so it stays `Send`.
#[derive(Debug, Clone)]
pub struct HumanPacing {
    config: PacingSection,
}

impl HumanPacing {
    pub fn new(config: PacingSection) -> Self {
        Self { config }
    }

    pub async fn click_element(&self, element: &Element) -> AutomationResult<()> {
        element.scroll_into_view().await.map_err(|err| {
            AutomationError::Unexpected(format!("failed to scroll element into view: {err}"))
        })?;
        sleep(self.click_hesitation()).await;
        element
            .click()
            .await
            .map_err(|err| AutomationError::Transport(format!("failed to click element: {err}")))?;
        Ok(())
    }

    pub async fn type_text(&self, element: &Element, text: &str) -> AutomationResult<()> {
        element.click().await.map_err(|err| {
            AutomationError::Transport(format!("failed to focus element before typing: {err}"))
        })?;
        for ch in text.chars() {
            element.type_str(ch.to_string()).await.map_err(|err| {
                AutomationError::Transport(format!("failed to type character: {err}"))
            })?;
            sleep(self.typing_delay()).await;
        }
        Ok(())
    }

    pub async fn scroll_by(&self, page: &Page, delta: f64) -> AutomationResult<()> {
        let js = format!("window.scrollBy({{ top: {delta}, behavior: 'smooth' }});");
        page.evaluate(js.as_str()).await.map_err(|err| {
            AutomationError::Transport(format!("failed to execute scroll script: {err}"))
        })?;
        sleep(self.scroll_pause()).await;
        Ok(())
    }

    pub async fn settle(&self) {
        sleep(self.page_settle()).await;
    }

    pub fn typing_delay(&self) -> Duration {
        let mut rng = thread_rng();
        let cadence = rng
            .gen_range(ordered(self.config.typing_cadence_cpm))
            .max(60) as f64;
        let base_delay = 60.0 / cadence;
        let jitter_ms = rng.gen_range(ordered(self.config.typing_jitter_ms));
        Duration::from_secs_f64(base_delay + jitter_ms as f64 / 1000.0)
    }

    pub fn click_hesitation(&self) -> Duration {
        random_duration(self.config.click_hesitation_ms)
    }

    pub fn scroll_pause(&self) -> Duration {
        random_duration(self.config.scroll_pause_ms)
    }

    pub fn page_settle(&self) -> Duration {
        random_duration(self.config.page_settle_ms)
    }
}

fn ordered(bounds: [u32; 2]) -> RangeInclusive<u32> {
    bounds[0].min(bounds[1])..=bounds[0].max(bounds[1])
}

fn random_duration(bounds: [u32; 2]) -> Duration {
    let ms = thread_rng().gen_range(ordered(bounds)) as u64;
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_stay_within_bounds() {
        let pacing = HumanPacing::new(PacingSection {
            typing_cadence_cpm: [300, 300],
            typing_jitter_ms: [0, 0],
            click_hesitation_ms: [400, 100],
            scroll_pause_ms: [0, 0],
            page_settle_ms: [10, 20],
        });
        assert_eq!(pacing.typing_delay(), Duration::from_millis(200));
        for _ in 0..20 {
            let hesitation = pacing.click_hesitation();
            assert!(hesitation >= Duration::from_millis(100));
            assert!(hesitation <= Duration::from_millis(400));
        }
        assert_eq!(pacing.scroll_pause(), Duration::ZERO);
        let settle = pacing.page_settle();
        assert!(settle >= Duration::from_millis(10) && settle <= Duration::from_millis(20));
    }
}
