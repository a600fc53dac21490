use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AutomationConfig, ProviderSection, SelectorSection};

use super::error::{AutomationError, AutomationResult};
use super::human::HumanPacing;
use super::metadata::{snapshot_script, PageSnapshot};
use super::session::{
    ActionCommand, ActionOutcome, ActionSpec, PageState, ProviderSession, SessionProvider,
};

const PAGE_STATE_SCRIPT: &str = r#"
(() => ({
    url: location.href,
    title: document.title || '',
    text: (document.body ? document.body.innerText : '').slice(0, 5000)
}))()
"#;

/// Local headless Chromium driven over CDP.
#[derive(Debug, Clone)]
pub struct ChromiumProvider {
    provider: ProviderSection,
    selectors: SelectorSection,
    pacing: HumanPacing,
    width: u32,
    height: u32,
}

impl ChromiumProvider {
    pub fn new(config: &AutomationConfig) -> Self {
        Self {
            provider: config.provider.clone(),
            selectors: config.selectors.clone(),
            pacing: HumanPacing::new(config.pacing.clone()),
            width: config.video.width,
            height: config.video.height,
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.provider.headless = headless;
        self
    }

    fn build_chromium_config(&self) -> AutomationResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .window_size(self.width, self.height)
            .viewport(ChromiumViewport {
                width: self.width,
                height: self.height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: self.width >= self.height,
                has_touch: false,
            })
            .request_timeout(Duration::from_secs(self.provider.request_timeout_seconds));

        if let Some(path) = &self.provider.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.provider.headless {
            builder = builder.with_head();
        }
        if !self.provider.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![
            "--no-first-run".to_string(),
            "--mute-audio".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.provider.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(user_agent) = &self.provider.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        if let Some(lang) = &self.provider.lang {
            args.push(format!("--lang={lang}"));
        }
        builder = builder.args(args);

        builder.build().map_err(AutomationError::Configuration)
    }
}

#[async_trait]
impl SessionProvider for ChromiumProvider {
    fn name(&self) -> &str {
        "chromium"
    }

    async fn open_session(&self) -> AutomationResult<Box<dyn ProviderSession>> {
        let chromium_config = self.build_chromium_config()?;
        let id = Uuid::new_v4().to_string();
        info!(
            session = %id,
            width = self.width,
            height = self.height,
            headless = self.provider.headless,
            "launching Chromium session"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| AutomationError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = match browser.new_page(CreateTargetParams::new("about:blank")).await {
            Ok(page) => page,
            Err(err) => {
                let mut browser = browser;
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "failed to close browser after page error");
                }
                handler_task.abort();
                return Err(err.into());
            }
        };

        Ok(Box::new(ChromiumSession {
            id,
            browser,
            page,
            handler_task: Some(handler_task),
            pacing: self.pacing.clone(),
            selectors: self.selectors.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct ChromiumSession {
    id: String,
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    pacing: HumanPacing,
    selectors: SelectorSection,
}

impl ChromiumSession {
    async fn goto(&self, url: &str) -> AutomationResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(AutomationError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn first_match(&self, selectors: &[String]) -> AutomationResult<Element> {
        for selector in selectors {
            if let Ok(element) = self.page.find_element(selector.as_str()).await {
                return Ok(element);
            }
        }
        Err(AutomationError::ElementNotFound(selectors.join(", ")))
    }

    async fn nth_match(&self, selectors: &[String], ordinal: usize) -> AutomationResult<Element> {
        for selector in selectors {
            let Ok(mut elements) = self.page.find_elements(selector.as_str()).await else {
                continue;
            };
            if elements.is_empty() {
                continue;
            }
            let index = ordinal.max(1).min(elements.len()) - 1;
            return Ok(elements.swap_remove(index));
        }
        Err(AutomationError::ElementNotFound(selectors.join(", ")))
    }

    async fn url(&self) -> AutomationResult<Option<String>> {
        Ok(self.page.url().await?)
    }
}

#[async_trait]
impl ProviderSession for ChromiumSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn perform(&mut self, action: &ActionSpec) -> AutomationResult<ActionOutcome> {
        debug!(
            session = %self.id,
            command = action.command.kind(),
            instruction = %action.instruction,
            "performing action"
        );
        let mut detail = None;
        match &action.command {
            ActionCommand::Goto { url } => {
                self.goto(url).await?;
                self.pacing.settle().await;
            }
            ActionCommand::DismissConsent { selectors } => {
                match self.first_match(selectors).await {
                    Ok(element) => {
                        self.pacing.click_element(&element).await?;
                        detail = Some("consent dismissed".to_string());
                    }
                    Err(_) => detail = Some("no consent prompt".to_string()),
                }
            }
            ActionCommand::Type { selectors, text } => {
                let element = self.first_match(selectors).await?;
                self.pacing.type_text(&element, text).await?;
            }
            ActionCommand::Click { selectors } => {
                let element = self.first_match(selectors).await?;
                self.pacing.click_element(&element).await?;
                self.pacing.settle().await;
            }
            ActionCommand::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ActionCommand::Scroll { delta_y } => {
                self.pacing.scroll_by(&self.page, *delta_y).await?;
            }
            ActionCommand::SelectListing { selectors, ordinal } => {
                let element = self.nth_match(selectors, *ordinal).await?;
                detail = element.attribute("href").await.ok().flatten();
                self.pacing.click_element(&element).await?;
                self.pacing.settle().await;
            }
        }
        Ok(ActionOutcome {
            url: self.url().await?,
            detail,
        })
    }

    async fn page_state(&mut self) -> AutomationResult<PageState> {
        self.page
            .evaluate(PAGE_STATE_SCRIPT)
            .await?
            .into_value::<PageState>()
            .map_err(|err| AutomationError::Unexpected(format!("invalid page state: {err}")))
    }

    async fn screenshot(&mut self) -> AutomationResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn snapshot(&mut self) -> AutomationResult<PageSnapshot> {
        let script = snapshot_script(&self.selectors);
        self.page
            .evaluate(script.as_str())
            .await?
            .into_value()
            .map_err(|err| AutomationError::Extraction(format!("invalid page snapshot: {err}")))
    }

    async fn current_url(&mut self) -> AutomationResult<Option<String>> {
        self.url().await
    }

    async fn close(self: Box<Self>) -> AutomationResult<()> {
        let mut session = self;
        info!(session = %session.id, "shutting down Chromium session");
        if let Err(err) = session.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = session.handler_task.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(session = %self.id, "Chromium session dropped without explicit close");
            }
        }
    }
}
