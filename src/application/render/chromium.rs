//! Headless Chromium render engine.
//!
//! Browsers are launched lazily and kept in a [`Pool`]. Each render opens a
//! fresh page, sizes it to the job viewport, loads the template document, waits
//! for web fonts and captures a PNG of the viewport. The page is closed on every
//! exit path, including when the render future is dropped by a timeout.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::{
        browser_protocol::{
            emulation::SetDeviceMetricsOverrideParams, page::CaptureScreenshotFormat,
        },
        js_protocol::runtime::EvaluateParams,
    },
    page::ScreenshotParams,
};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::card::Viewport;

use super::{
    pool::{CheckoutError, Pool, PoolManager},
    templates::TemplateCatalog,
    types::{RenderEngine, RenderError, RenderJob},
};

const FONTS_READY: &str = "document.fonts.ready.then(() => true)";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

const LAUNCH_ARGS: &[&str] = &[
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-breakpad",
    "--disable-component-update",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-sync",
    "--hide-scrollbars",
    "--mute-audio",
    "--no-first-run",
    "--no-default-browser-check",
    "--allow-file-access-from-files",
];

/// Browser launch parameters.
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    /// Explicit executable; auto-detected when `None`.
    pub chrome_path: Option<PathBuf>,
    pub pool_size: usize,
    pub no_sandbox: bool,
    /// Per-command CDP timeout.
    pub request_timeout: Duration,
    pub viewport: Viewport,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            pool_size: 2,
            no_sandbox: false,
            request_timeout: Duration::from_secs(15),
            viewport: Viewport::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid browser configuration: {0}")]
    Config(String),
    #[error("failed to launch browser: {0}")]
    Launch(#[from] chromiumoxide::error::CdpError),
}

/// A running browser plus the task driving its CDP connection.
pub struct ManagedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// Launches and retires browser processes for the pool.
pub struct BrowserLauncher {
    options: ChromiumOptions,
}

impl BrowserLauncher {
    fn config(&self) -> Result<BrowserConfig, LaunchError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(self.options.request_timeout)
            .window_size(self.options.viewport.width, self.options.viewport.height)
            .args(LAUNCH_ARGS.iter().copied());
        if let Some(path) = &self.options.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        builder.build().map_err(LaunchError::Config)
    }
}

#[async_trait]
impl PoolManager for BrowserLauncher {
    type Resource = ManagedBrowser;
    type Error = LaunchError;

    async fn create(&self) -> Result<ManagedBrowser, LaunchError> {
        let started_at = Instant::now();
        let (browser, mut handler) = Browser::launch(self.config()?).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(
                        target = "application::render::chromium",
                        op = "chromium::handler",
                        error = %err,
                        "CDP handler stopped"
                    );
                    break;
                }
            }
        });

        info!(
            target = "application::render::chromium",
            op = "chromium::launch",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Launched headless browser"
        );
        Ok(ManagedBrowser { browser, handler })
    }

    async fn is_healthy(&self, resource: &ManagedBrowser) -> bool {
        if resource.handler.is_finished() {
            return false;
        }
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, resource.browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn destroy(&self, mut resource: ManagedBrowser) {
        if let Err(err) = resource.browser.close().await {
            debug!(
                target = "application::render::chromium",
                op = "chromium::destroy",
                error = %err,
                "Browser close command failed"
            );
        }
        let _ = resource.browser.wait().await;
        resource.handler.abort();
    }
}

/// Closes the page when dropped unless it was closed explicitly.
struct PageGuard {
    page: Option<Page>,
}

impl PageGuard {
    fn new(page: Page) -> Self {
        Self { page: Some(page) }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take()
            && let Err(err) = page.close().await
        {
            debug!(
                target = "application::render::chromium",
                op = "chromium::close_page",
                error = %err,
                "Failed to close page"
            );
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take()
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

impl std::ops::Deref for PageGuard {
    type Target = Page;

    fn deref(&self) -> &Page {
        match self.page.as_ref() {
            Some(page) => page,
            None => unreachable!("page accessed after close"),
        }
    }
}

/// Render engine backed by pooled headless Chromium instances.
pub struct ChromiumEngine {
    templates: TemplateCatalog,
    pool: Pool<BrowserLauncher>,
}

impl ChromiumEngine {
    pub fn new(templates: TemplateCatalog, options: ChromiumOptions) -> Self {
        let pool_size = options.pool_size;
        Self {
            templates,
            pool: Pool::new(BrowserLauncher { options }, pool_size),
        }
    }

    /// Close every idle browser.
    pub async fn shutdown(&self) {
        self.pool.drain().await;
    }

    async fn capture(&self, page: &Page, job: &RenderJob) -> Result<Bytes, RenderError> {
        let metrics = SetDeviceMetricsOverrideParams::new(
            i64::from(job.viewport.width),
            i64::from(job.viewport.height),
            1.0,
            false,
        );
        page.execute(metrics).await.map_err(RenderError::page_load)?;

        let url = self.templates.document_url(job).await?;
        page.goto(url.as_str()).await.map_err(RenderError::page_load)?;

        let fonts_ready = EvaluateParams::builder()
            .expression(FONTS_READY)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(RenderError::capture)?;
        page.evaluate_expression(fonts_ready)
            .await
            .map_err(RenderError::capture)?;

        let png = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(RenderError::capture)?;

        verify_dimensions(&png, job.viewport)?;
        Ok(Bytes::from(png))
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    fn name(&self) -> &'static str {
        "chromium"
    }

    async fn render(&self, job: &RenderJob) -> Result<Bytes, RenderError> {
        let started_at = Instant::now();
        // Fail on unknown templates before touching a browser.
        self.templates.resolve(&job.template).await?;

        let browser = self.pool.checkout().await.map_err(|err| match err {
            CheckoutError::Closed => RenderError::unavailable("browser pool closed"),
            CheckoutError::Create(launch) => RenderError::unavailable(launch),
        })?;

        let page = match browser.browser.new_page("about:blank").await {
            Ok(page) => PageGuard::new(page),
            Err(err) => {
                warn!(
                    target = "application::render::chromium",
                    op = "chromium::render",
                    result = "error",
                    error_code = "new_page",
                    error = %err,
                    "Browser refused a new page; discarding it"
                );
                browser.discard();
                return Err(RenderError::unavailable(err));
            }
        };

        let result = self.capture(&page, job).await;
        page.close().await;

        match &result {
            Ok(png) => info!(
                target = "application::render::chromium",
                op = "chromium::render",
                result = "ok",
                template = %job.template,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                png_bytes = png.len(),
                "Rendered card"
            ),
            Err(err) => warn!(
                target = "application::render::chromium",
                op = "chromium::render",
                result = "error",
                template = %job.template,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error_code = err.code(),
                error = %err,
                "Card render failed"
            ),
        }

        result
    }
}

fn verify_dimensions(png: &[u8], viewport: Viewport) -> Result<(), RenderError> {
    let size = imagesize::blob_size(png)
        .map_err(|err| RenderError::capture(format!("unreadable screenshot: {err}")))?;
    let expected = (viewport.width as usize, viewport.height as usize);
    if (size.width, size.height) != expected {
        return Err(RenderError::capture(format!(
            "screenshot is {}x{}, expected {}x{}",
            size.width, size.height, viewport.width, viewport.height
        )));
    }
    Ok(())
}
