//! Browser session options, capability construction and the launch
//! negotiation loop that recovers from version-mismatched drivers.

use crate::error::ProvisionError;
use async_trait::async_trait;
use serde_json::json;
use std::ops::Deref;
use thirtyfour::error::{WebDriverError, WebDriverErrorInfo, WebDriverResult};
use thirtyfour::{ChromiumLikeCapabilities, WebDriver, WebElement, WindowHandle};
use tokio::process::Child;
use tracing::warn;

const WEB_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/105.0.0.0 Safari/537.36 Edg/105.0.1343.33";
const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; HD1913) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/105.0.5195.79 Mobile Safari/537.36 EdgA/100.0.1185.50";

/// Browser profile directory used when cookie persistence is requested.
pub const BROWSER_DATA_DIR: &str = "stored_browser_data";

/// Substring of the launch failure raised when the browser cannot open its
/// DevTools port, usually because another process holds the profile directory.
const DEVTOOLS_PORT_SIGNATURE: &str = "devtoolsactiveport";

/// The device profile a session emulates, selecting the user-agent string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Web,
    Mobile,
}

impl Device {
    pub fn user_agent(self) -> &'static str {
        match self {
            Device::Web => WEB_USER_AGENT,
            Device::Mobile => MOBILE_USER_AGENT,
        }
    }
}

/// Options recognized by session creation.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub device: Device,
    pub headless: bool,
    pub persist_cookies: bool,
    pub no_sandbox: bool,
}

/// Applies the shared option set to a chromium-like capability object.
///
/// Both families take the same arguments; only the capability type differs
/// (`goog:chromeOptions` vs `ms:edgeOptions`).
pub(crate) fn apply_options<C>(caps: &mut C, opts: &SessionOptions) -> WebDriverResult<()>
where
    C: ChromiumLikeCapabilities,
{
    caps.add_arg("--disable-extensions")?;
    caps.add_arg("--window-size=1280,1024")?;
    caps.add_arg("--log-level=3")?;
    caps.add_arg("--disable-notifications")?;
    caps.add_arg("disable-infobars")?;
    caps.add_arg("--disable-gpu")?;
    caps.add_arg("--disable-dev-shm-usage")?;

    caps.add_experimental_option(
        "prefs",
        json!({
            "profile.default_content_setting_values.geolocation": 1,
            "profile.default_content_setting_values.notifications": 2,
            "profile.default_content_setting_values.images": 2,
        }),
    )?;

    if opts.headless {
        caps.add_arg("--headless=new")?;
    }

    caps.add_arg(&format!("user-agent={}", opts.device.user_agent()))?;

    if opts.persist_cookies {
        let profile = std::env::current_dir()
            .map_err(|e| {
                WebDriverError::UnknownError(WebDriverErrorInfo::new(format!(
                    "cannot resolve profile dir: {e}"
                )))
            })?
            .join(BROWSER_DATA_DIR);
        caps.add_arg(&format!("user-data-dir={}", profile.display()))?;
    }

    if opts.no_sandbox {
        caps.add_arg("--no-sandbox")?;
    }

    Ok(())
}

/// A live browser session backed by a locally spawned driver process.
///
/// Derefs to the underlying [`WebDriver`] for page interaction; adds the tab
/// conveniences and the animation-suppressing click used by callers. The
/// post-click hook only fires for clicks routed through [`Session::click`];
/// clicking a [`WebElement`] directly bypasses it.
pub struct Session {
    driver: WebDriver,
    server: Child,
    device: Device,
}

/// Injected after every click. jQuery may not be present on the page, so the
/// script swallows its own failure.
const SUPPRESS_ANIMATIONS: &str = "try { jQuery.fx.off = true; } catch (e) {}";

impl Session {
    pub(crate) fn new(driver: WebDriver, server: Child, device: Device) -> Self {
        Self {
            driver,
            server,
            device,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Clicks an element, then disables page animations. Injection failures
    /// are ignored.
    pub async fn click(&self, element: &WebElement) -> WebDriverResult<()> {
        element.click().await?;
        let _ = self.driver.execute(SUPPRESS_ANIMATIONS, Vec::new()).await;
        Ok(())
    }

    /// Closes every tab except the current one and restores focus to it.
    pub async fn close_other_tabs(&self) -> WebDriverResult<()> {
        close_other_tabs(self).await
    }

    pub async fn switch_to_tab(&self, n: usize) -> WebDriverResult<()> {
        switch_to_tab(self, n).await
    }

    pub async fn switch_to_first_tab(&self) -> WebDriverResult<()> {
        switch_to_tab(self, 0).await
    }

    pub async fn switch_to_last_tab(&self) -> WebDriverResult<()> {
        switch_to_last_tab(self).await
    }

    /// Ends the WebDriver session and stops the driver process.
    pub async fn quit(self) -> WebDriverResult<()> {
        let Session {
            driver, mut server, ..
        } = self;
        let result = driver.quit().await;
        let _ = server.kill().await;
        result
    }
}

impl Deref for Session {
    type Target = WebDriver;

    fn deref(&self) -> &Self::Target {
        &self.driver
    }
}

/// Minimal view of a browser's tab state, so the tab bookkeeping can be
/// driven without a live browser.
#[async_trait]
pub(crate) trait TabControl: Sync {
    type Handle: Clone + PartialEq + Send + Sync;

    async fn current_tab(&self) -> WebDriverResult<Self::Handle>;

    async fn all_tabs(&self) -> WebDriverResult<Vec<Self::Handle>>;

    async fn focus_tab(&self, handle: Self::Handle) -> WebDriverResult<()>;

    /// Closes the currently focused tab.
    async fn close_current_tab(&self) -> WebDriverResult<()>;
}

#[async_trait]
impl TabControl for Session {
    type Handle = WindowHandle;

    async fn current_tab(&self) -> WebDriverResult<WindowHandle> {
        self.driver.window().await
    }

    async fn all_tabs(&self) -> WebDriverResult<Vec<WindowHandle>> {
        self.driver.windows().await
    }

    async fn focus_tab(&self, handle: WindowHandle) -> WebDriverResult<()> {
        self.driver.switch_to_window(handle).await
    }

    async fn close_current_tab(&self) -> WebDriverResult<()> {
        self.driver.close_window().await
    }
}

pub(crate) async fn close_other_tabs<T: TabControl>(tabs: &T) -> WebDriverResult<()> {
    let current = tabs.current_tab().await?;
    for handle in tabs.all_tabs().await? {
        if handle != current {
            tabs.focus_tab(handle).await?;
            tabs.close_current_tab().await?;
        }
    }
    tabs.focus_tab(current).await
}

pub(crate) async fn switch_to_tab<T: TabControl>(tabs: &T, n: usize) -> WebDriverResult<()> {
    let handles = tabs.all_tabs().await?;
    let handle = handles
        .get(n)
        .cloned()
        .ok_or_else(|| {
            WebDriverError::UnknownError(WebDriverErrorInfo::new(format!("no tab at index {n}")))
        })?;
    tabs.focus_tab(handle).await
}

pub(crate) async fn switch_to_last_tab<T: TabControl>(tabs: &T) -> WebDriverResult<()> {
    let handles = tabs.all_tabs().await?;
    let handle = handles
        .last()
        .cloned()
        .ok_or_else(|| {
            WebDriverError::UnknownError(WebDriverErrorInfo::new("no open tabs".to_string()))
        })?;
    tabs.focus_tab(handle).await
}

/// Seam between the negotiation loop and the machinery that actually starts
/// driver processes and downloads replacements.
#[async_trait]
pub(crate) trait LaunchBackend {
    type Session: Send;

    async fn launch(&mut self, opts: &SessionOptions) -> Result<Self::Session, ProvisionError>;

    async fn download_next(&mut self, attempt_index: usize) -> Result<(), ProvisionError>;
}

/// Drives launch attempts until a session comes up or recovery is exhausted.
///
/// `downloads_done` counts downloads already performed for this provisioning
/// call (1 if the driver was freshly installed); each version-mismatch failure
/// fetches the next-older release until `max_downloads` is reached. A
/// DevTools-port failure disables cookie persistence and retries exactly once,
/// outside the mismatch budget. Anything else propagates untouched.
pub(crate) async fn negotiate_session<B>(
    backend: &mut B,
    mismatch_signature: &str,
    mut opts: SessionOptions,
    mut downloads_done: usize,
    max_downloads: usize,
) -> Result<B::Session, ProvisionError>
where
    B: LaunchBackend + Send,
{
    let mut devtools_retried = false;

    loop {
        let err = match backend.launch(&opts).await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };

        let message = err.to_string().to_lowercase();

        if message.contains(mismatch_signature) {
            if downloads_done >= max_downloads {
                return Err(ProvisionError::VersionMismatchExhausted {
                    attempts: downloads_done,
                });
            }
            warn!("installed driver does not match the browser version, fetching an older release");
            backend.download_next(downloads_done).await?;
            downloads_done += 1;
        } else if message.contains(DEVTOOLS_PORT_SIGNATURE) && !devtools_retried {
            warn!("browser failed on the DevTools port, retrying without cookie persistence");
            devtools_retried = true;
            opts.persist_cookies = false;
        } else {
            return Err(err);
        }
    }
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use thirtyfour::{Capabilities, DesiredCapabilities};

    const MISMATCH: &str = "this version of chromedriver only supports chrome version";

    struct MockBackend {
        outcomes: VecDeque<Result<(), ProvisionError>>,
        launches: Vec<SessionOptions>,
        downloads: Vec<usize>,
    }

    impl MockBackend {
        fn new(outcomes: Vec<Result<(), ProvisionError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                launches: Vec::new(),
                downloads: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl LaunchBackend for MockBackend {
        type Session = ();

        async fn launch(&mut self, opts: &SessionOptions) -> Result<(), ProvisionError> {
            self.launches.push(opts.clone());
            self.outcomes.pop_front().expect("unexpected extra launch")
        }

        async fn download_next(&mut self, attempt_index: usize) -> Result<(), ProvisionError> {
            self.downloads.push(attempt_index);
            Ok(())
        }
    }

    fn launch_err(message: &str) -> ProvisionError {
        ProvisionError::Session(WebDriverError::UnknownError(WebDriverErrorInfo::new(
            message.to_string(),
        )))
    }

    fn mismatch_err() -> ProvisionError {
        launch_err("session not created: This version of ChromeDriver only supports Chrome version 114")
    }

    fn devtools_err() -> ProvisionError {
        launch_err("unknown error: DevToolsActivePort file doesn't exist")
    }

    #[tokio::test]
    async fn mismatch_triggers_one_download_per_cycle() {
        let mut backend = MockBackend::new(vec![Err(mismatch_err()), Ok(())]);

        negotiate_session(&mut backend, MISMATCH, SessionOptions::default(), 0, 4)
            .await
            .unwrap();

        assert_eq!(backend.downloads, vec![0]);
        assert_eq!(backend.launches.len(), 2);
    }

    #[tokio::test]
    async fn mismatch_walks_down_the_version_list() {
        let mut backend = MockBackend::new(vec![
            Err(mismatch_err()),
            Err(mismatch_err()),
            Err(mismatch_err()),
            Ok(()),
        ]);

        // The driver was freshly installed, so one download already happened.
        negotiate_session(&mut backend, MISMATCH, SessionOptions::default(), 1, 4)
            .await
            .unwrap();

        assert_eq!(backend.downloads, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mismatch_exhaustion_reports_attempt_count() {
        let mut backend = MockBackend::new(vec![
            Err(mismatch_err()),
            Err(mismatch_err()),
            Err(mismatch_err()),
            Err(mismatch_err()),
            Err(mismatch_err()),
        ]);

        let err = negotiate_session(&mut backend, MISMATCH, SessionOptions::default(), 0, 4)
            .await
            .unwrap_err();

        assert_eq!(backend.downloads, vec![0, 1, 2, 3]);
        assert_eq!(backend.launches.len(), 5);
        assert!(matches!(
            err,
            ProvisionError::VersionMismatchExhausted { attempts: 4 }
        ));
        assert!(err.to_string().contains('4'));
    }

    #[tokio::test]
    async fn devtools_failure_retries_once_without_cookies() {
        let mut backend = MockBackend::new(vec![Err(devtools_err()), Ok(())]);
        let opts = SessionOptions {
            persist_cookies: true,
            ..SessionOptions::default()
        };

        negotiate_session(&mut backend, MISMATCH, opts, 0, 4)
            .await
            .unwrap();

        assert!(backend.downloads.is_empty());
        assert!(backend.launches[0].persist_cookies);
        assert!(!backend.launches[1].persist_cookies);
    }

    #[tokio::test]
    async fn second_devtools_failure_propagates() {
        let mut backend = MockBackend::new(vec![Err(devtools_err()), Err(devtools_err())]);

        let err = negotiate_session(&mut backend, MISMATCH, SessionOptions::default(), 0, 4)
            .await
            .unwrap_err();

        assert_eq!(backend.launches.len(), 2);
        assert!(err.to_string().contains("DevToolsActivePort"));
    }

    #[tokio::test]
    async fn unrelated_launch_failure_propagates_immediately() {
        let mut backend = MockBackend::new(vec![Err(launch_err("chrome crashed on startup"))]);

        let err = negotiate_session(&mut backend, MISMATCH, SessionOptions::default(), 0, 4)
            .await
            .unwrap_err();

        assert!(backend.downloads.is_empty());
        assert_eq!(backend.launches.len(), 1);
        assert!(err.to_string().contains("crashed"));
    }

    struct FakeBrowser {
        tabs: Mutex<Vec<&'static str>>,
        current: Mutex<&'static str>,
    }

    impl FakeBrowser {
        fn new(tabs: &[&'static str], current: &'static str) -> Self {
            Self {
                tabs: Mutex::new(tabs.to_vec()),
                current: Mutex::new(current),
            }
        }
    }

    #[async_trait]
    impl TabControl for FakeBrowser {
        type Handle = &'static str;

        async fn current_tab(&self) -> WebDriverResult<&'static str> {
            Ok(*self.current.lock().unwrap())
        }

        async fn all_tabs(&self) -> WebDriverResult<Vec<&'static str>> {
            Ok(self.tabs.lock().unwrap().clone())
        }

        async fn focus_tab(&self, handle: &'static str) -> WebDriverResult<()> {
            *self.current.lock().unwrap() = handle;
            Ok(())
        }

        async fn close_current_tab(&self) -> WebDriverResult<()> {
            let current = *self.current.lock().unwrap();
            self.tabs.lock().unwrap().retain(|t| *t != current);
            Ok(())
        }
    }

    #[tokio::test]
    async fn closing_other_tabs_keeps_only_the_current_one_focused() {
        let browser = FakeBrowser::new(&["A", "B", "C"], "B");

        close_other_tabs(&browser).await.unwrap();

        assert_eq!(*browser.tabs.lock().unwrap(), vec!["B"]);
        assert_eq!(*browser.current.lock().unwrap(), "B");
    }

    #[tokio::test]
    async fn closing_other_tabs_is_a_no_op_on_a_single_tab() {
        let browser = FakeBrowser::new(&["A"], "A");

        close_other_tabs(&browser).await.unwrap();

        assert_eq!(*browser.tabs.lock().unwrap(), vec!["A"]);
        assert_eq!(*browser.current.lock().unwrap(), "A");
    }

    #[tokio::test]
    async fn tab_switching_targets_first_and_last_handles() {
        let browser = FakeBrowser::new(&["A", "B", "C"], "B");

        switch_to_tab(&browser, 0).await.unwrap();
        assert_eq!(*browser.current.lock().unwrap(), "A");

        switch_to_last_tab(&browser).await.unwrap();
        assert_eq!(*browser.current.lock().unwrap(), "C");
    }

    #[tokio::test]
    async fn switching_to_a_missing_tab_index_fails() {
        let browser = FakeBrowser::new(&["A", "B"], "A");

        let err = switch_to_tab(&browser, 2).await.unwrap_err();
        assert!(err.to_string().contains("no tab at index 2"));
        assert_eq!(*browser.current.lock().unwrap(), "A");
    }

    #[test]
    fn options_map_onto_chrome_arguments() {
        let opts = SessionOptions {
            device: Device::Mobile,
            headless: true,
            persist_cookies: true,
            no_sandbox: true,
        };

        let mut caps = DesiredCapabilities::chrome();
        apply_options(&mut caps, &opts).unwrap();

        let caps: Capabilities = caps.into();
        let options = caps.get("goog:chromeOptions").cloned().unwrap();
        let args: Vec<String> = options["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();

        assert!(args.iter().any(|a| a == "--headless=new"));
        assert!(args.iter().any(|a| a == "--no-sandbox"));
        assert!(args.iter().any(|a| a == "--disable-dev-shm-usage"));
        assert!(
            args.iter()
                .any(|a| a.starts_with("user-agent=") && a.contains("Android"))
        );
        assert!(
            args.iter()
                .any(|a| a.starts_with("user-data-dir=") && a.ends_with(BROWSER_DATA_DIR))
        );

        let prefs = &options["prefs"];
        assert_eq!(prefs["profile.default_content_setting_values.geolocation"], 1);
        assert_eq!(prefs["profile.default_content_setting_values.images"], 2);
    }

    #[test]
    fn defaults_leave_optional_arguments_out() {
        let mut caps = DesiredCapabilities::chrome();
        apply_options(&mut caps, &SessionOptions::default()).unwrap();

        let caps: Capabilities = caps.into();
        let options = caps.get("goog:chromeOptions").cloned().unwrap();
        let args: Vec<String> = options["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();

        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(!args.iter().any(|a| a == "--no-sandbox"));
        assert!(!args.iter().any(|a| a.starts_with("user-data-dir=")));
        assert!(
            args.iter()
                .any(|a| a.starts_with("user-agent=") && a.contains("Windows NT"))
        );
    }
}
