//! Chrome-family driver: chromedriver release discovery and capabilities.

use crate::session::{self, SessionOptions};
use crate::{DriverFamily, Platform};
use regex::Regex;
use std::sync::LazyLock;
use thirtyfour::error::WebDriverResult;
use thirtyfour::{Capabilities, DesiredCapabilities};

const RELEASE_LISTING_URL: &str = "https://sites.google.com/chromium.org/driver/downloads?authuser=0";
const ARCHIVE_BASE_URL: &str = "https://chromedriver.storage.googleapis.com";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ChromeDriver (\d{2,3}\.0\.\d{4}\.\d+)").unwrap());

/// Public struct for managing chromedriver.
pub struct ChromeDriver;

impl DriverFamily for ChromeDriver {
    fn driver_name(&self) -> &'static str {
        "chromedriver"
    }

    fn version_mismatch_signature(&self) -> &'static str {
        "this version of chromedriver only supports chrome version"
    }

    fn release_listing_url(&self) -> &'static str {
        RELEASE_LISTING_URL
    }

    fn extract_versions(&self, listing: &str) -> Vec<String> {
        VERSION_PATTERN
            .captures_iter(listing)
            .map(|c| c[1].to_string())
            .collect()
    }

    fn archive_url(&self, version: &str, platform: Platform) -> String {
        let suffix = match platform {
            Platform::Windows => "win32",
            Platform::MacArm => "mac_arm64",
            Platform::MacIntel => "mac64",
            Platform::Linux => "linux64",
        };
        format!("{ARCHIVE_BASE_URL}/{version}/chromedriver_{suffix}.zip")
    }

    fn capabilities(&self, opts: &SessionOptions) -> WebDriverResult<Capabilities> {
        let mut caps = DesiredCapabilities::chrome();
        session::apply_options(&mut caps, opts)?;
        Ok(caps.into())
    }
}

// --- Tests ---
