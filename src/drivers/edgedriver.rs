//! Edge-family driver: msedgedriver release discovery and capabilities.

use crate::session::{self, SessionOptions};
use crate::{DriverFamily, Platform};
use regex::Regex;
use std::sync::LazyLock;
use thirtyfour::error::WebDriverResult;
use thirtyfour::{Capabilities, DesiredCapabilities};

const RELEASE_LISTING_URL: &str =
    "https://developer.microsoft.com/en-us/microsoft-edge/tools/webdriver/";
const ARCHIVE_BASE_URL: &str = "https://msedgedriver.azureedge.net";

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Version: (\d{2,3}\.0\.\d{4}\.\d+)").unwrap());

/// Public struct for managing msedgedriver.
pub struct EdgeDriver;

impl DriverFamily for EdgeDriver {
    fn driver_name(&self) -> &'static str {
        "msedgedriver"
    }

    fn version_mismatch_signature(&self) -> &'static str {
        "this version of microsoft edge webdriver only supports microsoft edge version"
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
        // Microsoft publishes no separate ARM build for macOS.
        let suffix = match platform {
            Platform::Windows => "win64",
            Platform::MacArm | Platform::MacIntel => "mac64",
            Platform::Linux => "linux64",
        };
        format!("{ARCHIVE_BASE_URL}/{version}/edgedriver_{suffix}.zip")
    }

    fn capabilities(&self, opts: &SessionOptions) -> WebDriverResult<Capabilities> {
        let mut caps = DesiredCapabilities::edge();
        session::apply_options(&mut caps, opts)?;
        Ok(caps.into())
    }
}

// --- Tests ---
