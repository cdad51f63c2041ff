
// Top-level public modules
pub mod downloader;
pub mod drivers;
pub mod error;
pub mod provisioner;
pub mod session;

pub use drivers::{ChromeDriver, EdgeDriver};
pub use error::ProvisionError;
pub use provisioner::Provisioner;
pub use session::{Device, Session, SessionOptions};

use thirtyfour::Capabilities;
use thirtyfour::error::WebDriverResult;

/// The host platform a driver archive is published for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacArm,
    MacIntel,
    Linux,
}

impl Platform {
    /// Detects the platform the current process is running on.
    pub fn detect() -> Result<Self, ProvisionError> {
        Self::from_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_target(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        match (os, arch) {
            ("windows", _) => Ok(Self::Windows),
            ("macos", "aarch64") => Ok(Self::MacArm),
            ("macos", _) => Ok(Self::MacIntel),
            ("linux", _) => Ok(Self::Linux),
            _ => Err(ProvisionError::UnsupportedPlatform(format!("{os}-{arch}"))),
        }
    }
}

/// A browser family the provisioner can manage drivers for.
///
/// Two static implementations exist: [`ChromeDriver`] and [`EdgeDriver`].
/// Everything that differs between the two families lives behind this trait;
/// the download/retry machinery in [`Provisioner`] is shared.
pub trait DriverFamily: Send + Sync {
    /// Base name of the driver binary (e.g. "chromedriver").
    fn driver_name(&self) -> &'static str;

    /// Lowercase substring that identifies a driver/browser version mismatch
    /// in a session-creation failure message.
    fn version_mismatch_signature(&self) -> &'static str;

    /// Page listing the published driver releases, newest first.
    fn release_listing_url(&self) -> &'static str;

    /// Extracts ordered version identifiers from the release listing page.
    fn extract_versions(&self, listing: &str) -> Vec<String>;

    /// Download URL of the zip archive for `version` on `platform`.
    fn archive_url(&self, version: &str, platform: Platform) -> String;

    /// Browser capabilities for this family with `opts` applied.
    fn capabilities(&self, opts: &SessionOptions) -> WebDriverResult<Capabilities>;

    /// Name of the driver executable on the host OS.
    fn executable_name(&self) -> String {
        if cfg!(target_os = "windows") {
            format!("{}.exe", self.driver_name())
        } else {
            self.driver_name().to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_detection_covers_supported_targets() {
        assert_eq!(Platform::from_target("windows", "x86_64").unwrap(), Platform::Windows);
        assert_eq!(Platform::from_target("macos", "aarch64").unwrap(), Platform::MacArm);
        assert_eq!(Platform::from_target("macos", "x86_64").unwrap(), Platform::MacIntel);
        assert_eq!(Platform::from_target("linux", "x86_64").unwrap(), Platform::Linux);
        assert!(matches!(
            Platform::from_target("freebsd", "x86_64"),
            Err(ProvisionError::UnsupportedPlatform(_))
        ));
    }
}
