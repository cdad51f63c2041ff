//! Ensures a version-matched driver executable exists locally and turns it
//! into a live browser session.

use crate::error::ProvisionError;
use crate::session::{LaunchBackend, Session, SessionOptions, negotiate_session};
use crate::{DriverFamily, Platform, downloader};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thirtyfour::WebDriver;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

/// Bounded number of driver downloads per provisioning call.
pub const DEFAULT_MAX_DOWNLOAD_ATTEMPTS: usize = 4;

/// Default port the spawned driver process listens on.
pub const DEFAULT_PORT: u16 = 9515;

const DEFAULT_DRIVERS_DIR: &str = "drivers";

/// Distro-managed chromedriver used on embedded ARM boards, where no driver
/// archives are published.
const ARM_SYSTEM_DRIVER: &str = "/usr/lib/chromium-browser/chromedriver";

const SERVER_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Provisions the driver executable for one browser family and creates
/// sessions against it.
pub struct Provisioner<F: DriverFamily> {
    family: F,
    drivers_dir: PathBuf,
    port: u16,
    max_download_attempts: usize,
}

impl<F: DriverFamily> Provisioner<F> {
    pub fn new(family: F) -> Self {
        Self {
            family,
            drivers_dir: PathBuf::from(DEFAULT_DRIVERS_DIR),
            port: DEFAULT_PORT,
            max_download_attempts: DEFAULT_MAX_DOWNLOAD_ATTEMPTS,
        }
    }

    pub fn with_drivers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.drivers_dir = dir.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_download_attempts(mut self, attempts: usize) -> Self {
        self.max_download_attempts = attempts;
        self
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    /// Returns the path of a locally usable driver executable, downloading
    /// the most recent release if none is installed yet.
    pub async fn ensure_driver(&self) -> Result<PathBuf, ProvisionError> {
        let (path, _) = self.ensure_driver_inner().await?;
        Ok(path)
    }

    /// As [`ensure_driver`](Self::ensure_driver), also reporting how many
    /// downloads were performed (0 or 1) so the mismatch budget can account
    /// for a fresh install.
    async fn ensure_driver_inner(&self) -> Result<(PathBuf, usize), ProvisionError> {
        if is_embedded_arm() {
            return Ok((PathBuf::from(ARM_SYSTEM_DRIVER), 0));
        }

        fs::create_dir_all(&self.drivers_dir)
            .await
            .map_err(|e| ProvisionError::Io {
                path: self.drivers_dir.clone(),
                source: e,
            })?;

        let path = self.drivers_dir.join(self.family.executable_name());
        if !path.exists() {
            self.download_latest(0).await?;
            return Ok((path, 1));
        }

        Ok((path, 0))
    }

    /// Downloads and installs the release at `attempt_index` in the family's
    /// version listing (0 = most recent).
    ///
    /// Network and extraction failures are not retried here.
    pub async fn download_latest(&self, attempt_index: usize) -> Result<(), ProvisionError> {
        let listing = downloader::fetch_listing(self.family.release_listing_url()).await?;
        let versions = self.family.extract_versions(&listing);
        let version = select_version(&versions, attempt_index)?;

        let platform = Platform::detect()?;
        let url = self.family.archive_url(version, platform);

        info!(
            "Downloading {} {} version: {}",
            std::env::consts::OS,
            self.family.driver_name(),
            version
        );
        downloader::download_and_install(&url, &self.drivers_dir, &self.family.executable_name())
            .await?;
        Ok(())
    }

    /// Provisions the driver and starts a browser session, recovering from
    /// version-mismatched drivers by walking down the published version list.
    pub async fn create_session(&self, opts: SessionOptions) -> Result<Session, ProvisionError> {
        let (driver_path, downloads_done) = self.ensure_driver_inner().await?;

        let mut backend = DriverBackend {
            provisioner: self,
            driver_path,
        };
        negotiate_session(
            &mut backend,
            self.family.version_mismatch_signature(),
            opts,
            downloads_done,
            self.max_download_attempts,
        )
        .await
    }
}

/// Selects the version at `attempt_index`, newest first.
pub(crate) fn select_version(
    versions: &[String],
    attempt_index: usize,
) -> Result<&str, ProvisionError> {
    versions
        .get(attempt_index)
        .map(String::as_str)
        .ok_or(ProvisionError::VersionIndexOutOfRange {
            index: attempt_index,
            available: versions.len(),
        })
}

fn is_embedded_arm() -> bool {
    std::env::consts::OS == "linux" && matches!(std::env::consts::ARCH, "arm" | "aarch64")
}

/// Spawns the installed driver binary and connects a WebDriver session to it.
struct DriverBackend<'a, F: DriverFamily> {
    provisioner: &'a Provisioner<F>,
    driver_path: PathBuf,
}

#[async_trait]
impl<F: DriverFamily> LaunchBackend for DriverBackend<'_, F> {
    type Session = Session;

    async fn launch(&mut self, opts: &SessionOptions) -> Result<Session, ProvisionError> {
        let port = self.provisioner.port;
        let mut server = spawn_driver(&self.driver_path, port)?;

        if let Err(e) = wait_for_server(port).await {
            let _ = server.kill().await;
            return Err(e);
        }

        let caps = self
            .provisioner
            .family
            .capabilities(opts)
            .map_err(ProvisionError::Session)?;

        let server_url = format!("http://localhost:{port}");
        match WebDriver::new(server_url.as_str(), caps).await {
            Ok(driver) => Ok(Session::new(driver, server, opts.device)),
            Err(e) => {
                let _ = server.kill().await;
                Err(ProvisionError::Session(e))
            }
        }
    }

    async fn download_next(&mut self, attempt_index: usize) -> Result<(), ProvisionError> {
        self.provisioner.download_latest(attempt_index).await
    }
}

fn spawn_driver(driver_path: &Path, port: u16) -> Result<tokio::process::Child, ProvisionError> {
    Command::new(driver_path)
        .arg(format!("--port={port}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProvisionError::DriverStartup {
            path: driver_path.to_path_buf(),
            source: e,
        })
}

/// Polls the driver's status endpoint until it accepts connections.
async fn wait_for_server(port: u16) -> Result<(), ProvisionError> {
    let url = format!("http://localhost:{port}/status");
    let deadline = Instant::now() + SERVER_READY_TIMEOUT;

    loop {
        match reqwest::get(&url).await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => debug!("driver status endpoint returned {}", response.status()),
            Err(e) => debug!("driver not ready yet: {e}"),
        }

        if Instant::now() >= deadline {
            return Err(ProvisionError::DriverUnresponsive { port });
        }
        tokio::time::sleep(SERVER_POLL_INTERVAL).await;
    }
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ChromeDriver;

    fn versions(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("114.0.57{i:02}.90")).collect()
    }

    #[test]
    fn select_version_walks_newest_first() {
        let list = versions(3);
        assert_eq!(select_version(&list, 0).unwrap(), "114.0.5700.90");
        assert_eq!(select_version(&list, 2).unwrap(), "114.0.5702.90");
    }

    #[test]
    fn select_version_rejects_out_of_range_index() {
        let list = versions(2);
        let err = select_version(&list, 2).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::VersionIndexOutOfRange {
                index: 2,
                available: 2
            }
        ));

        assert!(select_version(&[], 0).is_err());
    }

    #[tokio::test]
    async fn ensure_driver_reuses_existing_executable() {
        if is_embedded_arm() {
            println!("embedded ARM host uses the system driver, skipping");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let provisioner = Provisioner::new(ChromeDriver).with_drivers_dir(dir.path());

        let expected = dir.path().join(provisioner.family().executable_name());
        std::fs::write(&expected, b"fake driver").unwrap();

        // No network involved: the pre-existing file short-circuits the download.
        let (path, downloads) = provisioner.ensure_driver_inner().await.unwrap();
        assert_eq!(path, expected);
        assert_eq!(downloads, 0);
    }

    #[tokio::test]
    async fn ensure_driver_short_circuits_on_embedded_arm() {
        if !is_embedded_arm() {
            return;
        }

        let provisioner = Provisioner::new(ChromeDriver);
        let path = provisioner.ensure_driver().await.unwrap();
        assert_eq!(path, PathBuf::from(ARM_SYSTEM_DRIVER));
    }
}
