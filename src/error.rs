use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for all possible failures in the library.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error accessing path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to unpack archive '{path}': {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Release listing contains {available} versions, cannot select index {index}")]
    VersionIndexOutOfRange { index: usize, available: usize },

    #[error("Driver executable '{name}' not found in the downloaded archive")]
    DriverExecutableNotFound { name: String },

    #[error("Failed to start driver process '{path}': {source}")]
    DriverStartup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Driver process did not become ready on port {port}")]
    DriverUnresponsive { port: u16 },

    #[error(
        "Tried downloading the {attempts} most recent drivers. \
         None matched the installed browser version."
    )]
    VersionMismatchExhausted { attempts: usize },

    #[error("Browser session could not be created: {0}")]
    Session(#[from] thirtyfour::error::WebDriverError),
}
