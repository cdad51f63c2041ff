//! Streams driver archives to disk and installs the unpacked executable.

use crate::error::ProvisionError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

/// Fetches a release listing page as text.
pub async fn fetch_listing(url: &str) -> Result<String, ProvisionError> {
    let response = reqwest::get(url).await?.error_for_status()?;
    Ok(response.text().await?)
}

/// Downloads the archive at `url` and installs the driver executable into
/// `drivers_dir`, overwriting any previous installation.
///
/// All intermediate files live in a staging directory inside `drivers_dir`,
/// so the final rename never crosses a filesystem boundary and the archive
/// and extraction tree are removed on every exit path.
pub async fn download_and_install(
    url: &str,
    drivers_dir: &Path,
    executable_name: &str,
) -> Result<PathBuf, ProvisionError> {
    fs::create_dir_all(drivers_dir)
        .await
        .map_err(|e| ProvisionError::Io {
            path: drivers_dir.to_path_buf(),
            source: e,
        })?;

    let staging = tempfile::Builder::new()
        .prefix("driver-dl-")
        .tempdir_in(drivers_dir)
        .map_err(|e| ProvisionError::Io {
            path: drivers_dir.to_path_buf(),
            source: e,
        })?;
    let archive_path = staging.path().join("driver.zip");

    download_file(url, &archive_path).await?;
    install_from_archive(&archive_path, drivers_dir, executable_name).await
}

/// Downloads a file from a given URL, streaming the body to disk in chunks.
pub async fn download_file(url: &str, dest_path: &Path) -> Result<(), ProvisionError> {
    let mut response = reqwest::get(url).await?.error_for_status()?;

    let mut dest_file = File::create(dest_path)
        .await
        .map_err(|e| ProvisionError::Io {
            path: dest_path.to_path_buf(),
            source: e,
        })?;

    while let Some(chunk) = response.chunk().await? {
        dest_file
            .write_all(&chunk)
            .await
            .map_err(|e| ProvisionError::Io {
                path: dest_path.to_path_buf(),
                source: e,
            })?;
    }

    dest_file.flush().await.map_err(|e| ProvisionError::Io {
        path: dest_path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Extracts `archive_path` next to itself, locates the driver executable in
/// the extracted tree and renames it onto the well-known target path.
pub(crate) async fn install_from_archive(
    archive_path: &Path,
    drivers_dir: &Path,
    executable_name: &str,
) -> Result<PathBuf, ProvisionError> {
    let extract_dir = archive_path.with_extension("unpacked");
    unzip_file(archive_path, &extract_dir).await?;

    // Archives may nest the executable in a top-level directory.
    let unpacked = find_driver_executable(&extract_dir, executable_name)?;
    let target = drivers_dir.join(executable_name);

    match fs::remove_file(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ProvisionError::Io {
                path: target,
                source: e,
            });
        }
    }

    fs::rename(&unpacked, &target)
        .await
        .map_err(|e| ProvisionError::Io {
            path: target.clone(),
            source: e,
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| ProvisionError::Io {
                path: target.clone(),
                source: e,
            })?;
    }

    Ok(target)
}

/// Decompresses a .zip archive to a specified directory.
///
/// The zip logic is synchronous, so we wrap it in `spawn_blocking` to avoid
/// blocking the Tokio runtime.
pub async fn unzip_file(archive_path: &Path, extract_to: &Path) -> Result<(), ProvisionError> {
    let archive_path = archive_path.to_path_buf();
    let extract_to = extract_to.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive_path).map_err(|e| ProvisionError::Io {
            path: archive_path.clone(),
            source: e,
        })?;

        let mut archive = zip::ZipArchive::new(file).map_err(|e| ProvisionError::Zip {
            path: archive_path.clone(),
            source: e,
        })?;

        archive
            .extract(&extract_to)
            .map_err(|e| ProvisionError::Zip {
                path: extract_to.clone(),
                source: e,
            })
    })
    .await
    .unwrap() // Propagate panics from the blocking task.
}

/// Searches a directory for the driver executable file.
fn find_driver_executable(
    search_path: &Path,
    executable_name: &str,
) -> Result<PathBuf, ProvisionError> {
    for entry in WalkDir::new(search_path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && entry.file_name().to_str() == Some(executable_name) {
            return Ok(entry.path().to_path_buf());
        }
    }

    Err(ProvisionError::DriverExecutableNotFound {
        name: executable_name.to_string(),
    })
}

// --- Tests ---
