//! HTTP retrieval from the boot service.

use std::path::Path;

use crate::config::{CloudInitDocs, InstallerConfig};
use crate::runner::CommandRunner;
use crate::InstallError;

fn http_err(url: &str, e: impl std::fmt::Display) -> InstallError {
    InstallError::Http {
        url: url.into(),
        message: e.to_string(),
    }
}

async fn get_text(url: &str) -> Result<String, InstallError> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| http_err(url, e))?;
    response.text().await.map_err(|e| http_err(url, e))
}

async fn get_bytes(url: &str) -> Result<Vec<u8>, InstallError> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| http_err(url, e))?;
    Ok(response.bytes().await.map_err(|e| http_err(url, e))?.to_vec())
}

pub async fn fetch_config(url: &str) -> Result<InstallerConfig, InstallError> {
    let body = get_text(url).await?;
    facet_json::from_str(&body).map_err(|e| http_err(url, format!("bad config document: {e}")))
}

pub async fn fetch_cloud_init(base: &str) -> Result<CloudInitDocs, InstallError> {
    Ok(CloudInitDocs {
        meta_data: get_text(&format!("{base}/meta-data")).await?,
        user_data: get_text(&format!("{base}/user-data")).await?,
        network_config: get_text(&format!("{base}/network-config")).await?,
    })
}

pub async fn download(url: &str, dest: &Path) -> Result<(), InstallError> {
    let bytes = get_bytes(url).await?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| InstallError::Io {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }
    std::fs::write(dest, &bytes).map_err(|source| InstallError::Io {
        context: format!("writing {}", dest.display()),
        source,
    })?;
    tracing::info!(url, dest = %dest.display(), bytes = bytes.len(), "downloaded");
    Ok(())
}

/// Download a gzipped tarball and unpack it into `target`, preserving
/// ownership and permissions. Extraction is delegated to the system
/// `tar`; the initramfs always ships one.
pub async fn download_and_unpack(
    runner: &dyn CommandRunner,
    url: &str,
    target: &Path,
) -> Result<(), InstallError> {
    let archive = target.join(".vmlab-download.tar.gz");
    download(url, &archive).await?;

    let target_str = target.display().to_string();
    let archive_str = archive.display().to_string();
    runner.run("tar", &["-xzpf", &archive_str, "-C", &target_str])?;

    if let Err(e) = std::fs::remove_file(&archive) {
        tracing::warn!(error = %e, "could not remove archive after unpack");
    }
    Ok(())
}
