//! In-memory OS installer for network-booted lab targets.
//!
//! Runs as PID-adjacent tooling inside the initramfs: the whole
//! pipeline is a straight line through six phases, and any failure
//! drops the operator into a debug shell instead of rebooting into a
//! half-written disk.

pub mod config;
pub mod disk;
pub mod fetch;
pub mod finalize;
pub mod net;
pub mod runner;
pub mod shell;

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::runner::CommandRunner;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command failed: {command}\n{output}")]
    Command { command: String, output: String },

    #[error("fetching {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("bad kernel command line: {message}")]
    Cmdline { message: String },

    #[error("no installable disk found among {candidates}")]
    NoDisk { candidates: String },

    #[error("no usable network interface (wanted MAC {wanted})")]
    NoInterface { wanted: String },

    #[error("not implemented: {feature}")]
    NotImplemented { feature: String },

    #[error("installer fault: {message}")]
    Fault { message: String },
}

/// The installer's phases, in execution order. Logged at every
/// transition so a serial-console trace shows exactly how far an
/// install got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NetworkSetup,
    FetchCloudInit,
    DiskPreparation,
    OsInstall,
    SystemConfiguration,
    Finalization,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::NetworkSetup => "network-setup",
            Phase::FetchCloudInit => "fetch-cloud-init",
            Phase::DiskPreparation => "disk-preparation",
            Phase::OsInstall => "os-install",
            Phase::SystemConfiguration => "system-configuration",
            Phase::Finalization => "finalization",
        };
        f.write_str(s)
    }
}

/// Run the full install. Returns whether the boot service asked for a
/// reboot on success.
pub async fn install(runner: &dyn CommandRunner, cmdline: &str) -> Result<bool, InstallError> {
    let boot = net::BootArgs::parse(cmdline)?;

    tracing::info!(phase = %Phase::NetworkSetup, "starting");
    let iface = net::find_interface(Path::new("/sys/class/net"), boot.mac.as_deref())?;
    net::bring_up(runner, &iface, &boot.ip)?;

    tracing::info!(phase = %Phase::FetchCloudInit, url = %boot.config_url, "starting");
    let config = fetch::fetch_config(&boot.config_url).await?;
    let docs = fetch::fetch_cloud_init(&config.cloud_init_url).await?;

    tracing::info!(phase = %Phase::DiskPreparation, "starting");
    let device = disk::detect_disk(|candidate| Path::new(candidate).exists())?;
    let layout = disk::prepare(runner, &device)?;

    tracing::info!(phase = %Phase::OsInstall, rootfs = %config.rootfs_url, "starting");
    let target = Path::new(disk::TARGET);
    fetch::download_and_unpack(runner, &config.rootfs_url, target).await?;

    tracing::info!(phase = %Phase::SystemConfiguration, "starting");
    fetch::download(&config.kernel_url, &target.join("boot/vmlinuz")).await?;
    fetch::download_and_unpack(runner, &config.modules_url, target).await?;
    finalize::write_fstab(target, &layout)?;

    tracing::info!(phase = %Phase::Finalization, "starting");
    finalize::seed_cloud_init(target, &docs)?;
    finalize::unmount(runner);

    tracing::info!(reboot = config.reboot_on_success, "install complete");
    Ok(config.reboot_on_success)
}

/// Runs the pipeline with a panic barrier: a panic anywhere inside
/// becomes an ordinary [`InstallError::Fault`], so the caller always
/// regains control and can hand the operator a console.
pub fn catch_fault<F>(f: F) -> Result<bool, InstallError>
where
    F: FnOnce() -> Result<bool, InstallError>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(InstallError::Fault {
            message: panic_message(&payload),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).into()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
