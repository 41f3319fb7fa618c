//! Last-mile work on the freshly installed disk.

use std::path::Path;

use crate::config::CloudInitDocs;
use crate::disk::DiskLayout;
use crate::runner::CommandRunner;
use crate::InstallError;

fn write_file(path: &Path, contents: &str) -> Result<(), InstallError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| InstallError::Io {
            context: format!("creating {}", parent.display()),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| InstallError::Io {
        context: format!("writing {}", path.display()),
        source,
    })
}

/// Seed the NoCloud datasource so cloud-init configures the system on
/// its first real boot.
pub fn seed_cloud_init(target: &Path, docs: &CloudInitDocs) -> Result<(), InstallError> {
    let seed = target.join("var/lib/cloud/seed/nocloud");
    write_file(&seed.join("meta-data"), &docs.meta_data)?;
    write_file(&seed.join("user-data"), &docs.user_data)?;
    write_file(&seed.join("network-config"), &docs.network_config)?;
    tracing::info!(seed = %seed.display(), "cloud-init seed written");
    Ok(())
}

pub fn write_fstab(target: &Path, layout: &DiskLayout) -> Result<(), InstallError> {
    let fstab = format!(
        "{root} / ext4 defaults 0 1\n{esp} /boot vfat defaults,nofail 0 2\n",
        root = layout.root,
        esp = layout.esp,
    );
    write_file(&target.join("etc/fstab"), &fstab)
}

/// Unmount in reverse mount order. Failures degrade to warnings; a
/// busy mount must not turn a finished install into a failure.
pub fn unmount(runner: &dyn CommandRunner) {
    for mount in ["/target/boot", "/target"] {
        if let Err(e) = runner.run("umount", &[mount]) {
            tracing::warn!(mount, error = %e, "unmount failed");
        }
    }
}
