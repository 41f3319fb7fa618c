//! Disk detection, partitioning, and filesystem preparation.

use crate::runner::CommandRunner;
use crate::InstallError;

/// Probe order covers the virtio, SATA/SCSI, and NVMe cases our lab
/// hypervisor configurations produce.
pub const DISK_CANDIDATES: &[&str] = &["/dev/vda", "/dev/sda", "/dev/nvme0n1"];

/// Install mount point inside the initramfs.
pub const TARGET: &str = "/target";

/// GPT layout: a 512M EFI system partition and the root taking the
/// rest.
const PARTITION_SCRIPT: &str = "label: gpt\n,512M,U\n,,L\n";

#[derive(Debug, Clone, PartialEq)]
pub struct DiskLayout {
    pub esp: String,
    pub root: String,
}

/// First candidate device that exists. `exists` is injected so tests
/// run without device nodes.
pub fn detect_disk<F: Fn(&str) -> bool>(exists: F) -> Result<String, InstallError> {
    DISK_CANDIDATES
        .iter()
        .find(|c| exists(c))
        .map(|c| (*c).to_string())
        .ok_or_else(|| InstallError::NoDisk {
            candidates: DISK_CANDIDATES.join(", "),
        })
}

/// NVMe namespaces take a `p` before the partition index.
pub fn partition_name(disk: &str, index: u32) -> String {
    if disk.contains("nvme") {
        format!("{disk}p{index}")
    } else {
        format!("{disk}{index}")
    }
}

/// Partition `disk`, create filesystems, and mount root and ESP under
/// [`TARGET`].
pub fn prepare(runner: &dyn CommandRunner, disk: &str) -> Result<DiskLayout, InstallError> {
    let layout = DiskLayout {
        esp: partition_name(disk, 1),
        root: partition_name(disk, 2),
    };

    runner.run_with_input("sfdisk", &[disk], PARTITION_SCRIPT)?;
    // Partition device nodes appear asynchronously.
    if let Err(e) = runner.run("udevadm", &["settle"]) {
        tracing::debug!(error = %e, "udevadm settle unavailable");
    }

    runner.run("mkfs.vfat", &["-F", "32", &layout.esp])?;
    runner.run("mkfs.ext4", &["-F", "-q", &layout.root])?;

    std::fs::create_dir_all(TARGET).map_err(|source| InstallError::Io {
        context: format!("creating {TARGET}"),
        source,
    })?;
    runner.run("mount", &[&layout.root, TARGET])?;

    let boot = format!("{TARGET}/boot");
    std::fs::create_dir_all(&boot).map_err(|source| InstallError::Io {
        context: format!("creating {boot}"),
        source,
    })?;
    runner.run("mount", &[&layout.esp, &boot])?;

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::RecordingRunner;

    #[test]
    fn detection_follows_probe_order() {
        let disk = detect_disk(|c| c == "/dev/sda" || c == "/dev/nvme0n1").unwrap();
        assert_eq!(disk, "/dev/sda");

        let err = detect_disk(|_| false).unwrap_err();
        assert!(matches!(err, InstallError::NoDisk { .. }));
    }

    #[test]
    fn nvme_partitions_get_the_p_infix() {
        assert_eq!(partition_name("/dev/vda", 2), "/dev/vda2");
        assert_eq!(partition_name("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
    }

    #[test]
    fn prepare_partitions_formats_and_mounts() {
        let runner = RecordingRunner::default();
        let layout = prepare(&runner, "/dev/vda").unwrap();

        assert_eq!(layout.esp, "/dev/vda1");
        assert_eq!(layout.root, "/dev/vda2");

        let calls = runner.rendered();
        assert!(calls[0].starts_with("sfdisk /dev/vda <<< "));
        assert!(calls[0].contains("label: gpt"));
        assert!(calls.iter().any(|c| c == "mkfs.vfat -F 32 /dev/vda1"));
        assert!(calls.iter().any(|c| c == "mkfs.ext4 -F -q /dev/vda2"));
        assert!(calls.iter().any(|c| c == "mount /dev/vda2 /target"));
        assert!(calls.iter().any(|c| c == "mount /dev/vda1 /target/boot"));
    }
}
