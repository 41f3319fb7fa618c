use std::path::{Path, PathBuf};

/// Filesystem layout of one lab directory.
///
/// Everything vmlab persists lives under a single base directory
/// (default `~/.local/share/vmlab/`, overridable with `--dir`):
/// descriptors under `vms/`, PID files and control sockets under `run/`,
/// serial and tool logs under `logs/`, SSH keypairs under `keys/`, and
/// network-boot payloads under `images/<distro>/<arch>/`.
#[derive(Debug, Clone)]
pub struct LabPaths {
    base: PathBuf,
}

impl LabPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `~/.local/share/vmlab/`
    pub fn default_base() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("vmlab")
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Descriptor directory, one JSON file per VM.
    pub fn vms_dir(&self) -> PathBuf {
        self.base.join("vms")
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{name}.json"))
    }

    /// Marker suppressing the installer's reboot-on-success for one VM.
    pub fn noreboot_marker(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{name}.noreboot"))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.pid"))
    }

    /// QMP control socket for a running hypervisor instance.
    pub fn control_socket_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.qmp"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// The hypervisor's serial console log, the log-marker waiter's target.
    pub fn serial_log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}-serial.log"))
    }

    /// vmlab's own tracing log.
    pub fn lab_log_path(&self) -> PathBuf {
        self.logs_dir().join("vmlab.log")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.base.join("keys")
    }

    pub fn private_key_path(&self, name: &str) -> PathBuf {
        self.keys_dir().join(name.to_string())
    }

    pub fn public_key_path(&self, name: &str) -> PathBuf {
        self.keys_dir().join(format!("{name}.pub"))
    }

    /// Network-boot payload root served by the boot service.
    pub fn images_dir(&self) -> PathBuf {
        self.base.join("images")
    }

    /// Kernel/initrd/rootfs directory for one distro/arch pair.
    pub fn image_dir(&self, distro: &str, arch: &str) -> PathBuf {
        self.images_dir().join(distro).join(arch)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.toml")
    }
}
