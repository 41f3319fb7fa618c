use facet::Facet;

use crate::error::LabError;
use crate::paths::LabPaths;

/// Lab-wide settings from `<lab>/config.toml`. Every field is optional;
/// absence of the file means all defaults.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct LabConfig {
    /// Default boot image family for new VMs.
    pub distro: Option<String>,

    /// Listen address for the network boot service.
    pub listen: Option<String>,

    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,

    #[facet(default)]
    pub qemu: QemuBinaries,
}

/// Hypervisor binary overrides, mostly used by tests to substitute a stub.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct QemuBinaries {
    pub aarch64: Option<String>,
    pub x86_64: Option<String>,
}

impl LabConfig {
    pub fn distro(&self) -> &str {
        self.distro.as_deref().unwrap_or("ubuntu")
    }

    pub fn listen(&self) -> &str {
        self.listen.as_deref().unwrap_or("0.0.0.0:8080")
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.unwrap_or(2048)
    }

    pub fn cpus(&self) -> u32 {
        self.cpus.unwrap_or(2)
    }

    pub fn qemu_binary(&self, arch: crate::store::Arch) -> String {
        match arch {
            crate::store::Arch::Aarch64 => self
                .qemu
                .aarch64
                .clone()
                .unwrap_or_else(|| "qemu-system-aarch64".into()),
            crate::store::Arch::X86_64 => self
                .qemu
                .x86_64
                .clone()
                .unwrap_or_else(|| "qemu-system-x86_64".into()),
        }
    }
}

/// Load `config.toml` from the lab directory, defaulting when absent.
pub fn load_config(paths: &LabPaths) -> Result<LabConfig, LabError> {
    let path = paths.config_path();
    if !path.exists() {
        return Ok(LabConfig::default());
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| LabError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    facet_toml::from_str(&contents).map_err(|e| LabError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
