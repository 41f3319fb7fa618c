//! Durable VM metadata: one JSON descriptor per VM under the lab's
//! `vms/` directory.
//!
//! The directory scan is the database. Lookups are O(n) over the number
//! of VMs in the lab, which stays small by construction; callers that
//! outgrow this keep the same `load`/`list_all`/`save` contract and swap
//! the representation. There is no file locking; concurrent mutations
//! of the same VM from two processes are a documented limitation of a
//! single-operator tool, not a supported mode.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use facet::Facet;

use crate::error::LabError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Role {
    Provisioner,
    Target,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Provisioner => f.write_str("provisioner"),
            Role::Target => f.write_str("target"),
        }
    }
}

impl FromStr for Role {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioner" => Ok(Role::Provisioner),
            "target" => Ok(Role::Target),
            other => Err(LabError::Validation {
                message: format!("unknown role '{other}' (use provisioner or target)"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum Arch {
    Aarch64,
    X86_64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Aarch64 => f.write_str("aarch64"),
            Arch::X86_64 => f.write_str("x86_64"),
        }
    }
}

impl FromStr for Arch {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            other => Err(LabError::Validation {
                message: format!("unknown arch '{other}' (use aarch64 or x86_64)"),
            }),
        }
    }
}

/// One VM's durable identity. `ssh_port == 0` means "not running";
/// it is refreshed on every successful start and cleared on stop.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct VmRecord {
    pub name: String,
    pub role: Role,
    pub arch: Arch,
    pub distro: String,
    /// IPv4 address in CIDR notation, e.g. `10.33.0.5/24`.
    pub ipv4: String,
    /// IPv6 address in CIDR notation, e.g. `fd33::5/64`.
    pub ipv6: String,
    pub mac: String,
    #[facet(default)]
    pub ssh_port: u16,
    pub disk_image: String,
    #[facet(default)]
    pub boot_media: Option<String>,
    #[facet(default)]
    pub shared_dir: Option<String>,
    /// OpenSSH public key embedded into cloud-init documents.
    #[facet(default)]
    pub public_key: String,
    #[facet(default)]
    pub pxe_boot: bool,
}

/// Parse `addr/prefix` and return the address portion.
pub fn parse_cidr(s: &str) -> Result<IpAddr, LabError> {
    let malformed = || LabError::Validation {
        message: format!("malformed CIDR '{s}' (expected addr/prefix)"),
    };

    let (addr_str, prefix_str) = s.split_once('/').ok_or_else(malformed)?;
    let addr: IpAddr = addr_str.parse().map_err(|_| malformed())?;
    let prefix: u8 = prefix_str.parse().map_err(|_| malformed())?;

    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(malformed());
    }

    Ok(addr)
}

pub struct VmStore {
    dir: PathBuf,
}

impl VmStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn save(&self, record: &VmRecord) -> Result<(), LabError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| LabError::Io {
            context: format!("creating {}", self.dir.display()),
            source,
        })?;

        let path = self.record_path(&record.name);
        let json = facet_json::to_string(record).map_err(|e| LabError::Store {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        std::fs::write(&path, json).map_err(|source| LabError::Io {
            context: format!("writing {}", path.display()),
            source,
        })
    }

    pub fn load(&self, name: &str) -> Result<VmRecord, LabError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Err(LabError::NotFound { name: name.into() });
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| LabError::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;

        facet_json::from_str(&contents).map_err(|e| LabError::Store {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// All parsable records. A missing directory is "no VMs"; individually
    /// malformed descriptors are skipped with a warning rather than
    /// failing the whole scan.
    pub fn list_all(&self) -> Result<Vec<VmRecord>, LabError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LabError::Io {
                    context: format!("reading {}", self.dir.display()),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LabError::Io {
                context: format!("reading {}", self.dir.display()),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                tracing::warn!(path = %path.display(), "skipping unreadable descriptor");
                continue;
            };
            match facet_json::from_str::<VmRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed descriptor");
                }
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn delete(&self, name: &str) -> Result<(), LabError> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&path).map_err(|source| LabError::Io {
            context: format!("removing {}", path.display()),
            source,
        })
    }

    /// The single provisioner record, if one exists.
    pub fn find_provisioner(&self) -> Result<Option<VmRecord>, LabError> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|r| r.role == Role::Provisioner))
    }

    /// First record whose MAC matches, compared case-insensitively.
    pub fn find_by_mac(&self, mac: &str) -> Result<Option<VmRecord>, LabError> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|r| r.mac.eq_ignore_ascii_case(mac)))
    }

    /// Validate and persist a new record. Rejects duplicate names, exact
    /// IPv4/IPv6 address matches (not subnet overlap), duplicate MACs,
    /// and a second provisioner.
    pub fn register(&self, record: &VmRecord) -> Result<(), LabError> {
        self.validate_new(record)?;
        self.save(record)
    }

    /// The registration preconditions on their own. Callers that create
    /// other on-disk state for the VM check these first so a rejected
    /// registration commits nothing.
    pub fn validate_new(&self, record: &VmRecord) -> Result<(), LabError> {
        let new_v4 = parse_cidr(&record.ipv4)?;
        let new_v6 = parse_cidr(&record.ipv6)?;
        if !new_v4.is_ipv4() || !new_v6.is_ipv6() {
            return Err(LabError::Validation {
                message: "ipv4/ipv6 arguments are swapped".into(),
            });
        }

        for existing in self.list_all()? {
            if existing.name == record.name {
                return Err(LabError::Validation {
                    message: format!("VM '{}' already exists", record.name),
                });
            }
            if existing.mac.eq_ignore_ascii_case(&record.mac) {
                return Err(LabError::MacConflict {
                    mac: record.mac.clone(),
                    owner: existing.name,
                });
            }
            // Exact address comparison; differing prefixes still conflict.
            for (new_addr, existing_cidr) in [(new_v4, &existing.ipv4), (new_v6, &existing.ipv6)] {
                if let Ok(existing_addr) = parse_cidr(existing_cidr)
                    && existing_addr == new_addr
                {
                    return Err(LabError::AddressConflict {
                        address: new_addr.to_string(),
                        owner: existing.name.clone(),
                    });
                }
            }
            if record.role == Role::Provisioner && existing.role == Role::Provisioner {
                return Err(LabError::ProvisionerExists {
                    existing: existing.name,
                });
            }
        }

        Ok(())
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> VmRecord {
        VmRecord {
            name: name.into(),
            role: Role::Target,
            arch: Arch::X86_64,
            distro: "ubuntu".into(),
            ipv4: "10.33.0.10/24".into(),
            ipv6: "fd33::10/64".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            ssh_port: 0,
            disk_image: "/tmp/disk.qcow2".into(),
            boot_media: None,
            shared_dir: None,
            public_key: "ssh-ed25519 AAAAC3Test lab".into(),
            pxe_boot: true,
        }
    }

    fn store(dir: &tempfile::TempDir) -> VmStore {
        VmStore::new(dir.path().join("vms"))
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let original = record("alpha");
        store.save(&original).unwrap();

        let loaded = store.load("alpha").unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn missing_directory_means_no_vms() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.list_all().unwrap().is_empty());
        assert!(store.find_provisioner().unwrap().is_none());
    }

    #[test]
    fn load_unknown_name_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(&dir).load("ghost").unwrap_err();
        assert!(matches!(err, LabError::NotFound { .. }));
    }

    #[test]
    fn malformed_descriptor_is_skipped_on_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&record("good")).unwrap();
        std::fs::write(dir.path().join("vms/bad.json"), "{ not json").unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "good");
    }

    #[test]
    fn register_rejects_exact_address_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.register(&record("alpha")).unwrap();

        // Same IPv4 address, different prefix and MAC: still a conflict.
        let mut dup = record("beta");
        dup.mac = "AA:BB:CC:00:00:01".into();
        dup.ipv4 = "10.33.0.10/16".into();
        dup.ipv6 = "fd33::99/64".into();
        let err = store.register(&dup).unwrap_err();
        assert!(matches!(err, LabError::AddressConflict { .. }));

        // Different addresses: accepted.
        let mut ok = record("beta");
        ok.mac = "AA:BB:CC:00:00:01".into();
        ok.ipv4 = "10.33.0.11/24".into();
        ok.ipv6 = "fd33::11/64".into();
        store.register(&ok).unwrap();
    }

    #[test]
    fn register_rejects_duplicate_mac_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.register(&record("alpha")).unwrap();

        let mut dup = record("beta");
        dup.ipv4 = "10.33.0.11/24".into();
        dup.ipv6 = "fd33::11/64".into();
        dup.mac = "aa:bb:cc:dd:ee:ff".into();
        let err = store.register(&dup).unwrap_err();
        assert!(matches!(err, LabError::MacConflict { .. }));
    }

    #[test]
    fn register_rejects_second_provisioner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut first = record("boss");
        first.role = Role::Provisioner;
        store.register(&first).unwrap();

        let mut second = record("boss2");
        second.role = Role::Provisioner;
        second.ipv4 = "10.33.0.2/24".into();
        second.ipv6 = "fd33::2/64".into();
        second.mac = "AA:BB:CC:00:00:02".into();
        let err = store.register(&second).unwrap_err();
        assert!(matches!(err, LabError::ProvisionerExists { .. }));

        assert_eq!(store.find_provisioner().unwrap().unwrap().name, "boss");
    }

    #[test]
    fn register_rejects_malformed_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        for bad in ["10.0.0.1", "10.0.0.1/33", "not-an-ip/24", "fd33::1/129"] {
            let mut r = record("alpha");
            if bad.contains(':') {
                r.ipv6 = bad.into();
            } else {
                r.ipv4 = bad.into();
            }
            assert!(
                store.register(&r).is_err(),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn find_by_mac_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&record("alpha")).unwrap();

        let found = store.find_by_mac("aa:bb:cc:dd:ee:ff").unwrap().unwrap();
        assert_eq!(found.name, "alpha");
        assert!(store.find_by_mac("00:00:00:00:00:00").unwrap().is_none());
    }
}
