//! Deterministic hypervisor argument-vector construction.
//!
//! The invocation is a pure function of the VM record, the lab config,
//! and the detected acceleration mode, so tests can assert on the exact
//! vector without spawning anything.

use crate::config::LabConfig;
use crate::paths::LabPaths;
use crate::store::{Arch, Role, VmRecord};

/// Loopback rendezvous for the private socket-backed lab network.
/// The provisioner listens here; every target connects.
pub const LAB_NET_ADDR: &str = "127.0.0.1:23600";

/// Fixed MAC for the provisioner's lab-side interface, so targets and
/// boot firmware always find it at the same hardware address.
pub const PROVISIONER_LAB_MAC: &str = "52:54:00:4c:41:42";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accel {
    Hvf,
    Kvm,
    None,
}

/// Hardware acceleration unless running under CI (or an OS with neither
/// HVF nor KVM), where nested virtualization is unavailable.
pub fn detect_accel() -> Accel {
    if std::env::var_os("CI").is_some() {
        return Accel::None;
    }
    if cfg!(target_os = "macos") {
        Accel::Hvf
    } else if cfg!(target_os = "linux") {
        Accel::Kvm
    } else {
        Accel::None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QemuInvocation {
    pub binary: String,
    pub args: Vec<String>,
}

struct Args(Vec<String>);

impl Args {
    fn flag(&mut self, flag: &str) {
        self.0.push(flag.into());
    }

    fn pair(&mut self, flag: &str, value: impl Into<String>) {
        self.0.push(flag.into());
        self.0.push(value.into());
    }
}

pub fn build_invocation(
    record: &VmRecord,
    config: &LabConfig,
    paths: &LabPaths,
    accel: Accel,
) -> QemuInvocation {
    let mut args = Args(Vec::new());

    args.pair("-name", &record.name);
    let machine = match record.arch {
        Arch::Aarch64 => "virt",
        Arch::X86_64 => "q35",
    };
    args.pair("-machine", machine);

    match accel {
        Accel::Hvf => {
            args.pair("-accel", "hvf");
            args.pair("-cpu", "host");
        }
        Accel::Kvm => {
            args.pair("-accel", "kvm");
            args.pair("-cpu", "host");
        }
        Accel::None => {
            args.pair("-cpu", "max");
        }
    }

    args.pair("-smp", config.cpus().to_string());
    args.pair("-m", config.memory_mb().to_string());

    args.pair(
        "-drive",
        format!("file={},if=virtio,format=qcow2", record.disk_image),
    );
    if let Some(ref media) = record.boot_media {
        args.pair("-cdrom", media);
    }
    args.pair("-boot", if record.pxe_boot { "n" } else { "c" });

    if let Some(ref shared) = record.shared_dir {
        args.pair(
            "-virtfs",
            format!("local,path={shared},mount_tag=shared,security_model=mapped-xattr,id=shared"),
        );
    }

    match record.role {
        Role::Provisioner => {
            // User-mode NAT for host SSH access, plus the listening side
            // of the private lab network at a fixed MAC.
            args.pair(
                "-netdev",
                format!(
                    "user,id=nat0,hostfwd=tcp:127.0.0.1:{}-:22",
                    record.ssh_port
                ),
            );
            args.pair("-device", "virtio-net-pci,netdev=nat0");
            args.pair("-netdev", format!("socket,id=lab0,listen={LAB_NET_ADDR}"));
            args.pair(
                "-device",
                format!("virtio-net-pci,netdev=lab0,mac={PROVISIONER_LAB_MAC}"),
            );
        }
        Role::Target => {
            args.pair("-netdev", format!("socket,id=lab0,connect={LAB_NET_ADDR}"));
            args.pair(
                "-device",
                format!(
                    "virtio-net-pci,netdev=lab0,mac={}",
                    record.mac.to_ascii_lowercase()
                ),
            );
        }
    }

    // Daemonize with PID file and QMP control socket; serial console to
    // a per-VM log file the readiness waiter can follow.
    args.flag("-daemonize");
    args.pair("-pidfile", paths.pid_path(&record.name).display().to_string());
    args.pair(
        "-qmp",
        format!(
            "unix:{},server,nowait",
            paths.control_socket_path(&record.name).display()
        ),
    );
    args.pair(
        "-serial",
        format!("file:{}", paths.serial_log_path(&record.name).display()),
    );
    args.pair("-display", "none");

    QemuInvocation {
        binary: config.qemu_binary(record.arch),
        args: args.0,
    }
}
