//! SSH plumbing: argument construction for the system `ssh` client and
//! the production `CommandRunner` used by the remote readiness waiter.
//!
//! The provisioner is reached directly through its NAT port-forward;
//! targets are reached on the lab network by jumping through the
//! provisioner with a ProxyCommand.

use std::process::Output;
use std::time::Duration;

use crate::error::LabError;
use crate::paths::LabPaths;
use crate::store::{parse_cidr, Role, VmRecord};
use crate::wait::{self, CommandRunner};

pub const SSH_USER: &str = "ubuntu";

/// The fixed remote query whose output signals first-boot completion.
pub const CLOUD_INIT_STATUS_QUERY: &str = "cloud-init status";
pub const CLOUD_INIT_READY_MARKER: &str = "status: done";

const REMOTE_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn common_options(key: &str) -> Vec<String> {
    vec![
        "-i".into(),
        key.into(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        "ConnectTimeout=5".into(),
    ]
}

/// Build the argument vector (excluding the `ssh` binary itself) for a
/// shell on `record`. Targets need the provisioner record for the jump.
pub fn ssh_args(
    record: &VmRecord,
    provisioner: Option<&VmRecord>,
    paths: &LabPaths,
) -> Result<Vec<String>, LabError> {
    let key = paths.private_key_path(&record.name).display().to_string();

    match record.role {
        Role::Provisioner => {
            if record.ssh_port == 0 {
                return Err(LabError::Validation {
                    message: format!("VM '{}' has no SSH port (not running?)", record.name),
                });
            }
            let mut args = common_options(&key);
            args.push("-p".into());
            args.push(record.ssh_port.to_string());
            args.push(format!("{SSH_USER}@127.0.0.1"));
            Ok(args)
        }
        Role::Target => {
            let prov = provisioner.ok_or_else(|| LabError::Validation {
                message: format!(
                    "target '{}' needs a running provisioner to proxy through",
                    record.name
                ),
            })?;
            if prov.ssh_port == 0 {
                return Err(LabError::Validation {
                    message: format!("provisioner '{}' has no SSH port (not running?)", prov.name),
                });
            }

            let prov_key = paths.private_key_path(&prov.name).display().to_string();
            let proxy = format!(
                "ssh -i {prov_key} -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \
                 -o LogLevel=ERROR -W %h:%p -p {} {SSH_USER}@127.0.0.1",
                prov.ssh_port
            );

            let host = parse_cidr(&record.ipv4)?;
            let mut args = common_options(&key);
            args.push("-o".into());
            args.push(format!("ProxyCommand={proxy}"));
            args.push(format!("{SSH_USER}@{host}"));
            Ok(args)
        }
    }
}

/// Runs one remote command over the system ssh client, capturing output.
pub struct SshRunner {
    args: Vec<String>,
}

impl SshRunner {
    pub fn new(
        record: &VmRecord,
        provisioner: Option<&VmRecord>,
        paths: &LabPaths,
    ) -> Result<Self, LabError> {
        Ok(Self {
            args: ssh_args(record, provisioner, paths)?,
        })
    }
}

impl CommandRunner for SshRunner {
    fn run(&self, command: &str) -> Result<String, LabError> {
        let output = std::process::Command::new("ssh")
            .args(&self.args)
            .arg(command)
            .output()
            .map_err(|source| LabError::Io {
                context: "spawning ssh".into(),
                source,
            })?;

        if !output.status.success() {
            return Err(LabError::External {
                tool: "ssh".into(),
                output: combined_output(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Poll `cloud-init status` over SSH until the guest reports done.
pub async fn wait_for_cloud_init(
    record: &VmRecord,
    provisioner: Option<&VmRecord>,
    paths: &LabPaths,
    timeout: Duration,
) -> Result<(), LabError> {
    let runner = SshRunner::new(record, provisioner, paths)?;
    wait::wait_for_remote_ready(
        &runner,
        CLOUD_INIT_STATUS_QUERY,
        CLOUD_INIT_READY_MARKER,
        timeout,
        REMOTE_POLL_INTERVAL,
    )
    .await
}

pub fn combined_output(output: &Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !s.is_empty() {
            s.push('\n');
        }
        s.push_str(&stderr);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Arch, Role};

    fn record(name: &str, role: Role, ssh_port: u16) -> VmRecord {
        VmRecord {
            name: name.into(),
            role,
            arch: Arch::X86_64,
            distro: "ubuntu".into(),
            ipv4: "10.33.0.7/24".into(),
            ipv6: "fd33::7/64".into(),
            mac: "AA:BB:CC:DD:EE:07".into(),
            ssh_port,
            disk_image: "/lab/disk.qcow2".into(),
            boot_media: None,
            shared_dir: None,
            public_key: String::new(),
            pxe_boot: false,
        }
    }

    #[test]
    fn provisioner_connects_directly_via_forwarded_port() {
        let paths = LabPaths::new("/lab");
        let prov = record("boss", Role::Provisioner, 40022);

        let args = ssh_args(&prov, None, &paths).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-p 40022"));
        assert!(joined.ends_with("ubuntu@127.0.0.1"));
        assert!(joined.contains("-i /lab/keys/boss"));
        assert!(!joined.contains("ProxyCommand"));
    }

    #[test]
    fn target_jumps_through_the_provisioner() {
        let paths = LabPaths::new("/lab");
        let prov = record("boss", Role::Provisioner, 40022);
        let target = record("worker", Role::Target, 0);

        let args = ssh_args(&target, Some(&prov), &paths).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("ProxyCommand=ssh"));
        assert!(joined.contains("-W %h:%p -p 40022"));
        assert!(joined.ends_with("ubuntu@10.33.0.7"));
    }

    #[test]
    fn target_without_provisioner_is_rejected() {
        let paths = LabPaths::new("/lab");
        let target = record("worker", Role::Target, 0);
        assert!(ssh_args(&target, None, &paths).is_err());
    }
}
