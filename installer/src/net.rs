//! Kernel command line parsing and early network bring-up.

use std::path::Path;

use crate::runner::CommandRunner;
use crate::InstallError;

/// The boot arguments the iPXE script passes on the kernel command
/// line. `vmlab.config=` is the only hard requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct BootArgs {
    pub mac: Option<String>,
    pub config_url: String,
    pub ip: IpMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IpMode {
    Dhcp,
    /// Carried verbatim; static addressing is not wired up yet.
    Static(String),
}

impl BootArgs {
    pub fn parse(cmdline: &str) -> Result<Self, InstallError> {
        let mut mac = None;
        let mut config_url = None;
        let mut ip = IpMode::Dhcp;

        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "vmlab.mac" => mac = Some(value.to_ascii_lowercase()),
                "vmlab.config" => config_url = Some(value.to_string()),
                "ip" if value != "dhcp" => ip = IpMode::Static(value.to_string()),
                _ => {}
            }
        }

        let config_url = config_url.ok_or_else(|| InstallError::Cmdline {
            message: "vmlab.config= is missing".into(),
        })?;
        Ok(Self {
            mac,
            config_url,
            ip,
        })
    }
}

/// Pick the interface to install over: the one matching `mac` when
/// given, otherwise the first interface that is not loopback.
pub fn find_interface(sys_net: &Path, mac: Option<&str>) -> Result<String, InstallError> {
    let entries = std::fs::read_dir(sys_net).map_err(|source| InstallError::Io {
        context: format!("reading {}", sys_net.display()),
        source,
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    match mac {
        Some(wanted) => {
            for name in &names {
                let address = sys_net.join(name).join("address");
                if let Ok(found) = std::fs::read_to_string(&address)
                    && found.trim().eq_ignore_ascii_case(wanted)
                {
                    return Ok(name.clone());
                }
            }
            Err(InstallError::NoInterface {
                wanted: wanted.into(),
            })
        }
        None => names.into_iter().next().ok_or(InstallError::NoInterface {
            wanted: "any".into(),
        }),
    }
}

/// DHCP clients to try, in order. Initramfs images differ in which one
/// they ship.
const DHCP_CLIENTS: &[(&str, &[&str])] = &[
    ("udhcpc", &["-i", "{iface}", "-n", "-q"]),
    ("dhclient", &["-1", "{iface}"]),
    ("dhcpcd", &["-1", "{iface}"]),
];

pub fn bring_up(
    runner: &dyn CommandRunner,
    iface: &str,
    mode: &IpMode,
) -> Result<(), InstallError> {
    runner.run("ip", &["link", "set", iface, "up"])?;

    match mode {
        IpMode::Dhcp => {
            let mut last_err = None;
            for (client, template) in DHCP_CLIENTS {
                let args: Vec<String> =
                    template.iter().map(|a| a.replace("{iface}", iface)).collect();
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                match runner.run(client, &args) {
                    Ok(_) => {
                        tracing::info!(iface, client, "lease acquired");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(client, error = %e, "dhcp client unavailable or failed");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or(InstallError::Cmdline {
                message: "no DHCP client available".into(),
            }))
        }
        IpMode::Static(given) => Err(InstallError::NotImplemented {
            feature: format!("static addressing (ip={given})"),
        }),
    }
}
