//! Cloud-init NoCloud document rendering.
//!
//! Three documents per VM: `meta-data`, `user-data`, `network-config`.
//! They are rendered on demand by the boot service and also written
//! into the installer's seed directory on the target's disk, so the
//! installed OS runs the same first-boot configuration either way.

use facet_value::{value, VArray, Value};

use crate::store::VmRecord;

/// First-boot account on every lab VM.
pub const GUEST_USER: &str = "ubuntu";
const GUEST_PASSWORD: &str = "ubuntu";

/// `meta-data`: the instance-id is derived from the VM name so a
/// recreated VM with the same name re-runs first boot only if the name
/// changed.
pub fn meta_data(record: &VmRecord) -> String {
    let mut doc = format!(
        "instance-id: iid-cloudimg-{name}\nlocal-hostname: {name}\n",
        name = record.name
    );
    if !record.public_key.is_empty() {
        doc.push_str(&format!("public-keys:\n  - {}\n", record.public_key.trim_end()));
    }
    doc
}

/// `user-data`: guest account, password and key auth, sudo, and a
/// first-boot runcmd that refreshes networking.
pub fn user_data(record: &VmRecord) -> String {
    let mut user = value!({
        "name": (GUEST_USER),
        "plain_text_passwd": (GUEST_PASSWORD),
        "lock_passwd": false,
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });

    if !record.public_key.is_empty() {
        let keys = VArray::from_iter([Value::from(record.public_key.as_str())]);
        if let Some(obj) = user.as_object_mut() {
            obj.insert("ssh_authorized_keys", Value::from(keys));
        }
    }

    let config = value!({
        "ssh_pwauth": true,
        "users": [user],
        "runcmd": [
            ["sh", "-c", "rm -f /etc/update-motd.d/*"],
            ["systemctl", "restart", "systemd-networkd"],
        ],
    });

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    // cloud-init wants #cloud-config on the first line; a document
    // separator after it confuses some versions.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

/// `network-config` (v2): DHCP on the interface matched by the VM's
/// MAC. The file IS the config; no outer "network:" wrapper.
pub fn network_config(record: &VmRecord) -> String {
    let mac = record.mac.to_ascii_lowercase();
    let config = value!({
        "version": 2,
        "ethernets": {
            "lab0": {
                "match": { "macaddress": (mac.as_str()) },
                "dhcp4": true,
                "dhcp6": true,
            },
        },
    });

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Arch, Role};

    fn record() -> VmRecord {
        VmRecord {
            name: "worker".into(),
            role: Role::Target,
            arch: Arch::Aarch64,
            distro: "ubuntu".into(),
            ipv4: "10.33.0.7/24".into(),
            ipv6: "fd33::7/64".into(),
            mac: "AA:BB:CC:DD:EE:07".into(),
            ssh_port: 0,
            disk_image: "/lab/worker.qcow2".into(),
            boot_media: None,
            shared_dir: None,
            public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest vmlab:worker".into(),
            pxe_boot: true,
        }
    }

    #[test]
    fn meta_data_uses_cloudimg_instance_id() {
        let md = meta_data(&record());
        assert!(md.contains("instance-id: iid-cloudimg-worker\n"));
        assert!(md.contains("local-hostname: worker\n"));
        assert!(md.contains("public-keys:\n  - ssh-ed25519"));
    }

    #[test]
    fn meta_data_without_key_omits_public_keys() {
        let mut r = record();
        r.public_key = String::new();
        assert!(!meta_data(&r).contains("public-keys"));
    }

    #[test]
    fn user_data_is_valid_cloud_config() {
        let ud = user_data(&record());
        assert!(ud.starts_with("#cloud-config\n"));
        assert!(!ud.contains("---"));
    }

    #[test]
    fn user_data_configures_guest_account() {
        let ud = user_data(&record());
        assert!(ud.contains("name: ubuntu"));
        assert!(ud.contains("lock_passwd: false"));
        assert!(ud.contains("ssh_pwauth: true"));
        assert!(ud.contains("NOPASSWD:ALL"));
    }

    #[test]
    fn user_data_embeds_the_vm_public_key() {
        let ud = user_data(&record());
        assert!(ud.contains("ssh_authorized_keys:"));
        assert!(ud.contains("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITest vmlab:worker"));
    }

    #[test]
    fn user_data_without_key_omits_authorized_keys() {
        let mut r = record();
        r.public_key = String::new();
        assert!(!user_data(&r).contains("ssh_authorized_keys"));
    }

    #[test]
    fn network_config_matches_lowercased_mac() {
        let nc = network_config(&record());
        assert!(nc.contains("version: 2"));
        assert!(nc.contains("macaddress: \"aa:bb:cc:dd:ee:07\""));
        assert!(nc.contains("dhcp4: true"));
        assert!(nc.contains("dhcp6: true"));
        assert!(!nc.contains("network:"));
    }
}
