use facet::Facet;

/// The configuration document served at `/config/{mac}` by the boot
/// service. Shared between the boot service (serializer) and this
/// installer (deserializer) so the wire format cannot drift.
#[derive(Debug, Clone, PartialEq, Facet)]
pub struct InstallerConfig {
    pub cloud_init_url: String,
    pub kernel_url: String,
    pub modules_url: String,
    pub rootfs_url: String,
    pub reboot_on_success: bool,
}

/// The three NoCloud documents, fetched from the boot service and
/// seeded onto the installed disk.
#[derive(Debug, Clone)]
pub struct CloudInitDocs {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let config = InstallerConfig {
            cloud_init_url: "http://boss:8080/cloud-init/worker".into(),
            kernel_url: "http://boss:8080/images/ubuntu/aarch64/vmlinuz".into(),
            modules_url: "http://boss:8080/images/ubuntu/aarch64/modules.tar.gz".into(),
            rootfs_url: "http://boss:8080/images/ubuntu/aarch64/rootfs.tar.gz".into(),
            reboot_on_success: true,
        };

        let json = facet_json::to_string(&config).unwrap();
        assert!(json.contains("\"cloud_init_url\""));
        assert!(json.contains("\"reboot_on_success\":true"));

        let parsed: InstallerConfig = facet_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
