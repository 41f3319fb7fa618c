//! Network boot service: the HTTP side of target provisioning.
//!
//! Serves iPXE boot scripts keyed by MAC, installer configuration
//! documents, per-VM cloud-init documents, and the static image payload
//! directory. Runs inside the provisioner VM in production; the routes
//! are equally reachable from the host for tests.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;

use vmlab_installer::config::InstallerConfig;

use crate::cloudinit;
use crate::error::LabError;
use crate::paths::LabPaths;
use crate::store::{VmRecord, VmStore};

#[derive(Clone)]
pub struct BootState {
    pub store: Arc<VmStore>,
    pub paths: Arc<LabPaths>,
}

impl BootState {
    pub fn new(paths: LabPaths) -> Self {
        Self {
            store: Arc::new(VmStore::new(paths.vms_dir())),
            paths: Arc::new(paths),
        }
    }
}

pub fn router(state: BootState) -> Router {
    let images = ServeDir::new(state.paths.images_dir());
    Router::new()
        .route("/ipxe", get(ipxe))
        .route("/config/{mac}", get(installer_config))
        .route("/cloud-init/{name}/{kind}", get(cloud_init_doc))
        .nest_service("/images", images)
        .with_state(state)
}

pub async fn serve(state: BootState, listen: &str) -> Result<(), LabError> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|source| LabError::Io {
            context: format!("binding {listen}"),
            source,
        })?;
    tracing::info!(listen, "boot service listening");

    axum::serve(listener, router(state))
        .await
        .map_err(|source| LabError::Io {
            context: "serving boot service".into(),
            source,
        })
}

/// `GET /ipxe?mac=...`: iPXE chainloads this on every target boot.
async fn ipxe(
    State(state): State<BootState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(mac) = params.get("mac") else {
        return (StatusCode::BAD_REQUEST, "missing mac parameter").into_response();
    };

    match state.store.find_by_mac(mac) {
        Ok(Some(record)) => {
            tracing::info!(mac, name = %record.name, "serving boot script");
            render_ipxe(&record, &base_url(&headers)).into_response()
        }
        Ok(None) => mac_not_found(mac),
        Err(e) => store_error(e),
    }
}

/// `GET /config/{mac}`: the installer's one-stop configuration
/// document, with every URL derived from the Host header so the
/// response works from whichever address the installer reached us on.
async fn installer_config(
    State(state): State<BootState>,
    headers: HeaderMap,
    UrlPath(mac): UrlPath<String>,
) -> Response {
    let record = match state.store.find_by_mac(&mac) {
        Ok(Some(record)) => record,
        Ok(None) => return mac_not_found(&mac),
        Err(e) => return store_error(e),
    };

    let config = describe_install(&record, &base_url(&headers), &state.paths);
    match facet_json::to_string(&config) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "installer config serialization failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "serialization failed").into_response()
        }
    }
}

/// `GET /cloud-init/{name}/{kind}` with kind one of `meta-data`,
/// `user-data`, `network-config`.
async fn cloud_init_doc(
    State(state): State<BootState>,
    UrlPath((name, kind)): UrlPath<(String, String)>,
) -> Response {
    let record = match state.store.load(&name) {
        Ok(record) => record,
        Err(LabError::NotFound { .. }) => {
            return (StatusCode::NOT_FOUND, format!("VM {name} not found")).into_response();
        }
        Err(e) => return store_error(e),
    };

    let body = match kind.as_str() {
        "meta-data" => cloudinit::meta_data(&record),
        "user-data" => cloudinit::user_data(&record),
        "network-config" => cloudinit::network_config(&record),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown cloud-init document '{kind}'"),
            )
                .into_response();
        }
    };
    body.into_response()
}

pub fn render_ipxe(record: &VmRecord, base: &str) -> String {
    let image = format!("{base}/images/{}/{}", record.distro, record.arch);
    let mac = record.mac.to_ascii_lowercase();
    format!(
        "#!ipxe\n\
         echo Booting {name} ({distro}/{arch})\n\
         kernel {image}/vmlinuz initrd=initrd ip=dhcp vmlab.mac={mac} vmlab.config={base}/config/{mac}\n\
         initrd {image}/initrd\n\
         boot\n",
        name = record.name,
        distro = record.distro,
        arch = record.arch,
    )
}

pub fn describe_install(record: &VmRecord, base: &str, paths: &LabPaths) -> InstallerConfig {
    let image = format!("{base}/images/{}/{}", record.distro, record.arch);
    InstallerConfig {
        cloud_init_url: format!("{base}/cloud-init/{}", record.name),
        kernel_url: format!("{image}/vmlinuz"),
        modules_url: format!("{image}/modules.tar.gz"),
        rootfs_url: format!("{image}/rootfs.tar.gz"),
        reboot_on_success: !paths.noreboot_marker(&record.name).exists(),
    }
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn mac_not_found(mac: &str) -> Response {
    // The body is machine-read by the boot firmware's error path; keep
    // it stable.
    (StatusCode::NOT_FOUND, format!("VM with MAC {mac} not found")).into_response()
}

fn store_error(e: LabError) -> Response {
    tracing::error!(error = %e, "VM store lookup failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "VM store lookup failed").into_response()
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
            public_key: String::new(),
            pxe_boot: true,
        }
    }

    #[test]
    fn ipxe_script_points_at_image_payload() {
        let script = render_ipxe(&record(), "http://10.33.0.1:8080");
        assert!(script.starts_with("#!ipxe\n"));
        assert!(script.contains("kernel http://10.33.0.1:8080/images/ubuntu/aarch64/vmlinuz"));
        assert!(script.contains("initrd http://10.33.0.1:8080/images/ubuntu/aarch64/initrd"));
        assert!(script.contains("vmlab.mac=aa:bb:cc:dd:ee:07"));
        assert!(script.contains("vmlab.config=http://10.33.0.1:8080/config/aa:bb:cc:dd:ee:07"));
        assert!(script.ends_with("boot\n"));
    }

    #[test]
    fn install_description_derives_urls_from_base() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LabPaths::new(dir.path());

        let config = describe_install(&record(), "http://boss:8080", &paths);
        assert_eq!(config.cloud_init_url, "http://boss:8080/cloud-init/worker");
        assert_eq!(
            config.rootfs_url,
            "http://boss:8080/images/ubuntu/aarch64/rootfs.tar.gz"
        );
        assert_eq!(
            config.kernel_url,
            "http://boss:8080/images/ubuntu/aarch64/vmlinuz"
        );
        assert!(config.reboot_on_success);
    }

    #[test]
    fn noreboot_marker_disables_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LabPaths::new(dir.path());
        std::fs::create_dir_all(paths.vms_dir()).unwrap();
        std::fs::write(paths.noreboot_marker("worker"), "").unwrap();

        let config = describe_install(&record(), "http://boss:8080", &paths);
        assert!(!config.reboot_on_success);
    }
}
