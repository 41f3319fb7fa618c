use std::time::Duration;

use clap::Parser;

use vmlab::bootsvc::{self, BootState};
use vmlab::cli::{Cli, Command};
use vmlab::config;
use vmlab::error::LabError;
use vmlab::logging;
use vmlab::paths::LabPaths;
use vmlab::ssh;
use vmlab::sshkeys;
use vmlab::store::{Role, VmRecord, VmStore};
use vmlab::supervisor::{ShutdownPolicy, Supervisor};
use vmlab::wait;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let paths = LabPaths::new(cli.dir.clone().unwrap_or_else(LabPaths::default_base));
    logging::init(cli.verbose, &paths.lab_log_path());

    let config = config::load_config(&paths)?;
    let store = VmStore::new(paths.vms_dir());

    match cli.command {
        Command::Create {
            name,
            role,
            arch,
            ipv4,
            ipv6,
            mac,
            disk,
            boot_media,
            shared_dir,
            distro,
            pxe,
        } => {
            let role: Role = role.parse()?;
            let arch = arch.parse()?;

            let mut record = VmRecord {
                name: name.clone(),
                role,
                arch,
                distro: distro.unwrap_or_else(|| config.distro().to_string()),
                ipv4,
                ipv6,
                mac,
                ssh_port: 0,
                disk_image: disk,
                boot_media,
                shared_dir,
                public_key: String::new(),
                pxe_boot: pxe,
            };
            // Preconditions first: a rejected create must not overwrite
            // an existing VM's keypair.
            store.validate_new(&record)?;

            record.public_key = sshkeys::generate_keypair(
                &paths.private_key_path(&name),
                &paths.public_key_path(&name),
                &format!("vmlab:{name}"),
            )?;
            store.register(&record)?;
            println!("VM '{name}' registered ({role}, {arch}).", arch = record.arch);
        }

        Command::Start { name } => {
            let supervisor = Supervisor::new(&store, &paths, &config);
            let pid = supervisor.start(&name).await?;
            let record = store.load(&name)?;
            if record.role == Role::Provisioner {
                println!("VM '{name}' running (pid {pid}, ssh port {}).", record.ssh_port);
            } else {
                println!("VM '{name}' running (pid {pid}).");
            }
        }

        Command::Stop { name } => {
            let supervisor = Supervisor::new(&store, &paths, &config);
            supervisor.stop(&name, &ShutdownPolicy::default()).await?;
            println!("VM '{name}' stopped.");
        }

        Command::Clean { name } => {
            let supervisor = Supervisor::new(&store, &paths, &config);
            if let Err(e) = supervisor.stop(&name, &ShutdownPolicy::default()).await {
                tracing::warn!(name = %name, error = %e, "stop before clean failed, removing anyway");
            }
            store.delete(&name)?;
            for path in [
                paths.private_key_path(&name),
                paths.public_key_path(&name),
                paths.serial_log_path(&name),
                paths.noreboot_marker(&name),
            ] {
                if let Err(e) = std::fs::remove_file(&path)
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove");
                }
            }
            println!("VM '{name}' removed.");
        }

        Command::List => {
            let supervisor = Supervisor::new(&store, &paths, &config);
            let records = store.list_all()?;
            if records.is_empty() {
                println!("No VMs registered.");
            } else {
                for record in records {
                    let state = match supervisor.running_pid(&record.name) {
                        Some(pid) => format!("running (pid {pid})"),
                        None => "stopped".into(),
                    };
                    let port = if record.ssh_port == 0 {
                        "-".into()
                    } else {
                        record.ssh_port.to_string()
                    };
                    println!(
                        "{:<16} {:<12} {:<8} {:<18} {:<18} {:<6} {}",
                        record.name, record.role, record.arch, record.mac, record.ipv4, port, state
                    );
                }
            }
        }

        Command::Ssh { name } => {
            let record = store.load(&name)?;
            let provisioner = store.find_provisioner()?;
            let args = ssh::ssh_args(&record, provisioner.as_ref(), &paths)?;

            let status = tokio::process::Command::new("ssh")
                .args(&args)
                .status()
                .await
                .map_err(|source| LabError::Io {
                    context: "spawning ssh".into(),
                    source,
                })?;
            std::process::exit(status.code().unwrap_or(1));
        }

        Command::Wait {
            name,
            marker,
            ssh: ssh_only,
            timeout,
        } => {
            let timeout = Duration::from_secs(timeout);
            let record = store.load(&name)?;

            if let Some(marker) = marker {
                wait::wait_for_log_marker(&paths.serial_log_path(&record.name), &marker, timeout)
                    .await?;
            } else if ssh_only {
                let port = reachable_ssh_port(&record, &store)?;
                wait::wait_for_port("127.0.0.1", port, timeout).await?;
            } else {
                let provisioner = store.find_provisioner()?;
                ssh::wait_for_cloud_init(&record, provisioner.as_ref(), &paths, timeout).await?;
            }
            println!("VM '{name}' is ready.");
        }

        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.listen().to_string());
            bootsvc::serve(BootState::new(paths), &listen).await?;
        }
    }

    Ok(())
}

/// The host-side port whose reachability proves the VM's sshd is up.
/// Only the provisioner is reachable from the host; targets are proved
/// ready through the cloud-init waiter instead.
fn reachable_ssh_port(record: &VmRecord, store: &VmStore) -> Result<u16, LabError> {
    let port = match record.role {
        Role::Provisioner => record.ssh_port,
        Role::Target => {
            store
                .find_provisioner()?
                .ok_or_else(|| LabError::Validation {
                    message: format!(
                        "target '{}' is only reachable through a provisioner; none registered",
                        record.name
                    ),
                })?
                .ssh_port
        }
    };
    if port == 0 {
        return Err(LabError::Validation {
            message: format!("VM '{}' has no SSH port (not running?)", record.name),
        });
    }
    Ok(port)
}
