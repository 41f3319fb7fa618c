use tracing_subscriber::EnvFilter;

use vmlab_installer::runner::{CommandRunner, SystemRunner};
use vmlab_installer::shell;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    eprintln!("vmlab-installer v{} starting", env!("CARGO_PKG_VERSION"));

    let cmdline = match std::fs::read_to_string("/proc/cmdline") {
        Ok(cmdline) => cmdline,
        Err(e) => {
            tracing::error!(error = %e, "cannot read /proc/cmdline");
            shell::debug_shell();
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "cannot start async runtime");
            shell::debug_shell();
        }
    };

    // The barrier converts a panic anywhere in the pipeline into an
    // error, so every fault path below ends at the debug shell rather
    // than a crashed init.
    let runner = SystemRunner;
    let outcome =
        vmlab_installer::catch_fault(|| runtime.block_on(vmlab_installer::install(&runner, &cmdline)));

    match outcome {
        Ok(true) => {
            tracing::info!("rebooting into the installed system");
            if let Err(e) = runner.run("reboot", &["-f"]) {
                tracing::error!(error = %e, "reboot failed");
                shell::debug_shell();
            }
        }
        Ok(false) => {
            tracing::info!("reboot suppressed, staying up for inspection");
            shell::debug_shell();
        }
        Err(e) => {
            tracing::error!(error = %e, "install failed");
            shell::debug_shell();
        }
    }
}
