use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vmlab", about = "QEMU-based VM lab provisioning")]
pub struct Cli {
    /// Lab directory (defaults to the per-user data directory)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a VM and generate its SSH keypair
    Create {
        name: String,

        /// VM role: provisioner or target
        #[arg(long, default_value = "target")]
        role: String,

        /// CPU architecture: aarch64 or x86_64
        #[arg(long, default_value = "aarch64")]
        arch: String,

        /// Lab IPv4 address in CIDR form, e.g. 10.33.0.5/24
        #[arg(long)]
        ipv4: String,

        /// Lab IPv6 address in CIDR form, e.g. fd33::5/64
        #[arg(long)]
        ipv6: String,

        /// Lab-network MAC address
        #[arg(long)]
        mac: String,

        /// Path to the VM's disk image
        #[arg(long)]
        disk: String,

        /// Optional ISO to attach as a CD-ROM
        #[arg(long)]
        boot_media: Option<String>,

        /// Host directory to share into the guest
        #[arg(long)]
        shared_dir: Option<String>,

        /// Distribution name for the image payload (defaults from config)
        #[arg(long)]
        distro: Option<String>,

        /// Boot from the network instead of the disk
        #[arg(long)]
        pxe: bool,
    },

    /// Launch a registered VM
    Start { name: String },

    /// Shut a VM down, escalating from graceful to forceful
    Stop { name: String },

    /// Stop a VM and remove its descriptor, keys, and runtime artifacts
    Clean { name: String },

    /// List registered VMs and their states
    List,

    /// Open an interactive shell on a VM
    Ssh { name: String },

    /// Wait until a VM is ready
    Wait {
        name: String,

        /// Wait for a marker line in the serial log instead of cloud-init
        #[arg(long, conflicts_with = "ssh")]
        marker: Option<String>,

        /// Wait only for the SSH port to accept connections
        #[arg(long)]
        ssh: bool,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },

    /// Run the network boot service
    Serve {
        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(long)]
        listen: Option<String>,
    },
}
