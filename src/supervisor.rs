//! Hypervisor child-process supervision.
//!
//! A VM moves `Stopped → Starting → Running → Stopping → Stopped`; the
//! durable proof of "running" is the PID file plus a null-signal probe;
//! the PID file alone is not sufficient, since QEMU can daemonize
//! successfully and still die moments later. Shutdown escalates through
//! an explicit [`ShutdownPhase`] machine: QMP powerdown, SIGTERM,
//! SIGKILL, each with a bounded liveness poll.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::config::LabConfig;
use crate::error::LabError;
use crate::paths::LabPaths;
use crate::ports::{KernelPortAllocator, PortAllocator};
use crate::qemu;
use crate::ssh::combined_output;
use crate::store::{Role, VmStore};

/// Liveness probing and signal delivery for the hypervisor process,
/// injectable so shutdown escalation can be unit-tested without
/// signaling real PIDs.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32);
    fn kill(&self, pid: u32);
}

/// Production control: the null-signal probe, SIGTERM, SIGKILL.
pub struct SignalControl;

impl ProcessControl for SignalControl {
    fn is_alive(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
    }

    fn terminate(&self, pid: u32) {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    fn kill(&self, pid: u32) {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

/// Bounded-retry policy for the shutdown escalation. Tests shrink the
/// intervals to zero.
pub struct ShutdownPolicy {
    pub graceful_polls: u32,
    pub term_polls: u32,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            graceful_polls: 10,
            term_polls: 5,
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// The escalation states, explicit so the timeout/retry policy stays
/// auditable in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    Graceful,
    TerminateSent,
    KillSent,
    Stopped,
    Failed,
}

/// How long we allow the daemonizing hypervisor to materialize its PID
/// file after a zero-exit launch.
const PID_FILE_GRACE: Duration = Duration::from_secs(2);
const PID_FILE_POLL: Duration = Duration::from_millis(200);

pub struct Supervisor<'a> {
    store: &'a VmStore,
    paths: &'a LabPaths,
    config: &'a LabConfig,
    control: Box<dyn ProcessControl>,
    allocator: Box<dyn PortAllocator>,
}

impl<'a> Supervisor<'a> {
    pub fn new(store: &'a VmStore, paths: &'a LabPaths, config: &'a LabConfig) -> Self {
        Self {
            store,
            paths,
            config,
            control: Box::new(SignalControl),
            allocator: Box::new(KernelPortAllocator),
        }
    }

    pub fn with_control(mut self, control: Box<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_allocator(mut self, allocator: Box<dyn PortAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// The live PID for a VM, if its PID file parses and the process
    /// answers the probe.
    pub fn running_pid(&self, name: &str) -> Option<u32> {
        let pid = read_pid_file(&self.paths.pid_path(name))?;
        self.control.is_alive(pid).then_some(pid)
    }

    /// Launch the hypervisor for `name`. Fails fast on missing artifacts,
    /// persists a fresh SSH port for the provisioner before spawning, and
    /// re-probes liveness after the daemonizing launch returns.
    pub async fn start(&self, name: &str) -> Result<u32, LabError> {
        let mut record = self.store.load(name)?;

        if let Some(pid) = self.running_pid(name) {
            return Err(LabError::AlreadyRunning {
                name: name.into(),
                pid,
            });
        }

        let disk = Path::new(&record.disk_image);
        if !disk.exists() {
            return Err(LabError::MissingArtifact {
                what: "disk image".into(),
                path: record.disk_image.clone(),
                hint: format!(
                    "create it first: qemu-img create -f qcow2 {} 10G",
                    record.disk_image
                ),
            });
        }
        if let Some(ref media) = record.boot_media
            && !Path::new(media).exists()
        {
            return Err(LabError::MissingArtifact {
                what: "boot media".into(),
                path: media.clone(),
                hint: "copy the boot image into place, or recreate the VM without --boot-media"
                    .into(),
            });
        }
        if record.role == Role::Provisioner {
            let payload = self.paths.image_dir(&record.distro, &record.arch.to_string());
            if !payload.exists() {
                return Err(LabError::MissingArtifact {
                    what: "network-boot payload".into(),
                    path: payload.display().to_string(),
                    hint: format!(
                        "place vmlinuz, initrd and rootfs.tar.gz under {} before starting the provisioner",
                        payload.display()
                    ),
                });
            }
        }

        for dir in [self.paths.run_dir(), self.paths.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| LabError::Io {
                context: format!("creating {}", dir.display()),
                source,
            })?;
        }
        // Stale artifacts from an unclean exit must not satisfy the
        // post-launch re-probe.
        let _ = std::fs::remove_file(self.paths.pid_path(name));
        let _ = std::fs::remove_file(self.paths.control_socket_path(name));

        if record.role == Role::Provisioner {
            // Persisted before the spawn so a mid-launch crash still
            // leaves a discoverable (if stale) port behind.
            record.ssh_port = self.allocator.find_random_port()?;
            self.store.save(&record)?;
        }

        let invocation =
            qemu::build_invocation(&record, self.config, self.paths, qemu::detect_accel());
        tracing::info!(name, binary = %invocation.binary, "launching hypervisor");
        tracing::debug!(args = ?invocation.args);

        let output = tokio::process::Command::new(&invocation.binary)
            .args(&invocation.args)
            .output()
            .await
            .map_err(|source| LabError::Io {
                context: format!("spawning {}", invocation.binary),
                source,
            })?;

        if !output.status.success() {
            return Err(LabError::LaunchFailed {
                name: name.into(),
                output: combined_output(&output),
            });
        }

        // A zero exit only means the launcher half daemonized cleanly.
        // The daemon itself may already be gone; re-probe.
        let pid = self.await_pid_file(name).await;
        match pid {
            Some(pid) if self.control.is_alive(pid) => {
                tracing::info!(name, pid, "hypervisor is up");
                Ok(pid)
            }
            _ => {
                let mut captured = combined_output(&output);
                if captured.is_empty() {
                    captured = "(hypervisor exited without output)".into();
                }
                Err(LabError::LaunchFailed {
                    name: name.into(),
                    output: captured,
                })
            }
        }
    }

    /// Shut down `name`, escalating from graceful to forceful. A missing
    /// PID file means already stopped: success, not an error.
    pub async fn stop(&self, name: &str, policy: &ShutdownPolicy) -> Result<(), LabError> {
        let pid_path = self.paths.pid_path(name);
        if !pid_path.exists() {
            tracing::debug!(name, "no PID file, already stopped");
            return Ok(());
        }

        let Some(pid) = read_pid_file(&pid_path) else {
            tracing::warn!(name, "unreadable PID file, cleaning up");
            self.cleanup(name);
            return Ok(());
        };

        if !self.control.is_alive(pid) {
            self.cleanup(name);
            return Ok(());
        }

        let mut phase = ShutdownPhase::Graceful;
        loop {
            phase = match phase {
                ShutdownPhase::Graceful => {
                    // Socket failures here mean "graceful path unavailable",
                    // which falls through to the forceful phase.
                    let socket = self.paths.control_socket_path(name);
                    if let Err(e) = send_powerdown(&socket, policy.connect_timeout).await {
                        tracing::debug!(name, error = %e, "graceful powerdown unavailable");
                    }
                    if self
                        .poll_until_dead(pid, policy.graceful_polls, policy.poll_interval)
                        .await
                    {
                        ShutdownPhase::Stopped
                    } else {
                        ShutdownPhase::TerminateSent
                    }
                }
                ShutdownPhase::TerminateSent => {
                    tracing::info!(name, pid, "escalating to SIGTERM");
                    self.control.terminate(pid);
                    if self
                        .poll_until_dead(pid, policy.term_polls, policy.poll_interval)
                        .await
                    {
                        ShutdownPhase::Stopped
                    } else {
                        ShutdownPhase::KillSent
                    }
                }
                ShutdownPhase::KillSent => {
                    tracing::warn!(name, pid, "escalating to SIGKILL");
                    self.control.kill(pid);
                    if self.poll_until_dead(pid, 1, policy.poll_interval).await {
                        ShutdownPhase::Stopped
                    } else {
                        ShutdownPhase::Failed
                    }
                }
                ShutdownPhase::Stopped => {
                    self.cleanup(name);
                    tracing::info!(name, "VM stopped");
                    return Ok(());
                }
                ShutdownPhase::Failed => {
                    return Err(LabError::StopFailed {
                        name: name.into(),
                        pid,
                    });
                }
            };
        }
    }

    async fn poll_until_dead(&self, pid: u32, polls: u32, interval: Duration) -> bool {
        for _ in 0..polls {
            if !self.control.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(interval).await;
        }
        !self.control.is_alive(pid)
    }

    async fn await_pid_file(&self, name: &str) -> Option<u32> {
        let path = self.paths.pid_path(name);
        let deadline = tokio::time::Instant::now() + PID_FILE_GRACE;
        loop {
            if let Some(pid) = read_pid_file(&path) {
                return Some(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(PID_FILE_POLL).await;
        }
    }

    /// Remove PID/socket artifacts and clear the persisted SSH port.
    /// Idempotent; failures degrade to warnings because cleanup must be
    /// maximally resilient.
    fn cleanup(&self, name: &str) {
        for path in [
            self.paths.pid_path(name),
            self.paths.control_socket_path(name),
        ] {
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact");
            }
        }

        match self.store.load(name) {
            Ok(mut record) if record.ssh_port != 0 => {
                record.ssh_port = 0;
                if let Err(e) = self.store.save(&record) {
                    tracing::warn!(name, error = %e, "failed to clear ssh port");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(name, error = %e, "no record to update on cleanup"),
        }
    }
}

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Connect to the QMP socket and issue a powerdown. QEMU requires the
/// capabilities negotiation before it accepts commands.
async fn send_powerdown(socket: &Path, connect_timeout: Duration) -> std::io::Result<()> {
    let attempt = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream
            .write_all(b"{\"execute\":\"qmp_capabilities\"}\n")
            .await?;
        stream
            .write_all(b"{\"execute\":\"system_powerdown\"}\n")
            .await?;
        stream.flush().await?;
        Ok(())
    };

    tokio::time::timeout(connect_timeout, attempt)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "QMP connect timed out"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Arch, VmRecord};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Reports alive for the first `alive_calls` probes, dead afterwards.
    /// Records delivered signals instead of touching any real PID.
    struct ScriptedControl {
        alive_calls: u32,
        calls: AtomicU32,
        term_signals: AtomicU32,
        kill_signals: AtomicU32,
    }

    impl ScriptedControl {
        fn dies_after(alive_calls: u32) -> Arc<Self> {
            Arc::new(Self {
                alive_calls,
                calls: AtomicU32::new(0),
                term_signals: AtomicU32::new(0),
                kill_signals: AtomicU32::new(0),
            })
        }

        fn immortal() -> Arc<Self> {
            Self::dies_after(u32::MAX)
        }
    }

    impl ProcessControl for Arc<ScriptedControl> {
        fn is_alive(&self, _pid: u32) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) < self.alive_calls
        }

        fn terminate(&self, _pid: u32) {
            self.term_signals.fetch_add(1, Ordering::SeqCst);
        }

        fn kill(&self, _pid: u32) {
            self.kill_signals.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedPort(u16);

    impl PortAllocator for FixedPort {
        fn find_random_port(&self) -> Result<u16, LabError> {
            Ok(self.0)
        }
    }

    fn lab(dir: &tempfile::TempDir) -> (VmStore, LabPaths, LabConfig) {
        let paths = LabPaths::new(dir.path());
        let store = VmStore::new(paths.vms_dir());
        (store, paths, LabConfig::default())
    }

    fn record(name: &str, role: Role, disk: &Path) -> VmRecord {
        VmRecord {
            name: name.into(),
            role,
            arch: Arch::X86_64,
            distro: "ubuntu".into(),
            ipv4: "10.33.0.5/24".into(),
            ipv6: "fd33::5/64".into(),
            mac: "AA:BB:CC:DD:EE:05".into(),
            ssh_port: 0,
            disk_image: disk.display().to_string(),
            boot_media: None,
            shared_dir: None,
            public_key: String::new(),
            pxe_boot: false,
        }
    }

    fn fast_policy() -> ShutdownPolicy {
        ShutdownPolicy {
            graceful_polls: 2,
            term_polls: 2,
            poll_interval: Duration::ZERO,
            connect_timeout: Duration::from_millis(50),
        }
    }

    /// A fake hypervisor that "daemonizes": writes a PID file and exits 0.
    fn write_stub_hypervisor(dir: &Path, fake_pid: u32) -> String {
        let path = dir.join("qemu-stub.sh");
        let script = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-pidfile\" ]; then echo {fake_pid} > \"$2\"; fi\n  shift\ndone\n"
        );
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.display().to_string()
    }

    #[tokio::test]
    async fn stop_on_never_started_vm_is_a_noop_success() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        let supervisor = Supervisor::new(&store, &paths, &config);

        supervisor.stop("ghost", &fast_policy()).await.unwrap();
    }

    #[tokio::test]
    async fn stop_succeeds_when_process_dies_after_kill() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        std::fs::create_dir_all(paths.run_dir()).unwrap();
        std::fs::write(paths.pid_path("vm1"), "54321\n").unwrap();
        std::fs::write(paths.control_socket_path("vm1"), "").unwrap();

        // Alive through the initial check (1), graceful polls (2), and
        // SIGTERM polls (2); dead at the post-SIGKILL poll.
        let control = ScriptedControl::dies_after(5);
        let supervisor =
            Supervisor::new(&store, &paths, &config).with_control(Box::new(control.clone()));

        supervisor.stop("vm1", &fast_policy()).await.unwrap();
        assert!(!paths.pid_path("vm1").exists());
        assert!(!paths.control_socket_path("vm1").exists());

        // Both escalation signals went through the injected control.
        assert_eq!(control.term_signals.load(Ordering::SeqCst), 1);
        assert_eq!(control.kill_signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_reports_hard_failure_when_kill_does_not_take() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        std::fs::create_dir_all(paths.run_dir()).unwrap();
        std::fs::write(paths.pid_path("vm1"), "54321\n").unwrap();

        let control = ScriptedControl::immortal();
        let supervisor =
            Supervisor::new(&store, &paths, &config).with_control(Box::new(control.clone()));

        let err = supervisor.stop("vm1", &fast_policy()).await.unwrap_err();
        match err {
            LabError::StopFailed { pid, .. } => assert_eq!(pid, 54321),
            other => panic!("expected StopFailed, got {other:?}"),
        }
        assert_eq!(control.term_signals.load(Ordering::SeqCst), 1);
        assert_eq!(control.kill_signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_clears_persisted_ssh_port() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        let disk = dir.path().join("disk.qcow2");
        std::fs::write(&disk, "").unwrap();

        let mut r = record("vm1", Role::Provisioner, &disk);
        r.ssh_port = 40022;
        store.save(&r).unwrap();
        std::fs::create_dir_all(paths.run_dir()).unwrap();
        std::fs::write(paths.pid_path("vm1"), "54321\n").unwrap();

        // Dead on first probe: straight to cleanup.
        let supervisor = Supervisor::new(&store, &paths, &config)
            .with_control(Box::new(ScriptedControl::dies_after(0)));
        supervisor.stop("vm1", &fast_policy()).await.unwrap();

        assert_eq!(store.load("vm1").unwrap().ssh_port, 0);
    }

    #[tokio::test]
    async fn start_fails_fast_on_missing_disk_image() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        store
            .save(&record("vm1", Role::Target, Path::new("/nonexistent/disk.qcow2")))
            .unwrap();

        let supervisor = Supervisor::new(&store, &paths, &config);
        let err = supervisor.start("vm1").await.unwrap_err();
        assert!(matches!(err, LabError::MissingArtifact { .. }));
    }

    #[tokio::test]
    async fn start_rejects_already_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, config) = lab(&dir);
        let disk = dir.path().join("disk.qcow2");
        std::fs::write(&disk, "").unwrap();
        store.save(&record("vm1", Role::Target, &disk)).unwrap();
        std::fs::create_dir_all(paths.run_dir()).unwrap();
        std::fs::write(paths.pid_path("vm1"), "4242\n").unwrap();

        let supervisor = Supervisor::new(&store, &paths, &config)
            .with_control(Box::new(ScriptedControl::immortal()));
        let err = supervisor.start("vm1").await.unwrap_err();
        assert!(matches!(err, LabError::AlreadyRunning { pid: 4242, .. }));
    }

    #[tokio::test]
    async fn start_reports_failure_when_daemon_dies_silently() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, mut config) = lab(&dir);
        let disk = dir.path().join("disk.qcow2");
        std::fs::write(&disk, "").unwrap();
        store.save(&record("vm1", Role::Target, &disk)).unwrap();

        // `true` exits 0 but never writes a PID file: the mandatory
        // re-probe must turn this into a start failure.
        config.qemu.x86_64 = Some("true".into());

        let supervisor = Supervisor::new(&store, &paths, &config);
        let err = supervisor.start("vm1").await.unwrap_err();
        assert!(matches!(err, LabError::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn start_persists_provisioner_port_before_reporting_success() {
        let dir = tempfile::tempdir().unwrap();
        let (store, paths, mut config) = lab(&dir);
        let disk = dir.path().join("disk.qcow2");
        std::fs::write(&disk, "").unwrap();
        std::fs::create_dir_all(paths.image_dir("ubuntu", "x86_64")).unwrap();

        let mut r = record("boss", Role::Provisioner, &disk);
        r.arch = Arch::X86_64;
        store.save(&r).unwrap();

        config.qemu.x86_64 = Some(write_stub_hypervisor(dir.path(), 4242));

        let supervisor = Supervisor::new(&store, &paths, &config)
            .with_control(Box::new(ScriptedControl::immortal()))
            .with_allocator(Box::new(FixedPort(45555)));

        let pid = supervisor.start("boss").await.unwrap();
        assert_eq!(pid, 4242);
        assert_eq!(store.load("boss").unwrap().ssh_port, 45555);
    }
}
