use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum LabError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("unreadable VM descriptor at {path}: {message}")]
    Store { path: String, message: String },

    #[error("no VM named '{name}'")]
    NotFound { name: String },

    #[error("missing {what} at {path}")]
    #[diagnostic(help("{hint}"))]
    MissingArtifact {
        what: String,
        path: String,
        hint: String,
    },

    #[error("address {address} is already assigned to VM '{owner}'")]
    AddressConflict { address: String, owner: String },

    #[error("MAC {mac} is already assigned to VM '{owner}'")]
    MacConflict { mac: String, owner: String },

    #[error("a provisioner VM already exists: '{existing}'")]
    ProvisionerExists { existing: String },

    #[error("VM '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("hypervisor for '{name}' did not stay up")]
    #[diagnostic(help("captured output:\n{output}"))]
    LaunchFailed { name: String, output: String },

    #[error("failed to stop VM '{name}': pid {pid} survived SIGKILL")]
    StopFailed { name: String, pid: u32 },

    #[error("{tool} failed")]
    #[diagnostic(help("captured output:\n{output}"))]
    External { tool: String, output: String },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("{feature} is not yet implemented")]
    NotImplemented { feature: String },
}

impl LabError {
    /// Timeouts are a distinct failure class; callers and tests match on
    /// them instead of string-comparing messages.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LabError::Timeout { .. })
    }
}
