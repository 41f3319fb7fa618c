//! External command execution, injectable so the pipeline is testable
//! without a real initramfs.

use std::process::{Command, Stdio};

use crate::InstallError;

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, InstallError>;

    /// Like [`run`](Self::run) but with `input` piped to stdin.
    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<String, InstallError>;
}

/// Runs commands on the live system.
pub struct SystemRunner;

impl SystemRunner {
    fn finish(
        program: &str,
        args: &[&str],
        output: std::process::Output,
    ) -> Result<String, InstallError> {
        let combined = {
            let mut s = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !s.is_empty() {
                    s.push('\n');
                }
                s.push_str(&stderr);
            }
            s
        };

        if !output.status.success() {
            return Err(InstallError::Command {
                command: format!("{program} {}", args.join(" ")),
                output: combined,
            });
        }
        Ok(combined)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, InstallError> {
        tracing::debug!(program, ?args, "running");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| InstallError::Io {
                context: format!("spawning {program}"),
                source,
            })?;
        Self::finish(program, args, output)
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<String, InstallError> {
        use std::io::Write;

        tracing::debug!(program, ?args, "running with stdin");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| InstallError::Io {
                context: format!("spawning {program}"),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|source| InstallError::Io {
                    context: format!("writing stdin of {program}"),
                    source,
                })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|source| InstallError::Io {
                context: format!("waiting for {program}"),
                source,
            })?;
        Self::finish(program, args, output)
    }
}
