//! External command execution.
//!
//! Every host tool (docker, dpkg-deb, rpm2cpio, git, ...) is invoked through
//! [`Cmd`], so failures carry the tool's own output in the error message.
//!
//! ```rust,ignore
//! use probe_builder::process::Cmd;
//!
//! Cmd::new("dpkg-deb")
//!     .args(["-x", "linux-headers.deb", "/tmp/out"])
//!     .error_msg("dpkg-deb extraction failed")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    error_msg: Option<String>,
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Message used as the error headline when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    /// Run to completion and capture output, regardless of exit status.
    ///
    /// Only a failure to spawn the process is an error here.
    pub fn output(&self) -> Result<CmdOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        tracing::debug!(program = %self.program, args = ?self.args, "running command");

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute '{}'", self.program))?;

        Ok(CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and fail unless the command exits successfully.
    pub fn run(&self) -> Result<CmdOutput> {
        let output = self.output()?;
        if !output.success() {
            let headline = self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!(
                "{} ({})\n  stdout: {}\n  stderr: {}",
                headline,
                output.status,
                output.stdout.trim(),
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

/// Run a `sh -c` pipeline, failing on non-zero exit.
pub fn shell(script: &str) -> Result<CmdOutput> {
    Cmd::new("sh")
        .args(["-c", script])
        .error_msg(format!("shell command failed: {}", script))
        .run()
}

/// Quote a path for interpolation into a [`shell`] script.
pub fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

/// Fail with a readable message if `path` is missing.
pub fn ensure_exists(path: &Path, desc: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found at {}", desc, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_captures_stdout() {
        let out = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_failure_uses_error_msg() {
        let err = Cmd::new("false").error_msg("tool exploded").run().unwrap_err();
        assert!(err.to_string().contains("tool exploded"));
    }

    #[test]
    fn test_output_does_not_fail_on_exit_status() {
        let out = Cmd::new("false").output().unwrap();
        assert!(!out.success());
    }

    #[test]
    fn test_shell_quote_round_trips_through_sh() {
        let temp = TempDir::new().unwrap();
        let weird = temp.path().join("it's here");
        std::fs::write(&weird, "x").unwrap();
        let out = shell(&format!("cat {}", shell_quote(&weird))).unwrap();
        assert_eq!(out.stdout, "x");
    }

    #[test]
    fn test_ensure_exists() {
        let temp = TempDir::new().unwrap();
        assert!(ensure_exists(temp.path(), "temp dir").is_ok());
        let err = ensure_exists(&temp.path().join("nope"), "Kernel tree").unwrap_err();
        assert!(err.to_string().starts_with("Kernel tree not found"));
    }
}
