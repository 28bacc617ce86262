//! Container runtime used for builder images and build workers.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl Volume {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>, readonly: bool) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly,
        }
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_path.display(), self.container_path)?;
        if self.readonly {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

/// One `docker run --rm` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub volumes: Vec<Volume>,
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn command(&self) -> Cmd {
        let mut cmd = Cmd::new("docker").args(["run", "--rm"]);
        for volume in &self.volumes {
            cmd = cmd.arg("-v").arg(volume.to_string());
        }
        for (name, value) in &self.env {
            cmd = cmd.arg("-e").arg(format!("{}={}", name, value));
        }
        cmd.arg(&self.image).args(&self.args)
    }
}

/// How a build worker exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    pub success: bool,
    /// Stdout and stderr of the worker.
    pub output: String,
}

/// A `(container path, host path)` bind mount of the container this
/// process runs in.
pub type MountMapping = (PathBuf, PathBuf);

pub trait ContainerRuntime: Send + Sync {
    /// Build `image` from `dockerfile` with `context` as build context.
    fn build_image(&self, image: &str, dockerfile: &Path, context: &Path) -> Result<()>;

    /// Run a worker to completion. Only failing to start it is an error.
    fn run(&self, spec: &RunSpec) -> Result<WorkerOutput>;

    /// Mounts of the container we are running in, if any.
    fn self_mounts(&self) -> Option<Vec<MountMapping>>;
}

/// The `docker` CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct Docker;

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Mounts", default)]
    mounts: Vec<InspectMount>,
}

#[derive(Debug, Deserialize)]
struct InspectMount {
    #[serde(rename = "Source")]
    source: PathBuf,
    #[serde(rename = "Destination")]
    destination: PathBuf,
}

/// Mount table from `docker inspect` output.
pub fn parse_inspect_mounts(json: &str) -> Result<Vec<MountMapping>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json).context("parsing docker inspect output")?;
    Ok(entries
        .into_iter()
        .next()
        .map(|e| e.mounts.into_iter().map(|m| (m.destination, m.source)).collect())
        .unwrap_or_default())
}

impl Docker {
    fn remove_dangling_images(&self) -> Result<()> {
        let images = Cmd::new("docker")
            .args(["images", "-q", "-f", "dangling=true"])
            .error_msg("Failed to list dangling images")
            .run()?;
        let ids: Vec<&str> = images.stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        if !ids.is_empty() {
            // images still in use by another build stay around
            let _ = Cmd::new("docker").arg("rmi").args(ids).output();
        }
        Ok(())
    }
}

impl ContainerRuntime for Docker {
    fn build_image(&self, image: &str, dockerfile: &Path, context: &Path) -> Result<()> {
        tracing::info!(image, dockerfile = %dockerfile.display(), "building builder image");
        Cmd::new("docker")
            .args(["build", "-t", image, "-f"])
            .arg(dockerfile)
            .arg(context)
            .error_msg(format!("Failed to build image {}", image))
            .run()?;
        self.remove_dangling_images()
    }

    fn run(&self, spec: &RunSpec) -> Result<WorkerOutput> {
        let out = spec.command().output()?;
        Ok(WorkerOutput {
            success: out.success(),
            output: out.combined(),
        })
    }

    fn self_mounts(&self) -> Option<Vec<MountMapping>> {
        let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname").ok()?;
        let out = Cmd::new("docker").args(["inspect", hostname.trim()]).output().ok()?;
        if !out.success() {
            return None;
        }
        match parse_inspect_mounts(&out.stdout) {
            Ok(mounts) => Some(mounts),
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "ignoring docker inspect output");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_command_line() {
        let spec = RunSpec {
            image: "sysdig-probe-builder:debian-gcc8.0".to_string(),
            volumes: vec![
                Volume::new("/src/sysdig", "/code/sysdig-ro", true),
                Volume::new("/ws/output", "/output", false),
            ],
            env: vec![("OUTPUT".to_string(), "/output".to_string())],
            args: vec!["bpf".to_string()],
        };
        let cmd = spec.command();
        let args: Vec<String> = cmd.arg_list().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.program(), "docker");
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "-v",
                "/src/sysdig:/code/sysdig-ro:ro",
                "-v",
                "/ws/output:/output",
                "-e",
                "OUTPUT=/output",
                "sysdig-probe-builder:debian-gcc8.0",
                "bpf",
            ]
        );
        assert_eq!(spec.env_var("OUTPUT"), Some("/output"));
        assert_eq!(spec.env_var("HASH"), None);
    }

    #[test]
    fn test_parse_inspect_mounts() {
        let json = r#"[{"Id": "abc", "Mounts": [
            {"Type": "bind", "Source": "/home/ci/ws", "Destination": "/workspace", "RW": true},
            {"Type": "bind", "Source": "/var/run/docker.sock", "Destination": "/var/run/docker.sock"}
        ]}]"#;
        assert_eq!(
            parse_inspect_mounts(json).unwrap(),
            vec![
                (PathBuf::from("/workspace"), PathBuf::from("/home/ci/ws")),
                (PathBuf::from("/var/run/docker.sock"), PathBuf::from("/var/run/docker.sock")),
            ]
        );
        assert!(parse_inspect_mounts("[]").unwrap().is_empty());
        assert!(parse_inspect_mounts("not json").is_err());
    }
}
