//! The probe being built: identity, source tree and output naming.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::process::Cmd;

/// The two artifacts built per kernel release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Kmod,
    Ebpf,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 2] = [ProbeKind::Kmod, ProbeKind::Ebpf];

    /// Name used in skip rules.
    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::Kmod => "kmod",
            ProbeKind::Ebpf => "ebpf",
        }
    }

    /// Arguments passed to the build worker.
    pub fn worker_args(self) -> &'static [&'static str] {
        match self {
            ProbeKind::Kmod => &[],
            ProbeKind::Ebpf => &["bpf"],
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Kmod => f.write_str("kmod"),
            ProbeKind::Ebpf => f.write_str("eBPF"),
        }
    }
}

impl FromStr for ProbeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kmod" => Ok(ProbeKind::Kmod),
            "ebpf" | "bpf" => Ok(ProbeKind::Ebpf),
            _ => bail!("unknown probe kind `{}` (expected kmod or ebpf)", s),
        }
    }
}

/// Probe name, version and the source tree mounted into the build worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub name: String,
    pub version: String,
    /// Character device name, the probe name up to its first `-`.
    pub device_name: String,
    pub source_dir: PathBuf,
}

impl Probe {
    pub fn new(name: impl Into<String>, version: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let device_name = name.split('-').next().unwrap_or(&name).to_string();
        Self {
            name,
            version: version.into(),
            device_name,
            source_dir: source_dir.into(),
        }
    }

    /// File name the build worker writes for one kernel.
    pub fn output_file(&self, kind: ProbeKind, arch: &str, kernel_release: &str, config_hash: &str) -> String {
        match kind {
            ProbeKind::Kmod => format!(
                "{}-{}-{}-{}-{}.ko",
                self.name, self.version, arch, kernel_release, config_hash
            ),
            ProbeKind::Ebpf => format!(
                "{}-bpf-{}-{}-{}-{}.o",
                self.name, self.version, arch, kernel_release, config_hash
            ),
        }
    }
}

/// Git repository and branch holding the sources of a probe version.
pub fn source_repository(probe_name: &str, probe_version: &str) -> Result<(&'static str, String)> {
    match probe_name {
        "sysdig" | "sysdig-probe" => Ok(("https://github.com/draios/sysdig", probe_version.to_string())),
        "sysdigcloud" | "sysdigcloud-probe" | "draios-agent" => Ok((
            "https://github.com/draios/agent-libs",
            format!("agent/{}", probe_version),
        )),
        _ => bail!(
            "no known source repository for probe `{}`; pass --source-dir",
            probe_name
        ),
    }
}

/// Locate the probe sources, cloning them into `workspace` if needed.
///
/// An explicit `source_dir` must exist. Otherwise the matching repository
/// is shallow-cloned into `<workspace>/sources/<name>-<version>`, once.
pub fn resolve_source(
    probe_name: &str,
    probe_version: &str,
    source_dir: Option<&Path>,
    workspace: &Path,
) -> Result<PathBuf> {
    if let Some(dir) = source_dir {
        if !dir.is_dir() {
            bail!("probe source directory {} does not exist", dir.display());
        }
        return dir
            .canonicalize()
            .with_context(|| format!("resolving {}", dir.display()));
    }

    let (url, branch) = source_repository(probe_name, probe_version)?;
    let target = workspace
        .join("sources")
        .join(format!("{}-{}", probe_name, probe_version));
    if target.join(".git").is_dir() {
        tracing::info!(path = %target.display(), "reusing probe sources");
        return Ok(target);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    tracing::info!(%url, %branch, "cloning probe sources");
    Cmd::new("git")
        .args(["clone", "--depth", "1", "--branch", branch.as_str(), url])
        .arg(&target)
        .error_msg(format!("Failed to clone {} ({})", url, branch))
        .run()?;
    Ok(target)
}
