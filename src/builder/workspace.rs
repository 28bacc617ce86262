//! On-disk layout of a build run.
//!
//! ```text
//! <root>/
//!   <distro>/                downloaded packages
//!   build/<distro>/<release> unpacked kernel trees
//!   output/                  built probes
//!   sources/                 cloned probe sources
//! ```
//!
//! The whole root is mounted read-only into build workers at
//! [`WORKSPACE_MOUNT`], and `output/` read-write at [`OUTPUT_MOUNT`].

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::docker::MountMapping;

/// Where the workspace appears inside a build worker.
pub const WORKSPACE_MOUNT: &str = "/build/probe";
/// Where the output directory appears inside a build worker.
pub const OUTPUT_MOUNT: &str = "/output";
/// Where the probe sources appear inside a build worker.
pub const SOURCE_MOUNT: &str = "/code/sysdig-ro";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    builder_source: PathBuf,
    image_prefix: String,
    machine: String,
    mounts: Vec<MountMapping>,
}

impl Workspace {
    /// Create (if needed) and open the workspace at `root`.
    pub fn new(root: &Path, builder_source: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("creating workspace {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("resolving workspace {}", root.display()))?;
        Ok(Self {
            root,
            builder_source: builder_source.to_path_buf(),
            image_prefix: String::new(),
            machine: std::env::consts::ARCH.to_string(),
            mounts: Vec::new(),
        })
    }

    pub fn with_image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = machine.into();
        self
    }

    /// Bind mounts of the container this process runs in, used by
    /// [`host_path`](Self::host_path).
    pub fn with_mounts(mut self, mounts: Vec<MountMapping>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn builder_source(&self) -> &Path {
        &self.builder_source
    }

    /// Registry prefix of pre-built builder images; empty means build locally.
    pub fn image_prefix(&self) -> &str {
        &self.image_prefix
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn subdir(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn download_dir(&self, distro: &str) -> PathBuf {
        self.subdir(distro)
    }

    pub fn build_dir(&self, distro: &str, release: &str) -> PathBuf {
        self.root.join("build").join(distro).join(release)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.subdir("output")
    }

    /// `path` as a build worker sees it.
    pub fn container_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => WORKSPACE_MOUNT.to_string(),
            Ok(rel) => format!("{}/{}", WORKSPACE_MOUNT, rel.display()),
            Err(_) => path.display().to_string(),
        }
    }

    /// `path` as the container runtime's host sees it.
    ///
    /// When running inside a container, bind mount sources have to be given
    /// in host terms; the longest matching mount destination is swapped for
    /// its source.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        self.mounts
            .iter()
            .filter(|(dest, _)| path.starts_with(dest))
            .max_by_key(|(dest, _)| dest.components().count())
            .and_then(|(dest, source)| path.strip_prefix(dest).ok().map(|rel| source.join(rel)))
            .unwrap_or_else(|| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(&temp.path().join("ws"), Path::new("/src/builders")).unwrap();
        let root = temp.path().join("ws").canonicalize().unwrap();
        assert_eq!(ws.root(), root);
        assert_eq!(ws.download_dir("debian"), root.join("debian"));
        assert_eq!(ws.build_dir("debian", "5.10.0-8"), root.join("build/debian/5.10.0-8"));
        assert_eq!(ws.output_dir(), root.join("output"));
        assert_eq!(ws.image_prefix(), "");
        assert_eq!(ws.builder_source(), Path::new("/src/builders"));
    }

    #[test]
    fn test_container_path() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), Path::new("/src")).unwrap();
        let kernel_dir = ws.build_dir("centos", "4.18.0-80.el8.x86_64").join("usr/src/kernels/4.18.0-80.el8.x86_64");
        assert_eq!(
            ws.container_path(&kernel_dir),
            "/build/probe/build/centos/4.18.0-80.el8.x86_64/usr/src/kernels/4.18.0-80.el8.x86_64"
        );
        assert_eq!(ws.container_path(ws.root()), "/build/probe");
        assert_eq!(ws.container_path(Path::new("/elsewhere")), "/elsewhere");
    }

    #[test]
    fn test_host_path_uses_longest_mount() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), Path::new("/src")).unwrap().with_mounts(vec![
            (PathBuf::from("/workspace"), PathBuf::from("/home/ci/ws")),
            (PathBuf::from("/workspace/output"), PathBuf::from("/mnt/artifacts")),
        ]);
        assert_eq!(ws.host_path(Path::new("/workspace/build/x")), PathBuf::from("/home/ci/ws/build/x"));
        assert_eq!(ws.host_path(Path::new("/workspace/output")), PathBuf::from("/mnt/artifacts"));
        assert_eq!(ws.host_path(Path::new("/workspacefoo")), PathBuf::from("/workspacefoo"));
        assert_eq!(ws.host_path(Path::new("/opt/src")), PathBuf::from("/opt/src"));
    }
}
