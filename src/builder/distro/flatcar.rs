//! Flatcar developer container images.
//!
//! One compressed disk image per Flatcar release; the kernel release inside
//! it is only known after unpacking (`modules/<kernel release>/build`).

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{BuilderFamily, DistroBuilder, KernelFiles};
use crate::builder::Workspace;
use crate::crawler::ReleaseKey;
use crate::download::url_basename;
use crate::unpack;

#[derive(Debug, Default, Clone, Copy)]
pub struct FlatcarBuilder;

impl DistroBuilder for FlatcarBuilder {
    fn family(&self) -> BuilderFamily {
        BuilderFamily::Flatcar
    }

    /// Every release ships the same image name, so prefix the release.
    fn local_file_name(&self, release: &ReleaseKey, url: &str) -> String {
        format!("{}-{}", release.kernel_release(), url_basename(url))
    }

    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles {
        let mut kernels = KernelFiles::new();
        for path in files {
            let name = super::centos::file_name(path);
            match name.split_once('-') {
                Some((release, _)) => kernels
                    .entry(ReleaseKey::grouped(release, release))
                    .or_default()
                    .push(path.clone()),
                None => tracing::warn!(file = %path.display(), "expected <release>-<image>, ignoring"),
            }
        }
        kernels
    }

    fn unpack(&self, workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf]) -> Result<PathBuf> {
        let target = workspace.build_dir(distro_dir, release.kernel_release());
        for image in files {
            unpack::unpack_flatcar(image, &target)?;
        }
        Ok(target)
    }

    fn kernel_dir(&self, _release: &ReleaseKey, target: &Path) -> Result<PathBuf> {
        let modules = target.join("modules");
        let mut builds = Vec::new();
        for entry in fs::read_dir(&modules).with_context(|| format!("reading {}", modules.display()))? {
            let build = entry?.path().join("build");
            if build.exists() {
                builds.push(build);
            }
        }
        if builds.len() != 1 {
            bail!("expected one kernel version in {}, got {:?}", target.display(), builds);
        }
        Ok(builds.remove(0))
    }

    fn hash_config(&self, _release: &ReleaseKey, target: &Path, _kernel_dir: &Path) -> Result<String> {
        unpack::md5_file(&target.join("config"))
    }

    fn kernel_release(&self, release: &ReleaseKey, kernel_dir: &Path) -> String {
        kernel_dir
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| release.kernel_release_name())
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        &[("bzip2", "bzip2"), ("mount", "util-linux")]
    }
}
