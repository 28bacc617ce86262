//! Photon OS: rpm packages, but a Debian-style `usr/src/linux-headers-<release>`.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use super::centos::{file_name, rpm_config_hash, unpack_rpms, RPM_TOOLS};
use super::{BuilderFamily, DistroBuilder, KernelFiles};
use crate::builder::Workspace;
use crate::crawler::ReleaseKey;

static LINUX_RPM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^linux(?:-[a-z]+)*-(?P<release>[0-9][^/]*)\.rpm$").expect("Failed to compile linux rpm regex")
});

/// Photon kernels report their release without the architecture.
pub fn strip_release(release: &str) -> &str {
    release.strip_suffix(".x86_64").unwrap_or(release)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PhotonBuilder;

impl DistroBuilder for PhotonBuilder {
    fn family(&self) -> BuilderFamily {
        BuilderFamily::PhotonOs
    }

    fn batch_crawled(&self, files: KernelFiles) -> KernelFiles {
        let mut renamed = KernelFiles::new();
        for (release, paths) in files {
            let stripped = strip_release(release.kernel_release()).to_string();
            renamed
                .entry(release.with_kernel_release(stripped))
                .or_default()
                .extend(paths);
        }
        renamed
    }

    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles {
        let mut kernels = KernelFiles::new();
        for path in files {
            let name = file_name(path);
            match LINUX_RPM.captures(&name) {
                Some(caps) => kernels
                    .entry(ReleaseKey::new(strip_release(&caps["release"])))
                    .or_default()
                    .push(path.clone()),
                None => tracing::warn!(file = %path.display(), "not a kernel rpm, ignoring"),
            }
        }
        kernels
    }

    fn unpack(&self, workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf]) -> Result<PathBuf> {
        unpack_rpms(workspace, distro_dir, release, files)
    }

    fn kernel_dir(&self, release: &ReleaseKey, target: &Path) -> Result<PathBuf> {
        Ok(target.join(format!("usr/src/linux-headers-{}", release.kernel_release())))
    }

    fn hash_config(&self, release: &ReleaseKey, target: &Path, kernel_dir: &Path) -> Result<String> {
        rpm_config_hash(release.kernel_release(), target, kernel_dir)
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        RPM_TOOLS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_strip_release() {
        assert_eq!(strip_release("5.10.83-3.ph4.x86_64"), "5.10.83-3.ph4");
        assert_eq!(strip_release("5.10.83-3.ph4.aarch64"), "5.10.83-3.ph4.aarch64");
        assert_eq!(strip_release("4.19.225-1.ph3"), "4.19.225-1.ph3");
    }

    #[test]
    fn test_crawled_releases_are_stripped() {
        let mut files = KernelFiles::new();
        files.insert(
            ReleaseKey::new("5.10.83-3.ph4.x86_64"),
            vec![PathBuf::from("/ws/photonos/linux-devel-5.10.83-3.ph4.x86_64.rpm")],
        );
        let batched = PhotonBuilder.batch_crawled(files);
        let release = ReleaseKey::new("5.10.83-3.ph4");
        assert_eq!(batched[&release].len(), 1);
        assert_eq!(
            PhotonBuilder.kernel_dir(&release, Path::new("/t")).unwrap(),
            PathBuf::from("/t/usr/src/linux-headers-5.10.83-3.ph4")
        );
    }

    #[test]
    fn test_batch_packages() {
        let files = vec![
            PathBuf::from("linux-5.10.83-3.ph4.x86_64.rpm"),
            PathBuf::from("linux-devel-5.10.83-3.ph4.x86_64.rpm"),
            PathBuf::from("kernel-4.18.0-80.el8.x86_64.rpm"),
        ];
        let kernels = PhotonBuilder.batch_packages(&files);
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[&ReleaseKey::new("5.10.83-3.ph4")].len(), 2);
    }
}
