//! RPM distributions laid out like RHEL: headers in
//! `usr/src/kernels/<release>`, config in `boot/config-<release>`.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

use super::{BuilderFamily, DistroBuilder, KernelFiles};
use crate::builder::Workspace;
use crate::crawler::ReleaseKey;
use crate::unpack;

static KERNEL_RPM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^kernel(?:-uek)?(?:-core|-devel|-modules|-headers)?-(?P<release>[0-9][^/]*)\.rpm$")
        .expect("Failed to compile kernel rpm regex")
});

pub(super) const RPM_TOOLS: &[(&str, &str)] = &[("rpm2cpio", "rpm2cpio"), ("cpio", "cpio")];

pub(super) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Unpack every rpm of a release into `build/<distro>/<release>`.
pub(super) fn unpack_rpms(workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf]) -> Result<PathBuf> {
    let target = workspace.build_dir(distro_dir, release.kernel_release());
    for rpm in files {
        unpack::unpack_rpm(rpm, &target)?;
    }
    Ok(target)
}

/// `boot/config-<release>`, or the kernel tree's own `.config`.
pub(super) fn rpm_config_hash(release: &str, target: &Path, kernel_dir: &Path) -> Result<String> {
    let boot_config = target.join(format!("boot/config-{}", release));
    if boot_config.exists() {
        unpack::md5_file(&boot_config)
    } else {
        unpack::md5_file(&kernel_dir.join(".config"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CentosBuilder;

impl DistroBuilder for CentosBuilder {
    fn family(&self) -> BuilderFamily {
        BuilderFamily::Centos
    }

    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles {
        let mut kernels = KernelFiles::new();
        for path in files {
            let name = file_name(path);
            match KERNEL_RPM.captures(&name) {
                Some(caps) => kernels
                    .entry(ReleaseKey::new(&caps["release"]))
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
        Ok(target.join("usr/src/kernels").join(release.kernel_release()))
    }

    fn hash_config(&self, release: &ReleaseKey, target: &Path, kernel_dir: &Path) -> Result<String> {
        rpm_config_hash(release.kernel_release(), target, kernel_dir)
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        RPM_TOOLS
    }
}
