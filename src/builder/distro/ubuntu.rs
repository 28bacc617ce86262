//! Ubuntu kernel packages: like Debian, minus the kbuild package.
//!
//! ```text
//! linux-headers-5.4.0-100_5.4.0-100.113_all.deb          common headers
//! linux-headers-5.4.0-100-generic_5.4.0-100.113_amd64.deb
//! linux-modules-5.4.0-100-generic_5.4.0-100.113_amd64.deb
//! ```

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::debian::{deb_config_hash, headers_dir, rebatch_crawled, unpack_debs, DEB_TOOLS};
use super::{BuilderFamily, DistroBuilder, KernelFiles};
use crate::builder::Workspace;
use crate::crawler::ReleaseKey;

static KERNEL_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-(?P<version>[0-9]+\.[0-9]+\.[0-9]+-[0-9]+)(-(?P<flavour>[a-z][a-z0-9-]*))?_")
        .expect("Failed to compile ubuntu kernel version regex")
});

/// Group Ubuntu package files into `(version, flavour)` releases.
pub fn batch_ubuntu_packages(drel: &str, files: &[PathBuf]) -> KernelFiles {
    let mut common: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut flavoured: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();

    for path in files {
        let name = super::centos::file_name(path);
        let Some(caps) = KERNEL_VERSION.captures(&name) else {
            tracing::warn!(file = %path.display(), "not a kernel package, ignoring");
            continue;
        };
        let version = caps["version"].to_string();
        match caps.name("flavour") {
            Some(flavour) => flavoured
                .entry((version, flavour.as_str().to_string()))
                .or_default()
                .push(path.clone()),
            None => common.entry(version).or_default().push(path.clone()),
        }
    }

    flavoured
        .into_iter()
        .map(|((version, flavour), mut packages)| {
            if let Some(shared) = common.get(&version) {
                packages.extend(shared.iter().cloned());
            }
            (ReleaseKey::grouped(drel, version).with_variant(flavour), packages)
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UbuntuBuilder;

impl DistroBuilder for UbuntuBuilder {
    fn family(&self) -> BuilderFamily {
        BuilderFamily::Ubuntu
    }

    fn batch_crawled(&self, files: KernelFiles) -> KernelFiles {
        rebatch_crawled(files, batch_ubuntu_packages)
    }

    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles {
        batch_ubuntu_packages("", files)
    }

    fn unpack(&self, workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf]) -> Result<PathBuf> {
        unpack_debs(workspace, distro_dir, release, files)
    }

    fn kernel_dir(&self, release: &ReleaseKey, target: &Path) -> Result<PathBuf> {
        Ok(headers_dir(release, target))
    }

    fn hash_config(&self, release: &ReleaseKey, target: &Path, _kernel_dir: &Path) -> Result<String> {
        deb_config_hash(release, target)
    }

    fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        DEB_TOOLS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_batch_flavours() {
        let files: Vec<PathBuf> = [
            "linux-headers-5.4.0-100_5.4.0-100.113_all.deb",
            "linux-headers-5.4.0-100-generic_5.4.0-100.113_amd64.deb",
            "linux-modules-5.4.0-100-generic_5.4.0-100.113_amd64.deb",
            "linux-headers-5.4.0-100-lowlatency_5.4.0-100.113_amd64.deb",
            "linux-aws-headers-5.4.0-1060_5.4.0-1060.63_all.deb",
            "linux-headers-5.4.0-1060-aws_5.4.0-1060.63_amd64.deb",
            "README",
        ]
        .iter()
        .map(PathBuf::from)
        .collect();

        let kernels = batch_ubuntu_packages("focal", &files);
        let names: Vec<String> = kernels.keys().map(|k| k.kernel_release_name()).collect();
        assert_eq!(names, vec!["5.4.0-100-generic", "5.4.0-100-lowlatency", "5.4.0-1060-aws"]);

        let generic = &kernels[&ReleaseKey::grouped("focal", "5.4.0-100").with_variant("generic")];
        assert_eq!(generic.len(), 3);
        assert_eq!(generic[2], PathBuf::from("linux-headers-5.4.0-100_5.4.0-100.113_all.deb"));
        let aws = &kernels[&ReleaseKey::grouped("focal", "5.4.0-1060").with_variant("aws")];
        assert_eq!(aws.len(), 2);
    }

    #[test]
    fn test_kernel_dir() {
        let release = ReleaseKey::grouped("jammy", "5.15.0-60").with_variant("generic");
        assert_eq!(
            UbuntuBuilder.kernel_dir(&release, Path::new("/ws/build/ubuntu/5.15.0-60")).unwrap(),
            PathBuf::from("/ws/build/ubuntu/5.15.0-60/usr/src/linux-headers-5.15.0-60-generic")
        );
    }
}
