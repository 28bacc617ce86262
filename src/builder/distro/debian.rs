//! Debian kernel packages.
//!
//! Debian ships one package version (`5.10.46-5`) per kernel ABI
//! (`5.10.0-8`), and every ABI comes in several flavours:
//!
//! ```text
//! linux-headers-5.10.0-8-amd64_5.10.46-5_amd64.deb     flavour amd64
//! linux-headers-5.10.0-8-rt-amd64_5.10.46-5_amd64.deb  flavour rt-amd64
//! linux-headers-5.10.0-8-common_5.10.46-5_all.deb      shared by all flavours
//! linux-kbuild-5.10_5.10.46-5_amd64.deb                shared by all 5.10 ABIs
//! ```
//!
//! Batching regroups a crawled closure into one release per ABI and
//! flavour, each carrying the shared packages. Every flavour of an ABI is
//! unpacked into the same `build/<distro>/<abi>` tree.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{BuilderFamily, DistroBuilder, KernelFiles};
use crate::builder::Workspace;
use crate::crawler::ReleaseKey;
use crate::unpack;

// newer kernels (6.6.8+) drop the trailing -<abi>
static KERNEL_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-(?P<version>[0-9]\.[0-9]+\.[0-9]+(-[0-9][^-]*)?)-(?P<vararch>[a-z0-9-]+)_")
        .expect("Failed to compile kernel version regex")
});

static KBUILD_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"linux-kbuild-(?P<version>[0-9]\.[0-9]+(\.[0-9]+(-[0-9][^-]*)?)?)_")
        .expect("Failed to compile kbuild package regex")
});

pub(super) const DEB_TOOLS: &[(&str, &str)] = &[("dpkg-deb", "dpkg")];

/// `5.10.0-8` → `5.10`.
fn major_minor(version: &str) -> Option<String> {
    let mut parts = version.splitn(3, '.');
    let major = parts.next()?;
    let minor = parts.next()?;
    Some(format!("{}.{}", major, minor))
}

/// Group Debian package files into `(version, flavour)` releases under
/// distribution release `drel`.
pub fn batch_debian_packages(drel: &str, files: &[PathBuf]) -> KernelFiles {
    let mut kbuild: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut common: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    let mut flavoured: BTreeMap<(String, String), Vec<PathBuf>> = BTreeMap::new();

    for path in files {
        let name = super::centos::file_name(path);
        if name.contains("linux-kbuild") {
            match KBUILD_PACKAGE.captures(&name) {
                Some(caps) => {
                    kbuild.insert(caps["version"].to_string(), path.clone());
                }
                None => tracing::warn!(file = %path.display(), "kbuild package without a version, ignoring"),
            }
            continue;
        }

        let Some(caps) = KERNEL_VERSION.captures(&name) else {
            tracing::warn!(file = %path.display(), "not a kernel package, ignoring");
            continue;
        };
        let version = caps["version"].to_string();
        let vararch = caps["vararch"].to_string();
        if vararch.contains("common") {
            common.entry(version).or_default().push(path.clone());
        } else {
            flavoured.entry((version, vararch)).or_default().push(path.clone());
        }
    }

    let mut kernels = KernelFiles::new();
    for ((version, vararch), mut packages) in flavoured {
        if let Some(shared) = common.get(&version) {
            packages.extend(shared.iter().cloned());
        }
        let kbuild_pkg = kbuild
            .get(&version)
            .or_else(|| major_minor(&version).and_then(|mm| kbuild.get(&mm)));
        if let Some(pkg) = kbuild_pkg {
            packages.push(pkg.clone());
        }
        kernels.insert(ReleaseKey::grouped(drel, version).with_variant(vararch), packages);
    }
    kernels
}

/// Re-batch every crawled closure, keeping its distribution release.
pub(super) fn rebatch_crawled(files: KernelFiles, batch: fn(&str, &[PathBuf]) -> KernelFiles) -> KernelFiles {
    let mut kernels = KernelFiles::new();
    for (release, paths) in files {
        for (key, packages) in batch(release.distro_release(), &paths) {
            kernels.entry(key).or_default().extend(packages);
        }
    }
    for packages in kernels.values_mut() {
        packages.sort();
        packages.dedup();
    }
    kernels
}

pub(super) fn headers_dir(release: &ReleaseKey, target: &Path) -> PathBuf {
    target.join(format!("usr/src/linux-headers-{}", release.kernel_release_name()))
}

/// Unpack `.deb`s into `build/<distro>/<version>` and make the tree usable
/// from its mount point inside build workers.
pub(super) fn unpack_debs(workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf]) -> Result<PathBuf> {
    let target = workspace.build_dir(distro_dir, release.kernel_release());
    for deb in files {
        unpack::unpack_deb(deb, &target)?;
    }
    unpack::relativize_symlinks(&target)?;
    let kernel_dir = headers_dir(release, &target);
    if unpack::patch_makefile(&kernel_dir, &workspace.container_path(&target))? {
        tracing::debug!(release = %release, "patched kernel Makefile");
    }
    Ok(target)
}

pub(super) fn deb_config_hash(release: &ReleaseKey, target: &Path) -> Result<String> {
    unpack::md5_file(&target.join(format!("boot/config-{}", release.kernel_release_name())))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DebianBuilder;

impl DistroBuilder for DebianBuilder {
    fn family(&self) -> BuilderFamily {
        BuilderFamily::Debian
    }

    fn batch_crawled(&self, files: KernelFiles) -> KernelFiles {
        rebatch_crawled(files, batch_debian_packages)
    }

    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles {
        batch_debian_packages("", files)
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
