//! Per-family handling of downloaded kernel packages.
//!
//! A family knows how its package files map to kernel releases, how to
//! unpack them into a build tree and where the kernel headers and config
//! end up inside it:
//!
//! | Family     | Distributions                                   | Packages |
//! |------------|-------------------------------------------------|----------|
//! | `centos`   | CentOS, Rocky, Alma, Fedora, Amazon, Aliyun     | rpm      |
//! | `oracle`   | Oracle Linux (CentOS unpacking, own images)     | rpm      |
//! | `photonos` | Photon OS                                       | rpm      |
//! | `debian`   | Debian                                          | deb      |
//! | `ubuntu`   | Ubuntu                                          | deb      |
//! | `flatcar`  | Flatcar Container Linux                         | image    |

mod centos;
mod debian;
mod flatcar;
mod photon;
mod ubuntu;

pub use centos::CentosBuilder;
pub use debian::DebianBuilder;
pub use flatcar::FlatcarBuilder;
pub use photon::PhotonBuilder;
pub use ubuntu::UbuntuBuilder;

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::Workspace;
use crate::crawler::{DistroKind, PackageTree, ReleaseKey};
use crate::download::{url_basename, DownloadTask};

/// Local package files per kernel release.
pub type KernelFiles = BTreeMap<ReleaseKey, Vec<PathBuf>>;

/// An unpacked kernel release, ready to build against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTree {
    pub release: ReleaseKey,
    pub target: PathBuf,
}

pub trait DistroBuilder: Send + Sync {
    fn family(&self) -> BuilderFamily;

    /// Name of a crawled file once downloaded.
    fn local_file_name(&self, _release: &ReleaseKey, url: &str) -> String {
        url_basename(url).to_string()
    }

    /// Re-key crawled and downloaded files into buildable releases.
    fn batch_crawled(&self, files: KernelFiles) -> KernelFiles {
        files
    }

    /// Group loose package files (given on the command line) into releases.
    fn batch_packages(&self, files: &[PathBuf]) -> KernelFiles;

    /// Unpack the files of one release, returning the build tree root.
    fn unpack(&self, workspace: &Workspace, distro_dir: &str, release: &ReleaseKey, files: &[PathBuf])
        -> Result<PathBuf>;

    /// Kernel headers directory inside an unpacked tree.
    fn kernel_dir(&self, release: &ReleaseKey, target: &Path) -> Result<PathBuf>;

    /// MD5 of the kernel configuration.
    fn hash_config(&self, release: &ReleaseKey, target: &Path, kernel_dir: &Path) -> Result<String>;

    /// Kernel release as used in probe file names (`uname -r`).
    fn kernel_release(&self, release: &ReleaseKey, _kernel_dir: &Path) -> String {
        release.kernel_release_name()
    }

    /// Host tools needed to unpack this family's packages, as
    /// `(command, package)` pairs.
    fn required_tools(&self) -> &'static [(&'static str, &'static str)];
}

/// Unpack every release, dropping (and logging) the ones that fail.
pub fn unpack_kernels(
    builder: &dyn DistroBuilder,
    workspace: &Workspace,
    distro_dir: &str,
    kernels: &KernelFiles,
) -> Vec<KernelTree> {
    let mut trees = Vec::with_capacity(kernels.len());
    for (release, files) in kernels {
        match builder.unpack(workspace, distro_dir, release, files) {
            Ok(target) => trees.push(KernelTree {
                release: release.clone(),
                target,
            }),
            Err(e) => tracing::error!(
                release = %release,
                error = %format!("{:#}", e),
                "unpacking failed, skipping release"
            ),
        }
    }
    trees
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuilderFamily {
    Centos,
    Debian,
    Flatcar,
    Oracle,
    PhotonOs,
    Ubuntu,
}

impl BuilderFamily {
    /// Name used in builder Dockerfiles (`Dockerfile.<name>-gcc<X.Y>`).
    pub fn name(self) -> &'static str {
        match self {
            BuilderFamily::Centos => "centos",
            BuilderFamily::Debian => "debian",
            BuilderFamily::Flatcar => "flatcar",
            BuilderFamily::Oracle => "oracle",
            BuilderFamily::PhotonOs => "photonos",
            BuilderFamily::Ubuntu => "ubuntu",
        }
    }

    pub fn builder(self) -> &'static dyn DistroBuilder {
        match self {
            BuilderFamily::Centos | BuilderFamily::Oracle => &CentosBuilder,
            BuilderFamily::Debian => &DebianBuilder,
            BuilderFamily::Flatcar => &FlatcarBuilder,
            BuilderFamily::PhotonOs => &PhotonBuilder,
            BuilderFamily::Ubuntu => &UbuntuBuilder,
        }
    }

    pub fn for_distro(kind: DistroKind) -> Self {
        match kind {
            DistroKind::Debian => BuilderFamily::Debian,
            DistroKind::Ubuntu => BuilderFamily::Ubuntu,
            DistroKind::PhotonOS => BuilderFamily::PhotonOs,
            DistroKind::Flatcar => BuilderFamily::Flatcar,
            DistroKind::Oracle6 | DistroKind::Oracle7 | DistroKind::Oracle8 | DistroKind::Oracle9 => {
                BuilderFamily::Oracle
            }
            _ => BuilderFamily::Centos,
        }
    }
}

impl fmt::Display for BuilderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What `build -k` accepts: a crawlable distribution, or a family whose
/// package files are given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    Crawled(DistroKind),
    Custom(BuilderFamily),
}

const CUSTOM_TYPES: &[(&str, BuilderFamily)] = &[
    ("CustomCentOS", BuilderFamily::Centos),
    ("CustomDebian", BuilderFamily::Debian),
    ("CustomFlatcar", BuilderFamily::Flatcar),
    ("CustomUbuntu", BuilderFamily::Ubuntu),
];

impl KernelType {
    /// Every accepted name.
    pub fn names() -> Vec<&'static str> {
        let mut names: Vec<&str> = DistroKind::ALL.iter().map(|k| k.name()).collect();
        names.extend(CUSTOM_TYPES.iter().map(|(name, _)| *name));
        names
    }

    pub fn family(self) -> BuilderFamily {
        match self {
            KernelType::Crawled(kind) => BuilderFamily::for_distro(kind),
            KernelType::Custom(family) => family,
        }
    }

    /// Workspace directory for this type's packages and build trees.
    pub fn workspace_dir(self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelType::Crawled(kind) => write!(f, "{}", kind),
            KernelType::Custom(family) => {
                let name = CUSTOM_TYPES
                    .iter()
                    .find(|(_, fam)| fam == family)
                    .map(|(name, _)| *name)
                    .unwrap_or("Custom");
                f.write_str(name)
            }
        }
    }
}

impl FromStr for KernelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((_, family)) = CUSTOM_TYPES.iter().find(|(name, _)| name.eq_ignore_ascii_case(s)) {
            return Ok(KernelType::Custom(*family));
        }
        match s.parse::<DistroKind>() {
            Ok(kind) => Ok(KernelType::Crawled(kind)),
            Err(_) => bail!(
                "unsupported kernel type `{}` (expected one of: {})",
                s,
                KernelType::names().join(", ")
            ),
        }
    }
}

/// Local paths for a crawled tree, downloaded into `download_dir`.
pub fn local_files(
    builder: &dyn DistroBuilder,
    crawled: &PackageTree,
    download_dir: &Path,
) -> (KernelFiles, Vec<DownloadTask>) {
    let mut files = KernelFiles::new();
    let mut tasks = Vec::new();
    for (release, urls) in crawled.iter() {
        let paths = files.entry(release.clone()).or_default();
        for url in urls {
            let destination = download_dir.join(builder.local_file_name(release, url));
            paths.push(destination.clone());
            tasks.push(DownloadTask {
                urls: vec![url.clone()],
                destination,
            });
        }
    }
    (files, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kernel_type_names() {
        assert_eq!("Debian".parse::<KernelType>().unwrap(), KernelType::Crawled(DistroKind::Debian));
        assert_eq!(
            "CustomCentOS".parse::<KernelType>().unwrap(),
            KernelType::Custom(BuilderFamily::Centos)
        );
        assert_eq!(
            "customubuntu".parse::<KernelType>().unwrap(),
            KernelType::Custom(BuilderFamily::Ubuntu)
        );
        assert!("Gentoo".parse::<KernelType>().is_err());
        assert!(KernelType::names().contains(&"CustomFlatcar"));
        assert!(KernelType::names().contains(&"AmazonLinux2022"));
    }

    #[test]
    fn test_families() {
        let family = |s: &str| s.parse::<KernelType>().unwrap().family();
        assert_eq!(family("Oracle8"), BuilderFamily::Oracle);
        assert_eq!(BuilderFamily::for_distro(DistroKind::Oracle6).name(), "oracle");
        assert_eq!(BuilderFamily::Oracle.builder().family(), BuilderFamily::Centos);
        assert_eq!(family("AmazonLinux2"), BuilderFamily::Centos);
        assert_eq!(family("PhotonOS"), BuilderFamily::PhotonOs);
        assert_eq!(family("Ubuntu"), BuilderFamily::Ubuntu);
        assert_eq!(family("CustomFlatcar"), BuilderFamily::Flatcar);
        assert_eq!(BuilderFamily::PhotonOs.builder().family(), BuilderFamily::PhotonOs);
    }

    #[test]
    fn test_workspace_dir() {
        assert_eq!("AmazonLinux2".parse::<KernelType>().unwrap().workspace_dir(), "amazonlinux2");
        assert_eq!("CustomDebian".parse::<KernelType>().unwrap().workspace_dir(), "customdebian");
    }

    #[test]
    fn test_local_files() {
        let mut tree = PackageTree::new();
        let key = ReleaseKey::new("4.18.0-80.el8.x86_64");
        tree.insert(key.clone(), "http://m/8/kernel-devel-4.18.0-80.el8.x86_64.rpm");
        tree.insert(key.clone(), "http://m/8/kernel-core-4.18.0-80.el8.x86_64.rpm");

        let (files, tasks) = local_files(&CentosBuilder, &tree, Path::new("/ws/centos"));
        assert_eq!(
            files[&key],
            vec![
                PathBuf::from("/ws/centos/kernel-core-4.18.0-80.el8.x86_64.rpm"),
                PathBuf::from("/ws/centos/kernel-devel-4.18.0-80.el8.x86_64.rpm"),
            ]
        );
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].urls, vec!["http://m/8/kernel-core-4.18.0-80.el8.x86_64.rpm".to_string()]);
    }
}
