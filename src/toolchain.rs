//! Builder image selection.
//!
//! Builder images are described by Dockerfiles in the builder source
//! directory, named `Dockerfile.<builder-distro>-gcc<major.minor>[-bpf]`
//! (a `-bpf` suffix marks images able to build the eBPF probe) or
//! `Dockerfile.<distro-tag>*` for kernels that need their own distribution's
//! compiler (`fc34`, `amzn2`).
//!
//! Selection for an unpacked kernel tree:
//!
//! 1. a distribution tag in the `autoconf.h` banner picks `Dockerfile.<tag>*`
//! 2. otherwise the compiler the kernel was built with decides:
//!    `CONFIG_GCC_VERSION` in `autoconf.h`, then `LINUX_COMPILER` in
//!    `include/generated/compile.h` or `include/compile.h`, else `4.8.0`
//! 3. among the builder distro's images, the exact `major.minor`, else the
//!    closest newer one, else the newest available

use anyhow::{bail, Context, Result};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::version::Version;

static AUTOCONF_GCC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#define CONFIG_GCC_VERSION ([0-9][0-9]?)([0-9][0-9])([0-9][0-9])$")
        .expect("Failed to compile autoconf regex")
});

static LINUX_COMPILER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^#define LINUX_COMPILER "gcc version ([0-9.]+)"#).expect("Failed to compile compiler regex")
});

static FEDORA_KERNEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*\.(fc[0-9]+)\..*Kernel Configuration$").expect("Failed to compile Fedora banner regex")
});

static AMAZON2_KERNEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*\.amzn2\..*Kernel Configuration$").expect("Failed to compile Amazon banner regex")
});

/// Compiler assumed when a kernel tree does not say.
pub const DEFAULT_GCC_VERSION: &str = "4.8.0";

const DOCKERFILE_PREFIX: &str = "Dockerfile.";

/// A builder image definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildToolchain {
    pub dockerfile: PathBuf,
    /// Image tag, the Dockerfile name without `Dockerfile.`.
    pub tag: String,
    pub supports_ebpf: bool,
}

impl BuildToolchain {
    fn from_path(dockerfile: PathBuf) -> Option<Self> {
        let name = dockerfile.file_name()?.to_str()?;
        let tag = name.strip_prefix(DOCKERFILE_PREFIX)?.to_string();
        let supports_ebpf = tag.ends_with("-bpf");
        Some(Self {
            dockerfile,
            tag,
            supports_ebpf,
        })
    }

    /// Image reference for this toolchain.
    pub fn image_name(&self, image_prefix: &str) -> String {
        format!("{}sysdig-probe-builder:{}", image_prefix, self.tag)
    }
}

fn read_lines(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => None,
    }
}

fn autoconf_path(kernel_dir: &Path) -> PathBuf {
    kernel_dir.join("include/generated/autoconf.h")
}

/// Distribution tag (`fc34`, `amzn2`) from the `autoconf.h` banner.
///
/// ```text
///  * Linux/x86_64 5.15.5-100.fc34.x86_64 Kernel Configuration
/// ```
pub fn kernel_distro_tag(kernel_dir: &Path) -> Option<String> {
    let path = autoconf_path(kernel_dir);
    tracing::debug!(path = %path.display(), "checking for distro tag");
    let text = read_lines(&path)?;
    for line in text.lines() {
        if let Some(caps) = FEDORA_KERNEL.captures(line) {
            return Some(caps[1].to_string());
        }
        if AMAZON2_KERNEL.is_match(line) {
            return Some("amzn2".to_string());
        }
    }
    None
}

/// Compiler version the kernel in `kernel_dir` was built with.
pub fn kernel_gcc_version(kernel_dir: &Path) -> Version {
    // CONFIG_GCC_VERSION first: 5.8 changed the LINUX_COMPILER format
    let autoconf = autoconf_path(kernel_dir);
    tracing::debug!(path = %autoconf.display(), "checking for gcc version");
    if let Some(text) = read_lines(&autoconf) {
        for line in text.lines() {
            if let Some(caps) = AUTOCONF_GCC.captures(line) {
                let parts: Vec<u32> = (1..=3).filter_map(|i| caps[i].parse().ok()).collect();
                return Version::new(&parts);
            }
        }
    }

    // include/compile.h is where RHEL 6 keeps it
    for header in ["include/generated/compile.h", "include/compile.h"] {
        let path = kernel_dir.join(header);
        tracing::debug!(path = %path.display(), "checking for gcc version");
        let Some(text) = read_lines(&path) else {
            continue;
        };
        for line in text.lines() {
            if let Some(version) = LINUX_COMPILER
                .captures(line)
                .and_then(|caps| Version::parse_prefix(&caps[1]))
            {
                return version;
            }
        }
    }

    Version::parse_prefix(DEFAULT_GCC_VERSION).unwrap_or_else(|| Version::new(&[4, 8, 0]))
}

/// Index of the version to use from `available` (sorted ascending).
///
/// Only `major.minor` is compared: exact match, else the smallest newer
/// version, else the newest one.
pub fn select_version(available: &[Version], required: &Version) -> Option<usize> {
    let required = required.major_minor();
    available
        .iter()
        .position(|v| v.major_minor() >= required)
        .or_else(|| available.len().checked_sub(1))
}

/// `Dockerfile.<builder_distro>-gcc<X.Y>[-bpf]` images, oldest first.
pub fn gcc_toolchains(builder_source: &Path, builder_distro: &str) -> Result<Vec<(Version, BuildToolchain)>> {
    let pattern = format!(
        r"^{}(?P<gcc>[0-9]+\.[0-9]+)(-bpf)?$",
        regex::escape(&format!("{}{}-gcc", DOCKERFILE_PREFIX, builder_distro))
    );
    let re = Regex::new(&pattern).with_context(|| format!("building Dockerfile pattern for {}", builder_distro))?;

    let mut found = Vec::new();
    for entry in fs::read_dir(builder_source)
        .with_context(|| format!("listing builder source {}", builder_source.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = re
            .captures(&name)
            .and_then(|caps| Version::parse_prefix(&caps["gcc"]))
        else {
            continue;
        };
        if let Some(toolchain) = BuildToolchain::from_path(entry.path()) {
            found.push((version, toolchain));
        }
    }
    // a plain image sorts before its -bpf twin
    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.tag.cmp(&b.1.tag)));
    Ok(found)
}

fn distro_toolchain(builder_source: &Path, distro_tag: &str) -> Result<Option<BuildToolchain>> {
    let prefix = format!("{}{}", DOCKERFILE_PREFIX, distro_tag);
    let mut matches: Vec<PathBuf> = fs::read_dir(builder_source)
        .with_context(|| format!("listing builder source {}", builder_source.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .map(|e| e.path())
        .collect();
    matches.sort();
    Ok(matches.into_iter().next().and_then(|path| {
        let mut toolchain = BuildToolchain::from_path(path)?;
        toolchain.tag = distro_tag.to_string();
        Some(toolchain)
    }))
}

/// Pick the builder image for the kernel unpacked in `kernel_dir`.
pub fn choose_toolchain(builder_source: &Path, builder_distro: &str, kernel_dir: &Path) -> Result<BuildToolchain> {
    if let Some(tag) = kernel_distro_tag(kernel_dir) {
        if let Some(toolchain) = distro_toolchain(builder_source, &tag)? {
            tracing::debug!(tag = %tag, dockerfile = %toolchain.dockerfile.display(), "distribution builder");
            return Ok(toolchain);
        }
    }

    let gcc = kernel_gcc_version(kernel_dir);
    let available = gcc_toolchains(builder_source, builder_distro)?;
    tracing::debug!(
        kernel_gcc = %gcc,
        available = ?available.iter().map(|(_, t)| t.tag.as_str()).collect::<Vec<_>>(),
        "choosing gcc builder"
    );

    let versions: Vec<Version> = available.iter().map(|(v, _)| v.clone()).collect();
    let Some(idx) = select_version(&versions, &gcc) else {
        bail!(
            "no Dockerfile.{}-gcc* builder in {}",
            builder_distro,
            builder_source.display()
        );
    };

    // prefer the eBPF-capable image of the chosen compiler when there are both
    let chosen = &versions[idx];
    let toolchain = available
        .iter()
        .filter(|(v, _)| v == chosen)
        .map(|(_, t)| t)
        .max_by_key(|t| t.supports_ebpf)
        .cloned()
        .unwrap_or_else(|| available[idx].1.clone());
    tracing::debug!(dockerfile = %toolchain.dockerfile.display(), "chosen builder");
    Ok(toolchain)
}

/// Tracks which builder images have been prepared in this run.
///
/// Concurrent callers asking for the same `(dockerfile, tag)` wait for the
/// first one; a failed preparation is retried by the next caller.
#[derive(Debug, Default)]
pub struct ToolchainCache {
    prepared: Mutex<HashMap<(PathBuf, String), Arc<OnceCell<()>>>>,
}

impl ToolchainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `prepare` unless it already succeeded for `toolchain`.
    pub fn ensure<F>(&self, toolchain: &BuildToolchain, prepare: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let cell = {
            let mut prepared = self.prepared.lock();
            prepared
                .entry((toolchain.dockerfile.clone(), toolchain.tag.clone()))
                .or_default()
                .clone()
        };
        cell.get_or_try_init(prepare)?;
        Ok(())
    }

    pub fn is_prepared(&self, toolchain: &BuildToolchain) -> bool {
        self.prepared
            .lock()
            .get(&(toolchain.dockerfile.clone(), toolchain.tag.clone()))
            .is_some_and(|cell| cell.get().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn builder_source(names: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for name in names {
            fs::write(temp.path().join(name), "FROM scratch\n").unwrap();
        }
        temp
    }

    fn kernel_tree(files: &[(&str, &str)]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for (path, content) in files {
            let path = temp.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        temp
    }

    #[test]
    fn test_select_version_tie_break() {
        let available = vec![v("4.4"), v("9.2"), v("10.0")];
        assert_eq!(select_version(&available, &v("9.2")), Some(1));
        assert_eq!(select_version(&available, &v("9.2.1")), Some(1));
        assert_eq!(select_version(&available, &v("8.0")), Some(1));
        assert_eq!(select_version(&available, &v("11.0")), Some(2));
        assert_eq!(select_version(&available, &v("4.1")), Some(0));
        assert_eq!(select_version(&[], &v("4.1")), None);
    }

    #[test]
    fn test_gcc_version_sources() {
        let tree = kernel_tree(&[("include/generated/autoconf.h", "#define CONFIG_GCC_VERSION 90201\n")]);
        assert_eq!(kernel_gcc_version(tree.path()), v("9.2.1"));

        let tree = kernel_tree(&[("include/generated/autoconf.h", "#define CONFIG_GCC_VERSION 110200\n")]);
        assert_eq!(kernel_gcc_version(tree.path()), v("11.2.0"));

        let tree = kernel_tree(&[(
            "include/generated/compile.h",
            "#define UTS_VERSION \"#1 SMP\"\n#define LINUX_COMPILER \"gcc version 8.3.0 (Debian 8.3.0-6)\"\n",
        )]);
        assert_eq!(kernel_gcc_version(tree.path()), v("8.3.0"));

        let tree = kernel_tree(&[(
            "include/compile.h",
            "#define LINUX_COMPILER \"gcc version 4.4.7 20120313 (Red Hat 4.4.7-23) (GCC) \"\n",
        )]);
        assert_eq!(kernel_gcc_version(tree.path()), v("4.4.7"));

        let tree = kernel_tree(&[]);
        assert_eq!(kernel_gcc_version(tree.path()), v(DEFAULT_GCC_VERSION));
    }

    #[test]
    fn test_distro_tag() {
        let banner = "/*\n *\n * Automatically generated file; DO NOT EDIT.\n * Linux/x86_64 5.15.5-100.fc34.x86_64 Kernel Configuration\n *\n */\n";
        let tree = kernel_tree(&[("include/generated/autoconf.h", banner)]);
        assert_eq!(kernel_distro_tag(tree.path()).as_deref(), Some("fc34"));

        let banner = " * Linux/x86_64 4.14.256-197.484.amzn2.x86_64 Kernel Configuration\n";
        let tree = kernel_tree(&[("include/generated/autoconf.h", banner)]);
        assert_eq!(kernel_distro_tag(tree.path()).as_deref(), Some("amzn2"));

        let tree = kernel_tree(&[("include/generated/autoconf.h", "#define CONFIG_X86 1\n")]);
        assert_eq!(kernel_distro_tag(tree.path()), None);
    }

    #[test]
    fn test_choose_gcc_toolchain() {
        let source = builder_source(&[
            "Dockerfile.centos-gcc4.4",
            "Dockerfile.centos-gcc9.2",
            "Dockerfile.centos-gcc9.2-bpf",
            "Dockerfile.centos-gcc10.0-bpf",
            "Dockerfile.debian-gcc8.0",
            "README.md",
        ]);

        let tree = kernel_tree(&[("include/generated/autoconf.h", "#define CONFIG_GCC_VERSION 80300\n")]);
        let chosen = choose_toolchain(source.path(), "centos", tree.path()).unwrap();
        assert_eq!(chosen.tag, "centos-gcc9.2-bpf");
        assert!(chosen.supports_ebpf);
        assert_eq!(chosen.dockerfile, source.path().join("Dockerfile.centos-gcc9.2-bpf"));

        let tree = kernel_tree(&[("include/generated/autoconf.h", "#define CONFIG_GCC_VERSION 120100\n")]);
        let chosen = choose_toolchain(source.path(), "centos", tree.path()).unwrap();
        assert_eq!(chosen.tag, "centos-gcc10.0-bpf");

        let tree = kernel_tree(&[]);
        let chosen = choose_toolchain(source.path(), "debian", tree.path()).unwrap();
        assert_eq!(chosen.tag, "debian-gcc8.0");
        assert!(!chosen.supports_ebpf);

        assert!(choose_toolchain(source.path(), "ubuntu", tree.path()).is_err());
    }

    #[test]
    fn test_distro_toolchain_wins() {
        let source = builder_source(&["Dockerfile.centos-gcc9.2", "Dockerfile.fc34-bpf"]);
        let banner = " * Linux/x86_64 5.15.5-100.fc34.x86_64 Kernel Configuration\n";
        let tree = kernel_tree(&[("include/generated/autoconf.h", banner)]);
        let chosen = choose_toolchain(source.path(), "centos", tree.path()).unwrap();
        assert_eq!(chosen.tag, "fc34");
        assert!(chosen.supports_ebpf);
        assert_eq!(chosen.image_name(""), "sysdig-probe-builder:fc34");
        assert_eq!(chosen.image_name("registry/"), "registry/sysdig-probe-builder:fc34");

        // no Dockerfile for the tag: fall back to gcc selection
        let banner = " * Linux/x86_64 5.17.5-300.fc36.x86_64 Kernel Configuration\n";
        let tree = kernel_tree(&[("include/generated/autoconf.h", banner)]);
        let chosen = choose_toolchain(source.path(), "centos", tree.path()).unwrap();
        assert_eq!(chosen.tag, "centos-gcc9.2");
    }

    #[test]
    fn test_cache_prepares_once() {
        let cache = Arc::new(ToolchainCache::new());
        let toolchain = BuildToolchain {
            dockerfile: PathBuf::from("/src/Dockerfile.centos-gcc9.2"),
            tag: "centos-gcc9.2".to_string(),
            supports_ebpf: false,
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let toolchain = toolchain.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    cache
                        .ensure(&toolchain, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_prepared(&toolchain));
    }

    #[test]
    fn test_cache_retries_after_failure() {
        let cache = ToolchainCache::new();
        let toolchain = BuildToolchain {
            dockerfile: PathBuf::from("/src/Dockerfile.x"),
            tag: "x".to_string(),
            supports_ebpf: false,
        };
        assert!(cache.ensure(&toolchain, || bail!("pull failed")).is_err());
        assert!(!cache.is_prepared(&toolchain));
        cache.ensure(&toolchain, || Ok(())).unwrap();
        assert!(cache.is_prepared(&toolchain));
    }
}
