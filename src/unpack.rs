//! Extracting downloaded kernel packages into per-release build trees.
//!
//! Every extraction drops a `.<package basename>` marker into the target
//! directory and is skipped when the marker is already there, so re-running
//! a build only unpacks packages that are new.
//!
//! The extracted trees still point at their install location (`/usr/src`,
//! absolute symlinks under `/lib/modules`). [`patch_makefile`] and
//! [`relativize_symlinks`] make them usable from wherever they are mounted.

use anyhow::{bail, Context, Result};
use md5::{Digest, Md5};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::process::{shell, shell_quote, Cmd};

/// First line written into a patched `Makefile`.
pub const PATCH_MARKER: &str = "# patched by probe-builder";

/// Byte offset of the root partition in a Flatcar developer container image.
const FLATCAR_ROOT_OFFSET: u64 = 2048 * 512;

/// Marker file recording that `package` was unpacked into `target`.
pub fn marker_path(target: &Path, package: &Path) -> PathBuf {
    let name = package
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.join(format!(".{}", name))
}

fn check_package(package: &Path) -> Result<()> {
    if !package.exists() {
        bail!("{} is missing", package.display());
    }
    if !package.is_file() {
        bail!("{} is not a file", package.display());
    }
    Ok(())
}

/// Run `extract` once per package and target.
fn unpack_once(package: &Path, target: &Path, extract: impl FnOnce() -> Result<()>) -> Result<bool> {
    let marker = marker_path(target, package);
    if marker.exists() {
        tracing::debug!(package = %package.display(), "already unpacked");
        return Ok(false);
    }
    check_package(package)?;
    fs::create_dir_all(target).with_context(|| format!("creating {}", target.display()))?;

    tracing::debug!(package = %package.display(), target = %target.display(), "unpacking");
    extract()?;
    fs::write(&marker, b"").with_context(|| format!("writing marker {}", marker.display()))?;
    Ok(true)
}

/// Extract a `.deb` with `dpkg-deb -x`. Returns whether anything was done.
pub fn unpack_deb(deb: &Path, target: &Path) -> Result<bool> {
    unpack_once(deb, target, || {
        Cmd::new("dpkg-deb")
            .arg("-x")
            .arg(deb)
            .arg(target)
            .error_msg(format!("Failed to unpack {}", deb.display()))
            .run()?;
        Ok(())
    })
}

/// Extract an `.rpm` through `rpm2cpio | cpio`.
pub fn unpack_rpm(rpm: &Path, target: &Path) -> Result<bool> {
    unpack_once(rpm, target, || {
        let rpm = rpm
            .canonicalize()
            .with_context(|| format!("resolving {}", rpm.display()))?;
        shell(&format!(
            "cd {} && rpm2cpio {} | cpio --quiet --extract --make-directories --no-absolute-filenames",
            shell_quote(target),
            shell_quote(&rpm)
        ))?;
        Ok(())
    })
}

/// Copy kernel modules and config out of a Flatcar developer container.
///
/// The image is decompressed next to the download, loop-mounted read-only,
/// and `usr/lib64/modules` plus `usr/boot/config` are copied into
/// `target/modules` and `target/config`. Needs root.
pub fn unpack_flatcar(image: &Path, target: &Path) -> Result<bool> {
    unpack_once(image, target, || {
        let raw = image.with_extension("");
        if !raw.exists() {
            Cmd::new("bzip2")
                .args(["-d", "-k", "-f"])
                .arg(image)
                .error_msg(format!("Failed to decompress {}", image.display()))
                .run()?;
        }

        let mountpoint = target.join(".mnt");
        fs::create_dir_all(&mountpoint).with_context(|| format!("creating {}", mountpoint.display()))?;
        Cmd::new("mount")
            .arg("-o")
            .arg(format!("ro,loop,offset={}", FLATCAR_ROOT_OFFSET))
            .arg(&raw)
            .arg(&mountpoint)
            .error_msg(format!("Failed to mount {}", raw.display()))
            .run()?;

        let copied = shell(&format!(
            "cp -a {}/usr/lib64/modules {}/modules && cp {}/usr/boot/config {}/config",
            shell_quote(&mountpoint),
            shell_quote(target),
            shell_quote(&mountpoint),
            shell_quote(target)
        ));
        let unmounted = Cmd::new("umount")
            .arg(&mountpoint)
            .error_msg(format!("Failed to unmount {}", mountpoint.display()))
            .run();
        copied?;
        unmounted?;
        fs::remove_dir(&mountpoint).ok();
        Ok(())
    })
}

/// Point the kernel `Makefile` at the relocated `usr/src`.
///
/// Debian-family header packages reference `/usr/src/...` absolutely; those
/// references are rewritten to `<container_target>/usr/src`. The file is
/// only touched when something changes, and the check runs every time since
/// a newer package for the same kernel may ship a fresh `Makefile`.
pub fn patch_makefile(kernel_dir: &Path, container_target: &str) -> Result<bool> {
    let makefile = kernel_dir.join("Makefile");
    let orig = fs::read_to_string(&makefile).with_context(|| format!("reading {}", makefile.display()))?;

    let new_path = format!("{}/usr/src", container_target.trim_end_matches('/'));
    let patched = orig
        .replace("include /usr/src", &format!("include {}", new_path))
        .replace("-C /usr/src", &format!("-C {}", new_path))
        .replace("O=/usr/src", &format!("O={}", new_path));

    if patched == orig {
        return Ok(false);
    }
    fs::write(&makefile, format!("{}\n{}", PATCH_MARKER, patched))
        .with_context(|| format!("writing {}", makefile.display()))?;
    Ok(true)
}

/// Relative form of the absolute link target `dest`, for a link at
/// `link` inside `root`.
fn relative_target(root: &Path, link: &Path, dest: &Path) -> Option<PathBuf> {
    let depth = link
        .parent()?
        .strip_prefix(root)
        .ok()?
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    let mut relative = PathBuf::new();
    for _ in 0..depth {
        relative.push("..");
    }
    relative.push(dest.strip_prefix("/").ok()?);
    Some(relative)
}

/// Rewrite absolute symlinks under `root` so they resolve inside it.
///
/// `lib/modules/<release>/build -> /usr/src/linux-headers-<release>` becomes
/// `../../../usr/src/linux-headers-<release>`. Relative links are left alone.
pub fn relativize_symlinks(root: &Path) -> Result<usize> {
    let mut rewritten = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.path_is_symlink() {
            continue;
        }
        let link = entry.path();
        let dest = fs::read_link(link).with_context(|| format!("reading link {}", link.display()))?;
        if !dest.is_absolute() {
            continue;
        }
        let Some(relative) = relative_target(root, link, &dest) else {
            continue;
        };
        fs::remove_file(link).with_context(|| format!("removing link {}", link.display()))?;
        std::os::unix::fs::symlink(&relative, link)
            .with_context(|| format!("linking {} -> {}", link.display(), relative.display()))?;
        tracing::debug!(link = %link.display(), target = %relative.display(), "relinked");
        rewritten += 1;
    }
    Ok(rewritten)
}

/// Hex MD5 of a file, the config hash used in probe file names.
pub fn md5_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(format!("{:x}", Md5::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_marker_skips_extraction() {
        let temp = TempDir::new().unwrap();
        let package = temp.path().join("linux-headers_1.0_amd64.deb");
        fs::write(&package, b"deb").unwrap();
        let target = temp.path().join("build");

        let mut runs = 0;
        assert!(unpack_once(&package, &target, || {
            runs += 1;
            Ok(())
        })
        .unwrap());
        assert!(target.join(".linux-headers_1.0_amd64.deb").exists());
        assert!(!unpack_once(&package, &target, || {
            runs += 1;
            Ok(())
        })
        .unwrap());
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_failed_extraction_leaves_no_marker() {
        let temp = TempDir::new().unwrap();
        let package = temp.path().join("broken.deb");
        fs::write(&package, b"deb").unwrap();
        let target = temp.path().join("build");

        assert!(unpack_once(&package, &target, || bail!("corrupt archive")).is_err());
        assert!(!marker_path(&target, &package).exists());
    }

    #[test]
    fn test_missing_package() {
        let temp = TempDir::new().unwrap();
        let err = unpack_deb(&temp.path().join("gone.deb"), temp.path()).unwrap_err();
        assert!(err.to_string().contains("is missing"));
        let err = unpack_rpm(temp.path(), &temp.path().join("t")).unwrap_err();
        assert!(err.to_string().contains("is not a file"));
    }

    #[test]
    fn test_patch_makefile() {
        let temp = TempDir::new().unwrap();
        let kernel_dir = temp.path().join("usr/src/linux-headers-5.10.0-8-amd64");
        fs::create_dir_all(&kernel_dir).unwrap();
        let makefile = kernel_dir.join("Makefile");
        fs::write(
            &makefile,
            "MAKEFLAGS += -rR\ninclude /usr/src/linux-headers-5.10.0-8-common/Makefile\n\
             all:\n\t$(MAKE) -C /usr/src/linux-headers-5.10.0-8-common O=/usr/src/linux-headers-5.10.0-8-amd64\n",
        )
        .unwrap();

        assert!(patch_makefile(&kernel_dir, "/build/probe/build/debian/5.10.0-8/").unwrap());
        let patched = fs::read_to_string(&makefile).unwrap();
        assert!(patched.starts_with(PATCH_MARKER));
        assert!(patched.contains("include /build/probe/build/debian/5.10.0-8/usr/src/linux-headers-5.10.0-8-common/Makefile"));
        assert!(patched.contains("-C /build/probe/build/debian/5.10.0-8/usr/src/linux-headers-5.10.0-8-common"));
        assert!(patched.contains("O=/build/probe/build/debian/5.10.0-8/usr/src/linux-headers-5.10.0-8-amd64"));

        // nothing left to rewrite
        assert!(!patch_makefile(&kernel_dir, "/build/probe/build/debian/5.10.0-8").unwrap());
        assert_eq!(fs::read_to_string(&makefile).unwrap(), patched);
    }

    #[test]
    fn test_relativize_symlinks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let modules = root.join("lib/modules/5.10.0-8-amd64");
        fs::create_dir_all(&modules).unwrap();
        fs::create_dir_all(root.join("usr/src/linux-headers-5.10.0-8-amd64")).unwrap();
        std::os::unix::fs::symlink("/usr/src/linux-headers-5.10.0-8-amd64", modules.join("build")).unwrap();
        std::os::unix::fs::symlink("../../../usr/src/other", modules.join("source")).unwrap();

        assert_eq!(relativize_symlinks(root).unwrap(), 1);
        assert_eq!(
            fs::read_link(modules.join("build")).unwrap(),
            PathBuf::from("../../../usr/src/linux-headers-5.10.0-8-amd64")
        );
        assert_eq!(fs::read_link(modules.join("source")).unwrap(), PathBuf::from("../../../usr/src/other"));
        assert!(modules.join("build").is_dir());

        assert_eq!(relativize_symlinks(root).unwrap(), 0);
    }

    #[test]
    fn test_md5_file() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config-5.10.0-8-amd64");
        fs::write(&config, "CONFIG_X86=y\n").unwrap();
        let hash = md5_file(&config).unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, format!("{:x}", Md5::digest(b"CONFIG_X86=y\n")));

        fs::write(&config, "").unwrap();
        assert_eq!(md5_file(&config).unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
