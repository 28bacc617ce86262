//! From a kernel type to unpacked kernel trees.
//!
//! Crawled types go through crawl → download → batch → unpack; custom
//! types batch the package files they were given and unpack those.

use anyhow::{bail, Result};
use std::path::PathBuf;

use super::distro::{local_files, unpack_kernels, KernelFiles, KernelTree, KernelType};
use super::Workspace;
use crate::crawler::{crawl_kernels, CrawlContext, CrawlerFilter};
use crate::download::{download_tasks, DownloadConfig, DownloadOutcome};

/// Where kernel packages come from.
pub enum KernelSource<'a> {
    Crawl {
        ctx: &'a CrawlContext,
        filter: &'a CrawlerFilter,
        download: &'a DownloadConfig,
    },
    Packages(&'a [PathBuf]),
}

/// Fetch (if needed), batch and unpack the kernels of `kernel_type`.
pub fn prepare_kernels(workspace: &Workspace, kernel_type: KernelType, source: KernelSource<'_>) -> Result<Vec<KernelTree>> {
    let builder = kernel_type.family().builder();
    let distro_dir = kernel_type.workspace_dir();

    let kernels: KernelFiles = match (kernel_type, source) {
        (KernelType::Crawled(kind), KernelSource::Crawl { ctx, filter, download }) => {
            let tree = crawl_kernels(ctx, kind, filter)?;
            let (mut files, tasks) = local_files(builder, &tree, &workspace.download_dir(&distro_dir));
            tracing::info!(distro = %kind, releases = files.len(), files = tasks.len(), "downloading kernel packages");

            let report = download_tasks(ctx.fetch(), tasks, download)?;
            tracing::info!(bytes = report.bytes_transferred(), "downloads finished");
            files.retain(|release, paths| {
                let missing: Vec<&PathBuf> = paths
                    .iter()
                    .filter(|p| matches!(report.outcome(p), Some(DownloadOutcome::Failed { .. }) | None))
                    .collect();
                if !missing.is_empty() {
                    tracing::warn!(release = %release, missing = ?missing, "incomplete download, dropping release");
                }
                missing.is_empty()
            });
            builder.batch_crawled(files)
        }
        (KernelType::Custom(family), KernelSource::Packages(packages)) => {
            if packages.is_empty() {
                bail!("{} needs kernel package files", kernel_type);
            }
            tracing::info!(family = %family, packages = packages.len(), "batching local packages");
            builder.batch_packages(packages)
        }
        (KernelType::Crawled(_), KernelSource::Packages(_)) => {
            bail!("{} is crawled, package files are only accepted for Custom* kernel types", kernel_type)
        }
        (KernelType::Custom(_), KernelSource::Crawl { .. }) => {
            bail!("{} builds from package files given on the command line", kernel_type)
        }
    };

    tracing::info!(kernel_type = %kernel_type, releases = kernels.len(), "unpacking kernels");
    let trees = unpack_kernels(builder, workspace, &distro_dir, &kernels);
    Ok(trees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderFamily;
    use crate::crawler::ReleaseKey;
    use crate::unpack::marker_path;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    #[test]
    fn test_custom_packages() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), Path::new("/src")).unwrap();
        let pkgs = ws.subdir("pkgs");
        fs::create_dir_all(&pkgs).unwrap();
        let rpm = pkgs.join("kernel-devel-4.18.0-80.el8.x86_64.rpm");
        fs::write(&rpm, b"rpm").unwrap();

        // already unpacked on a previous run
        let target = ws.build_dir("customcentos", "4.18.0-80.el8.x86_64");
        fs::create_dir_all(&target).unwrap();
        fs::write(marker_path(&target, &rpm), b"").unwrap();

        let trees = prepare_kernels(
            &ws,
            KernelType::Custom(BuilderFamily::Centos),
            KernelSource::Packages(&[rpm]),
        )
        .unwrap();
        assert_eq!(
            trees,
            vec![KernelTree {
                release: ReleaseKey::new("4.18.0-80.el8.x86_64"),
                target,
            }]
        );
    }

    #[test]
    fn test_custom_without_packages_is_an_error() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), Path::new("/src")).unwrap();
        let err = prepare_kernels(&ws, KernelType::Custom(BuilderFamily::Debian), KernelSource::Packages(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("CustomDebian"));
    }

    #[test]
    fn test_missing_package_drops_release() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path(), Path::new("/src")).unwrap();
        let missing = ws.subdir("kernel-devel-4.18.0-80.el8.x86_64.rpm");
        let trees = prepare_kernels(
            &ws,
            KernelType::Custom(BuilderFamily::Centos),
            KernelSource::Packages(&[missing]),
        )
        .unwrap();
        assert!(trees.is_empty());
    }
}
