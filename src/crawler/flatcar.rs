//! Flatcar Container Linux release channels.
//!
//! Flatcar does not publish kernel packages; each release ships a developer
//! container image carrying the kernel build tree. A release is therefore a
//! single file, and the distribution release and kernel release coincide.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;

use super::{CrawlContext, CrawlerFilter, Distro, Mirror, PackageTree, ReleaseKey, RepoGroups, Repository};
use crate::http;

pub const CHANNELS: &[&str] = &["stable", "beta", "alpha"];

pub const DEV_CONTAINER: &str = "flatcar_developer_container.bin.bz2";

/// One release directory of a channel.
pub struct FlatcarRepository {
    base_url: String,
}

impl FlatcarRepository {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn release(&self) -> &str {
        let trimmed = self.base_url.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

impl fmt::Display for FlatcarRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

impl Repository for FlatcarRepository {
    fn get_package_tree(&self, _ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree> {
        let release = self.release();
        let mut tree = PackageTree::new();
        if filter.matches_kernel(release) {
            tree.insert(
                ReleaseKey::grouped(release, release),
                format!("{}/{}", self.base_url.trim_end_matches('/'), DEV_CONTAINER),
            );
        }
        Ok(tree)
    }
}

/// A release channel (`https://<channel>.release.flatcar-linux.net/<arch>-usr/`).
pub struct FlatcarMirror {
    base_url: String,
}

impl FlatcarMirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn channel(channel: &str, arch: &str) -> Self {
        Self::new(format!("https://{}.release.flatcar-linux.net/{}-usr/", channel, arch))
    }

    /// Release versions named in the channel index.
    ///
    /// Links look like `./3033.2.0/`; `current` and versions containing `-`
    /// are skipped.
    pub fn releases(&self, index_html: &str, filter: &CrawlerFilter) -> Vec<String> {
        let prefix = format!("./{}", filter.distro_filter);
        http::index_links(index_html)
            .into_iter()
            .filter(|d| d.ends_with('/') && d.starts_with(&prefix) && !d.contains("current") && !d.contains('-'))
            .map(|d| d.trim_start_matches("./").trim_end_matches('/').to_string())
            .collect()
    }
}

impl fmt::Display for FlatcarMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

impl Mirror for FlatcarMirror {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups> {
        let index = http::get_text(ctx.fetch(), &self.base_url).with_context(|| format!("listing {}", self.base_url))?;
        let releases = self.releases(&index, filter);
        tracing::info!(mirror = %self.base_url, count = releases.len(), "flatcar releases found");

        let mut groups = RepoGroups::new();
        for release in releases {
            let repo = FlatcarRepository::new(format!("{}{}/", self.base_url, release));
            groups.entry(release).or_default().push(Arc::new(repo) as Arc<dyn Repository>);
        }
        Ok(groups)
    }
}

pub fn distro(filter: &CrawlerFilter) -> Distro {
    let mirrors = CHANNELS
        .iter()
        .map(|c| Box::new(FlatcarMirror::channel(c, &filter.arch)) as Box<dyn Mirror>)
        .collect();
    Distro::new("Flatcar", mirrors)
}
