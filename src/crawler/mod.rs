//! Kernel package discovery across distribution mirrors.
//!
//! A crawl is a three-level hierarchy:
//!
//! - **[`Repository`]** - one package index; resolves it into a [`PackageTree`]
//! - **[`Mirror`]** - lists the repositories it hosts, grouped by distribution
//!   release, and merges their trees
//! - **[`Distro`]** - holds several mirrors and is itself a [`Mirror`] whose
//!   repository list is the union of theirs
//!
//! Listing and fetching fan out over the crawl pool in [`CrawlContext`].
//! A mirror or repository that fails is logged and left out of the result;
//! the crawl as a whole only fails on configuration errors.
//!
//! ```rust,ignore
//! use probe_builder::crawler::{crawl_kernels, CrawlContext, CrawlerFilter, DistroKind};
//!
//! let ctx = CrawlContext::new(fetch, 8)?;
//! let tree = crawl_kernels(&ctx, DistroKind::Debian, &CrawlerFilter::host())?;
//! ```

pub mod deb;
pub mod distros;
pub mod filter;
pub mod flatcar;
pub mod rpm;
pub mod tree;

pub use distros::DistroKind;
pub use filter::CrawlerFilter;
pub use tree::{PackageTree, ReleaseKey};

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::http::Fetch;

/// Default number of concurrent crawl requests.
pub const DEFAULT_CRAWL_WORKERS: usize = 8;

/// Repositories grouped by distribution release (`""` when ungrouped).
pub type RepoGroups = BTreeMap<String, Vec<Arc<dyn Repository>>>;

/// Shared state of one crawl: the HTTP client and the bounded crawl pool.
#[derive(Clone)]
pub struct CrawlContext {
    fetch: Arc<dyn Fetch>,
    pool: Arc<ThreadPool>,
}

impl CrawlContext {
    pub fn new(fetch: Arc<dyn Fetch>, workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("crawl-{}", i))
            .build()
            .context("creating crawl thread pool")?;
        Ok(Self {
            fetch,
            pool: Arc::new(pool),
        })
    }

    pub fn fetch(&self) -> &dyn Fetch {
        self.fetch.as_ref()
    }

    /// Map `items` on the crawl pool, preserving order.
    pub fn par_map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.pool.install(|| items.into_par_iter().map(f).collect())
    }
}

/// A single package index.
pub trait Repository: Send + Sync + fmt::Display {
    fn get_package_tree(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree>;
}

/// A host publishing one or more repositories.
pub trait Mirror: Send + Sync + fmt::Display {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups>;

    /// Union of the trees of every listed repository.
    fn get_package_tree(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree> {
        let groups = self.list_repos(ctx, filter)?;
        Ok(merge_repo_trees(ctx, filter, groups))
    }
}

/// Crawl every repository of `groups` concurrently and union the results.
///
/// Failing repositories are logged and skipped.
pub fn merge_repo_trees(ctx: &CrawlContext, filter: &CrawlerFilter, groups: RepoGroups) -> PackageTree {
    let repos: Vec<Arc<dyn Repository>> = groups.into_values().flatten().collect();
    let trees = ctx.par_map(repos, |repo| {
        let result = repo.get_package_tree(ctx, filter);
        (repo, result)
    });

    let mut merged = PackageTree::new();
    for (repo, result) in trees {
        match result {
            Ok(tree) => {
                tracing::debug!(repo = %repo, releases = tree.len(), "repository crawled");
                merged.merge(tree);
            }
            Err(e) => tracing::warn!(repo = %repo, error = %format!("{:#}", e), "skipping repository"),
        }
    }
    merged
}

/// A distribution: a named set of mirrors.
pub struct Distro {
    name: String,
    mirrors: Vec<Box<dyn Mirror>>,
}

impl Distro {
    pub fn new(name: impl Into<String>, mirrors: Vec<Box<dyn Mirror>>) -> Self {
        Self {
            name: name.into(),
            mirrors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mirrors(&self) -> &[Box<dyn Mirror>] {
        &self.mirrors
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Mirror for Distro {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups> {
        let mirrors: Vec<&dyn Mirror> = self.mirrors.iter().map(|m| m.as_ref()).collect();
        let listings = ctx.par_map(mirrors, |mirror| (mirror.to_string(), mirror.list_repos(ctx, filter)));

        let mut groups = RepoGroups::new();
        for (mirror, listing) in listings {
            match listing {
                Ok(found) => {
                    for (release, repos) in found {
                        groups.entry(release).or_default().extend(repos);
                    }
                }
                Err(e) => tracing::warn!(
                    distro = %self.name,
                    mirror = %mirror,
                    error = %format!("{:#}", e),
                    "skipping mirror"
                ),
            }
        }
        Ok(groups)
    }
}

/// Crawl one distribution.
pub fn crawl_kernels(ctx: &CrawlContext, kind: DistroKind, filter: &CrawlerFilter) -> Result<PackageTree> {
    tracing::info!(distro = %kind, "crawling kernels");
    let distro = distros::distro(kind, filter)?;
    let tree = distro.get_package_tree(ctx, filter)?;
    tracing::info!(distro = %kind, releases = tree.len(), "crawl finished");
    Ok(tree)
}
