//! Debian-family (apt) repositories.
//!
//! A kernel release on Debian or Ubuntu is not one package but a closure:
//! `linux-headers-<rel>` plus `linux-modules-<rel>` or `linux-image-<rel>`,
//! and every kernel package those depend on (common headers, `linux-kbuild`).
//! Those dependencies are often published in a sibling repository of the same
//! distribution release (`bookworm` vs `bookworm-updates` vs the security
//! mirror), so [`DebDistro`] merges all repositories of a release before
//! resolving.
//!
//! Resolution steps:
//! - parse `Packages` (`.xz`, falling back to `.gz`) into a [`PackageDb`]
//! - pick candidates with [`kernel_candidates`]
//! - close each candidate over its kernel dependencies
//!   ([`transitive_dependencies`]); an unresolvable one drops the candidate
//! - key closures by package version, re-keyed by [`release_key`]
//! - drop releases whose closure has no `linux-headers` file

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::rpm::is_subdir_link;
use super::{CrawlContext, CrawlerFilter, Mirror, PackageTree, ReleaseKey, RepoGroups, Repository};
use crate::http;

static KERNEL_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^linux-.*?-[0-9]\.[0-9]+\.[0-9]+").expect("Failed to compile kernel package regex")
});

static KERNEL_RELEASE_UPDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+\.[0-9]+\.[0-9]+-[0-9]+)\.(.+)").expect("Failed to compile release update regex")
});

/// One stanza of a `Packages` index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebPackage {
    pub name: String,
    pub version: String,
    pub filename: String,
    pub url: String,
    /// Raw dependency entries, version constraints and alternatives included.
    pub depends: BTreeSet<String>,
    pub provides: Vec<String>,
}

/// Packages of one or more repositories, by name.
pub type PackageDb = BTreeMap<String, DebPackage>;

/// A kernel dependency that is not present in the package list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{dependency} (needed by {package}) not in package list")]
pub struct IncompleteClosure {
    pub package: String,
    pub dependency: String,
}

/// Parse a `Packages` index. `repo_base` is prepended to each `Filename`.
///
/// Continuation lines are ignored; stanzas without `Package`, `Version` or
/// `Filename` are skipped. A later stanza for the same name wins.
pub fn parse_packages(text: &str, repo_base: &str) -> PackageDb {
    let mut db = PackageDb::new();
    let mut fields: BTreeMap<String, String> = BTreeMap::new();

    for line in text.lines().map(str::trim_end).chain(std::iter::once("")) {
        if line.is_empty() {
            if !fields.is_empty() {
                if let Some(pkg) = stanza_package(&fields, repo_base) {
                    db.insert(pkg.name.clone(), pkg);
                }
                fields.clear();
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        match line.split_once(": ") {
            Some((key, value)) => {
                fields.insert(key.to_string(), value.to_string());
            }
            None => {
                if let Some(key) = line.strip_suffix(':') {
                    fields.insert(key.to_string(), String::new());
                } else {
                    tracing::debug!(line = %line, "ignoring malformed Packages line");
                }
            }
        }
    }
    db
}

fn stanza_package(fields: &BTreeMap<String, String>, repo_base: &str) -> Option<DebPackage> {
    let name = fields.get("Package")?;
    let version = fields.get("Version")?;
    let filename = fields.get("Filename")?;
    let split = |key: &str| -> Vec<String> {
        fields
            .get(key)
            .map(|v| v.split(", ").map(str::to_string).collect())
            .unwrap_or_default()
    };
    Some(DebPackage {
        name: name.clone(),
        version: version.clone(),
        filename: filename.clone(),
        url: format!("{}{}", repo_base, filename),
        depends: split("Depends").into_iter().collect(),
        provides: split("Provides"),
    })
}

/// Whether a package name or raw dependency entry names a kernel package.
pub fn is_kernel_package(dep: &str) -> bool {
    (KERNEL_PACKAGE.is_match(dep)
        && !dep.ends_with("-dbg")
        && !dep.contains("modules-extra")
        && !dep.contains("linux-source")
        && !dep.contains("tools"))
        || dep.contains("linux-kbuild")
}

/// `pkg` plus every kernel package it transitively depends on.
///
/// Only kernel dependencies are followed. Of an alternative `a | b` the
/// first branch is taken. Fails when a followed dependency is missing.
pub fn transitive_dependencies(db: &PackageDb, pkg: &str) -> Result<BTreeSet<String>, IncompleteClosure> {
    let mut closure = BTreeSet::from([pkg.to_string()]);
    let mut pending = vec![pkg.to_string()];

    while let Some(name) = pending.pop() {
        let Some(package) = db.get(&name) else {
            continue;
        };
        for raw in package.depends.iter().filter(|d| is_kernel_package(d)) {
            let Some(dep) = raw.split_whitespace().next() else {
                continue;
            };
            if !db.contains_key(dep) {
                return Err(IncompleteClosure {
                    package: name.clone(),
                    dependency: dep.to_string(),
                });
            }
            if closure.insert(dep.to_string()) {
                pending.push(dep.to_string());
            }
        }
    }
    Ok(closure)
}

/// Download URLs of the kernel packages in `pkg`'s closure.
pub fn package_urls(db: &PackageDb, pkg: &str) -> Result<BTreeSet<String>, IncompleteClosure> {
    if !is_kernel_package(pkg) {
        return Ok(BTreeSet::new());
    }
    Ok(transitive_dependencies(db, pkg)?
        .into_iter()
        .filter(|name| is_kernel_package(name))
        .filter_map(|name| db.get(&name).map(|p| p.url.clone()))
        .collect())
}

/// Kernel package names of `db` worth resolving, narrowed by `kernel_filter`.
///
/// Each `linux-headers-<rel>` is paired with `linux-modules-<rel>` when that
/// exists, else with `linux-image-<rel>`; unpaired headers are ignored.
pub fn kernel_candidates(db: &PackageDb, kernel_filter: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    for name in db.keys() {
        let Some(release) = name.strip_prefix("linux-headers-") else {
            continue;
        };
        let modules = format!("linux-modules-{}", release);
        let image = format!("linux-image-{}", release);
        if db.contains_key(&modules) {
            candidates.push(name.clone());
            candidates.push(modules);
        } else if db.contains_key(&image) {
            candidates.push(name.clone());
            candidates.push(image);
        }
    }

    if kernel_filter.is_empty() {
        return candidates;
    }

    let candidates: BTreeSet<String> = candidates.into_iter().collect();
    let modules = format!("linux-modules-{}", kernel_filter);
    let headers = format!("linux-headers-{}", kernel_filter);
    let image = format!("linux-image-{}", kernel_filter);

    if db.contains_key(kernel_filter) {
        vec![kernel_filter.to_string()]
    } else if candidates.contains(&modules) && candidates.contains(&headers) {
        vec![modules, headers]
    } else if candidates.contains(&image) && candidates.contains(&headers) {
        vec![image, headers]
    } else {
        candidates
            .into_iter()
            .filter(|c| c.contains(kernel_filter))
            .collect()
    }
}

/// Release key for a package version: `X.Y.Z-N.<upload>` becomes
/// `X.Y.Z-N/<upload>`, anything else is kept as is.
pub fn release_key(version: &str) -> String {
    match KERNEL_RELEASE_UPDATE.captures(version) {
        Some(caps) => format!("{}/{}", &caps[1], &caps[2]),
        None => version.to_string(),
    }
}

/// Resolve `candidates` against `db` into release → package URLs.
///
/// Candidates with an incomplete closure are logged and dropped, as are
/// releases that end up without any `linux-headers` file.
pub fn build_package_tree(db: &PackageDb, candidates: &[String]) -> BTreeMap<String, BTreeSet<String>> {
    let mut releases: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for pkg in candidates {
        let Some(package) = db.get(pkg) else {
            continue;
        };
        let key = release_key(&package.version);
        match package_urls(db, pkg) {
            Ok(urls) => releases.entry(key).or_default().extend(urls),
            Err(e) => tracing::debug!(package = %pkg, release = %key, reason = %e, "dropping candidate"),
        }
    }

    releases.retain(|release, urls| {
        let keep = urls.iter().any(|u| u.contains("linux-headers"));
        if !keep {
            tracing::debug!(release = %release, "no linux-headers in closure, pruning");
        }
        keep
    });
    releases
}

/// One `dists/<dist>/<component>/binary-<arch>/` index.
#[derive(Debug, Clone)]
pub struct DebRepository {
    repo_base: String,
    repo_name: String,
}

impl DebRepository {
    pub fn new(repo_base: impl Into<String>, repo_name: impl Into<String>) -> Self {
        Self {
            repo_base: repo_base.into(),
            repo_name: repo_name.into(),
        }
    }

    /// Package index of this repository; empty when none can be fetched.
    pub fn raw_package_db(&self, ctx: &CrawlContext) -> PackageDb {
        let prefix = format!("{}{}", self.repo_base, self.repo_name);
        let urls = [format!("{}Packages.xz", prefix), format!("{}Packages.gz", prefix)];
        match http::get_first_of(ctx.fetch(), &urls) {
            Ok(body) => parse_packages(&String::from_utf8_lossy(&body), &self.repo_base),
            Err(e) => {
                tracing::warn!(repo = %self, error = %e, "no package index");
                PackageDb::new()
            }
        }
    }
}

impl fmt::Display for DebRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.repo_base, self.repo_name)
    }
}

impl Repository for DebRepository {
    fn get_package_tree(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree> {
        let db = self.raw_package_db(ctx);
        let candidates = kernel_candidates(&db, &filter.kernel_filter);
        let mut tree = PackageTree::new();
        for (release, urls) in build_package_tree(&db, &candidates) {
            tree.extend(ReleaseKey::new(release), urls);
        }
        Ok(tree)
    }
}

/// Predicate on `dists/` entries.
pub type DistFilter = fn(&str) -> bool;

/// An apt mirror root (the directory containing `dists/`).
pub struct DebMirror {
    base_url: String,
    dist_filter: DistFilter,
}

impl DebMirror {
    pub fn new(base_url: &str) -> Self {
        Self::with_filter(base_url, |_| true)
    }

    pub fn with_filter(base_url: &str, dist_filter: DistFilter) -> Self {
        Self {
            base_url: base_url.to_string(),
            dist_filter,
        }
    }

    /// Repositories announced by `<dist>Release` for `arch`.
    ///
    /// Only the `main`, `updates` and `updates/main` components are used.
    pub fn scan_repo(&self, ctx: &CrawlContext, dist: &str, arch: &str) -> Result<BTreeMap<String, DebRepository>> {
        let release_url = format!("{}{}Release", self.base_url, dist);
        let release = http::get_text(ctx.fetch(), &release_url)?;
        Ok(components(&release, dist)
            .into_iter()
            .map(|comp| {
                let name = format!("{}{}/binary-{}/", dist, comp, arch);
                (name.clone(), DebRepository::new(&self.base_url, name))
            })
            .collect())
    }

    /// Entries of the `dists/` index accepted by this mirror and the filter.
    pub fn dists(&self, index_html: &str, filter: &CrawlerFilter) -> Vec<String> {
        http::index_links(index_html)
            .into_iter()
            .filter(|d| is_subdir_link(d) && (self.dist_filter)(d) && filter.matches_distro(d))
            .collect()
    }

    /// Repositories grouped by distribution release (`bookworm-updates/` → `bookworm`).
    pub fn list_drel_repos(
        &self,
        ctx: &CrawlContext,
        filter: &CrawlerFilter,
    ) -> Result<BTreeMap<String, Vec<DebRepository>>> {
        let dists_url = format!("{}dists/", self.base_url);
        let index = http::get_text(ctx.fetch(), &dists_url).with_context(|| format!("listing {}", dists_url))?;

        let mut drel_dists: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for dist in self.dists(&index, filter) {
            drel_dists.entry(distro_release(&dist)).or_default().push(dist);
        }
        tracing::info!(mirror = %self.base_url, releases = ?drel_dists.keys().collect::<Vec<_>>(), "distribution releases found");

        let scans: Vec<(String, String)> = drel_dists
            .iter()
            .flat_map(|(drel, dists)| {
                dists.iter().flat_map(move |dist| {
                    [
                        (drel.clone(), format!("dists/{}", dist)),
                        (drel.clone(), format!("dists/{}updates/", dist)),
                    ]
                })
            })
            .collect();

        let scanned = ctx.par_map(scans, |(drel, dist)| {
            let result = self.scan_repo(ctx, &dist, &filter.arch);
            (drel, dist, result)
        });

        let mut by_drel: BTreeMap<String, BTreeMap<String, DebRepository>> = BTreeMap::new();
        for (drel, dist, result) in scanned {
            match result {
                Ok(repos) => by_drel.entry(drel).or_default().extend(repos),
                Err(e) => tracing::debug!(dist = %dist, error = %e, "no Release file"),
            }
        }
        Ok(by_drel
            .into_iter()
            .map(|(drel, repos)| (drel, repos.into_values().collect()))
            .collect())
    }
}

/// Accepted components of a `Release` file.
fn components(release: &str, dist: &str) -> BTreeSet<String> {
    let mut comps = BTreeSet::new();
    if let Some(line) = release.lines().find(|l| l.starts_with("Components: ")) {
        for comp in line.split_whitespace().skip(1) {
            if !matches!(comp, "main" | "updates" | "updates/main") {
                continue;
            }
            let comp = if dist.ends_with("updates/") {
                comp.strip_prefix("updates/").unwrap_or(comp)
            } else {
                comp
            };
            comps.insert(comp.to_string());
        }
    }
    comps
}

/// `bookworm-updates/` and `bookworm/updates/` both belong to `bookworm`.
fn distro_release(dist: &str) -> String {
    let first = dist.split('/').next().unwrap_or(dist);
    first.split('-').next().unwrap_or(first).to_string()
}

impl fmt::Display for DebMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

impl Mirror for DebMirror {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups> {
        Ok(self
            .list_drel_repos(ctx, filter)?
            .into_iter()
            .map(|(drel, repos)| {
                let repos = repos
                    .into_iter()
                    .map(|r| Arc::new(r) as Arc<dyn Repository>)
                    .collect();
                (drel, repos)
            })
            .collect())
    }
}

/// A Debian-family distribution: several apt mirrors whose repositories are
/// resolved together per distribution release.
pub struct DebDistro {
    name: String,
    mirrors: Vec<DebMirror>,
}

impl DebDistro {
    pub fn new(name: impl Into<String>, mirrors: Vec<DebMirror>) -> Self {
        Self {
            name: name.into(),
            mirrors,
        }
    }

    pub fn mirrors(&self) -> &[DebMirror] {
        &self.mirrors
    }

    /// Union of every mirror's release groups; failing mirrors are skipped.
    pub fn list_drel_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> BTreeMap<String, Vec<DebRepository>> {
        let mirrors: Vec<&DebMirror> = self.mirrors.iter().collect();
        let listings = ctx.par_map(mirrors, |m| (m.to_string(), m.list_drel_repos(ctx, filter)));

        let mut merged: BTreeMap<String, Vec<DebRepository>> = BTreeMap::new();
        for (mirror, listing) in listings {
            match listing {
                Ok(groups) => {
                    for (drel, repos) in groups {
                        merged.entry(drel).or_default().extend(repos);
                    }
                }
                Err(e) => tracing::warn!(distro = %self.name, mirror = %mirror, error = %format!("{:#}", e), "skipping mirror"),
            }
        }
        merged
    }

    /// Resolve one distribution release from its repositories' indexes.
    pub fn resolve_release(dbs: Vec<PackageDb>, filter: &CrawlerFilter) -> BTreeMap<String, BTreeSet<String>> {
        let mut all_packages = PackageDb::new();
        let mut candidates = Vec::new();
        for db in dbs {
            candidates.extend(kernel_candidates(&db, &filter.kernel_filter));
            all_packages.extend(db);
        }
        build_package_tree(&all_packages, &candidates)
    }
}

impl fmt::Display for DebDistro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Mirror for DebDistro {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups> {
        Ok(self
            .list_drel_repos(ctx, filter)
            .into_iter()
            .map(|(drel, repos)| {
                let repos = repos
                    .into_iter()
                    .map(|r| Arc::new(r) as Arc<dyn Repository>)
                    .collect();
                (drel, repos)
            })
            .collect())
    }

    fn get_package_tree(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree> {
        let drel_repos: Vec<(String, Vec<DebRepository>)> = self.list_drel_repos(ctx, filter).into_iter().collect();

        let resolved = ctx.par_map(drel_repos, |(drel, repos)| {
            let dbs = ctx.par_map(repos, |repo| repo.raw_package_db(ctx));
            (drel, Self::resolve_release(dbs, filter))
        });

        let mut tree = PackageTree::new();
        for (drel, releases) in resolved {
            for (krel, urls) in releases {
                tree.extend(ReleaseKey::grouped(drel.clone(), krel), urls);
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http::MemoryFetch;
    use pretty_assertions::assert_eq;

    pub(crate) const BULLSEYE_PACKAGES: &str = "\
Package: linux-headers-5.10.0-8-amd64
Version: 5.10.46-5
Depends: linux-headers-5.10.0-8-common (= 5.10.46-5), linux-kbuild-5.10 (>= 5.10.46-5), linux-compiler-gcc-10-x86
Filename: pool/main/l/linux/linux-headers-5.10.0-8-amd64_5.10.46-5_amd64.deb
Description: Header files for Linux 5.10.0-8-amd64
 This package provides the architecture-specific kernel header files.

Package: linux-image-5.10.0-8-amd64
Version: 5.10.46-5
Depends: kmod, linux-base (>= 4.3~), initramfs-tools (>= 0.120+deb8u2) | linux-initramfs-tool
Filename: pool/main/l/linux-signed-amd64/linux-image-5.10.0-8-amd64_5.10.46-5_amd64.deb

Package: linux-headers-5.10.0-8-common
Version: 5.10.46-5
Filename: pool/main/l/linux/linux-headers-5.10.0-8-common_5.10.46-5_all.deb

Package: linux-kbuild-5.10
Version: 5.10.46-5
Depends: libc6 (>= 2.14)
Filename: pool/main/l/linux/linux-kbuild-5.10_5.10.46-5_amd64.deb
";

    fn db() -> PackageDb {
        parse_packages(BULLSEYE_PACKAGES, "http://deb/debian/")
    }

    #[test]
    fn test_parse_packages() {
        let db = db();
        assert_eq!(db.len(), 4);
        let headers = &db["linux-headers-5.10.0-8-amd64"];
        assert_eq!(headers.version, "5.10.46-5");
        assert_eq!(headers.depends.len(), 3);
        assert!(headers.depends.contains("linux-kbuild-5.10 (>= 5.10.46-5)"));
        assert_eq!(
            headers.url,
            "http://deb/debian/pool/main/l/linux/linux-headers-5.10.0-8-amd64_5.10.46-5_amd64.deb"
        );
        assert!(db["linux-headers-5.10.0-8-common"].depends.is_empty());
    }

    #[test]
    fn test_parse_skips_incomplete_stanzas() {
        let db = parse_packages("Package: foo\nVersion: 1\n\nPackage: bar\nVersion: 2\nFilename: bar.deb", "");
        assert_eq!(db.keys().collect::<Vec<_>>(), vec!["bar"]);
    }

    #[test]
    fn test_is_kernel_package() {
        assert!(is_kernel_package("linux-headers-5.10.0-8-amd64"));
        assert!(is_kernel_package("linux-headers-5.10.0-8-common (= 5.10.46-5)"));
        assert!(is_kernel_package("linux-kbuild-5.10 (>= 5.10.46-5)"));
        assert!(!is_kernel_package("linux-image-5.10.0-8-amd64-dbg"));
        assert!(!is_kernel_package("linux-modules-extra-5.15.0-1001-azure"));
        assert!(!is_kernel_package("linux-azure-tools-5.15.0-1001"));
        assert!(!is_kernel_package("linux-base (>= 4.3~)"));
        assert!(!is_kernel_package("kmod"));
    }

    #[test]
    fn test_closure_follows_kernel_deps_only() {
        let deps = transitive_dependencies(&db(), "linux-headers-5.10.0-8-amd64").unwrap();
        assert_eq!(
            deps,
            BTreeSet::from([
                "linux-headers-5.10.0-8-amd64".to_string(),
                "linux-headers-5.10.0-8-common".to_string(),
                "linux-kbuild-5.10".to_string(),
            ])
        );
    }

    #[test]
    fn test_closure_takes_first_alternative() {
        let db = parse_packages(
            "Package: linux-headers-6.1.0-1-amd64\nVersion: 6.1.4-1\nDepends: linux-kbuild-6.1 | linux-kbuild-6.0\nFilename: h.deb\n\n\
             Package: linux-kbuild-6.1\nVersion: 6.1.4-1\nFilename: k.deb\n",
            "",
        );
        let deps = transitive_dependencies(&db, "linux-headers-6.1.0-1-amd64").unwrap();
        assert!(deps.contains("linux-kbuild-6.1"));
        assert!(!deps.contains("linux-kbuild-6.0"));
    }

    #[test]
    fn test_missing_kernel_dependency_is_incomplete() {
        let mut db = db();
        db.remove("linux-kbuild-5.10");
        let err = transitive_dependencies(&db, "linux-headers-5.10.0-8-amd64").unwrap_err();
        assert_eq!(err.dependency, "linux-kbuild-5.10");
        assert_eq!(err.package, "linux-headers-5.10.0-8-amd64");
    }

    #[test]
    fn test_candidates() {
        let db = db();
        assert_eq!(
            kernel_candidates(&db, ""),
            vec!["linux-headers-5.10.0-8-amd64", "linux-image-5.10.0-8-amd64"]
        );
        assert_eq!(
            kernel_candidates(&db, "5.10.0-8-amd64"),
            vec!["linux-image-5.10.0-8-amd64", "linux-headers-5.10.0-8-amd64"]
        );
        assert_eq!(kernel_candidates(&db, "linux-kbuild-5.10"), vec!["linux-kbuild-5.10"]);
        assert!(kernel_candidates(&db, "4.19").is_empty());
    }

    #[test]
    fn test_release_key() {
        assert_eq!(release_key("5.15.0-1001.2"), "5.15.0-1001/2");
        assert_eq!(release_key("5.10.46-5"), "5.10.46-5");
    }

    #[test]
    fn test_tree_contains_full_closure() {
        let db = db();
        let tree = build_package_tree(&db, &kernel_candidates(&db, ""));
        assert_eq!(tree.len(), 1);
        let urls = &tree["5.10.46-5"];
        assert_eq!(urls.len(), 4);
        assert!(urls.iter().any(|u| u.contains("linux-kbuild-5.10")));
        assert!(urls.iter().any(|u| u.contains("linux-image-5.10.0-8-amd64")));
    }

    #[test]
    fn test_kbuild_only_release_is_pruned() {
        let db = parse_packages(
            "Package: linux-kbuild-5.10\nVersion: 5.10.70-1\nFilename: k.deb\n",
            "http://deb/",
        );
        let tree = build_package_tree(&db, &["linux-kbuild-5.10".to_string()]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_components() {
        let release = "Origin: Debian\nSuite: stable-security\nComponents: updates/main updates/contrib updates/non-free\n";
        assert_eq!(components(release, "dists/bullseye/updates/"), BTreeSet::from(["main".to_string()]));
        let release = "Components: main contrib non-free\n";
        assert_eq!(components(release, "dists/bullseye/"), BTreeSet::from(["main".to_string()]));
    }

    #[test]
    fn test_distro_release() {
        assert_eq!(distro_release("bookworm-updates/"), "bookworm");
        assert_eq!(distro_release("bullseye/"), "bullseye");
        assert_eq!(distro_release("bullseye-security/"), "bullseye");
    }

    #[test]
    fn test_distro_merges_sibling_repositories() {
        let fetch = MemoryFetch::new();
        let base = "http://deb/debian/";
        fetch.insert(
            format!("{}dists/", base),
            r#"<a href="../">../</a><a href="bullseye/">bullseye/</a><a href="bullseye-updates/">bullseye-updates/</a><a href="stable/">stable/</a>"#,
        );
        fetch.insert(format!("{}dists/bullseye/Release", base), "Components: main contrib\n");
        fetch.insert(format!("{}dists/bullseye-updates/Release", base), "Components: main\n");

        // headers and image in one repository, common headers and kbuild in the other
        let (kernel, support): (Vec<&str>, Vec<&str>) = BULLSEYE_PACKAGES
            .split("\n\n")
            .partition(|s| s.contains("Package: linux-headers-5.10.0-8-amd64") || s.contains("Package: linux-image"));
        fetch.insert(
            format!("{}dists/bullseye/main/binary-amd64/Packages.gz", base),
            crate::crawler::rpm::tests::gzip(&kernel.join("\n\n")),
        );
        fetch.insert(
            format!("{}dists/bullseye-updates/main/binary-amd64/Packages.gz", base),
            crate::crawler::rpm::tests::gzip(&support.join("\n\n")),
        );

        let ctx = CrawlContext::new(Arc::new(fetch), 4).unwrap();
        let distro = DebDistro::new("Debian", vec![DebMirror::with_filter(base, |d| !d.contains("stable"))]);
        let filter = CrawlerFilter::new("x86_64");

        let tree = distro.get_package_tree(&ctx, &filter).unwrap();
        assert_eq!(tree.len(), 1);
        let key = ReleaseKey::grouped("bullseye", "5.10.46-5");
        assert_eq!(tree.get(&key).unwrap().len(), 4);

        // resolved one repository at a time, the closure is incomplete
        let single = distro.mirrors()[0].get_package_tree(&ctx, &filter).unwrap();
        assert!(single.is_empty());
    }
}
