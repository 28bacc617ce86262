//! RPM (yum/dnf) repositories.
//!
//! A repository is resolved by reading `repodata/repomd.xml`, following it to
//! the `primary` metadata and loading every package row into a [`PrimaryDb`].
//! Kernel packages are picked by an [`RpmQuery`] and grouped by release
//! (`<version>-<release>.<arch>`). RPM kernels need no dependency walk: each
//! release's package set is exactly the matched rows.

use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use super::{CrawlContext, CrawlerFilter, Mirror, PackageTree, ReleaseKey, RepoGroups, Repository};
use crate::http;

/// One `<package>` row of `primary.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpmPackage {
    pub name: String,
    pub arch: String,
    pub epoch: String,
    pub version: String,
    pub release: String,
    pub checksum: String,
    pub location: String,
    pub requires: Vec<String>,
}

impl RpmPackage {
    /// Kernel release string, as `uname -r` reports it on the installed system.
    pub fn kernel_release(&self) -> String {
        format!("{}-{}.{}", self.version, self.release, self.arch)
    }
}

/// In-memory table of a repository's primary metadata.
#[derive(Debug, Clone, Default)]
pub struct PrimaryDb {
    packages: Vec<RpmPackage>,
}

impl PrimaryDb {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut packages = Vec::new();
        let mut current: Option<RpmPackage> = None;
        let mut text_field: Option<&'static str> = None;
        let mut in_requires = false;

        loop {
            match reader.read_event().context("parsing primary.xml")? {
                Event::Start(e) => {
                    match e.name().as_ref() {
                        b"package" => current = Some(RpmPackage::default()),
                        b"name" => text_field = Some("name"),
                        b"arch" => text_field = Some("arch"),
                        b"checksum" => text_field = Some("checksum"),
                        b"rpm:requires" => in_requires = true,
                        _ => {}
                    }
                    if let Some(pkg) = current.as_mut() {
                        apply_attributes(pkg, &e, in_requires)?;
                    }
                }
                Event::Empty(e) => {
                    if let Some(pkg) = current.as_mut() {
                        apply_attributes(pkg, &e, in_requires)?;
                    }
                }
                Event::Text(t) => {
                    if let (Some(field), Some(pkg)) = (text_field, current.as_mut()) {
                        let value = t.unescape().context("decoding primary.xml text")?.into_owned();
                        match field {
                            "name" => pkg.name = value,
                            "arch" => pkg.arch = value,
                            _ => pkg.checksum = value,
                        }
                    }
                }
                Event::End(e) => {
                    text_field = None;
                    match e.name().as_ref() {
                        b"package" => packages.extend(current.take()),
                        b"rpm:requires" => in_requires = false,
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self { packages })
    }

    pub fn packages(&self) -> &[RpmPackage] {
        &self.packages
    }

    pub fn query<'a>(
        &'a self,
        query: &'a RpmQuery,
        filter: &'a CrawlerFilter,
    ) -> impl Iterator<Item = &'a RpmPackage> + 'a {
        self.packages.iter().filter(move |p| query.matches(p, filter))
    }
}

fn apply_attributes(pkg: &mut RpmPackage, e: &BytesStart<'_>, in_requires: bool) -> Result<()> {
    let tag = e.name();
    let tag = tag.as_ref();
    if tag != b"version" && tag != b"location" && !(in_requires && tag == b"rpm:entry") {
        return Ok(());
    }
    for attr in e.attributes() {
        let attr = attr.context("reading primary.xml attribute")?;
        let value = attr.unescape_value().context("decoding primary.xml attribute")?.into_owned();
        match (tag, attr.key.as_ref()) {
            (b"version", b"epoch") => pkg.epoch = value,
            (b"version", b"ver") => pkg.version = value,
            (b"version", b"rel") => pkg.release = value,
            (b"location", b"href") => pkg.location = value,
            (b"rpm:entry", b"name") => pkg.requires.push(value),
            _ => {}
        }
    }
    Ok(())
}

/// Location of the `primary` metadata file inside `repomd.xml`.
pub fn primary_location(repomd: &str) -> Result<String> {
    let mut reader = Reader::from_str(repomd);
    reader.config_mut().trim_text(true);
    let mut in_primary = false;

    loop {
        match reader.read_event().context("parsing repomd.xml")? {
            Event::Start(e) if e.name().as_ref() == b"data" => {
                in_primary = false;
                for attr in e.attributes() {
                    let attr = attr.context("reading repomd.xml attribute")?;
                    if attr.key.as_ref() == b"type" && attr.value.as_ref() == b"primary" {
                        in_primary = true;
                    }
                }
            }
            Event::Empty(e) | Event::Start(e) if in_primary && e.name().as_ref() == b"location" => {
                for attr in e.attributes() {
                    let attr = attr.context("reading repomd.xml attribute")?;
                    if attr.key.as_ref() == b"href" {
                        return Ok(attr.unescape_value()?.into_owned());
                    }
                }
            }
            Event::End(e) if e.name().as_ref() == b"data" => in_primary = false,
            Event::Eof => bail!("repomd.xml has no primary metadata"),
            _ => {}
        }
    }
}

/// SQL `LIKE` pattern over package names (`%` any run, `_` one character).
#[derive(Debug, Clone)]
pub struct LikePattern {
    pattern: String,
    regex: Regex,
}

impl LikePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut re = String::from("^");
        for c in pattern.chars() {
            match c {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        let regex = Regex::new(&re).with_context(|| format!("invalid LIKE pattern '{}'", pattern))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

impl fmt::Display for LikePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Which rows of a repository count as kernel packages.
#[derive(Debug, Clone)]
pub enum RpmQuery {
    /// `kernel` and `kernel-devel` built for the crawl machine.
    Kernel,
    /// Name in `names` and arch in `arches`.
    NameIn { names: Vec<String>, arches: Vec<String> },
    /// Name matches any `include` pattern and no `exclude` pattern.
    Like {
        include: Vec<LikePattern>,
        exclude: Vec<LikePattern>,
    },
}

impl RpmQuery {
    pub fn name_in(names: &[&str], arches: &[&str]) -> Self {
        RpmQuery::NameIn {
            names: names.iter().map(|s| s.to_string()).collect(),
            arches: arches.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn like(include: &[&str], exclude: &[&str]) -> Result<Self> {
        Ok(RpmQuery::Like {
            include: include.iter().map(|p| LikePattern::new(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| LikePattern::new(p)).collect::<Result<_>>()?,
        })
    }

    pub fn matches(&self, pkg: &RpmPackage, filter: &CrawlerFilter) -> bool {
        match self {
            RpmQuery::Kernel => {
                (pkg.name == "kernel" || pkg.name == "kernel-devel") && pkg.arch == filter.machine
            }
            RpmQuery::NameIn { names, arches } => {
                names.iter().any(|n| *n == pkg.name) && arches.iter().any(|a| *a == pkg.arch)
            }
            RpmQuery::Like { include, exclude } => {
                include.iter().any(|p| p.matches(&pkg.name))
                    && !exclude.iter().any(|p| p.matches(&pkg.name))
            }
        }
    }
}

/// A yum repository rooted at `base_url` (the directory holding `repodata/`).
pub struct RpmRepository {
    base_url: String,
    query: RpmQuery,
}

impl RpmRepository {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_query(base_url, RpmQuery::Kernel)
    }

    pub fn with_query(base_url: impl Into<String>, query: RpmQuery) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url, query }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn load_primary(&self, ctx: &CrawlContext) -> Result<PrimaryDb> {
        let repomd_url = format!("{}repodata/repomd.xml", self.base_url);
        let repomd = http::get_text(ctx.fetch(), &repomd_url)?;
        let primary_url = format!("{}{}", self.base_url, primary_location(&repomd)?);
        let primary = http::get_text(ctx.fetch(), &primary_url)?;
        PrimaryDb::parse(&primary).with_context(|| format!("parsing {}", primary_url))
    }

    /// Group matching rows of `db` by kernel release.
    pub fn resolve(&self, db: &PrimaryDb, filter: &CrawlerFilter) -> PackageTree {
        let mut tree = PackageTree::new();
        for pkg in db.query(&self.query, filter) {
            let release = pkg.kernel_release();
            if !filter.matches_kernel(&release) {
                continue;
            }
            tree.insert(ReleaseKey::new(release), format!("{}{}", self.base_url, pkg.location));
        }
        tree
    }
}

impl fmt::Display for RpmRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

impl Repository for RpmRepository {
    fn get_package_tree(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<PackageTree> {
        let db = self.load_primary(ctx)?;
        Ok(self.resolve(&db, filter))
    }
}

/// Version predicate applied to the directories of a mirror's index.
pub type VersionFilter = fn(&str) -> bool;

/// A mirror whose index lists one directory per distribution version.
///
/// Every accepted `<base_url><version>/<variant>` is one repository.
pub struct RpmMirror {
    base_url: String,
    variant: String,
    version_filter: VersionFilter,
}

impl RpmMirror {
    pub fn new(base_url: &str, variant: &str, version_filter: VersionFilter) -> Self {
        Self {
            base_url: base_url.to_string(),
            variant: variant.to_string(),
            version_filter,
        }
    }

    /// Version directories named in an index page.
    pub fn versions(&self, index_html: &str, filter: &CrawlerFilter) -> Vec<String> {
        let mut versions: Vec<String> = http::index_links(index_html)
            .into_iter()
            .filter(|href| is_subdir_link(href))
            .map(|href| href.trim_end_matches('/').to_string())
            .filter(|v| (self.version_filter)(v) && filter.matches_distro(v))
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }
}

/// Relative links to child directories in an index page.
pub(crate) fn is_subdir_link(href: &str) -> bool {
    href.ends_with('/')
        && !href.starts_with('/')
        && !href.starts_with('?')
        && !href.starts_with('.')
        && !href.starts_with("http")
}

impl fmt::Display for RpmMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*/{}", self.base_url, self.variant)
    }
}

impl Mirror for RpmMirror {
    fn list_repos(&self, ctx: &CrawlContext, filter: &CrawlerFilter) -> Result<RepoGroups> {
        let index = http::get_text(ctx.fetch(), &self.base_url)?;
        let repos: Vec<Arc<dyn Repository>> = self
            .versions(&index, filter)
            .into_iter()
            .map(|v| {
                Arc::new(RpmRepository::new(format!("{}{}/{}", self.base_url, v, self.variant)))
                    as Arc<dyn Repository>
            })
            .collect();
        let mut groups = RepoGroups::new();
        groups.insert(String::new(), repos);
        Ok(groups)
    }
}

/// A fixed list of repositories.
pub struct StaticMirror {
    name: String,
    repos: Vec<Arc<dyn Repository>>,
}

impl StaticMirror {
    pub fn new(name: impl Into<String>, repos: Vec<Arc<dyn Repository>>) -> Self {
        Self {
            name: name.into(),
            repos,
        }
    }
}

impl fmt::Display for StaticMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Mirror for StaticMirror {
    fn list_repos(&self, _ctx: &CrawlContext, _filter: &CrawlerFilter) -> Result<RepoGroups> {
        let mut groups = RepoGroups::new();
        groups.insert(String::new(), self.repos.clone());
        Ok(groups)
    }
}
