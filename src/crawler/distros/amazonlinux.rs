//! Amazon Linux 1, 2 and 2022.
//!
//! Amazon Linux repositories are not listed in a browsable index. Each known
//! repository path has a `mirror.list` whose first line is the actual
//! repository URL (with `$basearch` to substitute).

use anyhow::{bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::crawler::rpm::RpmRepository;
use crate::crawler::{CrawlContext, CrawlerFilter, Distro, Mirror, RepoGroups, Repository};
use crate::http;

const AL1_REPOS: &[&str] = &[
    "latest/updates",
    "latest/main",
    "2017.03/updates",
    "2017.03/main",
    "2017.09/updates",
    "2017.09/main",
    "2018.03/updates",
    "2018.03/main",
];

const AL2_REPOS: &[&str] = &[
    "core/2.0",
    "core/latest",
    "extras/kernel-5.4/latest",
    "extras/kernel-5.10/latest",
];

const AL2022_BASE_URL: &str = "https://al2022-repos-us-east-1-9761ab97.s3.dualstack.us-east-1.amazonaws.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmazonRelease {
    AmazonLinux1,
    AmazonLinux2,
    AmazonLinux2022,
}

pub struct AmazonLinuxMirror {
    release: AmazonRelease,
    machine: String,
}

impl AmazonLinuxMirror {
    pub fn new(release: AmazonRelease, machine: &str) -> Self {
        Self {
            release,
            machine: machine.to_string(),
        }
    }

    /// `mirror.list` URLs to resolve.
    fn mirror_lists(&self, ctx: &CrawlContext) -> Result<Vec<String>> {
        Ok(match self.release {
            AmazonRelease::AmazonLinux1 => AL1_REPOS
                .iter()
                .map(|r| format!("http://repo.us-east-1.amazonaws.com/{}/mirror.list", r))
                .collect(),
            AmazonRelease::AmazonLinux2 => AL2_REPOS
                .iter()
                .map(|r| {
                    format!(
                        "http://amazonlinux.us-east-1.amazonaws.com/2/{}/{}/mirror.list",
                        r, self.machine
                    )
                })
                .collect(),
            AmazonRelease::AmazonLinux2022 => {
                let url = format!("{}/core/releasemd.xml", AL2022_BASE_URL);
                let releasemd = http::get_text(ctx.fetch(), &url)?;
                // the newest release carries the kernels of all earlier ones
                let release = latest_release(&releasemd).with_context(|| format!("parsing {}", url))?;
                tracing::info!(release = %release, "using Amazon Linux 2022 release");
                vec![format!(
                    "{}/core/mirrors/{}/{}/mirror.list",
                    AL2022_BASE_URL, release, self.machine
                )]
            }
        })
    }

    fn resolve_mirror_list(&self, ctx: &CrawlContext, url: &str) -> Result<String> {
        let body = http::get_text(ctx.fetch(), url)?;
        let Some(first) = body.lines().next() else {
            bail!("empty mirror list at {}", url);
        };
        Ok(repo_url(first, &self.machine))
    }
}

/// Repository URL from a mirror list line, `$basearch` substituted and
/// exactly one trailing slash.
fn repo_url(line: &str, machine: &str) -> String {
    format!("{}/", line.trim().replace("$basearch", machine).trim_end_matches('/'))
}

/// `version` attribute of the last `<release>` in a `releasemd.xml`.
fn latest_release(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut last = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"release" => {
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"version" {
                        last = Some(attr.unescape_value()?.into_owned());
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    last.context("no release listed")
}

impl fmt::Display for AmazonLinuxMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.release {
            AmazonRelease::AmazonLinux1 => write!(f, "AmazonLinux"),
            AmazonRelease::AmazonLinux2 => write!(f, "AmazonLinux2"),
            AmazonRelease::AmazonLinux2022 => write!(f, "AmazonLinux2022"),
        }
    }
}

impl Mirror for AmazonLinuxMirror {
    fn list_repos(&self, ctx: &CrawlContext, _filter: &CrawlerFilter) -> Result<RepoGroups> {
        let lists = self.mirror_lists(ctx)?;
        let resolved = ctx.par_map(lists, |url| {
            let result = self.resolve_mirror_list(ctx, &url);
            (url, result)
        });

        let mut urls = BTreeSet::new();
        for (list, result) in resolved {
            match result {
                Ok(url) => {
                    urls.insert(url);
                }
                Err(e) => tracing::warn!(mirror_list = %list, error = %e, "could not resolve repository"),
            }
        }

        let repos = urls
            .into_iter()
            .map(|url| Arc::new(RpmRepository::new(url)) as Arc<dyn Repository>)
            .collect();
        let mut groups = RepoGroups::new();
        groups.insert(String::new(), repos);
        Ok(groups)
    }
}

pub fn distro(release: AmazonRelease, machine: &str) -> Distro {
    let mirror = AmazonLinuxMirror::new(release, machine);
    Distro::new(mirror.to_string(), vec![Box::new(mirror)])
}
