//! VMware Photon OS.

use anyhow::Result;
use std::sync::Arc;

use crate::crawler::rpm::{RpmQuery, RpmRepository, StaticMirror};
use crate::crawler::{Distro, Repository};

const VERSIONS: &[(&str, &str)] = &[
    ("3.0", "_release"),
    ("3.0", "_updates"),
    ("4.0", ""),
    ("4.0", "_release"),
    ("4.0", "_updates"),
];

/// Generic kernel and its devel packages only.
///
/// `esx` kernels lack CONFIG_TRACEPOINTS; the other flavours (and
/// `Linux-PAM-devel`) are left out as well.
pub fn kernel_query() -> Result<RpmQuery> {
    RpmQuery::like(
        &["linux", "linux-%devel%"],
        &["%-PAM-%", "%-esx-%", "%-rt-%", "%-secure-%", "%-aws-%"],
    )
}

pub fn distro(machine: &str) -> Result<Distro> {
    let mut repos: Vec<Arc<dyn Repository>> = Vec::new();
    for (version, tag) in VERSIONS {
        let url = format!(
            "https://packages.vmware.com/photon/{v}/photon{t}_{v}_{m}/",
            v = version,
            t = tag,
            m = machine
        );
        repos.push(Arc::new(RpmRepository::with_query(url, kernel_query()?)));
    }
    Ok(Distro::new("PhotonOS", vec![Box::new(StaticMirror::new("PhotonOS", repos))]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::rpm::tests::{package_xml, serve_repo};
    use crate::crawler::{CrawlContext, CrawlerFilter, Mirror, ReleaseKey};
    use crate::http::MemoryFetch;

    #[test]
    fn test_photon_crawl() {
        let fetch = MemoryFetch::new();
        serve_repo(
            &fetch,
            "https://packages.vmware.com/photon/4.0/photon_updates_4.0_x86_64/",
            &[
                package_xml("linux", "x86_64", "5.10.83", "3.ph4"),
                package_xml("linux-devel", "x86_64", "5.10.83", "3.ph4"),
                package_xml("linux-esx-devel", "x86_64", "5.10.83", "3.ph4"),
                package_xml("linux-rt", "x86_64", "5.10.83", "3.ph4"),
            ],
        );
        let ctx = CrawlContext::new(Arc::new(fetch), 2).unwrap();
        let filter = CrawlerFilter::new("x86_64");

        let tree = distro("x86_64").unwrap().get_package_tree(&ctx, &filter).unwrap();
        assert_eq!(tree.len(), 1);
        let files = tree.get(&ReleaseKey::new("5.10.83-3.ph4.x86_64")).unwrap();
        assert_eq!(files.len(), 2);
    }
}
