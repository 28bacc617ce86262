//! Oracle Linux 6-9, including the Unbreakable Enterprise Kernel channels.

use std::sync::Arc;

use crate::crawler::rpm::{RpmQuery, RpmRepository, StaticMirror};
use crate::crawler::{Distro, Repository};

const OL6_REPOS: &[&str] = &[
    "http://yum.oracle.com/repo/OracleLinux/OL6/latest/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL6/MODRHCK/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL6/UEKR4/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL6/UEKR3/latest/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL6/UEK/latest/{}/",
];

const OL7_REPOS: &[&str] = &[
    "http://yum.oracle.com/repo/OracleLinux/OL7/latest/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL7/MODRHCK/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL7/UEKR6/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL7/UEKR5/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL7/UEKR4/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL7/UEKR3/{}/",
];

const OL8_REPOS: &[&str] = &[
    "http://yum.oracle.com/repo/OracleLinux/OL8/baseos/latest/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL8/UEKR6/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL8/UEKR7/{}/",
];

const OL9_REPOS: &[&str] = &[
    "http://yum.oracle.com/repo/OracleLinux/OL9/baseos/latest/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL9/appstream/{}/",
    "http://yum.oracle.com/repo/OracleLinux/OL9/UEKR7/{}/",
];

/// Stock and UEK kernels. Source packages are excluded by architecture.
pub fn kernel_query() -> RpmQuery {
    RpmQuery::name_in(
        &["kernel", "kernel-devel", "kernel-uek", "kernel-uek-devel"],
        &["x86_64", "aarch64"],
    )
}

pub fn distro(major: u32, machine: &str) -> Distro {
    let templates = match major {
        6 => OL6_REPOS,
        7 => OL7_REPOS,
        8 => OL8_REPOS,
        _ => OL9_REPOS,
    };
    let repos = templates
        .iter()
        .map(|t| Arc::new(RpmRepository::with_query(t.replace("{}", machine), kernel_query())) as Arc<dyn Repository>)
        .collect();
    let name = format!("Oracle{}", major);
    Distro::new(name.clone(), vec![Box::new(StaticMirror::new(name, repos))])
}
