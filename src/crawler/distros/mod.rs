//! Catalogue of crawlable distributions.

mod amazonlinux;
mod centos;
mod debian;
mod oracle;
mod photon;

pub use amazonlinux::{AmazonLinuxMirror, AmazonRelease};

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

use super::{flatcar, CrawlerFilter, Mirror};

/// Every distribution the crawler knows, by its command-line name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DistroKind {
    AliyunLinux,
    AlmaLinux,
    AmazonLinux,
    AmazonLinux2,
    AmazonLinux2022,
    CentOS,
    CentOSStream,
    Debian,
    Fedora,
    Flatcar,
    Oracle6,
    Oracle7,
    Oracle8,
    Oracle9,
    PhotonOS,
    RockyLinux,
    Ubuntu,
}

impl DistroKind {
    pub const ALL: &'static [DistroKind] = &[
        DistroKind::AliyunLinux,
        DistroKind::AlmaLinux,
        DistroKind::AmazonLinux,
        DistroKind::AmazonLinux2,
        DistroKind::AmazonLinux2022,
        DistroKind::CentOS,
        DistroKind::CentOSStream,
        DistroKind::Debian,
        DistroKind::Fedora,
        DistroKind::Flatcar,
        DistroKind::Oracle6,
        DistroKind::Oracle7,
        DistroKind::Oracle8,
        DistroKind::Oracle9,
        DistroKind::PhotonOS,
        DistroKind::RockyLinux,
        DistroKind::Ubuntu,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DistroKind::AliyunLinux => "AliyunLinux",
            DistroKind::AlmaLinux => "AlmaLinux",
            DistroKind::AmazonLinux => "AmazonLinux",
            DistroKind::AmazonLinux2 => "AmazonLinux2",
            DistroKind::AmazonLinux2022 => "AmazonLinux2022",
            DistroKind::CentOS => "CentOS",
            DistroKind::CentOSStream => "CentOSStream",
            DistroKind::Debian => "Debian",
            DistroKind::Fedora => "Fedora",
            DistroKind::Flatcar => "Flatcar",
            DistroKind::Oracle6 => "Oracle6",
            DistroKind::Oracle7 => "Oracle7",
            DistroKind::Oracle8 => "Oracle8",
            DistroKind::Oracle9 => "Oracle9",
            DistroKind::PhotonOS => "PhotonOS",
            DistroKind::RockyLinux => "RockyLinux",
            DistroKind::Ubuntu => "Ubuntu",
        }
    }
}

impl fmt::Display for DistroKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DistroKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match DistroKind::ALL.iter().find(|k| k.name() == s) {
            Some(kind) => Ok(*kind),
            None => {
                let known: Vec<&str> = DistroKind::ALL.iter().map(|k| k.name()).collect();
                bail!("unknown distribution '{}' (known: {})", s, known.join(", "))
            }
        }
    }
}

/// Build the crawl hierarchy for `kind`.
pub fn distro(kind: DistroKind, filter: &CrawlerFilter) -> Result<Box<dyn Mirror>> {
    let machine = filter.machine.as_str();
    Ok(match kind {
        DistroKind::AliyunLinux => Box::new(centos::aliyun(machine)),
        DistroKind::AlmaLinux => Box::new(centos::alma(machine)),
        DistroKind::AmazonLinux => Box::new(amazonlinux::distro(AmazonRelease::AmazonLinux1, machine)),
        DistroKind::AmazonLinux2 => Box::new(amazonlinux::distro(AmazonRelease::AmazonLinux2, machine)),
        DistroKind::AmazonLinux2022 => Box::new(amazonlinux::distro(AmazonRelease::AmazonLinux2022, machine)),
        DistroKind::CentOS => Box::new(centos::centos(machine)),
        DistroKind::CentOSStream => Box::new(centos::centos_stream(machine)),
        DistroKind::Debian => Box::new(debian::debian()),
        DistroKind::Fedora => Box::new(centos::fedora(machine)),
        DistroKind::Flatcar => Box::new(flatcar::distro(filter)),
        DistroKind::Oracle6 => Box::new(oracle::distro(6, machine)),
        DistroKind::Oracle7 => Box::new(oracle::distro(7, machine)),
        DistroKind::Oracle8 => Box::new(oracle::distro(8, machine)),
        DistroKind::Oracle9 => Box::new(oracle::distro(9, machine)),
        DistroKind::PhotonOS => Box::new(photon::distro(machine)?),
        DistroKind::RockyLinux => Box::new(centos::rocky(machine)),
        DistroKind::Ubuntu => Box::new(debian::ubuntu()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for kind in DistroKind::ALL {
            assert_eq!(kind.name().parse::<DistroKind>().unwrap(), *kind);
        }
        assert!("Slackware".parse::<DistroKind>().is_err());
    }

    #[test]
    fn test_every_distro_builds() {
        let filter = CrawlerFilter::new("x86_64");
        for kind in DistroKind::ALL {
            let mirror = distro(*kind, &filter).unwrap();
            assert!(!mirror.to_string().is_empty());
        }
    }
}
