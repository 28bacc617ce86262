//! Red Hat-compatible distributions served from versioned mirror trees.

use crate::crawler::rpm::{RpmMirror, VersionFilter};
use crate::crawler::{Distro, Mirror};

fn v2_only(ver: &str) -> bool {
    ver.starts_with('2')
}

fn v3_only(ver: &str) -> bool {
    ver.starts_with('3')
}

fn v6_or_v7(ver: &str) -> bool {
    ver.starts_with('6') || ver.starts_with('7')
}

fn v7_only(ver: &str) -> bool {
    ver.starts_with('7')
}

fn v8_only(ver: &str) -> bool {
    ver.starts_with('8')
}

fn v8_stream(ver: &str) -> bool {
    ver.starts_with("8-stream")
}

fn v9_only(ver: &str) -> bool {
    ver.starts_with('9')
}

fn v8_or_v9(ver: &str) -> bool {
    v8_only(ver) || v9_only(ver)
}

/// Skip Fedora releases older than 32.
fn fedora_release(ver: &str) -> bool {
    ver.parse::<u32>().map(|v| v >= 32).unwrap_or(false)
}

fn mirror(base_url: &str, variant: &str, filter: VersionFilter) -> Box<dyn Mirror> {
    Box::new(RpmMirror::new(base_url, variant, filter))
}

pub fn centos(machine: &str) -> Distro {
    let os = format!("os/{}/", machine);
    let updates = format!("updates/{}/", machine);
    let base_os = format!("BaseOS/{}/os/", machine);
    Distro::new(
        "CentOS",
        vec![
            mirror("http://mirror.centos.org/centos/", &os, v7_only),
            mirror("http://mirror.centos.org/centos/", &updates, v7_only),
            mirror("http://linuxsoft.cern.ch/centos-vault/", &os, v6_or_v7),
            mirror("http://linuxsoft.cern.ch/centos-vault/", &updates, v6_or_v7),
            mirror("http://linuxsoft.cern.ch/centos-vault/", &base_os, v8_only),
        ],
    )
}

pub fn centos_stream(machine: &str) -> Distro {
    let base_os = format!("BaseOS/{}/os/", machine);
    let app_stream = format!("AppStream/{}/os/", machine);
    Distro::new(
        "CentOSStream",
        vec![
            mirror("http://mirror.centos.org/centos/", &base_os, v8_stream),
            mirror("http://mirror.centos.org/centos/", &app_stream, v8_stream),
            mirror("http://mirror.stream.centos.org/", &base_os, v9_only),
            mirror("http://mirror.stream.centos.org/", &app_stream, v9_only),
        ],
    )
}

pub fn rocky(machine: &str) -> Distro {
    let base_os = format!("BaseOS/{}/os/", machine);
    let app_stream = format!("AppStream/{}/os/", machine);
    Distro::new(
        "RockyLinux",
        vec![
            mirror("http://dl.rockylinux.org/pub/rocky/", &base_os, v8_or_v9),
            mirror("http://dl.rockylinux.org/pub/rocky/", &app_stream, v8_or_v9),
            mirror("http://dl.rockylinux.org/vault/rocky/", &base_os, v8_only),
        ],
    )
}

pub fn alma(machine: &str) -> Distro {
    Distro::new(
        "AlmaLinux",
        vec![
            mirror("http://repo.almalinux.org/almalinux/", &format!("BaseOS/{}/os/", machine), v8_or_v9),
            mirror("http://repo.almalinux.org/almalinux/", &format!("AppStream/{}/os/", machine), v8_or_v9),
        ],
    )
}

pub fn aliyun(machine: &str) -> Distro {
    let filters: [VersionFilter; 2] = [v2_only, v3_only];
    let mut mirrors = Vec::new();
    for filter in filters {
        for repo in ["os", "updates", "plus"] {
            mirrors.push(mirror("http://mirrors.aliyun.com/alinux/", &format!("{}/{}/", repo, machine), filter));
        }
    }
    Distro::new("AliyunLinux", mirrors)
}

pub fn fedora(machine: &str) -> Distro {
    Distro::new(
        "Fedora",
        vec![
            mirror(
                "http://download-ib01.fedoraproject.org/pub/fedora/linux/releases/",
                &format!("Everything/{}/os/", machine),
                fedora_release,
            ),
            mirror(
                "http://download-ib01.fedoraproject.org/pub/fedora/linux/updates/",
                &format!("Everything/{}/", machine),
                fedora_release,
            ),
        ],
    )
}
