//! Debian and Ubuntu.

use crate::crawler::deb::{DebDistro, DebMirror};

/// Skip suite aliases; they duplicate the codename directories.
fn debian_dist(dist: &str) -> bool {
    !dist.contains("stable") && !dist.contains("testing") && !dist.starts_with("Debian")
}

pub fn debian() -> DebDistro {
    DebDistro::new(
        "Debian",
        vec![
            DebMirror::with_filter("http://mirrors.edge.kernel.org/debian/", debian_dist),
            DebMirror::with_filter("http://security.debian.org/", debian_dist),
        ],
    )
}

pub fn ubuntu() -> DebDistro {
    DebDistro::new(
        "Ubuntu",
        vec![
            DebMirror::new("http://mirrors.edge.kernel.org/ubuntu/"),
            DebMirror::new("http://security.ubuntu.com/ubuntu/"),
        ],
    )
}
