//! Release identities and the release → package-file mapping a crawl produces.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identity of one buildable kernel release.
///
/// RPM distributions key releases by the package release string alone;
/// Debian and Flatcar also carry the distribution release, and Debian
/// batches add an architecture/flavour variant. Use the accessors rather
/// than parsing the [`Display`](fmt::Display) form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReleaseKey {
    distro_release: String,
    kernel_release: String,
    variant: Option<String>,
}

impl ReleaseKey {
    /// Key for a distribution without release grouping.
    pub fn new(kernel_release: impl Into<String>) -> Self {
        Self {
            distro_release: String::new(),
            kernel_release: kernel_release.into(),
            variant: None,
        }
    }

    pub fn grouped(distro_release: impl Into<String>, kernel_release: impl Into<String>) -> Self {
        Self {
            distro_release: distro_release.into(),
            kernel_release: kernel_release.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Same identity with a different kernel release string.
    pub fn with_kernel_release(mut self, kernel_release: impl Into<String>) -> Self {
        self.kernel_release = kernel_release.into();
        self
    }

    pub fn distro_release(&self) -> &str {
        &self.distro_release
    }

    pub fn kernel_release(&self) -> &str {
        &self.kernel_release
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Kernel release as `uname -r` would report it.
    pub fn kernel_release_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}-{}", self.kernel_release, variant),
            None => self.kernel_release.clone(),
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.distro_release.is_empty() {
            write!(f, "{}/", self.distro_release)?;
        }
        write!(f, "{}", self.kernel_release)?;
        if let Some(variant) = &self.variant {
            write!(f, ":{}", variant)?;
        }
        Ok(())
    }
}

/// Package files (URLs or local paths) needed per kernel release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageTree {
    releases: BTreeMap<ReleaseKey, BTreeSet<String>>,
}

impl PackageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ReleaseKey, file: impl Into<String>) {
        self.releases.entry(key).or_default().insert(file.into());
    }

    pub fn extend<I, S>(&mut self, key: ReleaseKey, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.releases
            .entry(key)
            .or_default()
            .extend(files.into_iter().map(Into::into));
    }

    /// Union `other` into `self`, merging file sets of identical keys.
    pub fn merge(&mut self, other: PackageTree) {
        for (key, files) in other.releases {
            self.releases.entry(key).or_default().extend(files);
        }
    }

    pub fn get(&self, key: &ReleaseKey) -> Option<&BTreeSet<String>> {
        self.releases.get(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&ReleaseKey, &BTreeSet<String>) -> bool) {
        self.releases.retain(|k, v| keep(k, v));
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ReleaseKey> {
        self.releases.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReleaseKey, &BTreeSet<String>)> {
        self.releases.iter()
    }

    /// Every file of every release, deduplicated.
    pub fn all_files(&self) -> BTreeSet<String> {
        self.releases.values().flatten().cloned().collect()
    }
}

impl IntoIterator for PackageTree {
    type Item = (ReleaseKey, BTreeSet<String>);
    type IntoIter = std::collections::btree_map::IntoIter<ReleaseKey, BTreeSet<String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.releases.into_iter()
    }
}

impl FromIterator<(ReleaseKey, BTreeSet<String>)> for PackageTree {
    fn from_iter<T: IntoIterator<Item = (ReleaseKey, BTreeSet<String>)>>(iter: T) -> Self {
        let mut tree = PackageTree::new();
        for (key, files) in iter {
            tree.extend(key, files);
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_key_display() {
        assert_eq!(ReleaseKey::new("4.18.0-497.el8.x86_64").to_string(), "4.18.0-497.el8.x86_64");
        let deb = ReleaseKey::grouped("bullseye", "5.10.0-8").with_variant("amd64");
        assert_eq!(deb.to_string(), "bullseye/5.10.0-8:amd64");
        assert_eq!(deb.kernel_release_name(), "5.10.0-8-amd64");
        assert_eq!(deb.variant(), Some("amd64"));
    }

    #[test]
    fn test_merge_unions_file_sets() {
        let key = ReleaseKey::grouped("bullseye", "5.10.46-5");
        let mut a = PackageTree::new();
        a.insert(key.clone(), "http://m/a.deb");
        let mut b = PackageTree::new();
        b.insert(key.clone(), "http://m/b.deb");
        b.insert(ReleaseKey::new("other"), "http://m/c.deb");

        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(&key).unwrap().len(), 2);
        assert_eq!(a.all_files().len(), 3);
    }
}
