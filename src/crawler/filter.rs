//! Crawl-wide filtering options.

/// Restricts a crawl to one architecture and, optionally, to matching
/// distribution releases and kernel releases.
///
/// Built once per run and passed by reference to every level of the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlerFilter {
    /// uname-style machine (`x86_64`, `aarch64`), used by RPM repositories.
    pub machine: String,
    /// Package architecture (`amd64`, `arm64`), used by Debian and Flatcar.
    pub arch: String,
    /// Prefix a distribution release must start with (`""` matches all).
    pub distro_filter: String,
    /// Substring a kernel release must contain (`""` matches all).
    pub kernel_filter: String,
}

impl CrawlerFilter {
    pub fn new(machine: &str) -> Self {
        Self {
            machine: machine.to_string(),
            arch: package_arch(machine).to_string(),
            distro_filter: String::new(),
            kernel_filter: String::new(),
        }
    }

    /// Filter for the architecture this binary runs on.
    pub fn host() -> Self {
        Self::new(std::env::consts::ARCH)
    }

    pub fn with_distro_filter(mut self, filter: impl Into<String>) -> Self {
        self.distro_filter = filter.into();
        self
    }

    pub fn with_kernel_filter(mut self, filter: impl Into<String>) -> Self {
        self.kernel_filter = filter.into();
        self
    }

    pub fn matches_distro(&self, distro_release: &str) -> bool {
        distro_release.starts_with(&self.distro_filter)
    }

    pub fn matches_kernel(&self, kernel_release: &str) -> bool {
        kernel_release.contains(&self.kernel_filter)
    }
}

impl Default for CrawlerFilter {
    fn default() -> Self {
        Self::host()
    }
}

/// Debian-style architecture name for a machine.
pub fn package_arch(machine: &str) -> &str {
    match machine {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
