//! Optional TOML configuration.
//!
//! ```toml
//! [download]
//! concurrency = 4
//! timeout_secs = 60
//! retries = 3
//!
//! [build]
//! jobs = 8
//! image_prefix = "registry.example.com/"
//! builder_source = "/opt/probe-builder"
//! blacklist = "/opt/probe-builder/blacklist.yaml"
//!
//! [crawl]
//! workers = 16
//! ```
//!
//! Every key is optional; command line flags override the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::crawler::DEFAULT_CRAWL_WORKERS;
use crate::download::DownloadConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub download: DownloadConfig,
    pub build: BuildConfig,
    pub crawl: CrawlConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    /// Kernels built in parallel.
    pub jobs: usize,
    /// Registry prefix of pre-built builder images.
    pub image_prefix: String,
    /// Directory holding the builder Dockerfiles.
    pub builder_source: Option<PathBuf>,
    /// Workspace root, the current directory when unset.
    pub workspace: Option<PathBuf>,
    /// Skip rule document.
    pub blacklist: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            image_prefix: String::new(),
            builder_source: None,
            workspace: None,
            blacklist: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CrawlConfig {
    /// Concurrent index requests while crawling.
    pub workers: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_CRAWL_WORKERS,
        }
    }
}

/// `$XDG_CONFIG_HOME/probe-builder/config.toml` (or the platform equivalent).
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("probe-builder").join("config.toml"))
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// An explicit path must exist; the default location is optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}
