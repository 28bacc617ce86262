//! Kernel probe builder.
//!
//! Finds every kernel a distribution ever shipped, fetches the packages
//! needed to compile against it and drives containerized builds of the
//! kernel module (`.ko`) and eBPF (`.o`) probes for each release.
//!
//! # Architecture
//!
//! ```text
//! crawler ──> download ──> builder::distro ──> builder ──> report
//!  │            │            │ batch + unpack    │ toolchain, blacklist,
//!  │ mirrors,   │ resumable  │ per family        │ docker workers
//!  │ rpm / deb  │ .part      │                   │
//!  │ resolvers  │ files      │                   │
//! ```
//!
//! - **[`crawler`]** - mirror/repository hierarchy and package resolvers
//! - **[`download`]** - idempotent, resumable batch downloads
//! - **[`builder`]** - per-family unpacking and the build orchestrator
//! - **[`toolchain`]** - builder image selection
//! - **[`blacklist`]** - data-driven skip rules
//! - **[`preflight`]** - host tool validation
//!
//! # Example
//!
//! ```rust,ignore
//! use probe_builder::crawler::{crawl_kernels, CrawlContext, CrawlerFilter, DistroKind};
//! use probe_builder::http::HttpClient;
//!
//! let fetch = Arc::new(HttpClient::new(Duration::from_secs(120))?);
//! let ctx = CrawlContext::new(fetch, 8)?;
//! for (release, files) in crawl_kernels(&ctx, DistroKind::Debian, &CrawlerFilter::host())? {
//!     println!("{release}: {} files", files.len());
//! }
//! ```

pub mod blacklist;
pub mod builder;
pub mod config;
pub mod crawler;
pub mod download;
pub mod http;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod report;
pub mod toolchain;
pub mod unpack;
pub mod version;

pub use builder::{KernelBuildResult, ProbeBuildResult, ProbeBuilder, Workspace};
pub use crawler::{PackageTree, ReleaseKey};
pub use probe::{Probe, ProbeKind};
