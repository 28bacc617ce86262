//! Probe builds against unpacked kernel trees.
//!
//! For every kernel release both probe kinds go through the same steps:
//!
//! ```text
//! output exists?  ── yes ──> AlreadyExisting
//!      │ no
//! skip reason?    ── yes ──> Skipped      (skip rules, unsupported kernel,
//!      │ no                                eBPF before 4.14, image without eBPF)
//! run worker      ────────> Built | Failed (built iff the output file exists)
//! ```
//!
//! The builder image for a release is picked by [`crate::toolchain`] and
//! prepared at most once per run through the shared [`ToolchainCache`].

pub mod distro;
pub mod docker;
pub mod pipeline;
pub mod workspace;

pub use distro::{BuilderFamily, DistroBuilder, KernelTree, KernelType};
pub use docker::{ContainerRuntime, Docker, RunSpec, Volume, WorkerOutput};
pub use workspace::Workspace;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::blacklist::Blacklist;
use crate::crawler::ReleaseKey;
use crate::probe::{Probe, ProbeKind};
use crate::toolchain::{self, BuildToolchain, ToolchainCache};
use crate::version::Version;
use workspace::{OUTPUT_MOUNT, SOURCE_MOUNT, WORKSPACE_MOUNT};

/// `(kernel release, config hash)` pairs the probes are known not to build on.
pub const SKIPPED_KERNELS: &[(&str, &str)] = &[
    ("4.15.0-29-generic", "ea0aa038a6b9bdc4bb42152682bba6ce"),
    ("5.8.0-1023-aws", "3f7746be1bef4c3f68f5465d8453fa4d"),
];

/// Oldest kernel the eBPF probe supports.
const MIN_EBPF_KERNEL: [u32; 2] = [4, 14];

fn as_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Result of building one probe kind for one kernel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeBuildResult {
    Built {
        #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
        elapsed: Duration,
    },
    AlreadyExisting,
    Skipped {
        reason: String,
    },
    Failed {
        #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
        elapsed: Duration,
        output: String,
    },
}

impl ProbeBuildResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, ProbeBuildResult::Failed { .. })
    }

    /// Short status word for reports.
    pub fn status(&self) -> &'static str {
        match self {
            ProbeBuildResult::Built { .. } => "built",
            ProbeBuildResult::AlreadyExisting => "existing",
            ProbeBuildResult::Skipped { .. } => "skipped",
            ProbeBuildResult::Failed { .. } => "failed",
        }
    }

    fn failed(error: &anyhow::Error) -> Self {
        ProbeBuildResult::Failed {
            elapsed: Duration::ZERO,
            output: format!("{:#}", error),
        }
    }
}

/// Both probe results for one kernel release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelBuildResult {
    pub release: ReleaseKey,
    /// Release as used in output file names.
    pub kernel_release: String,
    pub config_hash: Option<String>,
    pub kmod: ProbeBuildResult,
    pub ebpf: ProbeBuildResult,
}

impl KernelBuildResult {
    pub fn failed(&self) -> bool {
        self.kmod.is_failed() || self.ebpf.is_failed()
    }

    pub fn result(&self, kind: ProbeKind) -> &ProbeBuildResult {
        match kind {
            ProbeKind::Kmod => &self.kmod,
            ProbeKind::Ebpf => &self.ebpf,
        }
    }
}

/// What a build worker needs to know about one kernel.
struct KernelTarget {
    kernel_dir: PathBuf,
    kernel_release: String,
    config_hash: String,
}

/// Drives the build workers for one probe and builder family.
pub struct ProbeBuilder<'a> {
    pub workspace: &'a Workspace,
    pub probe: &'a Probe,
    pub blacklist: &'a Blacklist,
    pub runtime: &'a dyn ContainerRuntime,
    pub toolchains: &'a ToolchainCache,
    pub family: BuilderFamily,
}

impl ProbeBuilder<'_> {
    fn output_path(&self, kind: ProbeKind, target: &KernelTarget) -> PathBuf {
        self.workspace.output_dir().join(self.probe.output_file(
            kind,
            self.workspace.machine(),
            &target.kernel_release,
            &target.config_hash,
        ))
    }

    /// Why `kind` must not be built for this kernel, if it must not.
    pub fn skip_reason(&self, kind: ProbeKind, kernel_release: &str, config_hash: &str) -> Option<String> {
        if let Some(reason) = self.blacklist.reason(kind, kernel_release) {
            return Some(reason);
        }
        if SKIPPED_KERNELS.contains(&(kernel_release, config_hash)) {
            return Some("Unsupported kernel".to_string());
        }
        if kind == ProbeKind::Ebpf {
            let min = Version::new(&MIN_EBPF_KERNEL);
            match Version::parse_prefix(kernel_release) {
                Some(version) if version >= min => {}
                _ => {
                    return Some(format!(
                        "Kernel {} too old to support eBPF (need at least {})",
                        kernel_release, min
                    ))
                }
            }
        }
        None
    }

    /// Result decided without running a worker, if any.
    fn precheck(&self, kind: ProbeKind, target: &KernelTarget) -> Option<ProbeBuildResult> {
        if self.output_path(kind, target).exists() {
            return Some(ProbeBuildResult::AlreadyExisting);
        }
        let reason = self.skip_reason(kind, &target.kernel_release, &target.config_hash)?;
        tracing::info!(
            kind = %kind,
            kernel = %target.kernel_release,
            hash = %target.config_hash,
            reason = %reason,
            "skipping probe build"
        );
        Some(ProbeBuildResult::Skipped { reason })
    }

    fn locate(&self, tree: &KernelTree) -> Result<KernelTarget> {
        let builder = self.family.builder();
        let kernel_dir = builder.kernel_dir(&tree.release, &tree.target)?;
        let config_hash = builder
            .hash_config(&tree.release, &tree.target, &kernel_dir)
            .with_context(|| format!("hashing kernel config of {}", tree.release))?;
        let kernel_release = builder.kernel_release(&tree.release, &kernel_dir);
        Ok(KernelTarget {
            kernel_dir,
            kernel_release,
            config_hash,
        })
    }

    /// Pick the builder image and make sure it exists.
    fn prepare_toolchain(&self, kernel_dir: &Path) -> Result<BuildToolchain> {
        let source = self.workspace.builder_source();
        let toolchain = toolchain::choose_toolchain(source, self.family.name(), kernel_dir)?;
        let prefix = self.workspace.image_prefix();
        self.toolchains.ensure(&toolchain, || {
            if !prefix.is_empty() {
                // pre-built, the runtime pulls it on first use
                return Ok(());
            }
            self.runtime
                .build_image(&toolchain.image_name(prefix), &toolchain.dockerfile, source)
        })?;
        Ok(toolchain)
    }

    fn run_spec(&self, kind: ProbeKind, toolchain: &BuildToolchain, target: &KernelTarget) -> RunSpec {
        let ws = self.workspace;
        let env = [
            ("OUTPUT", OUTPUT_MOUNT.to_string()),
            ("PROBE_NAME", self.probe.name.clone()),
            ("PROBE_VERSION", self.probe.version.clone()),
            ("PROBE_DEVICE_NAME", self.probe.device_name.clone()),
            ("KERNELDIR", ws.container_path(&target.kernel_dir)),
            ("KERNEL_RELEASE", target.kernel_release.clone()),
            ("HASH", target.config_hash.clone()),
            ("HASH_ORIG", target.config_hash.clone()),
        ];
        RunSpec {
            image: toolchain.image_name(ws.image_prefix()),
            volumes: vec![
                Volume::new(ws.host_path(&self.probe.source_dir), SOURCE_MOUNT, true),
                Volume::new(ws.host_path(ws.root()), WORKSPACE_MOUNT, true),
                Volume::new(ws.host_path(&ws.output_dir()), OUTPUT_MOUNT, false),
            ],
            env: env.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            args: kind.worker_args().iter().map(|a| a.to_string()).collect(),
        }
    }

    fn run_worker(&self, kind: ProbeKind, toolchain: &BuildToolchain, target: &KernelTarget) -> ProbeBuildResult {
        let spec = self.run_spec(kind, toolchain, target);
        tracing::info!(
            kind = %kind,
            kernel = %target.kernel_release,
            hash = %target.config_hash,
            image = %spec.image,
            "building probe"
        );

        let started = Instant::now();
        let worker = self.runtime.run(&spec);
        let elapsed = started.elapsed();
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(kind = %kind, kernel = %target.kernel_release, error = %format!("{:#}", e), "worker did not start");
                return ProbeBuildResult::Failed {
                    elapsed,
                    output: format!("{:#}", e),
                };
            }
        };

        if self.output_path(kind, target).exists() {
            tracing::info!(kind = %kind, kernel = %target.kernel_release, elapsed = ?elapsed, "probe built");
            return ProbeBuildResult::Built { elapsed };
        }
        if worker.success {
            tracing::warn!(kind = %kind, kernel = %target.kernel_release, "worker succeeded without an output file");
        } else {
            tracing::error!(kind = %kind, kernel = %target.kernel_release, "probe build failed");
        }
        for line in worker.output.lines() {
            tracing::debug!(kind = %kind, kernel = %target.kernel_release, "{}", line);
        }
        ProbeBuildResult::Failed {
            elapsed,
            output: worker.output,
        }
    }

    /// Build both probe kinds for one unpacked kernel.
    pub fn build_kernel(&self, tree: &KernelTree) -> KernelBuildResult {
        let target = match self.locate(tree) {
            Ok(target) => target,
            Err(e) => {
                // incomplete packages, nothing to build against
                let reason = format!("{:#}", e);
                tracing::error!(release = %tree.release, error = %reason, "kernel tree unusable");
                return KernelBuildResult {
                    release: tree.release.clone(),
                    kernel_release: tree.release.kernel_release_name(),
                    config_hash: None,
                    kmod: ProbeBuildResult::Skipped { reason: reason.clone() },
                    ebpf: ProbeBuildResult::Skipped { reason },
                };
            }
        };

        let mut result = KernelBuildResult {
            release: tree.release.clone(),
            kernel_release: target.kernel_release.clone(),
            config_hash: Some(target.config_hash.clone()),
            kmod: ProbeBuildResult::AlreadyExisting,
            ebpf: ProbeBuildResult::AlreadyExisting,
        };
        let kmod = self.precheck(ProbeKind::Kmod, &target);
        let ebpf = self.precheck(ProbeKind::Ebpf, &target);
        if let (Some(kmod), Some(ebpf)) = (&kmod, &ebpf) {
            result.kmod = kmod.clone();
            result.ebpf = ebpf.clone();
            return result;
        }

        let toolchain = match self.prepare_toolchain(&target.kernel_dir) {
            Ok(toolchain) => toolchain,
            Err(e) => {
                tracing::error!(release = %tree.release, error = %format!("{:#}", e), "no builder image");
                result.kmod = kmod.unwrap_or_else(|| ProbeBuildResult::failed(&e));
                result.ebpf = ebpf.unwrap_or_else(|| ProbeBuildResult::failed(&e));
                return result;
            }
        };

        result.kmod = kmod.unwrap_or_else(|| self.run_worker(ProbeKind::Kmod, &toolchain, &target));
        result.ebpf = ebpf.unwrap_or_else(|| {
            if toolchain.supports_ebpf {
                self.run_worker(ProbeKind::Ebpf, &toolchain, &target)
            } else {
                let reason = format!("Builder {} does not support eBPF", toolchain.tag);
                tracing::info!(kernel = %target.kernel_release, reason = %reason, "skipping probe build");
                ProbeBuildResult::Skipped { reason }
            }
        });
        result
    }

    /// Build every kernel on a pool of `jobs` threads, in input order.
    pub fn build_all(&self, trees: &[KernelTree], jobs: usize) -> Result<Vec<KernelBuildResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs.max(1))
            .thread_name(|i| format!("build-{}", i))
            .build()
            .context("Failed to create build pool")?;
        Ok(pool.install(|| trees.par_iter().map(|tree| self.build_kernel(tree)).collect()))
    }
}
