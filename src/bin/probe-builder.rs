use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use probe_builder::blacklist::Blacklist;
use probe_builder::builder::pipeline::{prepare_kernels, KernelSource};
use probe_builder::builder::{ContainerRuntime, Docker, KernelType, ProbeBuilder, Workspace};
use probe_builder::config::Config;
use probe_builder::crawler::{crawl_kernels, CrawlContext, CrawlerFilter, DistroKind};
use probe_builder::http::HttpClient;
use probe_builder::preflight;
use probe_builder::probe::{self, Probe};
use probe_builder::report::BuildReport;
use probe_builder::toolchain::ToolchainCache;

const LOG_ENV: &str = "PROBE_BUILDER_LOG";

#[derive(Parser)]
#[command(name = "probe-builder", version, about = "Build kernel probes for every kernel of a distribution")]
struct Cli {
    /// Log at debug level.
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (default: <config dir>/probe-builder/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the kernel packages of a distribution.
    Crawl(CrawlArgs),
    /// Download, unpack and build probes for a kernel type.
    Build(BuildArgs),
}

#[derive(Args)]
struct CrawlArgs {
    distro: DistroKind,
    /// Only distribution releases starting with this.
    #[arg(default_value = "")]
    distro_filter: String,
    /// Only kernel releases containing this.
    #[arg(default_value = "")]
    kernel_filter: String,
}

#[derive(Args)]
struct BuildArgs {
    /// Distribution to crawl, or Custom<Family> for local packages.
    #[arg(short = 'k', long)]
    kernel_type: KernelType,
    #[arg(short = 'p', long)]
    probe_name: String,
    #[arg(short = 'v', long)]
    probe_version: String,
    /// Probe sources; cloned from git when omitted.
    #[arg(short = 's', long)]
    source_dir: Option<PathBuf>,
    #[arg(short = 'j', long)]
    jobs: Option<usize>,
    #[arg(short = 'd', long)]
    download_concurrency: Option<usize>,
    /// Download timeout in seconds.
    #[arg(short = 't', long)]
    download_timeout: Option<u64>,
    #[arg(short = 'r', long)]
    retries: Option<u32>,
    /// Registry prefix of pre-built builder images.
    #[arg(short = 'b', long)]
    builder_image_prefix: Option<String>,
    #[arg(short = 'R', long, default_value = "")]
    distro_filter: String,
    #[arg(short = 'f', long, default_value = "")]
    kernel_filter: String,
    /// Workspace root (default: current directory).
    #[arg(short = 'w', long)]
    workspace: Option<PathBuf>,
    /// Directory with the builder Dockerfiles (default: current directory).
    #[arg(long)]
    builder_source: Option<PathBuf>,
    /// Skip rule document.
    #[arg(long)]
    blacklist: Option<PathBuf>,
    /// Also write the report as JSON.
    #[arg(long)]
    report_json: Option<PathBuf>,
    /// Package files, for Custom* kernel types.
    packages: Vec<PathBuf>,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let config = Config::resolve(cli.config.as_deref())?;

    match cli.command {
        Command::Crawl(args) => crawl(&config, args),
        Command::Build(args) => build(config, args),
    }
}

fn crawl(config: &Config, args: CrawlArgs) -> Result<ExitCode> {
    let fetch = Arc::new(HttpClient::new(config.download.timeout())?);
    let ctx = CrawlContext::new(fetch, config.crawl.workers)?;
    let filter = CrawlerFilter::host()
        .with_distro_filter(args.distro_filter)
        .with_kernel_filter(args.kernel_filter);

    let tree = crawl_kernels(&ctx, args.distro, &filter)?;
    for (release, urls) in tree.iter() {
        println!("=== {} ===", release);
        for url in urls {
            println!(" {}", url);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn build(mut config: Config, args: BuildArgs) -> Result<ExitCode> {
    if let Some(concurrency) = args.download_concurrency {
        config.download.concurrency = concurrency;
    }
    if let Some(timeout) = args.download_timeout {
        config.download.timeout_secs = timeout;
    }
    if let Some(retries) = args.retries {
        config.download.retries = retries;
    }
    let jobs = args.jobs.unwrap_or(config.build.jobs);
    let image_prefix = args.builder_image_prefix.unwrap_or(config.build.image_prefix);
    let blacklist_path = args.blacklist.or(config.build.blacklist);

    let kernel_type = args.kernel_type;
    preflight::check_build_tools(kernel_type.family(), args.source_dir.is_none())?;

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let root = args.workspace.or(config.build.workspace).unwrap_or_else(|| cwd.clone());
    let builder_source = args.builder_source.or(config.build.builder_source).unwrap_or(cwd);

    let runtime = Docker;
    let workspace = Workspace::new(&root, &builder_source)?
        .with_image_prefix(image_prefix)
        .with_mounts(runtime.self_mounts().unwrap_or_default());
    let output_dir = workspace.output_dir();
    fs::create_dir_all(&output_dir).with_context(|| format!("creating {}", output_dir.display()))?;

    let blacklist = match &blacklist_path {
        Some(path) => Blacklist::load(path, &args.probe_version)?,
        None => Blacklist::empty(&args.probe_version),
    };
    let source = probe::resolve_source(
        &args.probe_name,
        &args.probe_version,
        args.source_dir.as_deref(),
        workspace.root(),
    )?;
    let probe = Probe::new(&args.probe_name, &args.probe_version, source);

    let trees = match kernel_type {
        KernelType::Crawled(_) => {
            let fetch = Arc::new(HttpClient::new(config.download.timeout())?);
            let ctx = CrawlContext::new(fetch, config.crawl.workers)?;
            let filter = CrawlerFilter::host()
                .with_distro_filter(args.distro_filter)
                .with_kernel_filter(args.kernel_filter);
            prepare_kernels(
                &workspace,
                kernel_type,
                KernelSource::Crawl {
                    ctx: &ctx,
                    filter: &filter,
                    download: &config.download,
                },
            )?
        }
        KernelType::Custom(_) => prepare_kernels(&workspace, kernel_type, KernelSource::Packages(&args.packages))?,
    };

    let toolchains = ToolchainCache::new();
    let builder = ProbeBuilder {
        workspace: &workspace,
        probe: &probe,
        blacklist: &blacklist,
        runtime: &runtime,
        toolchains: &toolchains,
        family: kernel_type.family(),
    };
    let results = builder.build_all(&trees, jobs)?;

    let report = BuildReport::new(kernel_type.to_string(), &probe.name, &probe.version, results);
    print!("{}", report.render_table());
    if let Some(path) = &args.report_json {
        report.write_json(path)?;
    }

    Ok(if report.has_failures() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
