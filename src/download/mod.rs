//! Resumable, idempotent package downloads.
//!
//! - A destination that already exists is never fetched again
//! - Data lands in `<destination>.part` and is renamed into place only once
//!   complete, so a destination is either absent or whole
//! - An existing `.part` is resumed with a byte-range request: `206` appends,
//!   `416` means the partial file is already complete, a plain `200` (server
//!   ignores ranges) restarts from zero
//! - Several URLs may serve the same destination; they are tried in order
//!   and the first success wins
//!
//! Batches run on a dedicated pool of `concurrency` threads.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::Fetch;

/// Download settings shared by every file of a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DownloadConfig {
    /// Files downloaded in parallel.
    pub concurrency: usize,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per URL before moving to the next one.
    pub retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout_secs: 120,
            retries: 1,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One destination and the URLs that can provide it, in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub urls: Vec<String>,
    pub destination: PathBuf,
}

/// What a single file download did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    AlreadyPresent,
    Completed { bytes: u64 },
}

/// Final state of one destination in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    AlreadyPresent,
    Downloaded { url: String, bytes: u64 },
    Failed { errors: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub destination: PathBuf,
    pub outcome: DownloadOutcome,
}

/// Outcome of every destination of a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
}

impl BatchReport {
    /// Body bytes received over the network by this batch.
    pub fn bytes_transferred(&self) -> u64 {
        self.files
            .iter()
            .map(|f| match f.outcome {
                DownloadOutcome::Downloaded { bytes, .. } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, DownloadOutcome::Failed { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, destination: &Path) -> Option<&DownloadOutcome> {
        self.files
            .iter()
            .find(|f| f.destination == destination)
            .map(|f| &f.outcome)
    }
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), error = %e, "rename across devices, copying");
            fs::copy(src, dst)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src).with_context(|| format!("Failed to remove tmp {}", src.display()))?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to rename {} to {}", src.display(), dst.display())),
    }
}

/// Append the remainder of `url` to `part`; returns body bytes received.
fn fetch_into(fetch: &dyn Fetch, url: &str, part: &Path) -> Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(part)
        .with_context(|| format!("opening {}", part.display()))?;
    let size = file.metadata()?.len();
    let range = (size > 0).then_some(size);

    let mut resp = fetch.request(url, range)?;
    match resp.status {
        206 => {}
        416 => return Ok(0),
        200 => {
            if size > 0 {
                tracing::debug!(url = %url, "server ignored range request, restarting");
            }
            file.set_len(0)?;
        }
        status => bail!("HTTP {} fetching {}", status, url),
    }
    let bytes = io::copy(&mut resp.body, &mut file).with_context(|| format!("receiving {}", url))?;
    file.sync_all()?;
    Ok(bytes)
}

/// Download `url` to `output`, resuming a previous partial transfer.
///
/// Makes up to `retries` attempts (at least one).
pub fn download_file(fetch: &dyn Fetch, url: &str, output: &Path, retries: u32) -> Result<Transfer> {
    if output.exists() {
        return Ok(Transfer::AlreadyPresent);
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let part = part_path(output);
    let attempts = retries.max(1);
    let mut received = 0;
    let mut last_err = None;

    for attempt in 1..=attempts {
        match fetch_into(fetch, url, &part) {
            Ok(bytes) => {
                received += bytes;
                atomic_rename(&part, output)?;
                tracing::debug!(url = %url, bytes = received, "downloaded");
                return Ok(Transfer::Completed { bytes: received });
            }
            Err(e) => {
                tracing::warn!(url = %url, attempt, attempts, error = %format!("{:#}", e), "download attempt failed");
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e.context(format!("giving up on {} after {} attempt(s)", url, attempts))),
        None => bail!("no attempt made for {}", url),
    }
}

/// Merge tasks sharing a destination, keeping the first-seen URL order.
fn group_by_destination(tasks: Vec<DownloadTask>) -> BTreeMap<PathBuf, Vec<String>> {
    let mut grouped: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    for task in tasks {
        let urls = grouped.entry(task.destination).or_default();
        for url in task.urls {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    grouped
}

fn download_one(fetch: &dyn Fetch, destination: &Path, urls: &[String], retries: u32) -> DownloadOutcome {
    let mut errors = Vec::new();
    for url in urls {
        match download_file(fetch, url, destination, retries) {
            Ok(Transfer::AlreadyPresent) => return DownloadOutcome::AlreadyPresent,
            Ok(Transfer::Completed { bytes }) => {
                return DownloadOutcome::Downloaded {
                    url: url.clone(),
                    bytes,
                }
            }
            Err(e) => errors.push(format!("{:#}", e)),
        }
    }
    tracing::error!(destination = %destination.display(), "every source failed");
    DownloadOutcome::Failed { errors }
}

/// Download a set of tasks on a pool of `config.concurrency` threads.
pub fn download_tasks(fetch: &dyn Fetch, tasks: Vec<DownloadTask>, config: &DownloadConfig) -> Result<BatchReport> {
    let grouped: Vec<(PathBuf, Vec<String>)> = group_by_destination(tasks).into_iter().collect();
    tracing::info!(files = grouped.len(), concurrency = config.concurrency, "downloading");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.concurrency.max(1))
        .thread_name(|i| format!("download-{}", i))
        .build()
        .context("creating download thread pool")?;

    let files = pool.install(|| {
        grouped
            .into_par_iter()
            .map(|(destination, urls)| {
                let outcome = download_one(fetch, &destination, &urls, config.retries);
                FileReport { destination, outcome }
            })
            .collect()
    });
    Ok(BatchReport { files })
}

/// Last path segment of a URL.
pub fn url_basename(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

/// Download `urls` into `dest_dir`, one file per distinct basename.
pub fn download_batch<I, S>(fetch: &dyn Fetch, urls: I, dest_dir: &Path, config: &DownloadConfig) -> Result<BatchReport>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tasks = urls
        .into_iter()
        .map(|url| {
            let url = url.as_ref();
            DownloadTask {
                urls: vec![url.to_string()],
                destination: dest_dir.join(url_basename(url)),
            }
        })
        .collect();
    download_tasks(fetch, tasks, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{FetchError, MemoryFetch, Response};
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_second_batch_transfers_nothing() {
        let temp = TempDir::new().unwrap();
        let fetch = MemoryFetch::new();
        fetch.insert("http://m/pool/a.deb", vec![1u8; 1000]);
        fetch.insert("http://m/pool/b.deb", vec![2u8; 500]);
        let urls = ["http://m/pool/a.deb", "http://m/pool/b.deb"];
        let config = DownloadConfig {
            concurrency: 2,
            ..Default::default()
        };

        let first = download_batch(&fetch, urls, temp.path(), &config).unwrap();
        assert_eq!(first.bytes_transferred(), 1500);
        assert!(first.is_complete());

        let served = fetch.bytes_served();
        let second = download_batch(&fetch, urls, temp.path(), &config).unwrap();
        assert_eq!(second.bytes_transferred(), 0);
        assert_eq!(fetch.bytes_served(), served);
        assert_eq!(
            second.outcome(&temp.path().join("a.deb")),
            Some(&DownloadOutcome::AlreadyPresent)
        );
        assert_eq!(fs::read(temp.path().join("b.deb")).unwrap(), vec![2u8; 500]);
    }

    #[test]
    fn test_resume_partial_file() {
        let temp = TempDir::new().unwrap();
        let fetch = MemoryFetch::new();
        fetch.insert("http://m/f.rpm", "0123456789");
        let output = temp.path().join("f.rpm");
        fs::write(part_path(&output), "0123").unwrap();

        let transfer = download_file(&fetch, "http://m/f.rpm", &output, 1).unwrap();
        assert_eq!(transfer, Transfer::Completed { bytes: 6 });
        assert_eq!(fs::read_to_string(&output).unwrap(), "0123456789");
        assert!(!part_path(&output).exists());
    }

    #[test]
    fn test_complete_partial_file_is_renamed() {
        let temp = TempDir::new().unwrap();
        let fetch = MemoryFetch::new();
        fetch.insert("http://m/f.rpm", "0123456789");
        let output = temp.path().join("f.rpm");
        fs::write(part_path(&output), "0123456789").unwrap();

        let transfer = download_file(&fetch, "http://m/f.rpm", &output, 1).unwrap();
        assert_eq!(transfer, Transfer::Completed { bytes: 0 });
        assert_eq!(fs::read_to_string(&output).unwrap(), "0123456789");
    }

    /// Serves whole bodies with 200 whatever range was asked for.
    struct NoRanges;

    impl Fetch for NoRanges {
        fn request(&self, _url: &str, _range_from: Option<u64>) -> Result<Response, FetchError> {
            Ok(Response {
                status: 200,
                body: Box::new(Cursor::new(b"fresh".to_vec())),
            })
        }
    }

    #[test]
    fn test_full_response_restarts_partial_file() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("f.deb");
        fs::write(part_path(&output), "stale-bytes").unwrap();

        download_file(&NoRanges, "http://m/f.deb", &output, 1).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "fresh");
    }

    #[test]
    fn test_falls_back_to_next_url() {
        let temp = TempDir::new().unwrap();
        let fetch = MemoryFetch::new();
        fetch.insert("http://second/k.deb", "kernel");
        let tasks = vec![
            DownloadTask {
                urls: vec!["http://first/k.deb".into()],
                destination: temp.path().join("k.deb"),
            },
            DownloadTask {
                urls: vec!["http://second/k.deb".into()],
                destination: temp.path().join("k.deb"),
            },
        ];

        let report = download_tasks(&fetch, tasks, &DownloadConfig::default()).unwrap();
        assert_eq!(report.files.len(), 1);
        assert_eq!(
            report.files[0].outcome,
            DownloadOutcome::Downloaded {
                url: "http://second/k.deb".into(),
                bytes: 6
            }
        );
    }

    #[test]
    fn test_retries_then_reports_failure() {
        let temp = TempDir::new().unwrap();
        let fetch = MemoryFetch::new();
        fetch.fail_with("http://m/broken.deb", 503);

        let config = DownloadConfig {
            retries: 3,
            ..Default::default()
        };
        let report = download_batch(&fetch, ["http://m/broken.deb"], temp.path(), &config).unwrap();
        assert!(!report.is_complete());
        assert_eq!(fetch.requests().len(), 3);
        assert!(!temp.path().join("broken.deb").exists());
        match &report.files[0].outcome {
            DownloadOutcome::Failed { errors } => assert!(errors[0].contains("503")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_atomic_rename_reports_rename_error() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("a.deb.part");
        let dest = temp.path().join("a.deb");

        let err = atomic_rename(&part, &dest).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to rename"));
        assert!(!dest.exists());

        fs::write(&part, b"data").unwrap();
        atomic_rename(&part, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"data");
        assert!(!part.exists());
    }

    #[test]
    fn test_url_basename() {
        assert_eq!(url_basename("http://m/pool/main/l/linux/a_1_amd64.deb"), "a_1_amd64.deb");
        assert_eq!(url_basename("plain"), "plain");
    }
}
