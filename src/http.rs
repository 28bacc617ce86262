//! HTTP access for crawling and downloading.
//!
//! All network traffic goes through the [`Fetch`] trait. [`HttpClient`] is the
//! real implementation (blocking `reqwest` with a request timeout);
//! [`MemoryFetch`] serves fixed bodies from memory and is what the tests and
//! offline runs use.

use flate2::read::GzDecoder;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("reading response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decompressing {url}: {message}")]
    Decompress { url: String, message: String },

    #[error("none of the candidate URLs could be fetched")]
    NoCandidates,
}

impl FetchError {
    /// Status code for HTTP-level failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A response whose body has not been read yet.
pub struct Response {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait Fetch: Send + Sync {
    /// Issue a GET, optionally asking for the bytes from `range_from` on.
    ///
    /// Non-2xx statuses are returned as a [`Response`], not as an error; the
    /// download manager needs to see 206/416 itself.
    fn request(&self, url: &str, range_from: Option<u64>) -> Result<Response, FetchError>;
}

/// Blocking HTTP client with a per-request timeout.
pub struct HttpClient {
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("probe-builder/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpClient {
    fn request(&self, url: &str, range_from: Option<u64>) -> Result<Response, FetchError> {
        let mut req = self.client.get(url);
        if let Some(offset) = range_from {
            req = req.header(RANGE, format!("bytes={}-", offset));
        }
        let resp = req.send().map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Response {
            status: resp.status().as_u16(),
            body: Box::new(resp),
        })
    }
}

/// Fetch a whole body, failing on non-2xx.
pub fn get(fetch: &dyn Fetch, url: &str) -> Result<Vec<u8>, FetchError> {
    let mut resp = fetch.request(url, None)?;
    if !resp.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: resp.status,
        });
    }
    let mut body = Vec::new();
    resp.body
        .read_to_end(&mut body)
        .map_err(|source| FetchError::Body {
            url: url.to_string(),
            source,
        })?;
    Ok(body)
}

/// Fetch a body as text (lossy UTF-8).
pub fn get_text(fetch: &dyn Fetch, url: &str) -> Result<String, FetchError> {
    get_url(fetch, url).map(|body| String::from_utf8_lossy(&body).into_owned())
}

/// Fetch a body and transparently decompress `.gz` and `.xz` payloads.
pub fn get_url(fetch: &dyn Fetch, url: &str) -> Result<Vec<u8>, FetchError> {
    let body = get(fetch, url)?;
    decompress(url, body)
}

fn decompress(url: &str, body: Vec<u8>) -> Result<Vec<u8>, FetchError> {
    if url.ends_with(".gz") {
        let mut out = Vec::new();
        GzDecoder::new(Cursor::new(body))
            .read_to_end(&mut out)
            .map_err(|e| FetchError::Decompress {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(out)
    } else if url.ends_with(".xz") {
        lzma::decompress(&body).map_err(|e| FetchError::Decompress {
            url: url.to_string(),
            message: e.to_string(),
        })
    } else {
        Ok(body)
    }
}

/// Try each URL in order; return the first body that could be fetched.
///
/// On total failure the last error is returned.
pub fn get_first_of(fetch: &dyn Fetch, urls: &[String]) -> Result<Vec<u8>, FetchError> {
    let mut last_err = FetchError::NoCandidates;
    for url in urls {
        match get_url(fetch, url) {
            Ok(body) => return Ok(body),
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "candidate URL failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// `href` targets of every anchor in an HTML directory index.
pub fn index_links(html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    Html::parse_document(html)
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_string)
        .collect()
}

/// In-memory [`Fetch`] serving fixed bodies, with byte-range support.
///
/// Unknown URLs answer 404. Every body byte handed out is counted, which
/// lets callers assert that a repeated download transferred nothing.
#[derive(Default)]
pub struct MemoryFetch {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    statuses: Mutex<HashMap<String, u16>>,
    served: AtomicU64,
    requests: Mutex<Vec<String>>,
}

impl MemoryFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.bodies.lock().insert(url.into(), body.into());
    }

    /// Force a status for a URL regardless of its body.
    pub fn fail_with(&self, url: impl Into<String>, status: u16) {
        self.statuses.lock().insert(url.into(), status);
    }

    pub fn bytes_served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Fetch for MemoryFetch {
    fn request(&self, url: &str, range_from: Option<u64>) -> Result<Response, FetchError> {
        self.requests.lock().push(url.to_string());
        if let Some(status) = self.statuses.lock().get(url) {
            return Ok(Response {
                status: *status,
                body: Box::new(Cursor::new(Vec::new())),
            });
        }
        let Some(body) = self.bodies.lock().get(url).cloned() else {
            return Ok(Response {
                status: 404,
                body: Box::new(Cursor::new(Vec::new())),
            });
        };

        let (status, payload) = match range_from {
            Some(offset) if offset >= body.len() as u64 => (416, Vec::new()),
            Some(offset) if offset > 0 => (206, body[offset as usize..].to_vec()),
            _ => (200, body),
        };
        self.served.fetch_add(payload.len() as u64, Ordering::SeqCst);
        Ok(Response {
            status,
            body: Box::new(Cursor::new(payload)),
        })
    }
}
