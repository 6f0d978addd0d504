use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use futures_util::future::{self, FutureExt, LocalBoxFuture};
use thiserror::Error;
use url::Url;

use crate::config::DEFAULT_BASE_URL;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("file error: {0}")]
    File(String),
    #[error("no resource registered for {0}")]
    Missing(String),
}

/// Whether cookies accompany a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials {
    Include,
    Omit,
}

impl Credentials {
    /// Same-origin requests and explicitly trusted hosts carry credentials.
    pub fn for_url(url: &Url, origin: &Url, credential_hosts: &[String]) -> Self {
        if let Some(host) = url.host_str() {
            if credential_hosts
                .iter()
                .any(|trusted| host == trusted || host.ends_with(&format!(".{trusted}")))
            {
                return Credentials::Include;
            }
        }

        if url.origin() == origin.origin() {
            Credentials::Include
        } else {
            Credentials::Omit
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: Url,
    pub credentials: Credentials,
}

pub type FetchFuture = LocalBoxFuture<'static, Result<String, FetchError>>;

/// Source of bundle and document text.
pub trait BundleFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture;
}

pub fn resolve_url(raw: &str, base: &Url) -> Result<Url, FetchError> {
    if raw.starts_with("http://")
        || raw.starts_with("https://")
        || raw.starts_with("file://")
        || raw.starts_with("about:")
    {
        return Url::parse(raw).map_err(|err| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        });
    }

    base.join(raw).map_err(|err| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: format!("failed to resolve relative to {base}: {err}"),
    })
}

/// Fetches over HTTP(S) with `reqwest` and reads `file://` URLs from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
    cookie: Option<String>,
}

impl HttpFetcher {
    pub fn new(cookie: Option<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self { client, cookie })
    }
}

impl BundleFetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let client = self.client.clone();
        let cookie = match request.credentials {
            Credentials::Include => self.cookie.clone(),
            Credentials::Omit => None,
        };

        async move {
            let url = request.url;
            if url.scheme() == "file" {
                let path = url.to_file_path().map_err(|_| FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: "not a local path".to_string(),
                })?;
                return tokio::fs::read_to_string(path)
                    .await
                    .map_err(|err| FetchError::File(err.to_string()));
            }

            tracing::debug!(target: "fetch", url = %url, "fetching");
            let mut builder = client.get(url.clone());
            if let Some(cookie) = cookie {
                builder = builder.header(reqwest::header::COOKIE, cookie);
            }

            let response = builder
                .send()
                .await
                .map_err(|err| FetchError::Network(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            response
                .text()
                .await
                .map_err(|err| FetchError::Network(err.to_string()))
        }
        .boxed_local()
    }
}

enum StaticEntry {
    Body(String),
    Hang,
}

/// In-memory resources keyed by absolute URL. Relative keys resolve against
/// the default base URL.
pub struct StaticFetcher {
    base: Url,
    entries: RefCell<HashMap<String, StaticEntry>>,
    failures: RefCell<HashMap<String, VecDeque<String>>>,
    requests: RefCell<Vec<FetchRequest>>,
}

impl Default for StaticFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticFetcher {
    pub fn new() -> Self {
        let base = Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid");
        Self::with_base(base)
    }

    pub fn with_base(base: Url) -> Self {
        Self {
            base,
            entries: RefCell::new(HashMap::new()),
            failures: RefCell::new(HashMap::new()),
            requests: RefCell::new(Vec::new()),
        }
    }

    fn key(&self, raw: &str) -> String {
        resolve_url(raw, &self.base)
            .map(|url| url.to_string())
            .unwrap_or_else(|_| raw.to_string())
    }

    pub fn insert(&self, url: &str, body: impl Into<String>) {
        let key = self.key(url);
        self.entries
            .borrow_mut()
            .insert(key, StaticEntry::Body(body.into()));
    }

    /// The request never completes.
    pub fn hang(&self, url: &str) {
        let key = self.key(url);
        self.entries.borrow_mut().insert(key, StaticEntry::Hang);
    }

    /// The next request for `url` fails; later ones use the registered entry.
    pub fn fail_next(&self, url: &str, reason: impl Into<String>) {
        let key = self.key(url);
        self.failures
            .borrow_mut()
            .entry(key)
            .or_default()
            .push_back(reason.into());
    }

    pub fn request_count(&self, url: &str) -> usize {
        let key = self.key(url);
        self.requests
            .borrow()
            .iter()
            .filter(|request| request.url.as_str() == key)
            .count()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.borrow().clone()
    }
}

impl BundleFetcher for StaticFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchFuture {
        let key = request.url.to_string();
        self.requests.borrow_mut().push(request);

        let failure = self
            .failures
            .borrow_mut()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        if let Some(reason) = failure {
            return future::ready(Err(FetchError::Network(reason))).boxed_local();
        }

        match self.entries.borrow().get(&key) {
            Some(StaticEntry::Body(body)) => future::ready(Ok(body.clone())).boxed_local(),
            Some(StaticEntry::Hang) => future::pending().boxed_local(),
            None => future::ready(Err(FetchError::Missing(key))).boxed_local(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://base.com/app/page.html").unwrap()
    }

    #[test]
    fn test_resolve_url_absolute() {
        let result = resolve_url("https://example.com/script.js", &base());
        assert_eq!(result.unwrap().as_str(), "https://example.com/script.js");
    }

    #[test]
    fn test_resolve_url_relative_path() {
        let result = resolve_url("../lib/script.js", &base());
        assert_eq!(result.unwrap().as_str(), "https://base.com/lib/script.js");
    }

    #[test]
    fn test_resolve_url_absolute_path() {
        let result = resolve_url("/assets/script.js", &base());
        assert_eq!(result.unwrap().as_str(), "https://base.com/assets/script.js");
    }

    #[test]
    fn same_origin_includes_credentials() {
        let url = Url::parse("https://base.com/a.js").unwrap();
        assert_eq!(Credentials::for_url(&url, &base(), &[]), Credentials::Include);
    }

    #[test]
    fn cross_origin_omits_credentials_unless_trusted() {
        let url = Url::parse("https://static.cdn.example/a.js").unwrap();
        assert_eq!(Credentials::for_url(&url, &base(), &[]), Credentials::Omit);
        let trusted = vec!["cdn.example".to_string()];
        assert_eq!(
            Credentials::for_url(&url, &base(), &trusted),
            Credentials::Include
        );
    }

    #[tokio::test]
    async fn static_fetcher_serves_failures_before_bodies() {
        let fetcher = StaticFetcher::new();
        fetcher.insert("/a.js", "body");
        fetcher.fail_next("/a.js", "boom");
        let url = Url::parse("http://localhost/a.js").unwrap();
        let request = FetchRequest {
            url,
            credentials: Credentials::Include,
        };

        let first = fetcher.fetch(request.clone()).await;
        assert_eq!(first, Err(FetchError::Network("boom".to_string())));
        let second = fetcher.fetch(request).await;
        assert_eq!(second.as_deref(), Ok("body"));
        assert_eq!(fetcher.request_count("/a.js"), 2);
    }

    #[tokio::test]
    async fn static_fetcher_reports_missing() {
        let fetcher = StaticFetcher::new();
        let url = Url::parse("http://localhost/none.js").unwrap();
        let result = fetcher
            .fetch(FetchRequest {
                url,
                credentials: Credentials::Omit,
            })
            .await;
        assert!(matches!(result, Err(FetchError::Missing(_))));
    }
}
