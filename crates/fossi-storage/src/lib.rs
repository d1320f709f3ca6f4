//! GitHub API fetch utilities + on-disk language cache for FOSSI.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use base64::Engine;
use chrono::NaiveDate;
use fossi_core::{format_date, parse_date, LanguageBreakdown};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fossi-storage";

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Media type that makes the repository endpoints include license information.
pub const GITHUB_ACCEPT: &str = "application/vnd.github.drax-preview+json";

pub const TIMESTAMP_FILE: &str = "ts.json";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected contents document from {url}: {reason}")]
    Contents { url: String, reason: String },
}

/// Extract the `rel="next"` target from a `Link` header.
///
/// The header is a comma-separated list of `<url>; rel="..."` entries.
pub fn next_page_link(header: &str) -> Option<String> {
    header
        .split(',')
        .find(|segment| segment.contains("rel=\"next\""))
        .and_then(|segment| segment.split(';').next())
        .map(|target| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
        .filter(|url| !url.is_empty())
}

#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
}

impl GithubClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("token {token}"))
                .context("building authorization header from TOKEN")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn repo_url(&self, repo_name: &str) -> String {
        format!("{}/repos/{repo_name}", self.api_base)
    }

    pub fn user_repos_url(&self, user_name: &str) -> String {
        format!("{}/users/{user_name}/repos", self.api_base)
    }

    pub fn languages_url(&self, repo_name: &str) -> String {
        format!("{}/repos/{repo_name}/languages", self.api_base)
    }

    pub fn contents_url(&self, repo_name: &str, path: &str, git_ref: &str) -> String {
        format!("{}/repos/{repo_name}/contents/{path}?ref={git_ref}", self.api_base)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let next = resp
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_link);
        let body = resp.bytes().await?.to_vec();
        Ok((body, next))
    }

    /// Fetch `first_page_url`, following `Link: rel="next"` while the payload is a list.
    ///
    /// List pages are concatenated. A non-list payload is returned as soon as it is seen.
    pub async fn try_get(&self, first_page_url: &str) -> Result<JsonValue, FetchError> {
        let mut url = Some(first_page_url.to_string());
        let mut pages = Vec::new();
        while let Some(current) = url.take() {
            let (body, next) = self.fetch_bytes(&current).await?;
            let data: JsonValue =
                serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                    url: current.clone(),
                    source,
                })?;
            match data {
                JsonValue::Array(items) => pages.extend(items),
                other => return Ok(other),
            }
            url = next;
        }
        Ok(JsonValue::Array(pages))
    }

    /// Like [`GithubClient::try_get`], but any failure is logged and degrades to an empty object.
    pub async fn get(&self, first_page_url: &str) -> JsonValue {
        let span = info_span!("github_get", url = first_page_url);
        async {
            match self.try_get(first_page_url).await {
                Ok(data) => data,
                Err(err) => {
                    warn!(url = first_page_url, error = %err, "get failed");
                    JsonValue::Object(Default::default())
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn get_repo(&self, repo_name: &str) -> JsonValue {
        self.get(&self.repo_url(repo_name)).await
    }

    pub async fn get_user_repos(&self, user_name: &str) -> JsonValue {
        self.get(&self.user_repos_url(user_name)).await
    }

    /// Per-language byte counts for a repository, in the order the API lists them.
    pub async fn get_languages(&self, repo_name: &str) -> Result<LanguageBreakdown, FetchError> {
        let url = self.languages_url(repo_name);
        let started = Instant::now();
        let (body, _) = self
            .fetch_bytes(&url)
            .instrument(info_span!("github_languages", repo = repo_name))
            .await?;
        let breakdown = serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.clone(),
            source,
        })?;
        debug!(repo = repo_name, elapsed_ms = started.elapsed().as_millis() as u64, "fetched languages");
        Ok(breakdown)
    }

    /// Fetch a JSON list stored as a file in a repository, decode it and sort it.
    pub async fn try_get_file_list(&self, url: &str) -> Result<Vec<String>, FetchError> {
        let document = self.try_get(url).await?;
        let bytes = decode_contents_document(url, &document)?;
        let mut items: Vec<String> =
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })?;
        items.sort();
        Ok(items)
    }

    pub async fn get_file_list(&self, url: &str) -> Vec<String> {
        let started = Instant::now();
        let items = match self.try_get_file_list(url).await {
            Ok(items) => items,
            Err(err) => {
                warn!(url, error = %err, "get file contents failed");
                Vec::new()
            }
        };
        info!(url, entries = items.len(), elapsed_ms = started.elapsed().as_millis() as u64, "get_file_contents finished");
        items
    }
}

/// Decode the base64 `content` field of a contents API document.
pub fn decode_contents_document(url: &str, document: &JsonValue) -> Result<Vec<u8>, FetchError> {
    let content = document
        .get("content")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| FetchError::Contents {
            url: url.to_string(),
            reason: "missing content field".to_string(),
        })?;
    // The API wraps the payload at 60 columns.
    let compact: String = content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| FetchError::Contents {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Write `bytes` to `path` through a temp file in the same directory and an atomic rename.
pub async fn write_file_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Per-repository language snapshots plus the shared freshness timestamp.
///
/// Layout: `<root>/<owner>:<repo>.json` holds a repository's language breakdown and
/// `<root>/ts.json` holds `["YYYY/MM/DD"]`, the date of the last completed refresh.
#[derive(Debug, Clone)]
pub struct LanguageCache {
    root: PathBuf,
}

impl LanguageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, repo_name: &str) -> PathBuf {
        self.root.join(format!("{}.json", repo_name.replace('/', ":")))
    }

    pub fn timestamp_path(&self) -> PathBuf {
        self.root.join(TIMESTAMP_FILE)
    }

    /// `None` when the entry is missing or unreadable; both mean it must be refetched.
    pub async fn read_entry(&self, repo_name: &str) -> Option<LanguageBreakdown> {
        let path = self.entry_path(repo_name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "language cache entry unavailable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(breakdown) => Some(breakdown),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "malformed language cache entry");
                None
            }
        }
    }

    pub async fn write_entry(
        &self,
        repo_name: &str,
        breakdown: &LanguageBreakdown,
    ) -> anyhow::Result<()> {
        let path = self.entry_path(repo_name);
        let bytes = serde_json::to_vec(breakdown)
            .with_context(|| format!("serializing languages for {repo_name}"))?;
        write_file_atomic(&path, &bytes).await
    }

    /// The last refresh date. A missing or malformed file yields `None`.
    pub async fn load_timestamp(&self) -> anyhow::Result<Option<NaiveDate>> {
        let path = self.timestamp_path();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let stamp = serde_json::from_str::<Vec<String>>(&text)
            .ok()
            .and_then(|values| values.first().and_then(|v| parse_date(v)));
        if stamp.is_none() {
            warn!(path = %path.display(), "unreadable cache timestamp; treating every entry as stale");
        }
        Ok(stamp)
    }

    pub async fn store_timestamp(&self, date: NaiveDate) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(&[format_date(date)]).context("serializing cache timestamp")?;
        write_file_atomic(&self.timestamp_path(), &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn client_for(server: &mockito::Server) -> GithubClient {
        GithubClient::new(HttpClientConfig {
            api_base: server.url(),
            token: Some("secret".into()),
            user_agent: Some("fossi-test".into()),
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn next_link_is_parsed_from_relation_list() {
        let header = r#"<https://api.github.com/user/1/repos?page=2>; rel="next", <https://api.github.com/user/1/repos?page=5>; rel="last""#;
        assert_eq!(
            next_page_link(header).as_deref(),
            Some("https://api.github.com/user/1/repos?page=2")
        );

        let last_page = r#"<https://api.github.com/user/1/repos?page=1>; rel="first", <https://api.github.com/user/1/repos?page=4>; rel="prev""#;
        assert_eq!(next_page_link(last_page), None);
    }

    #[tokio::test]
    async fn pagination_concatenates_list_pages() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("<{}/page-two>; rel=\"next\"", server.url());
        let first = server
            .mock("GET", "/users/alice/repos")
            .match_header("authorization", "token secret")
            .match_header("accept", GITHUB_ACCEPT)
            .with_status(200)
            .with_header("link", &next)
            .with_body(r#"[{"id": 1}, {"id": 2}]"#)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/page-two")
            .with_status(200)
            .with_body(r#"[{"id": 3}]"#)
            .create_async()
            .await;

        let client = client_for(&server);
        let data = client.get_user_repos("alice").await;

        first.assert_async().await;
        second.assert_async().await;
        let ids: Vec<u64> = data
            .as_array()
            .expect("list")
            .iter()
            .filter_map(|v| v["id"].as_u64())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn object_payload_returns_immediately() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("<{}/never>; rel=\"next\"", server.url());
        let _repo = server
            .mock("GET", "/repos/acme/cpu")
            .with_status(200)
            .with_header("link", &next)
            .with_body(r#"{"full_name": "acme/cpu"}"#)
            .create_async()
            .await;
        let never = server.mock("GET", "/never").expect(0).create_async().await;

        let data = client_for(&server).get_repo("acme/cpu").await;
        assert_eq!(data["full_name"], "acme/cpu");
        never.assert_async().await;
    }

    #[tokio::test]
    async fn transport_failure_degrades_to_empty_object() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/repos/acme/gone")
            .with_status(404)
            .create_async()
            .await;

        let data = client_for(&server).get_repo("acme/gone").await;
        assert_eq!(data, serde_json::json!({}));
    }

    #[tokio::test]
    async fn languages_keep_api_order() {
        let mut server = mockito::Server::new_async().await;
        let _langs = server
            .mock("GET", "/repos/acme/cpu/languages")
            .with_status(200)
            .with_body(r#"{"VHDL": 900, "Python": 500, "Verilog": 20}"#)
            .create_async()
            .await;

        let breakdown = client_for(&server)
            .get_languages("acme/cpu")
            .await
            .expect("languages");
        let names: Vec<&str> = breakdown.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["VHDL", "Python", "Verilog"]);
    }

    #[tokio::test]
    async fn languages_failure_is_reported_to_caller() {
        let mut server = mockito::Server::new_async().await;
        let _langs = server
            .mock("GET", "/repos/acme/cpu/languages")
            .with_status(502)
            .create_async()
            .await;

        let err = client_for(&server).get_languages("acme/cpu").await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn file_list_is_decoded_and_sorted() {
        let mut server = mockito::Server::new_async().await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(br#"["zoe", "adam", "mia"]"#);
        // Simulate the API's line wrapping.
        let wrapped = format!("{}\n{}", &encoded[..8], &encoded[8..]);
        let body = serde_json::json!({ "encoding": "base64", "content": wrapped }).to_string();
        let _contents = server
            .mock("GET", "/repos/org/site/contents/data/users.json")
            .match_query(mockito::Matcher::UrlEncoded("ref".into(), "gh-pages".into()))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let client = client_for(&server);
        let url = client.contents_url("org/site", "data/users.json", "gh-pages");
        assert_eq!(client.get_file_list(&url).await, vec!["adam", "mia", "zoe"]);
    }

    #[test]
    fn entry_path_replaces_owner_separator() {
        let cache = LanguageCache::new("/tmp/cache");
        assert_eq!(
            cache.entry_path("acme/cpu-core"),
            PathBuf::from("/tmp/cache/acme:cpu-core.json")
        );
    }

    #[tokio::test]
    async fn cache_entries_round_trip_and_tolerate_garbage() {
        let dir = tempdir().expect("tempdir");
        let cache = LanguageCache::new(dir.path());
        assert!(cache.read_entry("acme/cpu").await.is_none());

        let mut breakdown = LanguageBreakdown::new();
        breakdown.insert("Verilog".into(), 10);
        breakdown.insert("C".into(), 4);
        cache.write_entry("acme/cpu", &breakdown).await.expect("write");
        assert_eq!(cache.read_entry("acme/cpu").await, Some(breakdown));

        std::fs::write(cache.entry_path("acme/broken"), b"{not json").expect("garbage");
        assert!(cache.read_entry("acme/broken").await.is_none());
    }

    #[tokio::test]
    async fn timestamp_is_stored_as_single_element_list() {
        let dir = tempdir().expect("tempdir");
        let cache = LanguageCache::new(dir.path());
        assert_eq!(cache.load_timestamp().await.expect("load"), None);

        let date = NaiveDate::from_ymd_opt(2026, 2, 4).expect("date");
        cache.store_timestamp(date).await.expect("store");
        let raw = std::fs::read_to_string(cache.timestamp_path()).expect("read");
        assert_eq!(raw, r#"["2026/02/04"]"#);
        assert_eq!(cache.load_timestamp().await.expect("load"), Some(date));

        std::fs::write(cache.timestamp_path(), r#"["2017/3/5"]"#).expect("legacy");
        assert_eq!(
            cache.load_timestamp().await.expect("load"),
            NaiveDate::from_ymd_opt(2017, 3, 5)
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("data.json");
        write_file_atomic(&path, b"first").await.expect("first");
        write_file_atomic(&path, b"second").await.expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
