//! GitHub source adapter, repository extraction and curated CSV tables.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fossi_core::{
    is_hdl_language, smart_truncate, LanguageBreakdown, QualityCode, RepoRecord, SnapshotRow,
    DESCRIPTION_MAX_LEN, FORK_TAG, TRUNCATION_SUFFIX,
};
use fossi_storage::{FetchError, GithubClient};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "fossi-adapters";

pub const TABLE_DELIMITER: u8 = b'|';

#[derive(Debug, Error)]
pub enum TableError {
    #[error("reading table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing table {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Upstream data the pipeline pulls from. Failures degrade to empty values except for
/// [`RepoSource::languages`], whose caller decides what a failure means for its cache.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Users whose public HDL repositories are indexed.
    async fn users(&self) -> Vec<String>;
    /// Individually curated repositories, indexed regardless of owner.
    async fn repo_names(&self) -> Vec<String>;
    async fn user_repos(&self, user: &str) -> JsonValue;
    async fn repo(&self, name: &str) -> JsonValue;
    async fn languages(&self, name: &str) -> Result<LanguageBreakdown, FetchError>;
}

/// [`RepoSource`] backed by the GitHub REST API. The user and repository lists live as JSON
/// files in `data_repo` at `data_ref`.
#[derive(Debug, Clone)]
pub struct GithubSource {
    http: GithubClient,
    data_repo: String,
    data_ref: String,
}

impl GithubSource {
    pub fn new(http: GithubClient, data_repo: impl Into<String>, data_ref: impl Into<String>) -> Self {
        Self {
            http,
            data_repo: data_repo.into(),
            data_ref: data_ref.into(),
        }
    }

    async fn data_file_list(&self, file: &str) -> Vec<String> {
        let url = self
            .http
            .contents_url(&self.data_repo, &format!("data/{file}"), &self.data_ref);
        self.http.get_file_list(&url).await
    }
}

#[async_trait]
impl RepoSource for GithubSource {
    async fn users(&self) -> Vec<String> {
        self.data_file_list("users.json").await
    }

    async fn repo_names(&self) -> Vec<String> {
        self.data_file_list("repos.json").await
    }

    async fn user_repos(&self, user: &str) -> JsonValue {
        self.http.get_user_repos(user).await
    }

    async fn repo(&self, name: &str) -> JsonValue {
        self.http.get_repo(name).await
    }

    async fn languages(&self, name: &str) -> Result<LanguageBreakdown, FetchError> {
        self.http.get_languages(name).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LicenseRef {
    pub key: String,
}

/// The subset of a GitHub repository document the dataset uses.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoDescriptor {
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub license: Option<LicenseRef>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub forks: u64,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RepoDescriptor {
    /// HDL primary language, and either an original repository or a fork somebody starred.
    pub fn is_hdl_candidate(&self) -> bool {
        let hdl = self.language.as_deref().is_some_and(is_hdl_language);
        hdl && (!self.fork || self.stargazers_count > 0)
    }
}

/// Project a descriptor into a dataset record. `None` when the repository has no usable date
/// or no primary language, since the language guess is the classifier's fallback.
pub fn extract_keys(repo: &RepoDescriptor) -> Option<RepoRecord> {
    let Some(language) = repo.language.clone() else {
        warn!(repo = %repo.full_name, "repository has no primary language; skipping");
        return None;
    };
    let Some(updated) = repo.pushed_at.or(repo.updated_at) else {
        warn!(repo = %repo.full_name, "repository has no push or update date; skipping");
        return None;
    };
    Some(RepoRecord {
        name: repo.full_name.clone(),
        description: repo
            .description
            .as_deref()
            .map(|d| smart_truncate(d, DESCRIPTION_MAX_LEN, TRUNCATION_SUFFIX))
            .unwrap_or_default(),
        license: repo
            .license
            .as_ref()
            .map(|l| l.key.clone())
            .unwrap_or_default(),
        languages: vec![language],
        forks: repo.forks,
        stars: repo.stargazers_count,
        updated: updated.date_naive(),
        tags: if repo.fork {
            vec![FORK_TAG.to_string()]
        } else {
            Vec::new()
        },
        quality: QualityCode::Unknown,
    })
}

/// Descriptors from a JSON value; anything that is not a list (e.g. the empty object a failed
/// fetch degrades to) yields nothing, and undecodable entries are skipped.
pub fn parse_descriptors(value: &JsonValue) -> Vec<RepoDescriptor> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match RepoDescriptor::deserialize(item) {
            Ok(descriptor) => Some(descriptor),
            Err(err) => {
                warn!(error = %err, "skipping undecodable repository descriptor");
                None
            }
        })
        .collect()
}

/// Parse a single repository document, e.g. from `/repos/{name}`. Empty objects yield `None`.
pub fn parse_descriptor(value: &JsonValue) -> Option<RepoDescriptor> {
    if value.as_object().is_some_and(|o| o.is_empty()) {
        return None;
    }
    match RepoDescriptor::deserialize(value) {
        Ok(descriptor) => Some(descriptor),
        Err(err) => {
            warn!(error = %err, "skipping undecodable repository document");
            None
        }
    }
}

pub fn extract_repos_data(value: &JsonValue) -> Vec<RepoRecord> {
    parse_descriptors(value)
        .iter()
        .filter(|d| d.is_hdl_candidate())
        .filter_map(extract_keys)
        .collect()
}

#[derive(Debug, Deserialize)]
struct TagRow {
    repo: String,
    #[serde(default)]
    tags: String,
}

#[derive(Debug, Deserialize)]
struct IpBlockRow {
    repo: String,
    block: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    quality: String,
}

fn read_table<R: Read, T: DeserializeOwned>(reader: R, label: &str) -> Result<Vec<T>, TableError> {
    csv::ReaderBuilder::new()
        .delimiter(TABLE_DELIMITER)
        .trim(csv::Trim::All)
        .from_reader(reader)
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(|source| TableError::Csv {
            path: label.to_string(),
            source,
        })
}

fn open_table(path: &Path) -> Result<fs::File, TableError> {
    fs::File::open(path).map_err(|source| TableError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Curated `repo|tags` table; `tags` is a comma-separated list.
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    tags: HashMap<String, Vec<String>>,
}

impl TagTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        Self::from_reader(open_table(path)?, &path.display().to_string())
    }

    /// A later row for the same repository replaces an earlier one.
    pub fn from_reader<R: Read>(reader: R, label: &str) -> Result<Self, TableError> {
        let rows: Vec<TagRow> = read_table(reader, label)?;
        let tags = rows
            .into_iter()
            .map(|row| {
                let tags = row
                    .tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(ToString::to_string)
                    .collect();
                (row.repo, tags)
            })
            .collect();
        Ok(Self { tags })
    }

    /// Curated tags for a repository; empty when it has none.
    pub fn tags_for(&self, repo_name: &str) -> &[String] {
        self.tags.get(repo_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpBlock {
    pub block: String,
    pub description: String,
    pub quality: QualityCode,
}

impl IpBlock {
    /// `"{block} - {description}"`, or just the block name when there is no description.
    pub fn display_description(&self) -> String {
        if self.description.is_empty() {
            self.block.clone()
        } else {
            format!("{} - {}", self.block, self.description)
        }
    }
}

/// Curated `repo|block|description|quality` table. Rows keep file order per repository.
#[derive(Debug, Clone, Default)]
pub struct IpBlockTable {
    blocks: HashMap<String, Vec<IpBlock>>,
}

impl IpBlockTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        Self::from_reader(open_table(path)?, &path.display().to_string())
    }

    pub fn from_reader<R: Read>(reader: R, label: &str) -> Result<Self, TableError> {
        let rows: Vec<IpBlockRow> = read_table(reader, label)?;
        let mut blocks: HashMap<String, Vec<IpBlock>> = HashMap::new();
        for row in rows {
            blocks.entry(row.repo).or_default().push(IpBlock {
                block: row.block,
                description: row.description,
                quality: QualityCode::from_status(&row.quality),
            });
        }
        Ok(Self { blocks })
    }

    /// IP blocks documented for a repository; empty when it has none.
    pub fn blocks_for(&self, repo_name: &str) -> &[IpBlock] {
        self.blocks.get(repo_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn block_count(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    data: Vec<SnapshotRow>,
}

/// Records previously written by the fetch stage, in file order.
pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Vec<RepoRecord>> {
    let path = path.as_ref();
    let snapshot: SnapshotFile = read_json_file(path)?;
    let mut records = Vec::with_capacity(snapshot.data.len());
    for row in snapshot.data {
        let name = row.0.clone();
        let record = RepoRecord::from_snapshot_row(row)
            .with_context(|| format!("invalid date for {name} in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
