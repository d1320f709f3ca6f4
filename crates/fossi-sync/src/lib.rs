//! Dataset pipeline: collect, classify languages, merge curated tags, expand IP blocks, emit.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fossi_adapters::{
    extract_keys, extract_repos_data, load_snapshot, parse_descriptor, GithubSource, IpBlockTable,
    RepoSource, TagTable,
};
use fossi_core::{hdl_languages, DatasetRow, QualityCode, RepoRecord, SnapshotRow};
use fossi_storage::{write_file_atomic, GithubClient, HttpClientConfig, LanguageCache, DEFAULT_API_BASE};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fossi-sync";

#[derive(Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub api_base: String,
    pub token: Option<String>,
    pub data_repo: String,
    pub data_ref: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("workspace_root", &self.workspace_root)
            .field("api_base", &self.api_base)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("data_repo", &self.data_repo)
            .field("data_ref", &self.data_ref)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            api_base: DEFAULT_API_BASE.to_string(),
            token: None,
            data_repo: "berndca/discover_fossi".to_string(),
            data_ref: "gh-pages".to_string(),
            user_agent: "fossi-sync/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("FOSSI_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            api_base: std::env::var("FOSSI_API_BASE").unwrap_or(defaults.api_base),
            token: std::env::var("TOKEN").ok().filter(|t| !t.trim().is_empty()),
            data_repo: std::env::var("FOSSI_DATA_REPO").unwrap_or(defaults.data_repo),
            data_ref: std::env::var("FOSSI_DATA_REF").unwrap_or(defaults.data_ref),
            user_agent: std::env::var("FOSSI_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("FOSSI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.workspace_root.join("data")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("languages-cache")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.data_dir().join("repo_tags.csv")
    }

    pub fn ip_blocks_path(&self) -> PathBuf {
        self.data_dir().join("ip-libs.csv")
    }

    pub fn output_path(&self) -> PathBuf {
        self.data_dir().join("data.json")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.workspace_root.join("resp.json")
    }
}

/// Run date for the cache timestamp. Repository dates come from UTC API timestamps, so the
/// comparison must be made in UTC as well.
pub fn run_date() -> NaiveDate {
    Utc::now().date_naive()
}

fn log_elapsed(stage: &str, started: Instant) {
    info!(stage, elapsed_ms = started.elapsed().as_millis() as u64, "stage finished");
}

/// Every indexed user's HDL repositories, followed by the individually curated repositories.
///
/// Curated repositories bypass the language filter. Duplicates are kept; classification
/// fetches each name at most once per run.
pub async fn collect_repos(source: &dyn RepoSource) -> Vec<RepoRecord> {
    let started = Instant::now();
    let users = source.users().await;
    let repo_names = source.repo_names().await;

    let mut records = Vec::new();
    for user in &users {
        let user_started = Instant::now();
        let found = extract_repos_data(&source.user_repos(user).await);
        info!(user = %user, repos = found.len(), elapsed_ms = user_started.elapsed().as_millis() as u64, "collected user repositories");
        records.extend(found);
    }
    for name in &repo_names {
        let document = source.repo(name).await;
        match parse_descriptor(&document).as_ref().and_then(extract_keys) {
            Some(record) => records.push(record),
            None => warn!(repo = %name, "no data for curated repository"),
        }
    }

    info!(users = users.len(), curated = repo_names.len(), records = records.len(), "collection complete");
    log_elapsed("collect", started);
    records
}

#[derive(Debug, Clone)]
pub struct ClassifyOutcome {
    pub records: Vec<RepoRecord>,
    pub fetched: usize,
    pub cache_hits: usize,
    pub fetch_failures: usize,
    pub unmatched: usize,
    /// Timestamp to persist once the run completes.
    pub new_timestamp: NaiveDate,
}

/// Replace each record's language guess with the HDL languages from its cached breakdown,
/// refreshing stale cache entries from `source` first.
///
/// An entry is stale when it is missing or unreadable, or when the repository was updated after
/// `cache_ts` and has not already been refreshed during this call. An unknown `cache_ts`
/// treats every repository as updated. A failed fetch keeps whatever entry exists and leaves
/// the repository eligible for a retry. Records whose breakdown has no HDL language keep
/// their original guess.
pub async fn classify_languages(
    records: Vec<RepoRecord>,
    source: &dyn RepoSource,
    cache: &LanguageCache,
    cache_ts: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<ClassifyOutcome> {
    let started = Instant::now();
    let mut processed: HashSet<String> = HashSet::new();
    let mut outcome = ClassifyOutcome {
        records: Vec::with_capacity(records.len()),
        fetched: 0,
        cache_hits: 0,
        fetch_failures: 0,
        unmatched: 0,
        new_timestamp: today,
    };

    for mut record in records {
        let updated_since = cache_ts.map_or(true, |ts| record.updated > ts);
        let needs_refresh = updated_since && !processed.contains(&record.name);
        let cached = cache.read_entry(&record.name).await;

        let breakdown = match cached {
            Some(entry) if !needs_refresh => {
                outcome.cache_hits += 1;
                entry
            }
            previous => {
                info!(repo = %record.name, "fetching languages");
                match source.languages(&record.name).await {
                    Ok(fresh) => {
                        cache
                            .write_entry(&record.name, &fresh)
                            .await
                            .with_context(|| format!("caching languages for {}", record.name))?;
                        processed.insert(record.name.clone());
                        outcome.fetched += 1;
                        fresh
                    }
                    Err(err) => {
                        warn!(repo = %record.name, error = %err, "language fetch failed");
                        outcome.fetch_failures += 1;
                        previous.unwrap_or_default()
                    }
                }
            }
        };

        let repo_hdl_languages = hdl_languages(&breakdown);
        if repo_hdl_languages.is_empty() {
            warn!(repo = %record.name, "no HDL language in cached breakdown");
            outcome.unmatched += 1;
        } else {
            record.languages = repo_hdl_languages;
        }
        outcome.records.push(record);
    }

    log_elapsed("classify", started);
    Ok(outcome)
}

/// Curated tags first, then the structural tags already on the record. Quality is reset.
pub fn merge_repo_tags(records: Vec<RepoRecord>, table: &TagTable) -> Vec<RepoRecord> {
    records
        .into_iter()
        .map(|mut record| {
            // Absent repositories have no curated tags.
            let mut tags = table.tags_for(&record.name).to_vec();
            tags.append(&mut record.tags);
            record.tags = tags;
            record.quality = QualityCode::Unknown;
            record
        })
        .collect()
}

/// One derived record per IP block, copying everything from its parent except
/// description and quality. Parents are not included.
pub fn expand_ip_blocks(records: &[RepoRecord], table: &IpBlockTable) -> Vec<RepoRecord> {
    records
        .iter()
        .flat_map(|parent| {
            // Repositories without blocks contribute nothing.
            table.blocks_for(&parent.name).iter().map(move |block| RepoRecord {
                description: block.display_description(),
                quality: block.quality,
                ..parent.clone()
            })
        })
        .collect()
}

/// Stable sort by repository name; ties keep concatenation order.
pub fn combine_and_sort(tagged: Vec<RepoRecord>, blocks: Vec<RepoRecord>) -> Vec<RepoRecord> {
    let mut combined = tagged;
    combined.extend(blocks);
    combined.sort_by(|a, b| a.name.cmp(&b.name));
    combined
}

#[derive(Serialize)]
struct DatasetDocument<'a> {
    data: Vec<DatasetRow<'a>>,
}

#[derive(Serialize)]
struct SnapshotDocument {
    data: Vec<SnapshotRow>,
}

pub fn render_dataset(records: &[RepoRecord]) -> Result<Vec<u8>> {
    let document = DatasetDocument {
        data: records.iter().map(RepoRecord::to_dataset_row).collect(),
    };
    serde_json::to_vec_pretty(&document).context("serializing dataset")
}

pub fn render_snapshot(records: &[RepoRecord]) -> Result<Vec<u8>> {
    let document = SnapshotDocument {
        data: records.iter().map(RepoRecord::to_snapshot_row).collect(),
    };
    serde_json::to_vec_pretty(&document).context("serializing snapshot")
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub records: usize,
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_records: usize,
    pub fetched_languages: usize,
    pub cache_hits: usize,
    pub fetch_failures: usize,
    pub unmatched: usize,
    pub ip_blocks: usize,
    pub output_records: usize,
    pub cache_timestamp: String,
    pub output_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn RepoSource>,
    cache: LanguageCache,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = GithubClient::new(HttpClientConfig {
            api_base: config.api_base.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            token: config.token.clone(),
        })?;
        let source = GithubSource::new(http, config.data_repo.clone(), config.data_ref.clone());
        Ok(Self::with_source(config, Box::new(source)))
    }

    pub fn with_source(config: SyncConfig, source: Box<dyn RepoSource>) -> Self {
        let cache = LanguageCache::new(config.cache_dir());
        Self {
            config,
            source,
            cache,
        }
    }

    /// Collect repositories from the API and write them to the snapshot file.
    pub async fn fetch_once(&self) -> Result<(FetchSummary, Vec<RepoRecord>)> {
        let run_id = Uuid::new_v4();
        let records = collect_repos(self.source.as_ref()).await;
        let path = self.config.snapshot_path();
        write_file_atomic(&path, &render_snapshot(&records)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        let summary = FetchSummary {
            run_id,
            records: records.len(),
            snapshot_path: path.display().to_string(),
        };
        Ok((summary, records))
    }

    /// Build the dataset from the last snapshot.
    pub async fn merge_once(&self) -> Result<SyncRunSummary> {
        let records = load_snapshot(self.config.snapshot_path())?;
        self.merge_records(records).await
    }

    /// Fetch, snapshot and merge in one run.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let (_fetch, records) = self.fetch_once().await?;
        self.merge_records(records).await
    }

    pub async fn merge_records(&self, records: Vec<RepoRecord>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let input_records = records.len();

        // Curated tables are required; load them before touching the cache.
        let tags = TagTable::load(self.config.tags_path())?;
        let ip_table = IpBlockTable::load(self.config.ip_blocks_path())?;

        let cache_ts = self.cache.load_timestamp().await?;
        let today = run_date();
        let outcome =
            classify_languages(records, self.source.as_ref(), &self.cache, cache_ts, today).await?;
        self.cache
            .store_timestamp(outcome.new_timestamp)
            .await
            .context("persisting cache timestamp")?;

        let started = Instant::now();
        let tagged = merge_repo_tags(outcome.records, &tags);
        let blocks = expand_ip_blocks(&tagged, &ip_table);
        let ip_blocks = blocks.len();
        let combined = combine_and_sort(tagged, blocks);
        log_elapsed("merge", started);

        let output_path = self.config.output_path();
        write_file_atomic(&output_path, &render_dataset(&combined)?)
            .await
            .with_context(|| format!("writing {}", output_path.display()))?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_records,
            fetched_languages: outcome.fetched,
            cache_hits: outcome.cache_hits,
            fetch_failures: outcome.fetch_failures,
            unmatched: outcome.unmatched,
            ip_blocks,
            output_records: combined.len(),
            cache_timestamp: fossi_core::format_date(outcome.new_timestamp),
            output_path: output_path.display().to_string(),
        };
        info!(%run_id, records = summary.output_records, fetched = summary.fetched_languages, "dataset written");
        Ok(summary)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

pub async fn run_fetch_once_from_env() -> Result<FetchSummary> {
    let (summary, _records) = SyncPipeline::new(SyncConfig::from_env())?.fetch_once().await?;
    Ok(summary)
}

pub async fn run_merge_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.merge_once().await
}
