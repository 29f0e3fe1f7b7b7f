//! Run artifacts, source download and record persistence for ICMS ingestion.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use icms_core::IcmsRecord;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::MemoryRecordStore;
pub use pg::PgRecordStore;

pub const CRATE_NAME: &str = "icms-storage";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("transaction already finished")]
    TransactionClosed,
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Relational storage of ICMS records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Distinct periods already persisted, sorted.
    async fn existing_periods(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn LoadTransaction>, StoreError>;
}

/// A single all-or-nothing load. Batches may be inserted concurrently
/// through a shared reference.
#[async_trait]
pub trait LoadTransaction: Send + Sync {
    /// Removes every stored record.
    async fn clear_all(&self) -> Result<u64, StoreError>;

    async fn insert_batch(&self, batch_index: usize, records: &[IcmsRecord]) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Working folder of one run: `icms_<stamp>` under the storage root.
#[derive(Debug, Clone)]
pub struct RunFolder {
    pub path: PathBuf,
    pub stamp: String,
}

impl RunFolder {
    pub fn original_path(&self) -> PathBuf {
        self.path.join(format!("icms_original_{}.xlsx", self.stamp))
    }

    pub fn json_dump_path(&self) -> PathBuf {
        self.path.join(format!("icms_original_{}.json", self.stamp))
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_stamp(at: DateTime<Utc>) -> String {
        at.format("%Y-%m-%d_%H-%M-%S").to_string()
    }

    pub async fn create_run_folder(&self, at: DateTime<Utc>) -> anyhow::Result<RunFolder> {
        let stamp = Self::run_stamp(at);
        let path = self.root.join(format!("icms_{stamp}"));
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating run folder {}", path.display()))?;
        Ok(RunFolder { path, stamp })
    }

    /// Writes the downloaded workbook with an atomic temp-file rename.
    pub async fn store_original(&self, folder: &RunFolder, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let absolute_path = folder.original_path();
        write_atomic(&folder.path, &absolute_path, bytes).await?;
        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(bytes),
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn store_json_dump<T: Serialize + ?Sized>(
        &self,
        folder: &RunFolder,
        value: &T,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(value).context("serializing json dump")?;
        let absolute_path = folder.json_dump_path();
        write_atomic(&folder.path, &absolute_path, &bytes).await?;
        Ok(StoredArtifact {
            content_hash: Self::sha256_hex(&bytes),
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

async fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
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

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into {}", target.display()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot downloader for the source workbook.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            info!(bytes = body.len(), "downloaded source workbook");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
