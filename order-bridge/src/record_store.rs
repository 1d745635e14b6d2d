//! Durable storage of decoded order requests, one JSON file per token id.
//!
//! Writes go to a temporary sibling first and are then renamed over the target, so a crash never
//! leaves a half written record or watermark behind.

use std::path::{Path, PathBuf};

use log::{debug, info};
use snafu::{ResultExt, Snafu};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::StorageConfig;
use crate::order::OrderRequest;

/// Filesystem failures. Fatal to a reconciliation run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PersistenceError {
    /// A storage directory could not be created.
    #[snafu(display("Failed to create directory '{}': {source}", path.display()))]
    CreateDir {
        /// The directory.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// A file could not be written or moved into place.
    #[snafu(display("Failed to write '{}': {source}", path.display()))]
    Write {
        /// The file.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// A file or directory could not be read.
    #[snafu(display("Failed to read '{}': {source}", path.display()))]
    Read {
        /// The file or directory.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// A stored file does not hold the expected JSON.
    #[snafu(display("Failed to parse '{}': {source}", path.display()))]
    Parse {
        /// The file.
        path: PathBuf,
        /// The JSON error.
        source: serde_json::Error,
    },

    /// A value could not be serialized.
    #[snafu(display("Failed to serialize record: {source}"))]
    Serialize {
        /// The JSON error.
        source: serde_json::Error,
    },
}

/// Replaces the contents of `path` with `contents`, creating parent directories as needed.
///
/// The data is synced to disk before the rename, so after a crash `path` holds either the old or
/// the new contents in full.
pub(crate) async fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .context(CreateDirSnafu { path: parent })?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)
        .await
        .context(WriteSnafu { path: &tmp_path })?;
    file.write_all(contents)
        .await
        .context(WriteSnafu { path: &tmp_path })?;
    file.sync_all()
        .await
        .context(WriteSnafu { path: &tmp_path })?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .context(WriteSnafu { path })
}

/// The directory of persisted [`OrderRequest`]s.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Opens the record directory named by `config`. Nothing is touched until the first write.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.records_dir.clone(),
        }
    }

    /// The record directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `token_id`.
    pub fn record_path(&self, token_id: u64) -> PathBuf {
        self.dir.join(format!("{token_id}.json"))
    }

    /// Writes `order` to `<token_id>.json`, replacing any earlier record for that token.
    pub async fn save(&self, order: &OrderRequest) -> Result<PathBuf, PersistenceError> {
        let path = self.record_path(order.token_id);
        let json = serde_json::to_vec(order).context(SerializeSnafu)?;
        write_atomically(&path, &json).await?;
        info!("Saved request for token {} to {}", order.token_id, path.display());
        Ok(path)
    }

    /// Reads the record for `token_id`.
    pub async fn load(&self, token_id: u64) -> Result<OrderRequest, PersistenceError> {
        read_record(&self.record_path(token_id)).await
    }

    /// Reads every `*.json` record, ordered by file name. A missing directory holds no records.
    pub async fn load_all(&self) -> Result<Vec<OrderRequest>, PersistenceError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Record directory {} does not exist yet", self.dir.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(PersistenceError::Read {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(ReadSnafu { path: &self.dir })?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        debug!("Found {} records in {}", paths.len(), self.dir.display());

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            records.push(read_record(&path).await?);
        }
        Ok(records)
    }
}

/// Reads and parses one record file.
async fn read_record(path: &Path) -> Result<OrderRequest, PersistenceError> {
    let contents = fs::read(path).await.context(ReadSnafu { path })?;
    serde_json::from_slice(&contents).context(ParseSnafu { path })
}
