//! The `fromBlock` high-water mark.
//!
//! The watermark is the inclusive first block of the next reconciliation window. It only moves
//! forward, and only after every record decoded in a run has been written.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;

use crate::config::StorageConfig;
use crate::record_store::{write_atomically, PersistenceError, SerializeSnafu};

/// On-disk shape of the watermark file: `{"fromBlock": <integer>}`.
#[derive(Debug, Serialize)]
struct WatermarkFile {
    /// The stored cursor.
    #[serde(rename = "fromBlock")]
    from_block: u64,
}

/// How the next watermark treats pending requests whose oracle log has not been seen yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatermarkPolicy {
    /// Advance past the latest requested event regardless of unmatched requests.
    #[default]
    AdvancePastObserved,
    /// Never advance past the earliest pending request that had no oracle log, so the next poll
    /// reads it again.
    HoldAtUnmatched,
}

impl WatermarkPolicy {
    /// Applies the policy to a watermark computed by [`compute_next`].
    pub fn apply(self, next: u64, from_block: u64, earliest_unmatched_block: Option<u64>) -> u64 {
        match (self, earliest_unmatched_block) {
            (WatermarkPolicy::HoldAtUnmatched, Some(block)) => next.min(block.max(from_block)),
            _ => next,
        }
    }
}

/// The next watermark: one past the latest observed request when the run made progress,
/// otherwise the current one. Never lower than `from_block`.
pub fn compute_next(from_block: u64, observed_max_block: u64, progressed: bool) -> u64 {
    if progressed {
        observed_max_block.saturating_add(1).max(from_block)
    } else {
        from_block
    }
}

/// Reads and writes the watermark file.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    /// Opens the watermark file named by `config`.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            path: config.watermark_path(),
        }
    }

    /// The watermark file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted watermark, or `fallback` when the file is missing or unreadable.
    pub async fn load(&self, fallback: u64) -> u64 {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                info!(
                    "No watermark at {} ({}), starting from block {}",
                    self.path.display(),
                    e,
                    fallback
                );
                return fallback;
            }
        };

        match parse_watermark(&contents) {
            Some(from_block) => {
                info!(
                    "Loaded watermark {} from {}",
                    from_block,
                    self.path.display()
                );
                from_block
            }
            None => {
                warn!(
                    "Watermark file {} is corrupt, starting from block {}",
                    self.path.display(),
                    fallback
                );
                fallback
            }
        }
    }

    /// Durably replaces the stored watermark.
    pub async fn persist(&self, from_block: u64) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(&WatermarkFile { from_block }).context(SerializeSnafu)?;
        write_atomically(&self.path, &json).await?;
        info!("Saved watermark {} to {}", from_block, self.path.display());
        Ok(())
    }
}

/// Extracts `fromBlock` as a non-negative integer or a string of digits.
fn parse_watermark(contents: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(contents).ok()?;
    match value.get("fromBlock")? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::test_directory::TestDirectory;

    #[test]
    fn the_watermark_only_moves_on_progress() {
        assert_eq!(compute_next(10, 15, false), 10);
        assert_eq!(compute_next(10, 15, true), 16);
        assert_eq!(compute_next(0, 0, true), 1);
        assert_eq!(compute_next(20, 15, true), 20);
        assert_eq!(compute_next(5, u64::MAX, true), u64::MAX);
    }

    #[test]
    fn we_can_hold_the_watermark_at_unmatched_requests() {
        let hold = WatermarkPolicy::HoldAtUnmatched;
        assert_eq!(hold.apply(16, 0, Some(15)), 15);
        assert_eq!(hold.apply(16, 0, None), 16);
        assert_eq!(hold.apply(16, 12, Some(10)), 12);

        let advance = WatermarkPolicy::AdvancePastObserved;
        assert_eq!(advance.apply(16, 0, Some(15)), 16);
    }

    #[test]
    fn we_can_parse_watermark_files() {
        assert_eq!(parse_watermark(r#"{"fromBlock":16}"#), Some(16));
        assert_eq!(parse_watermark(r#"{"fromBlock":"42"}"#), Some(42));
        assert_eq!(parse_watermark(r#"{"fromBlock":-1}"#), None);
        assert_eq!(parse_watermark(r#"{"fromBlock":1.5}"#), None);
        assert_eq!(parse_watermark(r#"{"block":3}"#), None);
        assert_eq!(parse_watermark("not json"), None);
    }

    #[tokio::test]
    async fn we_can_persist_and_reload_the_watermark() {
        let directory = TestDirectory::random(&mut StdRng::seed_from_u64(21));
        let store = WatermarkStore::new(&StorageConfig::from_data_dir(&directory.path));

        assert_eq!(store.load(5).await, 5);

        store.persist(16).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            r#"{"fromBlock":16}"#
        );
        assert_eq!(store.load(5).await, 16);

        store.persist(17).await.unwrap();
        assert_eq!(store.load(0).await, 17);
    }

    #[tokio::test]
    async fn a_corrupt_watermark_falls_back() {
        let directory = TestDirectory::random(&mut StdRng::seed_from_u64(22));
        let store = WatermarkStore::new(&StorageConfig::from_data_dir(&directory.path));
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{\"fromBlock\": ").unwrap();

        assert_eq!(store.load(3).await, 3);
    }
}
