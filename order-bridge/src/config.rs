//! Explicit configuration handed to every component at construction.
//!
//! Nothing in this crate derives storage locations from the working directory or the executable
//! path. The binary builds these structs once from its command line and passes them down.

use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use url::Url;

/// The tag attached to every order posted to the order API, identifying this integration.
pub const BRIDGE_TAG: &str = "orderpizzav1";

/// Default name of the watermark file inside [`StorageConfig::db_dir`].
pub const DEFAULT_WATERMARK_FILE: &str = "fromBlock.json";

/// Where decoded records and the watermark live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding one `<token_id>.json` file per decoded order request.
    pub records_dir: PathBuf,
    /// Directory holding the watermark file.
    pub db_dir: PathBuf,
    /// File name of the watermark inside `db_dir`.
    pub watermark_file: String,
}

impl StorageConfig {
    /// Lays out the default `output/` and `db/` directories below `data_dir`.
    pub fn from_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            records_dir: data_dir.join("output"),
            db_dir: data_dir.join("db"),
            watermark_file: DEFAULT_WATERMARK_FILE.to_string(),
        }
    }

    /// Replaces the watermark file name.
    pub fn with_watermark_file(mut self, file: impl Into<String>) -> Self {
        self.watermark_file = file.into();
        self
    }

    /// Full path of the watermark file.
    pub fn watermark_path(&self) -> PathBuf {
        self.db_dir.join(&self.watermark_file)
    }
}

/// Contract addresses and RPC endpoint of the ledger being reconciled.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint of the EVM node.
    pub rpc_url: Url,
    /// The consumer contract emitting `ChainlinkRequested` / `ChainlinkFulfilled`.
    pub consumer_address: Address,
    /// The oracle contract emitting `OracleRequest`.
    pub oracle_address: Address,
}

/// Target of the republish pipeline.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the order API, e.g. `http://localhost:8080`.
    pub base_url: Url,
    /// API version segment, e.g. `v1`.
    pub api_version: String,
}

impl ApiConfig {
    /// The `POST` endpoint for new orders: `{base_url}/api/{api_version}/orders`.
    pub fn orders_endpoint(&self) -> String {
        format!(
            "{}/api/{}/orders",
            self.base_url.as_str().trim_end_matches('/'),
            self.api_version
        )
    }
}
