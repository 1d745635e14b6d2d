//! This binary reconciles pizza order requests made through a Chainlink consumer contract,
//! stores the decoded orders on disk and republishes them to the order API.
//!
//! ## Features
//! - Fetches request, fulfillment and oracle events from an EVM node over HTTP JSON-RPC.
//! - Decodes the CBOR payload of every pending request into `<token_id>.json`.
//! - Tracks progress in a `{"fromBlock": N}` watermark file.
//! - Posts stored orders to `{url}/api/{version}/orders`.
//! - Polls continuously with the `listen` command.
//!
//! ## Usage
//! ```sh
//! cargo run -- --consumer-address 0x5FbDB2315678afecb367f032d93F642f64180aa3 --oracle-address 0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512 fetch --block 0
//! cargo run -- push --url http://localhost:8080 --api-version v1
//! ```
use std::future::pending;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::hex::FromHexError;
use alloy::primitives::Address;
use alloy::providers::ProviderBuilder;
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use order_bridge::config::{ApiConfig, LedgerConfig, StorageConfig, DEFAULT_WATERMARK_FILE};
use order_bridge::decoder::{decode_hex_payload, decode_order_request, DecodeError};
use order_bridge::ledger::{AlloyEventSource, EventSource};
use order_bridge::listener::{Listener, ListenerError};
use order_bridge::publish::{OrderPublisher, PublishError, PublishPolicy};
use order_bridge::reconcile::{self, ReconciliationPipeline};
use order_bridge::record_store::{PersistenceError, RecordStore};
use order_bridge::watermark::{WatermarkPolicy, WatermarkStore};
use snafu::{OptionExt, ResultExt, Snafu};
use url::{ParseError, Url};

#[derive(Debug, Snafu)]
enum OrderBridgeError {
    #[snafu(display("Failed to parse {flag} URL '{url}': {source}"))]
    UrlParse {
        flag: &'static str,
        url: String,
        source: ParseError,
    },

    #[snafu(display("Invalid {flag} format: {source}"))]
    AddressParse {
        flag: &'static str,
        source: FromHexError,
    },

    #[snafu(display("Missing --{flag}, it is required to read the ledger"))]
    MissingAddress { flag: &'static str },

    #[snafu(display("Reconciliation failed: {source}"))]
    Reconcile { source: reconcile::Error },

    #[snafu(display("{source}"))]
    Publish { source: PublishError },

    #[snafu(display("{failed} of {attempted} orders failed to publish"))]
    PublishFailures { failed: usize, attempted: usize },

    #[snafu(display("Invalid listener settings: {source}"))]
    Listen { source: ListenerError },

    #[snafu(display("Failed to decode payload: {source}"))]
    Decode { source: DecodeError },

    #[snafu(display("Failed to save decoded order: {source}"))]
    Save { source: PersistenceError },

    #[snafu(display("Failed to render decoded order: {source}"))]
    Render { source: serde_json::Error },
}

/// Type alias for returning results with `OrderBridgeError`
type Result<T, E = OrderBridgeError> = std::result::Result<T, E>;

/// CLI arguments parser using `clap` derive syntax
#[derive(Parser, Debug)]
#[command(
    name = "Order Bridge",
    version,
    about = "Reconciles Chainlink order requests and forwards the decoded orders to the order API"
)]
struct Cli {
    /// Directory holding `output/` (order records) and `db/` (watermark)
    #[arg(long, env = "ORDER_BRIDGE_DATA_DIR", default_value = ".", global = true)]
    data_dir: PathBuf,

    /// The HTTP JSON-RPC URL of the EVM node
    #[arg(
        long,
        env = "ORDER_BRIDGE_RPC_URL",
        default_value = "http://127.0.0.1:8545",
        global = true
    )]
    rpc_url: String,

    /// Address of the consumer contract emitting `ChainlinkRequested` and `ChainlinkFulfilled`
    #[arg(long, env = "ORDER_BRIDGE_CONSUMER_ADDRESS", global = true)]
    consumer_address: Option<String>,

    /// Address of the oracle contract emitting `OracleRequest`
    #[arg(long, env = "ORDER_BRIDGE_ORACLE_ADDRESS", global = true)]
    oracle_address: Option<String>,

    /// Keep the watermark at the earliest pending request that has no oracle request yet
    #[arg(long, env = "ORDER_BRIDGE_HOLD_UNMATCHED", global = true)]
    hold_unmatched: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Defines the available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconciles once from the watermark to the chain head
    Fetch(WindowArgs),

    /// Posts stored orders to the order API
    Push {
        #[command(flatten)]
        api: ApiArgs,

        /// Only push the order for this token
        #[arg(long)]
        token_id: Option<u64>,

        /// Keep pushing after a failed order
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Reconciles on an interval, pushing new orders when an API URL is given
    Listen {
        #[command(flatten)]
        window: WindowArgs,

        /// Base URL of the order API
        #[arg(long, env = "ORDER_API_URL")]
        url: Option<String>,

        /// Version segment of the order API path
        #[arg(long, env = "ORDER_API_VERSION", default_value = "v1")]
        api_version: String,

        /// Seconds between polls
        #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Keep pushing after a failed order
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Decodes a hex encoded request payload and prints the order
    Decode {
        /// The `OracleRequest` data field, with or without `0x`
        payload: String,

        /// Also store the decoded order in the record directory
        #[arg(long)]
        save: bool,
    },
}

/// Where a reconciliation starts
#[derive(Args, Debug)]
struct WindowArgs {
    /// Watermark file name inside the `db/` directory
    #[arg(long, env = "ORDER_BRIDGE_WATERMARK_FILE", default_value = DEFAULT_WATERMARK_FILE)]
    file: String,

    /// First block to read when no watermark has been saved
    #[arg(long, env = "ORDER_BRIDGE_START_BLOCK", default_value_t = 0)]
    block: u64,
}

/// Where orders are pushed
#[derive(Args, Debug)]
struct ApiArgs {
    /// Base URL of the order API
    #[arg(long, env = "ORDER_API_URL", default_value = "http://localhost:8080")]
    url: String,

    /// Version segment of the order API path
    #[arg(long, env = "ORDER_API_VERSION", default_value = "v1")]
    api_version: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Cli::parse();
    run(args).await.inspect_err(|e| error!("{e}"))
}

/// Dispatches the parsed command line
async fn run(args: Cli) -> Result<()> {
    let watermark_policy = if args.hold_unmatched {
        WatermarkPolicy::HoldAtUnmatched
    } else {
        WatermarkPolicy::AdvancePastObserved
    };

    match &args.command {
        Commands::Fetch(window) => {
            let storage =
                StorageConfig::from_data_dir(&args.data_dir).with_watermark_file(&window.file);
            let ledger = setup_ledger(&args)?;
            let provider = ProviderBuilder::new().on_http(ledger.rpc_url.clone());
            let source =
                AlloyEventSource::new(provider, ledger.consumer_address, ledger.oracle_address);
            let pipeline = setup_pipeline(source, &storage, watermark_policy);

            let report = pipeline.run(window.block).await.context(ReconcileSnafu)?;
            info!(
                "Block window {}: saved tokens {:?}, watermark {} -> {}",
                report.window,
                report
                    .saved
                    .iter()
                    .map(|order| order.token_id)
                    .collect::<Vec<_>>(),
                report.previous_watermark,
                report.next_watermark
            );
            Ok(())
        }
        Commands::Push {
            api,
            token_id,
            continue_on_error,
        } => {
            let storage = StorageConfig::from_data_dir(&args.data_dir);
            let api = setup_api(&api.url, &api.api_version)?;
            let publisher = OrderPublisher::new(&api);

            let report = publisher
                .push(
                    &RecordStore::new(&storage),
                    *token_id,
                    publish_policy(*continue_on_error),
                )
                .await
                .context(PublishSnafu)?;

            info!("Published tokens {:?}", report.published);
            if report.is_success() {
                Ok(())
            } else {
                PublishFailuresSnafu {
                    failed: report.failures.len(),
                    attempted: report.published.len() + report.failures.len(),
                }
                .fail()
            }
        }
        Commands::Listen {
            window,
            url,
            api_version,
            interval,
            continue_on_error,
        } => {
            let storage =
                StorageConfig::from_data_dir(&args.data_dir).with_watermark_file(&window.file);
            let ledger = setup_ledger(&args)?;
            let provider = ProviderBuilder::new().on_http(ledger.rpc_url.clone());
            let source =
                AlloyEventSource::new(provider, ledger.consumer_address, ledger.oracle_address);
            let publisher = url
                .as_deref()
                .map(|url| setup_api(url, api_version).map(|api| OrderPublisher::new(&api)))
                .transpose()?;

            let listener = Listener::new(
                setup_pipeline(source, &storage, watermark_policy),
                publisher,
                publish_policy(*continue_on_error),
                Duration::from_secs(*interval),
                window.block,
            )
            .context(ListenSnafu)?;
            listener.run(ctrl_c()).await;
            Ok(())
        }
        Commands::Decode { payload, save } => {
            let bytes = decode_hex_payload(payload).context(DecodeSnafu)?;
            let order = decode_order_request(&bytes).context(DecodeSnafu)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&order).context(RenderSnafu)?
            );

            if *save {
                let storage = StorageConfig::from_data_dir(&args.data_dir);
                RecordStore::new(&storage)
                    .save(&order)
                    .await
                    .context(SaveSnafu)?;
            }
            Ok(())
        }
    }
}

/// Builds the pipeline over `source` with stores laid out by `storage`
fn setup_pipeline<S: EventSource>(
    source: S,
    storage: &StorageConfig,
    policy: WatermarkPolicy,
) -> ReconciliationPipeline<S> {
    ReconciliationPipeline::new(
        source,
        RecordStore::new(storage),
        WatermarkStore::new(storage),
        policy,
    )
}

/// Parses the ledger flags shared by `fetch` and `listen`
fn setup_ledger(args: &Cli) -> Result<LedgerConfig> {
    let rpc_url = Url::from_str(&args.rpc_url).context(UrlParseSnafu {
        flag: "rpc",
        url: &args.rpc_url,
    })?;

    Ok(LedgerConfig {
        rpc_url,
        consumer_address: parse_address("consumer-address", args.consumer_address.as_deref())?,
        oracle_address: parse_address("oracle-address", args.oracle_address.as_deref())?,
    })
}

fn parse_address(flag: &'static str, address: Option<&str>) -> Result<Address> {
    let address = address.context(MissingAddressSnafu { flag })?;
    Address::from_str(address.trim()).context(AddressParseSnafu { flag })
}

fn setup_api(url: &str, api_version: &str) -> Result<ApiConfig> {
    Ok(ApiConfig {
        base_url: Url::from_str(url).context(UrlParseSnafu { flag: "api", url })?,
        api_version: api_version.to_string(),
    })
}

fn publish_policy(continue_on_error: bool) -> PublishPolicy {
    if continue_on_error {
        PublishPolicy::Continue
    } else {
        PublishPolicy::Abort
    }
}

/// Resolves on Ctrl-C. Never resolves if the signal handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C, stop the process another way: {e}");
        pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn we_cannot_parse_a_zero_listen_interval() {
        assert!(Cli::try_parse_from(["order-bridge", "listen", "--interval", "0"]).is_err());

        let args = Cli::try_parse_from(["order-bridge", "listen", "--interval", "1"]).unwrap();
        assert!(matches!(args.command, Commands::Listen { interval: 1, .. }));
    }

    #[test]
    fn push_defaults_to_the_local_order_api() {
        let args = Cli::try_parse_from(["order-bridge", "push", "--url", "http://orders:9000"])
            .unwrap();
        assert!(matches!(
            args.command,
            Commands::Push { api, .. } if api.url == "http://orders:9000"
        ));

        std::env::remove_var("ORDER_API_URL");
        let args = Cli::try_parse_from(["order-bridge", "push"]).unwrap();
        match args.command {
            Commands::Push { api, .. } => {
                assert_eq!(api.url, "http://localhost:8080");
                assert_eq!(api.api_version, "v1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
