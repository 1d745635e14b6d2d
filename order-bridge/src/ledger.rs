//! # Ledger Access
//!
//! Everything the reconciliation pipeline needs from the chain goes through the [`EventSource`]
//! trait: the current head and three filtered log queries over an inclusive [`BlockWindow`].
//!
//! [`AlloyEventSource`] is the production implementation. It filters logs by contract address and
//! event signature with `alloy` and decodes them into the `sol!` event types from
//! [`crate::contracts`] before converting them into the plain [`RequestEvent`] and
//! [`OracleRequestEvent`] records used by the rest of the crate.

use std::fmt;

use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::TransportError;
use async_trait::async_trait;
use log::debug;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::contracts::OrderApiConsumer::{ChainlinkFulfilled, ChainlinkRequested};
use crate::contracts::OrderApiOracle::OracleRequest;

/// An inclusive range of blocks queried in one reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    /// First block of the window.
    pub from_block: u64,
    /// Last block of the window.
    pub to_block: u64,
}

impl BlockWindow {
    /// Creates a window covering `from_block..=to_block`.
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
        }
    }

    /// A window is empty when the cursor is already past the chain head.
    pub fn is_empty(&self) -> bool {
        self.from_block > self.to_block
    }
}

impl fmt::Display for BlockWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from_block, self.to_block)
    }
}

/// A `ChainlinkRequested` or `ChainlinkFulfilled` log reduced to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    /// The Chainlink request id.
    pub identifier: B256,
    /// Block the log was emitted in.
    pub block_number: u64,
}

/// An `OracleRequest` log carrying the full request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequestEvent {
    /// The request id, equal to the consumer's `ChainlinkRequested` id.
    pub request_id: B256,
    /// Job spec id.
    pub spec_id: B256,
    /// The contract that made the request.
    pub requester: Address,
    /// LINK payment attached to the request.
    pub payment: U256,
    /// Contract the oracle calls back.
    pub callback_addr: Address,
    /// Selector of the callback function.
    pub callback_function_id: FixedBytes<4>,
    /// Expiration after which the request can be cancelled.
    pub cancel_expiration: U256,
    /// Version of the payload encoding.
    pub data_version: U256,
    /// CBOR encoded request parameters.
    pub payload: Bytes,
    /// Block the log was emitted in.
    pub block_number: u64,
}

/// Errors raised while reading the ledger. All of them abort the current run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    /// The chain head could not be read.
    #[snafu(display("Failed to fetch the latest block number: {source}"))]
    LatestBlock {
        /// The transport error.
        source: TransportError,
    },

    /// A log query failed.
    #[snafu(display("Failed to query {event} logs in block window {window}: {source}"))]
    Query {
        /// Signature of the queried event.
        event: &'static str,
        /// The window that was queried.
        window: BlockWindow,
        /// The transport error.
        source: TransportError,
    },

    /// A log matched the event signature but did not decode as that event.
    #[snafu(display("Failed to decode {event} log: {source}"))]
    LogDecode {
        /// Signature of the expected event.
        event: &'static str,
        /// The ABI decoding error.
        source: alloy::sol_types::Error,
    },

    /// The node returned a log without a block number (a pending log).
    #[snafu(display("{event} log has no block number"))]
    MissingBlockNumber {
        /// Signature of the event.
        event: &'static str,
    },

    /// Any other failure of an [`EventSource`] implementation.
    #[snafu(display("Event source failure: {message}"))]
    Source {
        /// Description of the failure.
        message: String,
    },
}

/// Read access to the consumer and oracle event logs.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// The current chain head.
    async fn latest_block(&self) -> Result<u64, LedgerError>;

    /// `ChainlinkRequested` logs in `window`, ordered by block.
    async fn requested_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError>;

    /// `ChainlinkFulfilled` logs in `window`, ordered by block.
    async fn fulfilled_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError>;

    /// `OracleRequest` logs in `window`, ordered by block.
    async fn oracle_requests(
        &self,
        window: BlockWindow,
    ) -> Result<Vec<OracleRequestEvent>, LedgerError>;
}

/// [`EventSource`] backed by an `alloy` provider.
pub struct AlloyEventSource<P> {
    provider: P,
    consumer_address: Address,
    oracle_address: Address,
}

impl<P: Provider> AlloyEventSource<P> {
    /// Creates a source reading the consumer and oracle contracts through `provider`.
    pub fn new(provider: P, consumer_address: Address, oracle_address: Address) -> Self {
        Self {
            provider,
            consumer_address,
            oracle_address,
        }
    }

    /// Fetches the raw logs of event `E` emitted by `address` inside `window`.
    async fn fetch_logs<E: SolEvent>(
        &self,
        address: Address,
        window: BlockWindow,
    ) -> Result<Vec<Log>, LedgerError> {
        let filter = Filter::new()
            .address(address)
            .event_signature(E::SIGNATURE_HASH)
            .from_block(window.from_block)
            .to_block(window.to_block);

        let logs = self.provider.get_logs(&filter).await.context(QuerySnafu {
            event: E::SIGNATURE,
            window,
        })?;
        debug!(
            "Fetched {} {} logs in block window {}",
            logs.len(),
            E::SIGNATURE,
            window
        );
        Ok(logs)
    }
}

#[async_trait]
impl<P: Provider> EventSource for AlloyEventSource<P> {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.provider
            .get_block_number()
            .await
            .context(LatestBlockSnafu)
    }

    async fn requested_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError> {
        self.fetch_logs::<ChainlinkRequested>(self.consumer_address, window)
            .await?
            .iter()
            .map(requested_event_from_log)
            .collect()
    }

    async fn fulfilled_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError> {
        self.fetch_logs::<ChainlinkFulfilled>(self.consumer_address, window)
            .await?
            .iter()
            .map(fulfilled_event_from_log)
            .collect()
    }

    async fn oracle_requests(
        &self,
        window: BlockWindow,
    ) -> Result<Vec<OracleRequestEvent>, LedgerError> {
        self.fetch_logs::<OracleRequest>(self.oracle_address, window)
            .await?
            .iter()
            .map(oracle_request_from_log)
            .collect()
    }
}

/// Decodes `log` as event `E` and returns it with its block number.
fn decode_log<E: SolEvent>(log: &Log) -> Result<(E, u64), LedgerError> {
    let block_number = log.block_number.context(MissingBlockNumberSnafu {
        event: E::SIGNATURE,
    })?;
    let decoded = log.log_decode::<E>().context(LogDecodeSnafu {
        event: E::SIGNATURE,
    })?;
    Ok((decoded.inner.data, block_number))
}

/// Converts a raw `ChainlinkRequested` log.
pub fn requested_event_from_log(log: &Log) -> Result<RequestEvent, LedgerError> {
    let (event, block_number) = decode_log::<ChainlinkRequested>(log)?;
    Ok(RequestEvent {
        identifier: event.id,
        block_number,
    })
}

/// Converts a raw `ChainlinkFulfilled` log.
pub fn fulfilled_event_from_log(log: &Log) -> Result<RequestEvent, LedgerError> {
    let (event, block_number) = decode_log::<ChainlinkFulfilled>(log)?;
    Ok(RequestEvent {
        identifier: event.id,
        block_number,
    })
}

/// Converts a raw `OracleRequest` log.
pub fn oracle_request_from_log(log: &Log) -> Result<OracleRequestEvent, LedgerError> {
    let (event, block_number) = decode_log::<OracleRequest>(log)?;
    Ok(OracleRequestEvent {
        request_id: event.requestId,
        spec_id: event.specId,
        requester: event.requester,
        payment: event.payment,
        callback_addr: event.callbackAddr,
        callback_function_id: event.callbackFunctionId,
        cancel_expiration: event.cancelExpiration,
        data_version: event.dataVersion,
        payload: event.data,
        block_number,
    })
}
