//! # Order Bridge Library
//!
//! This library reconciles Chainlink oracle requests made by an order consumer contract against
//! their fulfillments, decodes the CBOR payload of every request still pending into an order
//! record, stores the records on disk and republishes them to an HTTP order API.
//!
//! ## Modules
//! - [`ledger`]: Reads `ChainlinkRequested`, `ChainlinkFulfilled` and `OracleRequest` events.
//! - [`matcher`]: Finds pending requests and the oracle requests that carry their payloads.
//! - [`decoder`]: Decodes the Chainlink CBOR payload into an [`order::OrderRequest`].
//! - [`reconcile`]: Runs one reconciliation pass over a block window.
//! - [`publish`]: Posts stored records to the order API.
//! - [`listener`]: Polls the ledger on an interval, reconciling and publishing as it goes.

/// Storage, ledger and API configuration.
pub mod config;

/// The order consumer and oracle contract events built with sol apis.
pub mod contracts;

/// The `ledger` module fetches and decodes contract events over a block window through the
/// [`ledger::EventSource`] seam.
pub mod ledger;

/// Pure correlation of requested, fulfilled and oracle events.
pub mod matcher;

/// The `decoder` module parses the Chainlink request payload: a sequence of CBOR items read as
/// alternating keys and values.
pub mod decoder;

/// Order records and the body posted to the order API.
pub mod order;

/// One JSON file per decoded order request.
pub mod record_store;

/// The `fromBlock` high-water mark and its advancement rules.
pub mod watermark;

/// The `reconcile` module ties the ledger, matcher, decoder and stores into a single pass that
/// only advances the watermark after every decoded record is on disk.
pub mod reconcile;

/// Republishing of stored records.
pub mod publish;

/// Long running polling loop.
pub mod listener;

#[cfg(test)]
mod mock;


#[cfg(test)]
mod test_directory;
