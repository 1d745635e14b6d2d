//! # Reconciliation Pipeline
//!
//! One run of [`ReconciliationPipeline::run`] walks these stages in order, never going back:
//!
//! ```text
//! LoadWatermark -> FetchRequestEvents -> ComputePending -> FetchOracleEvents
//!   -> ComputeMatched -> DecodeAndPersist -> AdvanceWatermark -> Done
//! ```
//!
//! When no request is pending the oracle stages are skipped and the watermark is written back
//! unchanged. A ledger failure aborts the run before anything is written. A payload that does not
//! decode is logged and skipped. A write failure aborts the run before the watermark moves.

use std::fmt;

use alloy::primitives::B256;
use log::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};

use crate::decoder::{decode_order_request, DecodeError};
use crate::ledger::{BlockWindow, EventSource, LedgerError, RequestEvent};
use crate::matcher::{matched_oracle_requests, pending_requests, unmatched_requests};
use crate::order::OrderRequest;
use crate::record_store::{PersistenceError, RecordStore};
use crate::watermark::{compute_next, WatermarkPolicy, WatermarkStore};

/// Stages of a run, logged on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    LoadWatermark,
    FetchRequestEvents,
    ComputePending,
    FetchOracleEvents,
    ComputeMatched,
    DecodeAndPersist,
    AdvanceWatermark,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LoadWatermark => "LOAD_WATERMARK",
            Stage::FetchRequestEvents => "FETCH_REQUEST_EVENTS",
            Stage::ComputePending => "COMPUTE_PENDING",
            Stage::FetchOracleEvents => "FETCH_ORACLE_EVENTS",
            Stage::ComputeMatched => "COMPUTE_MATCHED",
            Stage::DecodeAndPersist => "DECODE_AND_PERSIST",
            Stage::AdvanceWatermark => "ADVANCE_WATERMARK",
            Stage::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Logs the transition into `stage`.
fn enter(stage: Stage) {
    debug!("Reconciliation stage {stage}");
}

/// An oracle request whose payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRequest {
    /// The request id.
    pub request_id: B256,
    /// Block of the `OracleRequest` log.
    pub block_number: u64,
    /// Why decoding failed.
    pub reason: String,
}

/// What one run observed and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The queried window.
    pub window: BlockWindow,
    /// Number of `ChainlinkRequested` events in the window.
    pub requested: usize,
    /// Number of `ChainlinkFulfilled` events in the window.
    pub fulfilled: usize,
    /// Number of pending requests.
    pub pending: usize,
    /// Number of pending requests with an oracle request.
    pub matched: usize,
    /// Records written in this run.
    pub saved: Vec<OrderRequest>,
    /// Matched requests dropped because their payload did not decode.
    pub skipped: Vec<SkippedRequest>,
    /// Pending requests without an oracle request in the window.
    pub unmatched: Vec<RequestEvent>,
    /// Watermark the run started from.
    pub previous_watermark: u64,
    /// Watermark persisted at the end of the run.
    pub next_watermark: u64,
}

impl ReconcileReport {
    /// A report for a run that found nothing to do.
    fn idle(window: BlockWindow, requested: usize, fulfilled: usize) -> Self {
        Self {
            window,
            requested,
            fulfilled,
            pending: 0,
            matched: 0,
            saved: Vec::new(),
            skipped: Vec::new(),
            unmatched: Vec::new(),
            previous_watermark: window.from_block,
            next_watermark: window.from_block,
        }
    }
}

/// Errors that abort a reconciliation run.
#[derive(Debug, Snafu)]
pub enum Error {
    /// Reading the ledger failed. Nothing was persisted.
    #[snafu(display("Ledger query from block {from_block} failed, nothing persisted: {source}"))]
    Ledger {
        /// Watermark the run started from.
        from_block: u64,
        /// The ledger error.
        source: LedgerError,
    },

    /// Writing a record or the watermark failed. The watermark was not advanced.
    #[snafu(display(
        "Persistence failed for block window {window}, watermark not advanced: {source}"
    ))]
    Persistence {
        /// The window being reconciled.
        window: BlockWindow,
        /// The storage error.
        source: PersistenceError,
    },
}

/// Reconciles consumer requests against oracle requests and stores the decoded orders.
pub struct ReconciliationPipeline<S> {
    source: S,
    records: RecordStore,
    watermark: WatermarkStore,
    policy: WatermarkPolicy,
}

impl<S: EventSource> ReconciliationPipeline<S> {
    /// Creates a pipeline reading from `source` and writing to the given stores.
    pub fn new(
        source: S,
        records: RecordStore,
        watermark: WatermarkStore,
        policy: WatermarkPolicy,
    ) -> Self {
        Self {
            source,
            records,
            watermark,
            policy,
        }
    }

    /// The event source being read.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs one reconciliation over `[watermark, head]`.
    ///
    /// `fallback_block` is used when no watermark has been persisted yet.
    pub async fn run(&self, fallback_block: u64) -> Result<ReconcileReport, Error> {
        enter(Stage::LoadWatermark);
        let from_block = self.watermark.load(fallback_block).await;

        enter(Stage::FetchRequestEvents);
        let head = self
            .source
            .latest_block()
            .await
            .context(LedgerSnafu { from_block })?;
        let window = BlockWindow::new(from_block, head);

        if window.is_empty() {
            info!("Watermark {from_block} is past the chain head {head}, nothing to fetch");
            let report = ReconcileReport::idle(window, 0, 0);
            self.advance(window, report.next_watermark).await?;
            return Ok(report);
        }

        info!("Getting request events in block window {window}");
        let (requested, fulfilled) = tokio::try_join!(
            self.source.requested_events(window),
            self.source.fulfilled_events(window)
        )
        .context(LedgerSnafu { from_block })?;
        info!(
            "Found {} ChainlinkRequested and {} ChainlinkFulfilled events",
            requested.len(),
            fulfilled.len()
        );

        enter(Stage::ComputePending);
        let pending = pending_requests(&requested, &fulfilled, from_block);
        for request in &pending.pending {
            info!(
                "Found pending request {} at block {}",
                request.identifier, request.block_number
            );
        }

        if pending.is_empty() {
            info!(
                "No pending requests in block window {window}, keeping watermark {from_block}"
            );
            let report = ReconcileReport::idle(window, requested.len(), fulfilled.len());
            self.advance(window, report.next_watermark).await?;
            return Ok(report);
        }

        enter(Stage::FetchOracleEvents);
        let oracle_requests = self
            .source
            .oracle_requests(window)
            .await
            .context(LedgerSnafu { from_block })?;
        info!("Found {} OracleRequest events", oracle_requests.len());

        enter(Stage::ComputeMatched);
        let matched = matched_oracle_requests(&pending.identifiers(), &oracle_requests);
        let unmatched: Vec<RequestEvent> = unmatched_requests(&pending.pending, &matched)
            .into_iter()
            .cloned()
            .collect();
        for request in &unmatched {
            warn!(
                "Pending request {} at block {} has no oracle request in block window {window}",
                request.identifier, request.block_number
            );
        }
        info!(
            "Matched {} oracle requests to {} pending requests",
            matched.len(),
            pending.pending.len()
        );

        enter(Stage::DecodeAndPersist);
        let mut saved = Vec::new();
        let mut skipped = Vec::new();
        for request in &matched {
            match decode_order_request(&request.payload) {
                Ok(order) => {
                    self.records
                        .save(&order)
                        .await
                        .context(PersistenceSnafu { window })?;
                    saved.push(order);
                }
                Err(e) => {
                    error!(
                        "Skipping oracle request {} at block {} in block window {window}: {e}",
                        request.request_id, request.block_number
                    );
                    skipped.push(skipped_request(request.request_id, request.block_number, &e));
                }
            }
        }

        let next = compute_next(from_block, pending.latest_block, true);
        let earliest_unmatched = unmatched.iter().map(|request| request.block_number).min();
        let next_watermark = self.policy.apply(next, from_block, earliest_unmatched);
        self.advance(window, next_watermark).await?;

        Ok(ReconcileReport {
            window,
            requested: requested.len(),
            fulfilled: fulfilled.len(),
            pending: pending.pending.len(),
            matched: matched.len(),
            saved,
            skipped,
            unmatched,
            previous_watermark: from_block,
            next_watermark,
        })
    }

    /// Persists the watermark that ends a run.
    async fn advance(&self, window: BlockWindow, next_watermark: u64) -> Result<(), Error> {
        enter(Stage::AdvanceWatermark);
        self.watermark
            .persist(next_watermark)
            .await
            .context(PersistenceSnafu { window })?;
        enter(Stage::Done);
        Ok(())
    }
}

/// Records a decode failure for the report.
fn skipped_request(request_id: B256, block_number: u64, error: &DecodeError) -> SkippedRequest {
    SkippedRequest {
        request_id,
        block_number,
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_display_as_their_state_names() {
        assert_eq!(Stage::LoadWatermark.to_string(), "LOAD_WATERMARK");
        assert_eq!(Stage::DecodeAndPersist.to_string(), "DECODE_AND_PERSIST");
        assert_eq!(Stage::Done.to_string(), "DONE");
    }

    #[test]
    fn idle_reports_keep_the_watermark() {
        let report = ReconcileReport::idle(BlockWindow::new(12, 30), 2, 2);

        assert_eq!(report.previous_watermark, 12);
        assert_eq!(report.next_watermark, 12);
        assert!(report.saved.is_empty());
    }
}
