//! # Polling Listener
//!
//! [`Listener`] turns the one-shot [`ReconciliationPipeline`] into a long running service. Every
//! tick it reconciles the window since the watermark, then publishes the records saved in that
//! run. A failed tick is logged and retried on the next one. The persisted watermark is untouched
//! by a failed reconciliation, so a retry reads the same window again.
//!
//! The loop ends when the shutdown future resolves. A poll that is already running is allowed to
//! finish first, so the watermark is never left behind a set of written records.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use snafu::{ensure, Snafu};
use tokio::time::{interval, MissedTickBehavior};

use crate::ledger::EventSource;
use crate::publish::{OrderPublisher, PublishPolicy, PublishReport};
use crate::reconcile::{Error, ReconcileReport, ReconciliationPipeline};

/// Result of one successful poll.
#[derive(Debug)]
pub struct PollOutcome {
    /// The reconciliation report.
    pub reconciled: ReconcileReport,
    /// The publish report, when a publisher is configured and records were saved.
    pub published: Option<PublishReport>,
}

/// Errors building a [`Listener`].
#[derive(Debug, Snafu)]
pub enum ListenerError {
    /// The poll interval is zero.
    #[snafu(display("Poll interval must be non-zero, got {poll_interval:?}"))]
    ZeroInterval {
        /// The rejected interval.
        poll_interval: Duration,
    },
}

/// Repeatedly reconciles and publishes until shut down.
pub struct Listener<S> {
    pipeline: ReconciliationPipeline<S>,
    publisher: Option<OrderPublisher>,
    publish_policy: PublishPolicy,
    poll_interval: Duration,
    fallback_block: u64,
}

impl<S: EventSource> Listener<S> {
    /// Creates a listener polling every `poll_interval`.
    ///
    /// `fallback_block` is the first block to read when no watermark has been persisted. Without a
    /// publisher the listener only reconciles. A zero `poll_interval` is rejected.
    pub fn new(
        pipeline: ReconciliationPipeline<S>,
        publisher: Option<OrderPublisher>,
        publish_policy: PublishPolicy,
        poll_interval: Duration,
        fallback_block: u64,
    ) -> Result<Self, ListenerError> {
        ensure!(!poll_interval.is_zero(), ZeroIntervalSnafu { poll_interval });

        Ok(Self {
            pipeline,
            publisher,
            publish_policy,
            poll_interval,
            fallback_block,
        })
    }

    /// Runs one reconciliation and publishes what it saved.
    pub async fn poll_once(&self) -> Result<PollOutcome, Error> {
        let reconciled = self.pipeline.run(self.fallback_block).await?;
        info!(
            "Reconciled block window {}: {} saved, {} skipped, {} unmatched, watermark {} -> {}",
            reconciled.window,
            reconciled.saved.len(),
            reconciled.skipped.len(),
            reconciled.unmatched.len(),
            reconciled.previous_watermark,
            reconciled.next_watermark
        );

        let published = match &self.publisher {
            Some(publisher) if !reconciled.saved.is_empty() => {
                let report = publisher
                    .publish(&reconciled.saved, self.publish_policy)
                    .await;
                if !report.is_success() {
                    warn!(
                        "{} of {} records failed to publish, they remain on disk for a later push",
                        report.failures.len(),
                        reconciled.saved.len()
                    );
                }
                Some(report)
            }
            _ => None,
        };

        Ok(PollOutcome {
            reconciled,
            published,
        })
    }

    /// Polls until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting listener, polling every {}s",
            self.poll_interval.as_secs_f64()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping listener");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Poll failed, retrying next tick: {e}");
                    }
                }
            }
        }
    }
}
