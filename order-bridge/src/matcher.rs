//! Correlation of consumer and oracle events.
//!
//! Both functions here are pure: they only compare identifiers, so they can be exercised without a
//! ledger connection. Lookups go through a hash index of the second collection.

use std::collections::{HashMap, HashSet};

use alloy::primitives::B256;

use crate::ledger::{OracleRequestEvent, RequestEvent};

/// Requests that have been emitted but not fulfilled inside one query window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequests {
    /// The unfulfilled `ChainlinkRequested` events, in ledger order.
    pub pending: Vec<RequestEvent>,
    /// The highest block among all requested events, or the window start if there were none.
    pub latest_block: u64,
}

impl PendingRequests {
    /// Identifiers of the pending requests, in order.
    pub fn identifiers(&self) -> Vec<B256> {
        self.pending.iter().map(|event| event.identifier).collect()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Keeps every requested event whose identifier has no fulfilled counterpart.
///
/// A single fulfillment satisfies every requested event carrying the same identifier. The order of
/// `requested` is preserved.
pub fn pending_requests(
    requested: &[RequestEvent],
    fulfilled: &[RequestEvent],
    from_block: u64,
) -> PendingRequests {
    let fulfilled_ids: HashSet<&B256> = fulfilled.iter().map(|event| &event.identifier).collect();

    let latest_block = requested
        .iter()
        .map(|event| event.block_number)
        .fold(from_block, u64::max);

    let pending = requested
        .iter()
        .filter(|event| !fulfilled_ids.contains(&event.identifier))
        .cloned()
        .collect();

    PendingRequests {
        pending,
        latest_block,
    }
}

/// For each pending identifier, in order, picks the first oracle request carrying it.
///
/// Identifiers without an oracle request are skipped: the oracle log may simply not have been
/// emitted yet.
pub fn matched_oracle_requests(
    pending_ids: &[B256],
    oracle_requests: &[OracleRequestEvent],
) -> Vec<OracleRequestEvent> {
    let mut first_by_id: HashMap<&B256, &OracleRequestEvent> = HashMap::new();
    for request in oracle_requests {
        first_by_id.entry(&request.request_id).or_insert(request);
    }

    pending_ids
        .iter()
        .filter_map(|id| first_by_id.get(id).map(|request| (*request).clone()))
        .collect()
}

/// Pending identifiers that [`matched_oracle_requests`] found no oracle request for.
pub fn unmatched_requests<'a>(
    pending: &'a [RequestEvent],
    matched: &[OracleRequestEvent],
) -> Vec<&'a RequestEvent> {
    let matched_ids: HashSet<&B256> = matched.iter().map(|request| &request.request_id).collect();
    pending
        .iter()
        .filter(|event| !matched_ids.contains(&event.identifier))
        .collect()
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, Bytes, FixedBytes, U256};

    use super::*;

    fn id(n: u8) -> B256 {
        B256::with_last_byte(n)
    }

    fn request(n: u8, block_number: u64) -> RequestEvent {
        RequestEvent {
            identifier: id(n),
            block_number,
        }
    }

    fn oracle(n: u8, block_number: u64, payload: &[u8]) -> OracleRequestEvent {
        OracleRequestEvent {
            request_id: id(n),
            spec_id: B256::ZERO,
            requester: Address::ZERO,
            payment: U256::ZERO,
            callback_addr: Address::ZERO,
            callback_function_id: FixedBytes::ZERO,
            cancel_expiration: U256::ZERO,
            data_version: U256::from(1u64),
            payload: Bytes::copy_from_slice(payload),
            block_number,
        }
    }

    #[test]
    fn we_can_compute_pending_requests_in_order() {
        let requested = [request(1, 10), request(2, 12), request(3, 15)];
        let fulfilled = [request(1, 11)];

        let pending = pending_requests(&requested, &fulfilled, 0);

        assert_eq!(pending.pending, vec![request(2, 12), request(3, 15)]);
        assert_eq!(pending.latest_block, 15);
        assert_eq!(pending.identifiers(), vec![id(2), id(3)]);
    }

    #[test]
    fn we_can_compute_pending_requests_with_no_fulfillments() {
        let requested = [request(4, 7), request(5, 3)];

        let pending = pending_requests(&requested, &[], 1);

        assert_eq!(pending.pending, requested.to_vec());
        assert_eq!(pending.latest_block, 7);
    }

    #[test]
    fn we_can_compute_pending_requests_with_no_requests() {
        let pending = pending_requests(&[], &[request(1, 4)], 42);

        assert!(pending.is_empty());
        assert_eq!(pending.latest_block, 42);
    }

    #[test]
    fn a_single_fulfillment_satisfies_repeated_requests() {
        let requested = [request(1, 10), request(2, 11), request(1, 12)];
        let fulfilled = [request(1, 13)];

        let pending = pending_requests(&requested, &fulfilled, 0);

        assert_eq!(pending.pending, vec![request(2, 11)]);
        assert_eq!(pending.latest_block, 12);
    }

    #[test]
    fn fully_fulfilled_windows_still_report_the_latest_block() {
        let requested = [request(1, 20), request(2, 21)];
        let fulfilled = [request(2, 22), request(1, 22)];

        let pending = pending_requests(&requested, &fulfilled, 5);

        assert!(pending.is_empty());
        assert_eq!(pending.latest_block, 21);
    }

    #[test]
    fn we_can_match_the_first_oracle_request_per_pending_id() {
        let oracle_requests = [
            oracle(3, 14, b"c"),
            oracle(2, 12, b"first"),
            oracle(2, 13, b"second"),
            oracle(9, 16, b"unrelated"),
        ];

        let matched = matched_oracle_requests(&[id(2), id(3), id(4)], &oracle_requests);

        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].request_id, id(2));
        assert_eq!(matched[0].payload, Bytes::from_static(b"first"));
        assert_eq!(matched[1].request_id, id(3));
    }

    #[test]
    fn matched_requests_are_bounded_by_the_pending_ids() {
        let pending_ids = [id(1), id(2)];
        let oracle_requests = [oracle(1, 1, b""), oracle(2, 2, b""), oracle(3, 3, b"")];

        let matched = matched_oracle_requests(&pending_ids, &oracle_requests);

        assert!(matched.len() <= pending_ids.len());
        assert!(matched
            .iter()
            .all(|request| pending_ids.contains(&request.request_id)));
        assert!(matched_oracle_requests(&[], &oracle_requests).is_empty());
        assert!(matched_oracle_requests(&pending_ids, &[]).is_empty());
    }

    #[test]
    fn we_can_list_pending_requests_without_an_oracle_request() {
        let pending = [request(2, 12), request(3, 15)];
        let matched = [oracle(2, 12, b"")];

        let unmatched = unmatched_requests(&pending, &matched);

        assert_eq!(unmatched, vec![&request(3, 15)]);
    }
}
