//! In-memory ledger used by the crate level tests.

use std::sync::Mutex;

use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use async_trait::async_trait;

use crate::decoder::{encode_terms, Term};
use crate::ledger::{BlockWindow, EventSource, LedgerError, OracleRequestEvent, RequestEvent};

/// Queries a [`MemoryEventSource`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    LatestBlock,
    Requested,
    Fulfilled,
    Oracle,
}

/// An [`EventSource`] over fixed event lists that records every query it answers.
#[derive(Debug, Default)]
pub struct MemoryEventSource {
    pub head: u64,
    pub requested: Vec<RequestEvent>,
    pub fulfilled: Vec<RequestEvent>,
    pub oracle_requests: Vec<OracleRequestEvent>,
    pub failing: Option<Query>,
    pub queries: Mutex<Vec<Query>>,
}

impl MemoryEventSource {
    pub fn queried(&self, query: Query) -> bool {
        self.queries.lock().unwrap().contains(&query)
    }

    fn answer(&self, query: Query) -> Result<(), LedgerError> {
        self.queries.lock().unwrap().push(query);
        if self.failing == Some(query) {
            return Err(LedgerError::Source {
                message: format!("{query:?} unavailable"),
            });
        }
        Ok(())
    }
}

fn in_window(block_number: u64, window: BlockWindow) -> bool {
    (window.from_block..=window.to_block).contains(&block_number)
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn latest_block(&self) -> Result<u64, LedgerError> {
        self.answer(Query::LatestBlock)?;
        Ok(self.head)
    }

    async fn requested_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError> {
        self.answer(Query::Requested)?;
        Ok(self
            .requested
            .iter()
            .filter(|event| in_window(event.block_number, window))
            .cloned()
            .collect())
    }

    async fn fulfilled_events(&self, window: BlockWindow) -> Result<Vec<RequestEvent>, LedgerError> {
        self.answer(Query::Fulfilled)?;
        Ok(self
            .fulfilled
            .iter()
            .filter(|event| in_window(event.block_number, window))
            .cloned()
            .collect())
    }

    async fn oracle_requests(
        &self,
        window: BlockWindow,
    ) -> Result<Vec<OracleRequestEvent>, LedgerError> {
        self.answer(Query::Oracle)?;
        Ok(self
            .oracle_requests
            .iter()
            .filter(|event| in_window(event.block_number, window))
            .cloned()
            .collect())
    }
}

pub fn request_id(n: u8) -> B256 {
    B256::repeat_byte(n)
}

pub fn request(n: u8, block_number: u64) -> RequestEvent {
    RequestEvent {
        identifier: request_id(n),
        block_number,
    }
}

pub fn oracle_request(n: u8, payload: Vec<u8>, block_number: u64) -> OracleRequestEvent {
    OracleRequestEvent {
        request_id: request_id(n),
        spec_id: B256::repeat_byte(0xaa),
        requester: Address::repeat_byte(0x11),
        payment: U256::from(100_000_000_000_000_000u64),
        callback_addr: Address::repeat_byte(0x11),
        callback_function_id: FixedBytes::from([0x4e, 0x71, 0xd9, 0x2d]),
        cancel_expiration: U256::from(1_700_000_300u64),
        data_version: U256::from(1),
        payload: Bytes::from(payload),
        block_number,
    }
}

/// The CBOR payload of an order for `token_id` and `recipe_id`.
pub fn order_payload(token_id: u64, recipe_id: u64) -> Vec<u8> {
    encode_terms(&[
        Term::Text("address".into()),
        Term::Text("0x1".into()),
        Term::Text("requestor".into()),
        Term::Text("0x2".into()),
        Term::Text("token_id".into()),
        Term::Integer(token_id.into()),
        Term::Text("recipe_id".into()),
        Term::Integer(recipe_id.into()),
    ])
    .unwrap()
}
