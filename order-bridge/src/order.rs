//! The decoded order request and its wire form.

use serde::{Deserialize, Serialize};

use crate::config::BRIDGE_TAG;

/// A redeemed order decoded from an oracle request payload.
///
/// Persisted as JSON, one file per `token_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Delivery address.
    pub address: String,
    /// Account that redeemed the token.
    pub requestor: String,
    /// The redeemed token. Records are keyed by it.
    pub token_id: u64,
    /// Recipe ordered with the token.
    pub recipe_id: u64,
}

/// The body posted to the order API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundOrder<'a> {
    /// Integration tag, always [`BRIDGE_TAG`].
    pub bridge: &'static str,
    /// The order itself.
    #[serde(flatten)]
    pub order: &'a OrderRequest,
}

impl<'a> From<&'a OrderRequest> for OutboundOrder<'a> {
    fn from(order: &'a OrderRequest) -> Self {
        OutboundOrder {
            bridge: BRIDGE_TAG,
            order,
        }
    }
}
