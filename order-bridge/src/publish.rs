//! Republishes persisted order requests to the order API.
//!
//! Each record becomes one `POST {base_url}/api/{api_version}/orders` carrying the record plus the
//! bridge tag. Records are sent one at a time in file name order.

use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use snafu::{ResultExt, Snafu};

use crate::config::ApiConfig;
use crate::order::{OrderRequest, OutboundOrder};
use crate::record_store::{PersistenceError, RecordStore};

/// What to do with the rest of a batch once one record fails to publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Stop at the first failure.
    #[default]
    Abort,
    /// Report the failure and keep going.
    Continue,
}

/// Errors publishing order requests.
#[derive(Debug, Snafu)]
pub enum PublishError {
    /// The request could not be sent or its response not read.
    #[snafu(display("Failed to send order for token {token_id}: {source}"))]
    Transport {
        /// Token of the record being published.
        token_id: u64,
        /// The client error.
        source: reqwest::Error,
    },

    /// The API answered with a non-success status.
    #[snafu(display("Order API rejected token {token_id} with {status}: {body}"))]
    Status {
        /// Token of the record being published.
        token_id: u64,
        /// The response status.
        status: StatusCode,
        /// The response body, for the log.
        body: String,
    },

    /// The records to publish could not be read.
    #[snafu(display("Failed to read records to publish: {source}"))]
    Records {
        /// The storage error.
        source: PersistenceError,
    },
}

impl PublishError {
    /// Token of the record that failed, if the error concerns one record.
    pub fn token_id(&self) -> Option<u64> {
        match self {
            PublishError::Transport { token_id, .. } | PublishError::Status { token_id, .. } => {
                Some(*token_id)
            }
            PublishError::Records { .. } => None,
        }
    }
}

/// Outcome of publishing a batch.
#[derive(Debug, Default)]
pub struct PublishReport {
    /// Tokens accepted by the API, in the order they were sent.
    pub published: Vec<u64>,
    /// Records that failed.
    pub failures: Vec<PublishError>,
}

impl PublishReport {
    /// Whether every attempted record was accepted.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Posts order requests to the order API.
#[derive(Debug, Clone)]
pub struct OrderPublisher {
    client: Client,
    endpoint: String,
}

impl OrderPublisher {
    /// Creates a publisher for the API described by `config`.
    pub fn new(config: &ApiConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// Creates a publisher sharing an existing client.
    pub fn with_client(client: Client, config: &ApiConfig) -> Self {
        Self {
            client,
            endpoint: config.orders_endpoint(),
        }
    }

    /// The URL orders are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Posts one order. Any 2xx response is success.
    pub async fn publish_one(&self, order: &OrderRequest) -> Result<(), PublishError> {
        let token_id = order.token_id;
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OutboundOrder::from(order))
            .send()
            .await
            .context(TransportSnafu { token_id })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                token_id,
                status,
                body,
            }
            .fail();
        }

        info!("Published order for token {token_id} ({status})");
        Ok(())
    }

    /// Posts `orders` in sequence, following `policy` on failure.
    pub async fn publish(&self, orders: &[OrderRequest], policy: PublishPolicy) -> PublishReport {
        let mut report = PublishReport::default();
        for order in orders {
            match self.publish_one(order).await {
                Ok(()) => report.published.push(order.token_id),
                Err(e) => {
                    error!("{e}");
                    report.failures.push(e);
                    if policy == PublishPolicy::Abort {
                        warn!(
                            "Aborting publish with {} records left unsent",
                            orders.len() - report.published.len() - report.failures.len()
                        );
                        break;
                    }
                }
            }
        }
        report
    }

    /// Publishes the stored record for `token_id`, or every stored record when it is `None`.
    pub async fn push(
        &self,
        store: &RecordStore,
        token_id: Option<u64>,
        policy: PublishPolicy,
    ) -> Result<PublishReport, PublishError> {
        let orders = match token_id {
            Some(token_id) => vec![store.load(token_id).await.context(RecordsSnafu)?],
            None => store.load_all().await.context(RecordsSnafu)?,
        };
        info!(
            "Publishing {} records from {} to {}",
            orders.len(),
            store.dir().display(),
            self.endpoint()
        );
        Ok(self.publish(&orders, policy).await)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::config::StorageConfig;
    use crate::test_directory::TestDirectory;

    fn order(token_id: u64) -> OrderRequest {
        OrderRequest {
            address: "0x1".into(),
            requestor: "0x2".into(),
            token_id,
            recipe_id: 3,
        }
    }

    fn publisher_for(server: &MockServer) -> OrderPublisher {
        OrderPublisher::new(&ApiConfig {
            base_url: Url::parse(&server.base_url()).unwrap(),
            api_version: "v1".into(),
        })
    }

    #[tokio::test]
    async fn we_can_publish_an_order_with_the_bridge_tag() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/orders").json_body(json!({
                    "bridge": "orderpizzav1",
                    "address": "0x1",
                    "requestor": "0x2",
                    "token_id": 7,
                    "recipe_id": 3,
                }));
                then.status(201);
            })
            .await;

        let publisher = publisher_for(&server);
        assert_eq!(
            publisher.endpoint(),
            format!("{}/api/v1/orders", server.base_url())
        );

        publisher.publish_one(&order(7)).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn we_cannot_publish_when_the_api_rejects_the_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/v1/orders");
                then.status(500).body("kitchen closed");
            })
            .await;

        let result = publisher_for(&server).publish_one(&order(7)).await;

        match result {
            Err(PublishError::Status {
                token_id,
                status,
                body,
            }) => {
                assert_eq!(token_id, 7);
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "kitchen closed");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn the_abort_policy_stops_at_the_first_failure() {
        let server = MockServer::start_async().await;
        let rejected = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/orders")
                    .json_body_partial(r#"{"token_id": 1}"#);
                then.status(400);
            })
            .await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/orders")
                    .json_body_partial(r#"{"token_id": 2}"#);
                then.status(200);
            })
            .await;

        let orders = [order(1), order(2)];
        let publisher = publisher_for(&server);

        let report = publisher.publish(&orders, PublishPolicy::Abort).await;
        assert!(report.published.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].token_id(), Some(1));
        rejected.assert_hits_async(1).await;
        accepted.assert_hits_async(0).await;

        let report = publisher.publish(&orders, PublishPolicy::Continue).await;
        assert_eq!(report.published, vec![2]);
        assert!(!report.is_success());
        accepted.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn we_can_push_one_stored_record() {
        let directory = TestDirectory::random(&mut StdRng::seed_from_u64(31));
        let store = RecordStore::new(&StorageConfig::from_data_dir(&directory.path));
        store.save(&order(4)).await.unwrap();
        store.save(&order(5)).await.unwrap();

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/orders")
                    .json_body_partial(r#"{"token_id": 5}"#);
                then.status(200);
            })
            .await;

        let report = publisher_for(&server)
            .push(&store, Some(5), PublishPolicy::Abort)
            .await
            .unwrap();

        assert_eq!(report.published, vec![5]);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn we_cannot_push_a_record_that_was_never_stored() {
        let directory = TestDirectory::random(&mut StdRng::seed_from_u64(32));
        let store = RecordStore::new(&StorageConfig::from_data_dir(&directory.path));
        let server = MockServer::start_async().await;

        let result = publisher_for(&server)
            .push(&store, Some(9), PublishPolicy::Abort)
            .await;

        assert!(matches!(result, Err(PublishError::Records { .. })));
    }
}
