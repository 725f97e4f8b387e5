//! HTTP transport for the collection endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use super::{BatchPayload, BestEffortTransport, DeliveryOutcome, ReliableTransport};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const REQUEST_TIMEOUT_SECS: u64 = 20;

const API_KEY_HEADER: &str = "X-API-Key";

/// Success body: `{"accepted": <count>}`. Tolerates a missing field.
#[derive(Debug, Deserialize)]
struct AcceptedBody {
    #[serde(default)]
    accepted: u64,
}

pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid collection endpoint '{endpoint}'"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    fn request(&self, payload: &BatchPayload) -> reqwest::RequestBuilder {
        let mut request = self.client.post(self.endpoint.clone()).json(payload);
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }
        request
    }
}

#[async_trait]
impl ReliableTransport for HttpTransport {
    async fn deliver(&self, payload: &BatchPayload) -> DeliveryOutcome {
        let response = match self.request(payload).send().await {
            Ok(response) => response,
            Err(err) => {
                return DeliveryOutcome::TransientFailure {
                    reason: format!("network error: {err}"),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            let accepted = match response.json::<AcceptedBody>().await {
                Ok(body) => body.accepted,
                Err(_) => payload.len() as u64,
            };
            log_info!("Endpoint accepted {accepted} record(s)");
            return DeliveryOutcome::Accepted { accepted };
        }

        // 408/429 are retryable despite living in the 4xx range.
        let retryable_client_error =
            status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS;
        if status.is_client_error() && !retryable_client_error {
            DeliveryOutcome::PermanentFailure {
                reason: format!("endpoint rejected batch: {status}"),
            }
        } else {
            DeliveryOutcome::TransientFailure {
                reason: format!("server responded {status}"),
            }
        }
    }
}

impl BestEffortTransport for HttpTransport {
    fn deliver_detached(&self, payload: BatchPayload) {
        let request = self.request(&payload);
        let count = payload.len();

        // Detached: the host is tearing down, so the send races process
        // death. Whatever does not make it stays in the durable mirror.
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    log_info!(
                        "Unload delivery of {count} record(s) got {}",
                        response.status()
                    );
                }
                Err(err) => {
                    log_warn!("Unload delivery of {count} record(s) failed: {err}");
                }
            }
        });
    }
}
