//! HTTP placement client. `POST /allocate` answers `{ "server_uuid": ... }`
//! with 200, or 409 when nothing fits.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::ServiceConfig;
use crate::metrics::observe_external_call;

use super::{PlacementError, PlacementRequest, PlacementService};

#[derive(Debug, Deserialize)]
struct AllocateResponse {
    server_uuid: Option<String>,
}

pub struct HttpPlacementService {
    client: Client,
    config: ServiceConfig,
}

impl HttpPlacementService {
    pub fn new(config: ServiceConfig) -> Result<Self, PlacementError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| PlacementError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn allocate(&self, request: &PlacementRequest) -> Result<Option<String>, PlacementError> {
        let url = format!("{}/allocate", self.config.url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = self.config.api_token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PlacementError::Timeout
            } else if e.is_connect() {
                PlacementError::ConnectionFailed(e.to_string())
            } else {
                PlacementError::ApiError(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(None),
            status if status.is_success() => {
                let body: AllocateResponse = response
                    .json()
                    .await
                    .map_err(|e| PlacementError::ApiError(format!("invalid response: {}", e)))?;
                Ok(body.server_uuid)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PlacementError::ApiError(format!("HTTP {}: {}", status, body)))
            }
        }
    }
}

#[async_trait]
impl PlacementService for HttpPlacementService {
    async fn choose(&self, request: &PlacementRequest) -> Result<Option<String>, PlacementError> {
        let started = Instant::now();
        let result = self.allocate(request).await;
        observe_external_call(
            "placement",
            "choose",
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        result
    }
}
