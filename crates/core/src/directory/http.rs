//! HTTP instance directory client: `GET /vms/{uuid}`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::config::ServiceConfig;
use crate::metrics::observe_external_call;

use super::{DirectoryError, InstanceDirectory, InstanceInfo};

pub struct HttpInstanceDirectory {
    client: Client,
    config: ServiceConfig,
}

impl HttpInstanceDirectory {
    pub fn new(config: ServiceConfig) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| DirectoryError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn fetch(&self, uuid: &str) -> Result<Option<InstanceInfo>, DirectoryError> {
        let url = format!("{}/vms/{}", self.config.url.trim_end_matches('/'), uuid);
        let mut builder = self.client.get(&url);
        if let Some(token) = self.config.api_token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DirectoryError::Timeout
            } else if e.is_connect() {
                DirectoryError::ConnectionFailed(e.to_string())
            } else {
                DirectoryError::ApiError(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let info: InstanceInfo = response
                    .json()
                    .await
                    .map_err(|e| DirectoryError::ApiError(format!("invalid instance: {}", e)))?;
                // Destroyed instances are gone as far as migrations are concerned.
                if info.state == "destroyed" {
                    Ok(None)
                } else {
                    Ok(Some(info))
                }
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DirectoryError::ApiError(format!("HTTP {}: {}", status, body)))
            }
        }
    }
}

#[async_trait]
impl InstanceDirectory for HttpInstanceDirectory {
    async fn get_instance(&self, uuid: &str) -> Result<Option<InstanceInfo>, DirectoryError> {
        let started = Instant::now();
        let result = self.fetch(uuid).await;
        observe_external_call(
            "directory",
            "get_instance",
            started.elapsed().as_secs_f64(),
            result.is_ok(),
        );
        result
    }
}
