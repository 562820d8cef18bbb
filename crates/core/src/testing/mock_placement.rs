//! Mock placement service for testing.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::placement::{PlacementError, PlacementRequest, PlacementService};

/// Mock implementation of the PlacementService trait.
///
/// Picks the first known server that the request does not exclude.
#[derive(Debug, Clone, Default)]
pub struct MockPlacementService {
    servers: Arc<RwLock<Vec<String>>>,
    requests: Arc<RwLock<Vec<PlacementRequest>>>,
    next_error: Arc<RwLock<Option<PlacementError>>>,
}

impl MockPlacementService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock service that knows the given servers.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: Arc::new(RwLock::new(servers.into_iter().map(Into::into).collect())),
            ..Self::default()
        }
    }

    pub async fn set_servers(&self, servers: Vec<String>) {
        *self.servers.write().await = servers;
    }

    /// Requests received so far.
    pub async fn recorded_requests(&self) -> Vec<PlacementRequest> {
        self.requests.read().await.clone()
    }

    pub async fn set_next_error(&self, error: PlacementError) {
        *self.next_error.write().await = Some(error);
    }
}

#[async_trait]
impl PlacementService for MockPlacementService {
    async fn choose(&self, request: &PlacementRequest) -> Result<Option<String>, PlacementError> {
        self.requests.write().await.push(request.clone());
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        Ok(self
            .servers
            .read()
            .await
            .iter()
            .find(|s| !request.exclude_servers.contains(s))
            .cloned())
    }
}
