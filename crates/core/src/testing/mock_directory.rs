//! Mock instance directory for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::directory::{DirectoryError, InstanceDirectory, InstanceInfo};

/// Mock implementation of the InstanceDirectory trait.
///
/// Clones share the same instance table, so a clone handed to
/// [`MockJobEngine::with_directory`](super::MockJobEngine::with_directory)
/// sees (and changes) what the test sees.
#[derive(Debug, Clone, Default)]
pub struct MockInstanceDirectory {
    instances: Arc<RwLock<HashMap<String, InstanceInfo>>>,
    /// If set, the next lookup will fail with this error.
    next_error: Arc<RwLock<Option<DirectoryError>>>,
}

impl MockInstanceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an instance.
    pub async fn add_instance(&self, instance: InstanceInfo) {
        self.instances
            .write()
            .await
            .insert(instance.uuid.clone(), instance);
    }

    /// Raw lookup, including destroyed instances.
    pub async fn instance(&self, uuid: &str) -> Option<InstanceInfo> {
        self.instances.read().await.get(uuid).cloned()
    }

    /// Move an instance to another server.
    pub async fn relocate(&self, uuid: &str, server_uuid: &str) {
        if let Some(instance) = self.instances.write().await.get_mut(uuid) {
            instance.server_uuid = server_uuid.to_string();
        }
    }

    /// Mark an instance destroyed.
    pub async fn destroy(&self, uuid: &str) {
        if let Some(instance) = self.instances.write().await.get_mut(uuid) {
            instance.state = "destroyed".to_string();
        }
    }

    pub async fn set_next_error(&self, error: DirectoryError) {
        *self.next_error.write().await = Some(error);
    }
}

#[async_trait]
impl InstanceDirectory for MockInstanceDirectory {
    async fn get_instance(&self, uuid: &str) -> Result<Option<InstanceInfo>, DirectoryError> {
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        Ok(self
            .instances
            .read()
            .await
            .get(uuid)
            .filter(|i| i.state != "destroyed")
            .cloned())
    }
}
