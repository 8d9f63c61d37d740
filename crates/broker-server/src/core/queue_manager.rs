use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use super::dlq::DeadLetterQueue;
use super::error::{BrokerError, BrokerResult};
use super::options::QueueOptions;
use super::queue::Queue;

/// Owns every named queue, handing out `Arc<Queue>` handles. The directory
/// itself is an `RwLock<HashMap<..>>` rather than a sharded map, following the
/// same composition style the teacher uses for its `AppState` fields: reads
/// (routing a publish/subscribe to an existing queue) vastly outnumber writes
/// (creating or deleting a queue).
pub struct QueueManager {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    defaults: QueueOptions,
    dlq: Arc<DeadLetterQueue>,
}

impl QueueManager {
    pub fn new(defaults: QueueOptions, dlq: Arc<DeadLetterQueue>) -> Self {
        Self { queues: RwLock::new(HashMap::new()), defaults, dlq }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Creates `name` with the manager's default options, failing if it
    /// already exists (§4.6 `CreateQueue`).
    pub async fn create(&self, name: &str) -> BrokerResult<Arc<Queue>> {
        self.create_with_options(name, self.defaults.clone()).await
    }

    pub async fn create_with_options(&self, name: &str, options: QueueOptions) -> BrokerResult<Arc<Queue>> {
        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(BrokerError::QueueExists(name.to_string()));
        }
        let queue = Arc::new(Queue::new(name.to_string(), options, self.dlq.clone()));
        queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    pub async fn delete(&self, name: &str) -> BrokerResult<()> {
        let mut queues = self.queues.write().await;
        queues.remove(name).map(|_| ()).ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    /// Returns the named queue, auto-creating it with the manager's defaults
    /// when `auto_create` is enabled and it doesn't exist yet (§4.6).
    pub async fn get_or_auto_create(&self, name: &str) -> BrokerResult<Arc<Queue>> {
        if let Some(queue) = self.get(name).await {
            return Ok(queue);
        }
        if !self.defaults.auto_create {
            return Err(BrokerError::QueueNotFound(name.to_string()));
        }
        match self.create(name).await {
            Ok(queue) => Ok(queue),
            Err(BrokerError::QueueExists(_)) => {
                // Lost a create race to another connection; the queue exists now.
                self.get(name).await.ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.queues.read().await.len()
    }

    /// Sweeps every queue for TTL-expired messages, returning the total
    /// removed. Driven by the clock tick.
    pub async fn expire_all_ttl(&self, now: Instant) -> usize {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        queues.iter().map(|q| q.expire_ttl(now)).sum()
    }

    pub async fn total_depth(&self) -> usize {
        let queues: Vec<Arc<Queue>> = self.queues.read().await.values().cloned().collect();
        queues.iter().map(|q| q.info().depth).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> QueueManager {
        QueueManager::new(QueueOptions::default(), Arc::new(DeadLetterQueue::new(100)))
    }

    #[tokio::test]
    async fn create_then_get_or_create_reuses_existing() {
        let manager = manager();
        manager.create("orders").await.unwrap();
        assert_eq!(manager.count().await, 1);

        let queue = manager.get_or_auto_create("orders").await.unwrap();
        assert_eq!(queue.name(), "orders");
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn create_twice_fails_with_queue_exists() {
        let manager = manager();
        manager.create("orders").await.unwrap();
        let err = manager.create("orders").await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueExists(_)));
    }

    #[tokio::test]
    async fn auto_create_disabled_fails_lookup() {
        let manager = QueueManager::new(
            QueueOptions { auto_create: false, ..QueueOptions::default() },
            Arc::new(DeadLetterQueue::new(100)),
        );
        let err = manager.get_or_auto_create("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn delete_missing_queue_fails() {
        let manager = manager();
        let err = manager.delete("missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }
}
