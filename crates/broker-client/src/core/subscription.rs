use tokio::sync::mpsc;

/// A message pushed from a subscribed queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: String,
    pub queue: String,
    pub payload: Vec<u8>,
    pub delivery_attempts: u32,
}

/// A live subscription to one queue. Dropping the handle sends a
/// best-effort `Unsubscribe` and stops forwarding deliveries; it does not
/// block on confirmation, mirroring `Drop` impls elsewhere in the stack
/// that can't be async.
pub struct SubscriptionHandle {
    queue: String,
    receiver: mpsc::Receiver<Delivery>,
    unsubscribe_tx: mpsc::Sender<String>,
}

impl SubscriptionHandle {
    pub(crate) fn new(queue: String, receiver: mpsc::Receiver<Delivery>, unsubscribe_tx: mpsc::Sender<String>) -> Self {
        Self { queue, receiver, unsubscribe_tx }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.unsubscribe_tx.try_send(self.queue.clone());
    }
}
