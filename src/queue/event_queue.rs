//! The bounded mpsc channel the watcher hands normalized events to the
//! handler through (spec §4.2/§4.5)

use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::model::Event;

const CAPACITY: usize = 256;

/// The producer half, held by the watcher
#[derive(Clone)]
pub struct EventSender(mpsc::Sender<Event>);

/// The consumer half, held by the handler
pub struct EventReceiver(mpsc::Receiver<Event>);

/// Create a linked sender/receiver pair
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(CAPACITY);
    (EventSender(tx), EventReceiver(rx))
}

impl EventSender {
    /// Enqueue an event, waiting for room if the queue is full
    pub async fn put(&self, event: Event) -> Result<(), Event> {
        self.0.send(event).await.map_err(|err| err.0)
    }
}

impl EventReceiver {
    /// Pop the next event, or `None` if nothing arrives within `timeout`
    /// (mirrors `EventQueue.get(timeout=...)`'s empty-queue-is-not-an-error
    /// contract).
    pub async fn get(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.0.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckKey;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (tx, mut rx) = channel();
        tx.put(Event::deleted(CheckKey::new("default", "x"))).await.unwrap();
        let event = rx.get(Duration::from_secs(1)).await;
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn get_times_out_on_empty_queue() {
        let (_tx, mut rx) = channel();
        let event = rx.get(Duration::from_millis(10)).await;
        assert!(event.is_none());
    }
}
