//! Server-Sent-Events fan-out: per-device subscriber queues fed by the
//! Manager's wildcard subscriptions, drained one-per-HTTP-connection with a
//! 1-second idle ping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 64;
pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// One outbound event, matching the wire format `event: <type>\ndata: <json>\n\n`.
#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub device_id: Option<String>,
    pub payload: Value,
}

impl SseEvent {
    pub fn ping() -> Self {
        SseEvent { event_type: "ping", device_id: None, payload: Value::Null }
    }
}

/// A bounded, ring-buffer-style mailbox for one SSE subscriber: once full,
/// pushing a new event evicts the oldest one rather than rejecting the new
/// one, so a slow reader loses stale updates instead of fresh ones.
pub struct SubscriberQueue {
    buf: Mutex<VecDeque<SseEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new() -> Arc<Self> {
        Arc::new(SubscriberQueue {
            buf: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    async fn push(&self, event: SseEvent) {
        let mut buf = self.buf.lock().await;
        if buf.len() >= QUEUE_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }

    /// Wait for the next event, or `None` once the queue has been closed.
    pub async fn recv(&self) -> Option<SseEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.buf.lock().await.pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct DeviceListeners {
    queues: HashMap<Uuid, Arc<SubscriberQueue>>,
}

/// Registry of active SSE subscribers, keyed by device id.
pub struct SseHub {
    listeners: RwLock<HashMap<String, DeviceListeners>>,
}

impl SseHub {
    pub fn new() -> Self {
        SseHub { listeners: RwLock::new(HashMap::new()) }
    }

    /// Register a new subscriber for `device_id`, returning its id and its
    /// mailbox.
    pub async fn connect(&self, device_id: &str) -> (Uuid, Arc<SubscriberQueue>) {
        let subscriber_id = Uuid::new_v4();
        let queue = SubscriberQueue::new();
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceListeners { queues: HashMap::new() })
            .queues
            .insert(subscriber_id, queue.clone());
        (subscriber_id, queue)
    }

    /// Remove a subscriber, dropping the device entry entirely once empty.
    pub async fn disconnect(&self, device_id: &str, subscriber_id: Uuid) {
        let mut listeners = self.listeners.write().await;
        if let Some(device_listeners) = listeners.get_mut(device_id) {
            if let Some(queue) = device_listeners.queues.remove(&subscriber_id) {
                queue.close();
            }
            if device_listeners.queues.is_empty() {
                listeners.remove(device_id);
            }
        }
    }

    /// Push `event` to every subscriber of `event.device_id`, dropping the
    /// oldest queued item for any subscriber whose bounded queue is full.
    pub async fn broadcast(&self, event: SseEvent) {
        let Some(device_id) = event.device_id.clone() else { return };
        let listeners = self.listeners.read().await;
        let Some(device_listeners) = listeners.get(&device_id) else { return };
        for queue in device_listeners.queues.values() {
            queue.push(event.clone()).await;
        }
    }
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_broadcast_for_its_device() {
        let hub = SseHub::new();
        let (id, queue) = hub.connect("abcdef").await;

        hub.broadcast(SseEvent {
            event_type: "state_changed",
            device_id: Some("abcdef".to_string()),
            payload: json!({"status": "running"}),
        })
        .await;

        let event = queue.recv().await.unwrap();
        assert_eq!(event.event_type, "state_changed");
        hub.disconnect("abcdef", id).await;
    }

    #[tokio::test]
    async fn broadcast_for_unrelated_device_is_not_delivered() {
        let hub = SseHub::new();
        let (_id, queue) = hub.connect("abcdef").await;

        hub.broadcast(SseEvent {
            event_type: "state_changed",
            device_id: Some("other".to_string()),
            payload: Value::Null,
        })
        .await;

        assert!(queue.buf.lock().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_empty_device_entry() {
        let hub = SseHub::new();
        let (id, _queue) = hub.connect("abcdef").await;
        hub.disconnect("abcdef", id).await;
        assert!(hub.listeners.read().await.get("abcdef").is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_event_not_newest() {
        let queue = SubscriberQueue::new();
        for i in 0..QUEUE_CAPACITY + 1 {
            queue
                .push(SseEvent { event_type: "event", device_id: None, payload: json!({ "i": i }) })
                .await;
        }
        let first = queue.recv().await.unwrap();
        assert_eq!(first.payload, json!({ "i": 1 }));
    }

    #[tokio::test]
    async fn closed_queue_recv_returns_none_once_drained() {
        let queue = SubscriberQueue::new();
        queue.push(SseEvent::ping()).await;
        queue.close();
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }
}
