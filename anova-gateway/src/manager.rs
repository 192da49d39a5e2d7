//! The device registry: owns every live [`Device`], its monitor task, and
//! the wildcard/per-id subscriber fan-out described in the component design
//! for connect, disconnect, state-change and event notifications.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::device::{BoxFuture, Device, DeviceEvent, DeviceState};
use crate::error::{ConnectionError, GatewayError};
use crate::server::TcpServer;

type ConnectedCallback = Arc<dyn Fn(Arc<Device>) -> BoxFuture + Send + Sync>;
type DisconnectedCallback = Arc<dyn Fn(&str) -> BoxFuture + Send + Sync>;
type StateChangeCallback = Arc<dyn Fn(&str, DeviceState) -> BoxFuture + Send + Sync>;
type EventCallback = Arc<dyn Fn(&str, DeviceEvent) -> BoxFuture + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    connected: Vec<ConnectedCallback>,
    disconnected: HashMap<String, Vec<DisconnectedCallback>>,
    disconnected_wildcard: Vec<DisconnectedCallback>,
    state_change: HashMap<String, Vec<StateChangeCallback>>,
    state_change_wildcard: Vec<StateChangeCallback>,
    event: HashMap<String, Vec<EventCallback>>,
    event_wildcard: Vec<EventCallback>,
}

/// Registry of every appliance currently connected to this gateway.
pub struct Manager {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    monitors: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    subscribers: RwLock<Subscribers>,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        Arc::new(Manager {
            devices: RwLock::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Subscribers::default()),
        })
    }

    /// Drive `server`'s accept loop, handshaking every connection it hands us.
    pub async fn serve(self: Arc<Self>, server: TcpServer) {
        server
            .serve(move |stream, peer| {
                let manager = self.clone();
                Box::pin(async move {
                    if let Err(e) = manager.handle_new_connection(stream).await {
                        warn!(%peer, error = %e, "handshake failed, dropping connection");
                    }
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            })
            .await;
    }

    async fn handle_new_connection(self: &Arc<Self>, stream: tokio::net::TcpStream) -> Result<(), GatewayError> {
        let (connection, events) = Connection::new(stream).map_err(ConnectionError::Io)?;
        let device = Device::handshake(connection, events)
            .await
            .map_err(GatewayError::Connection)?;

        let id = device.id_card.clone();

        if self.devices.read().await.contains_key(&id) {
            self.evict(&id).await;
        }

        let manager = self.clone();
        let manager_for_state = manager.clone();
        device
            .set_state_change_callback(Arc::new(move |id, state| {
                let manager = manager_for_state.clone();
                let id = id.to_string();
                Box::pin(async move {
                    manager.dispatch_state_change(&id, state).await;
                })
            }))
            .await;

        let manager_for_event = manager.clone();
        device
            .set_event_callback(Arc::new(move |id, event| {
                let manager = manager_for_event.clone();
                let id = id.to_string();
                Box::pin(async move {
                    manager.dispatch_event(&id, event).await;
                })
            }))
            .await;

        self.devices.write().await.insert(id.clone(), device.clone());

        let monitor_device = device.clone();
        let monitor_manager = self.clone();
        let monitor_id = id.clone();
        let handle = tokio::spawn(async move {
            monitor_manager.run_monitor(monitor_id, monitor_device).await;
        });
        self.monitors.lock().await.insert(id.clone(), handle);

        self.dispatch_connected(device).await;
        Ok(())
    }

    async fn run_monitor(self: Arc<Self>, id: String, device: Arc<Device>) {
        loop {
            if let Err(e) = device.heartbeat().await {
                warn!(%id, error = %e, "heartbeat failed, disconnecting");
                self.evict(&id).await;
                return;
            }
            tokio::time::sleep(crate::device::HEARTBEAT_INTERVAL).await;
        }
    }

    /// Close and remove a device, firing disconnect subscribers.
    pub async fn evict(&self, id: &str) {
        let device = self.devices.write().await.remove(id);
        if let Some(handle) = self.monitors.lock().await.remove(id) {
            handle.abort();
        }
        if let Some(device) = device {
            device.close().await;
            self.dispatch_disconnected(id).await;
        }
    }

    pub async fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn list_devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn on_connected(&self, cb: ConnectedCallback) {
        self.subscribers.write().await.connected.push(cb);
    }

    pub async fn on_disconnected(&self, id: &str, cb: DisconnectedCallback) {
        let mut subs = self.subscribers.write().await;
        if id == "*" {
            subs.disconnected_wildcard.push(cb);
        } else {
            subs.disconnected.entry(id.to_string()).or_default().push(cb);
        }
    }

    pub async fn on_state_change(&self, id: &str, cb: StateChangeCallback) {
        let mut subs = self.subscribers.write().await;
        if id == "*" {
            subs.state_change_wildcard.push(cb);
        } else {
            subs.state_change.entry(id.to_string()).or_default().push(cb);
        }
    }

    pub async fn on_event(&self, id: &str, cb: EventCallback) {
        let mut subs = self.subscribers.write().await;
        if id == "*" {
            subs.event_wildcard.push(cb);
        } else {
            subs.event.entry(id.to_string()).or_default().push(cb);
        }
    }

    async fn dispatch_connected(&self, device: Arc<Device>) {
        let callbacks: Vec<_> = self.subscribers.read().await.connected.clone();
        for cb in callbacks {
            cb(device.clone()).await;
        }
    }

    async fn dispatch_disconnected(&self, id: &str) {
        let callbacks = {
            let subs = self.subscribers.read().await;
            let mut callbacks = subs.disconnected_wildcard.clone();
            if let Some(list) = subs.disconnected.get(id) {
                callbacks.extend(list.iter().cloned());
            }
            callbacks
        };
        for cb in callbacks {
            cb(id).await;
        }
    }

    /// Awaits each subscriber in turn so that, for a single device, causes
    /// observed on the wire in order are delivered to every subscriber in
    /// that same order.
    async fn dispatch_state_change(&self, id: &str, state: DeviceState) {
        let callbacks = {
            let subs = self.subscribers.read().await;
            let mut callbacks = subs.state_change_wildcard.clone();
            if let Some(list) = subs.state_change.get(id) {
                callbacks.extend(list.iter().cloned());
            }
            callbacks
        };
        for cb in callbacks {
            cb(id, state.clone()).await;
        }
    }

    async fn dispatch_event(&self, id: &str, event: DeviceEvent) {
        let callbacks = {
            let subs = self.subscribers.read().await;
            let mut callbacks = subs.event_wildcard.clone();
            if let Some(list) = subs.event.get(id) {
                callbacks.extend(list.iter().cloned());
            }
            callbacks
        };
        for cb in callbacks {
            cb(id, event.clone()).await;
        }
    }

    /// Stop accepting work: cancel every monitor task and close every device.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        for id in ids {
            self.evict(&id).await;
        }
        info!("manager shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Spin up a fake appliance that completes the handshake reporting
    /// `id_card`, then echoes "stopped" to any further heartbeat query.
    /// Returns the client-side stream to hand to `handle_new_connection`,
    /// plus a flag the appliance task sets once the connection closes.
    async fn fake_appliance(id_card: &str) -> (TcpStream, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (mut appliance, _) = accepted.unwrap();
        let client = client.unwrap();

        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_task = closed.clone();
        let handshake_responses =
            vec![format!("anova {id_card}"), "1.0.0".to_string(), "a1b2c3d4e5".to_string(), "stopped".to_string()];

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            for resp in &handshake_responses {
                match appliance.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        closed_for_task.store(true, Ordering::Release);
                        return;
                    }
                    Ok(_) => {}
                }
                if appliance.write_all(&anova_protocol::encode(resp)).await.is_err() {
                    closed_for_task.store(true, Ordering::Release);
                    return;
                }
            }
            loop {
                match appliance.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if appliance.write_all(&anova_protocol::encode("stopped")).await.is_err() {
                            break;
                        }
                    }
                }
            }
            closed_for_task.store(true, Ordering::Release);
        });

        (client, closed)
    }

    async fn wait_until(flag: &Arc<AtomicBool>) {
        for _ in 0..200 {
            if flag.load(Ordering::Acquire) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn duplicate_id_connection_evicts_the_previous_one() {
        let manager = Manager::new();
        let (stream1, closed1) = fake_appliance("abcdef").await;
        manager.handle_new_connection(stream1).await.unwrap();
        assert!(manager.get_device("abcdef").await.is_some());

        let (stream2, _closed2) = fake_appliance("abcdef").await;
        manager.handle_new_connection(stream2).await.unwrap();

        assert_eq!(manager.list_devices().await.len(), 1);
        wait_until(&closed1).await;
        assert!(closed1.load(Ordering::Acquire), "the superseded connection should have been closed");
    }

    #[tokio::test]
    async fn shutdown_drains_every_connected_device() {
        let manager = Manager::new();
        let (stream_a, closed_a) = fake_appliance("device-a").await;
        let (stream_b, closed_b) = fake_appliance("device-b").await;
        manager.handle_new_connection(stream_a).await.unwrap();
        manager.handle_new_connection(stream_b).await.unwrap();
        assert_eq!(manager.list_devices().await.len(), 2);

        manager.shutdown().await;

        assert!(manager.list_devices().await.is_empty());
        wait_until(&closed_a).await;
        wait_until(&closed_b).await;
        assert!(closed_a.load(Ordering::Acquire));
        assert!(closed_b.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn connected_subscribers_observe_newly_registered_devices() {
        let manager = Manager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_cb = seen.clone();
        manager
            .on_connected(Arc::new(move |device| {
                let seen = seen_for_cb.clone();
                Box::pin(async move {
                    seen.lock().await.push(device.id_card.clone());
                })
            }))
            .await;

        let (stream, _closed) = fake_appliance("abcdef").await;
        manager.handle_new_connection(stream).await.unwrap();

        assert_eq!(*seen.lock().await, vec!["abcdef".to_string()]);
    }
}
