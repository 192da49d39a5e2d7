//! A single TCP connection to one appliance: a read loop that decodes
//! frames and either completes an in-flight command or forwards an
//! unsolicited event, and a write path serialized by a command lock so
//! concurrent callers can't interleave requests on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use anova_protocol::frame::FrameDecoder;
use anova_protocol::{encode, ProtocolError};

use crate::error::ConnectionError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF_SIZE: usize = 1024;

/// A slot for the single in-flight command response, mirroring the
/// appliance's own single-outstanding-request behavior: only one query can
/// be awaiting a reply at a time, enforced by [`Connection::command_lock`].
type PendingSlot = Arc<Mutex<Option<oneshot::Sender<String>>>>;

/// An open connection to one appliance.
pub struct Connection {
    peer: std::net::SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    command_lock: Mutex<()>,
    pending: PendingSlot,
    closed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
}

impl Connection {
    /// Take ownership of an accepted socket, spawning its read loop.
    ///
    /// Returns the connection plus a channel of unsolicited event text
    /// lines observed on this socket, in arrival order.
    pub fn new(stream: TcpStream) -> std::io::Result<(Self, mpsc::UnboundedReceiver<String>)> {
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(read_loop(peer, read_half, pending.clone(), closed.clone(), event_tx));

        Ok((
            Connection {
                peer,
                writer: Mutex::new(write_half),
                command_lock: Mutex::new(()),
                pending,
                closed,
                read_task,
            },
            event_rx,
        ))
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.peer
    }

    /// Send `message`, wait up to [`COMMAND_TIMEOUT`] for the next non-event
    /// line the appliance sends back, and return it.
    ///
    /// Only one command can be in flight on a connection at a time; this is
    /// enforced by holding `command_lock` for the whole round trip rather
    /// than relying on the appliance to serialize out of order.
    pub async fn send_command(&self, message: &str) -> Result<String, ConnectionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }

        let _guard = self.command_lock.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().await;
            *slot = Some(tx);
        }

        let frame = encode(message);
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await.map_err(ConnectionError::Io)?;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                // Drop the stale slot so a late response doesn't get
                // delivered to whichever command runs next.
                self.pending.lock().await.take();
                Err(ConnectionError::Timeout(COMMAND_TIMEOUT))
            }
        }
    }

    /// Close the connection and stop its read loop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.read_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn read_loop(
    peer: std::net::SocketAddr,
    mut reader: OwnedReadHalf,
    pending: PendingSlot,
    closed: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<String>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(%peer, "connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(%peer, error = %e, "read error");
                break;
            }
        };

        for result in decoder.push(&buf[..n]) {
            match result {
                Ok(text) => route_message(&peer, &text, &pending, &event_tx).await,
                Err(ProtocolError::InvalidHeader(b)) => {
                    warn!(%peer, byte = format!("0x{:02x}", b), "resynchronizing after invalid frame header")
                }
                Err(e) => warn!(%peer, error = %e, "dropping malformed frame"),
            }
        }
    }

    // Wake up any command still waiting on a reply that will never come, and
    // mark the connection closed so later callers fail fast instead of
    // waiting out the full command timeout.
    closed.store(true, Ordering::Release);
    pending.lock().await.take();
}

async fn route_message(
    peer: &std::net::SocketAddr,
    text: &str,
    pending: &PendingSlot,
    event_tx: &mpsc::UnboundedSender<String>,
) {
    if anova_protocol::is_event(text) {
        trace!(%peer, %text, "received event");
        let _ = event_tx.send(text.to_string());
        return;
    }

    if text.eq_ignore_ascii_case("invalid command") {
        warn!(%peer, "appliance rejected the last command, discarding reply");
        return;
    }

    let mut slot = pending.lock().await;
    match slot.take() {
        Some(tx) => {
            let _ = tx.send(text.to_string());
        }
        None => warn!(%peer, %text, "received response with no pending command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn send_command_round_trips_a_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (appliance_side, _) = accepted.unwrap();
        let client = client.unwrap();

        let (connection, mut events) = Connection::new(client).unwrap();

        let appliance_task = tokio::spawn(async move {
            let mut appliance = appliance_side;
            let mut buf = vec![0u8; 1024];
            let n = appliance.read(&mut buf).await.unwrap();
            let mut decoder = FrameDecoder::new();
            let results = decoder.push(&buf[..n]);
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].as_ref().unwrap(), "status");
            appliance.write_all(&encode("running")).await.unwrap();
        });

        let response = connection.send_command("status").await.unwrap();
        assert_eq!(response, "running");
        appliance_task.await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_event_is_routed_to_event_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (mut appliance_side, _) = accepted.unwrap();
        let client = client.unwrap();

        let (_connection, mut events) = Connection::new(client).unwrap();

        appliance_side.write_all(&encode("event stop")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, "event stop");
    }

    #[tokio::test]
    async fn command_times_out_when_no_response_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (_appliance_side, _) = accepted.unwrap();
        let client = client.unwrap();

        let (connection, _events) = Connection::new(client).unwrap();
        tokio::time::pause();
        let call = connection.send_command("status");
        tokio::pin!(call);
        tokio::select! {
            _ = &mut call => panic!("should not resolve before timeout"),
            _ = tokio::time::advance(Duration::from_secs(11)) => {}
        }
        let result = call.await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
    }

    #[tokio::test]
    async fn send_command_fails_fast_once_read_loop_has_exited() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_fut = listener.accept();
        let connect_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(accept_fut, connect_fut);
        let (appliance_side, _) = accepted.unwrap();
        let client = client.unwrap();

        let (connection, _events) = Connection::new(client).unwrap();
        drop(appliance_side);

        // Give the read loop a chance to observe EOF and flip `closed`.
        for _ in 0..100 {
            if connection.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(connection.closed.load(Ordering::Acquire));

        let result = tokio::time::timeout(Duration::from_millis(100), connection.send_command("status")).await;
        assert!(matches!(result, Ok(Err(ConnectionError::Closed))));
    }
}
