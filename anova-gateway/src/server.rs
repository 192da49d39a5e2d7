//! The TCP accept loop appliances connect to. Knows nothing about the
//! protocol or device state — it only owns the listening socket and hands
//! each accepted stream to a pluggable handler.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info};

type ConnectionHandler =
    Arc<dyn Fn(TcpStream, SocketAddr) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Listens for appliance TCP connections and dispatches each to a handler.
pub struct TcpServer {
    listener: TcpListener,
    shutdown: Arc<Notify>,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "TCP server listening for appliances");
        Ok(TcpServer { listener, shutdown: Arc::new(Notify::new()) })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that, when notified, stops the accept loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is signalled, invoking `on_connection`
    /// for each and awaiting all in-flight handlers before returning.
    pub async fn serve<F>(self, on_connection: F)
    where
        F: Fn(TcpStream, SocketAddr) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        let on_connection: ConnectionHandler = Arc::new(on_connection);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = on_connection.clone();
                            in_flight.spawn(async move { handler(stream, peer).await });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }

        while in_flight.join_next().await.is_some() {}
    }
}
