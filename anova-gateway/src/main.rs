//! Binary entry point: wire configuration, the TCP appliance server, the
//! device registry, the SSE hub, and the HTTP API together, then run until
//! signalled to shut down.

mod ble;
mod config;
mod connection;
mod device;
mod error;
mod http;
mod manager;
mod server;
mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::sync::Notify;
use tracing::info;

use config::{Cli, Settings};
use manager::Manager;
use server::TcpServer;
use sse::{SseEvent, SseHub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_cli(cli));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(settings.log_filter.clone()))
        .init();

    let tcp_addr = SocketAddr::new(settings.server_host, settings.server_port);
    let tcp_server = TcpServer::bind(tcp_addr).await?;
    let tcp_shutdown = tcp_server.shutdown_handle();

    let manager = Manager::new();
    let sse_hub = Arc::new(SseHub::new());

    wire_sse(&manager, &sse_hub).await;

    let http_state = http::AppState { manager: manager.clone(), sse: sse_hub, settings: settings.clone() };
    let router = http::build_router(http_state);
    let http_addr = SocketAddr::new(settings.http_host, settings.http_port);
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP API listening");

    let tcp_task = tokio::spawn(manager.clone().serve(tcp_server));
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, router.into_make_service_with_connect_info::<SocketAddr>()).await
    });

    let shutdown = Arc::new(Notify::new());
    let shutdown_for_handler = shutdown.clone();
    ctrlc::set_handler(move || shutdown_for_handler.notify_one())
        .expect("failed to install Ctrl+C handler");
    shutdown.notified().await;
    info!("shutdown signal received, draining connections");

    tcp_shutdown.notify_one();
    manager.shutdown().await;
    let _ = tcp_task.await;
    http_task.abort();

    Ok(())
}

/// Fan the Manager's wildcard notifications out to the SSE hub as the
/// event types the external interface promises subscribers.
///
/// Each closure returns its broadcast as a future for the Manager to await
/// directly rather than spawning it onto another task: spawning here would
/// let two notifications for the same device race through the scheduler and
/// reach subscribers out of the order their wire causes occurred in.
async fn wire_sse(manager: &Arc<Manager>, sse_hub: &Arc<SseHub>) {
    let hub = sse_hub.clone();
    manager
        .on_connected(Arc::new(move |device| {
            let hub = hub.clone();
            Box::pin(async move {
                hub.broadcast(SseEvent {
                    event_type: "device_connected",
                    device_id: Some(device.id_card.clone()),
                    payload: json!({ "id": device.id_card, "version": device.version }),
                })
                .await;
            })
        }))
        .await;

    let hub = sse_hub.clone();
    manager
        .on_disconnected(
            "*",
            Arc::new(move |id| {
                let hub = hub.clone();
                let id = id.to_string();
                Box::pin(async move {
                    hub.broadcast(SseEvent {
                        event_type: "device_disconnected",
                        device_id: Some(id.clone()),
                        payload: json!({ "id": id }),
                    })
                    .await;
                })
            }),
        )
        .await;

    let hub = sse_hub.clone();
    manager
        .on_state_change(
            "*",
            Arc::new(move |id, state| {
                let hub = hub.clone();
                let id = id.to_string();
                Box::pin(async move {
                    hub.broadcast(SseEvent {
                        event_type: "state_changed",
                        device_id: Some(id),
                        payload: serde_json::to_value(&state).unwrap_or(serde_json::Value::Null),
                    })
                    .await;
                })
            }),
        )
        .await;

    let hub = sse_hub.clone();
    manager
        .on_event(
            "*",
            Arc::new(move |id, event| {
                let hub = hub.clone();
                let id = id.to_string();
                Box::pin(async move {
                    hub.broadcast(SseEvent {
                        event_type: "event",
                        device_id: Some(id),
                        payload: json!({
                            "originator": format!("{:?}", event.originator),
                            "kind": format!("{:?}", event.kind),
                        }),
                    })
                    .await;
                })
            }),
        )
        .await;
}
