//! WebSocket endpoints.
//!
//! Each server accepts an upgrade on any path:
//! - photo server: camera sessions, one reply per frame needing one
//! - status server: dashboards, push-only
//! - card server: request/reply membership checks

use crate::common::{Config, FaceGateError, Result};
use crate::core::{FaceAnalysisGateway, FaceAnalyzer};
use crate::service::cards::CardRegistry;
use crate::service::photo::{Frame, PhotoContext, PhotoSession};
use crate::service::status::{Observer, StatusHub};
use crate::storage::{IdentityStore, TempFileManager};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub fn photo_router(ctx: Arc<PhotoContext>) -> Router {
    Router::new().fallback(photo_upgrade).with_state(ctx)
}

pub fn status_router(hub: Arc<StatusHub>) -> Router {
    Router::new().fallback(status_upgrade).with_state(hub)
}

pub fn card_router(registry: Arc<CardRegistry>) -> Router {
    Router::new().fallback(card_upgrade).with_state(registry)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        FaceGateError::Io(std::io::Error::new(e.kind(), format!("Failed to bind to {}: {}", addr, e)))
    })
}

/// Serve `router` until ctrl-c.
pub async fn serve(listener: TcpListener, router: Router) -> Result<()> {
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the shared photo context from config.
pub fn photo_context(
    config: &Config,
    analyzer: Arc<dyn FaceAnalyzer>,
    hub: Arc<StatusHub>,
) -> Result<Arc<PhotoContext>> {
    let files = TempFileManager::start(&config.storage.temp_dir)?;
    let identities = IdentityStore::new(&config.storage.identity_dir)?;
    warn_if_no_identities(&identities)?;

    Ok(Arc::new(PhotoContext {
        files,
        gateway: FaceAnalysisGateway::new(analyzer, config.analysis.workers),
        hub,
        identity_dir: identities.dir().to_path_buf(),
        grace: config.cleanup.grace_policy(),
    }))
}

/// Returns true (and warns) when nobody is enrolled yet.
fn warn_if_no_identities(identities: &IdentityStore) -> Result<bool> {
    let empty = identities.is_empty()?;
    if empty {
        warn!(
            "The identity store {} is missing or empty, every check will be denied until someone enrolls",
            identities.dir().display()
        );
    }
    Ok(empty)
}

/// Run the photo and status servers together.
pub async fn run_face_servers(config: &Config, analyzer: Arc<dyn FaceAnalyzer>) -> Result<()> {
    let hub = Arc::new(StatusHub::new(config.broadcast.observer_buffer));
    let ctx = photo_context(config, analyzer, Arc::clone(&hub))?;

    let photo_listener = bind(config.server.photo_addr).await?;
    let status_listener = bind(config.server.status_addr).await?;

    info!("[PHOTO_SERVER] Listening on ws://{}", config.server.photo_addr);
    info!("[STATUS_SERVER] Listening on ws://{}", config.server.status_addr);
    info!("Saving photos to {}", config.storage.temp_dir.display());

    tokio::try_join!(
        serve(photo_listener, photo_router(ctx)),
        serve(status_listener, status_router(hub)),
    )?;

    info!("Face servers stopped");
    Ok(())
}

pub async fn run_card_server(config: &Config) -> Result<()> {
    let listener = bind(config.server.card_addr).await?;
    info!("[CARD_SERVER] Listening on ws://{}", config.server.card_addr);

    serve(listener, card_router(Arc::new(CardRegistry::new()))).await?;

    info!("Card server stopped");
    Ok(())
}

async fn photo_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<PhotoContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_photo_socket(socket, peer, ctx))
}

async fn status_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<StatusHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_socket(socket, peer, hub))
}

async fn card_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(registry): State<Arc<CardRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_card_socket(socket, peer, registry))
}

/// Camera connection. Frames are handled strictly in arrival order; the
/// reply goes out before the matching status event is published.
pub async fn handle_photo_socket(socket: WebSocket, peer: SocketAddr, ctx: Arc<PhotoContext>) {
    info!("[PHOTO_SERVER] Camera connected: {}", peer);
    let mut session = PhotoSession::new(Arc::clone(&ctx), peer.to_string());
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(msg) = ws_rx.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => Frame::Text(text.to_string()),
            Ok(Message::Binary(data)) => Frame::Binary(data.to_vec()),
            Ok(Message::Ping(data)) => {
                let _ = ws_tx.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("[PHOTO_SERVER] Receive error from {}: {}", peer, e);
                break;
            }
        };

        let Some(reply) = session.handle_frame(frame).await else {
            continue;
        };

        match reply.response.to_json() {
            Ok(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    warn!("[PHOTO_SERVER] Camera {} went away before reply", peer);
                }
            }
            Err(e) => error!("[PHOTO_SERVER] Failed to encode reply: {}", e),
        }

        if let Some(event) = reply.event {
            ctx.hub.publish(&event).await;
        }
    }

    session.close();
    info!("[PHOTO_SERVER] Camera disconnected: {}", peer);
}

/// Dashboard connection. Inbound data frames are ignored.
pub async fn handle_status_socket(socket: WebSocket, peer: SocketAddr, hub: Arc<StatusHub>) {
    let Observer { id, mut outbox } = hub.register().await;
    info!("[STATUS_SERVER] Dashboard connected: {} (observer {})", peer, id);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = outbox.recv() => {
                match event {
                    Some(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    hub.unregister(id).await;
    info!("[STATUS_SERVER] Dashboard disconnected: {}", peer);
}

pub async fn handle_card_socket(socket: WebSocket, peer: SocketAddr, registry: Arc<CardRegistry>) {
    info!("[CARD_SERVER] Reader connected: {}", peer);
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(msg) = ws_rx.next().await {
        let response = match msg {
            Ok(Message::Text(text)) => registry.handle_message(text.as_bytes()).await,
            Ok(Message::Binary(data)) => registry.handle_message(&data).await,
            Ok(Message::Ping(data)) => {
                let _ = ws_tx.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("[CARD_SERVER] Receive error from {}: {}", peer, e);
                break;
            }
        };

        match serde_json::to_string(&response) {
            Ok(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => error!("[CARD_SERVER] Failed to encode reply: {}", e),
        }
    }

    info!("[CARD_SERVER] Reader disconnected: {}", peer);
}
