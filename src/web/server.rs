//! Web server for WebSocket sessions and the optional web UI.
//! Uses axum framework with tower middleware support.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use eyre::{Context, Result};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{debug, error, info, warn};

use super::session::{IoSession, WsInbound};
use crate::backend::Bridge;
use crate::cache::IoCache;
use crate::config::WebConfig;
use crate::error::AppError;

/// WebSocket subprotocol offered on upgrade.
pub const WS_PROTOCOL: &str = "rook_io";

const PING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct WebSocketState {
    cache: Arc<IoCache>,
}

/// Web server that handles WebSocket sessions on `/ws` and serves static
/// files for the web UI when an asset directory is configured.
pub struct WebServer {
    bind_addr: SocketAddr,
    assets_path: Option<PathBuf>,
    cache: Arc<IoCache>,
}

impl WebServer {
    pub fn new(config: &WebConfig, cache: Arc<IoCache>) -> Result<Self> {
        let bind_addr = format!("{}:{}", config.host, config.port)
            .parse()
            .context("Invalid web bind address")?;
        Ok(Self {
            bind_addr,
            assets_path: config.assets.clone(),
            cache,
        })
    }

    /// Build the application router with all routes.
    fn build_router(&self) -> Router {
        let state = WebSocketState {
            cache: self.cache.clone(),
        };
        let mut router = Router::new().route("/ws", get(ws_handler)).with_state(state);

        if let Some(assets_path) = &self.assets_path {
            if assets_path.join("index.html").is_file() {
                let serve_dir = tower_http::services::ServeDir::new(assets_path)
                    .append_index_html_on_directories(true);
                router = router.fallback_service(serve_dir);
                info!("Web UI serving enabled from {}", assets_path.display());
            } else {
                warn!(
                    "Web UI directory exists but doesn't contain index.html: {}",
                    assets_path.display()
                );
            }
        } else {
            info!("Web UI serving disabled (no asset path configured)");
        }

        router.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
    }
}

#[async_trait::async_trait]
impl Bridge for WebServer {
    async fn run(&mut self) -> Result<()> {
        info!("Starting web server on {}", self.bind_addr);

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .context("Failed to bind to address")?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("Server error")?;

        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<WebSocketState>,
) -> Response {
    info!("New WebSocket connection from {}", addr);
    ws.protocols([WS_PROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Handles a single WebSocket connection for the lifetime of the session.
#[tracing::instrument(skip_all, fields(addr = %addr))]
async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: WebSocketState) {
    let (sender, mut receiver) = socket.split();

    // Shared between the writer, ping, and pong paths
    let sender = Arc::new(tokio::sync::Mutex::new(sender));

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = IoSession::new(addr.to_string(), state.cache.clone(), outbound_tx);

    // Writer task: notifications queued by the cache listener are encoded and
    // sent here, off the cache worker thread.
    let output_task = {
        let sender = sender.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        let mut guard = sender.lock().await;
                        if guard.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to serialize outbound message for {}: {}", addr, e);
                    }
                }
            }
        })
    };

    // Liveness probe: a session that cannot take a ping is torn down.
    let ping_task = {
        let sender = sender.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut guard = sender.lock().await;
                if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        })
    };

    // Reader task: protocol frames from the client.
    let input_task = {
        let session = session.clone();
        let sender = sender.clone();
        tokio::spawn(async move {
            while let Some(msg) = receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => handle_text_frame(&session, text.as_str()),
                    Ok(Message::Ping(data)) => {
                        let mut guard = sender.lock().await;
                        if guard.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => debug!("Received pong from {}", addr),
                    Ok(Message::Binary(_)) => {
                        warn!("Received unexpected binary message from {}", addr);
                    }
                    Ok(Message::Close(_)) => {
                        info!("Client {} disconnected", addr);
                        break;
                    }
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                }
            }
        })
    };

    // Wait for any task to complete (connection closed or error)
    tokio::select! {
        _ = input_task => debug!("Input task completed for {}", addr),
        _ = output_task => debug!("Output task completed for {}", addr),
        _ = ping_task => debug!("Ping task completed for {}", addr),
    }

    session.close();
    info!("WebSocket connection {} closed", addr);
}

fn handle_text_frame(session: &Arc<IoSession>, text: &str) {
    match serde_json::from_str::<WsInbound>(text) {
        Ok(msg) => session.handle_message(msg),
        Err(e) => {
            debug!("Rejecting malformed frame: {}", e);
            session.reject(AppError::Parse(format!("invalid protocol message: {e}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Origin;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite};

    async fn spawn_server(cache: Arc<IoCache>) -> SocketAddr {
        let server = WebServer {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            assets_path: None,
            cache,
        };
        let router = server.build_router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    async fn next_text<S>(read: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = timeout(Duration::from_secs(2), read.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let tungstenite::Message::Text(text) = msg {
                return text.as_str().to_string();
            }
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn subscribe_snapshot_then_live_roundtrip() {
        let cache = Arc::new(IoCache::new());
        let origin = Origin::unique();
        cache.set_input("Distance", "I16", &[5, 0], origin);

        let addr = spawn_server(cache.clone()).await;
        let (ws, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("Failed to connect");
        let (mut write, mut read) = ws.split();

        write
            .send(tungstenite::Message::Text(
                r#"{"type":"input_subscribe"}"#.into(),
            ))
            .await
            .unwrap();

        // snapshot of the pre-existing value
        let snapshot: serde_json::Value = serde_json::from_str(&next_text(&mut read).await).unwrap();
        assert_eq!(snapshot["type"], "input");
        assert_eq!(snapshot["name"], "Distance");
        assert_eq!(snapshot["dataType"], "I16");
        assert_eq!(snapshot["value"], "BQA=");

        // receiving the snapshot proves the registration that was queued
        // right behind it is applied before this later mutation
        cache.set_input("Distance", "I16", &[7, 0], origin);
        let live: serde_json::Value = serde_json::from_str(&next_text(&mut read).await).unwrap();
        assert_eq!(live["type"], "input");
        assert_eq!(live["value"], "BwA=");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn publish_from_one_session_reaches_another() {
        let cache = Arc::new(IoCache::new());
        // sync point: gives the subscriber a snapshot frame to wait on
        cache.set_output("Ready", "U8", &[0], Origin::unique());

        let addr = spawn_server(cache.clone()).await;

        let (subscriber, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut sub_write, mut sub_read) = subscriber.split();
        sub_write
            .send(tungstenite::Message::Text(
                r#"{"type":"output_subscribe"}"#.into(),
            ))
            .await
            .unwrap();
        let ready: serde_json::Value = serde_json::from_str(&next_text(&mut sub_read).await).unwrap();
        assert_eq!(ready["name"], "Ready");

        let (publisher, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut pub_write, _pub_read) = publisher.split();
        pub_write
            .send(tungstenite::Message::Text(
                r#"{"type":"output_publish","name":"Led","dataType":"U8","value":"AQ=="}"#.into(),
            ))
            .await
            .unwrap();

        let led: serde_json::Value = serde_json::from_str(&next_text(&mut sub_read).await).unwrap();
        assert_eq!(led["type"], "output");
        assert_eq!(led["name"], "Led");
        assert_eq!(led["dataType"], "U8");
        assert_eq!(led["value"], "AQ==");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn malformed_frame_is_rejected_with_error_packet() {
        let cache = Arc::new(IoCache::new());
        let addr = spawn_server(cache).await;

        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let (mut write, mut read) = ws.split();
        write
            .send(tungstenite::Message::Text(r#"{"type":"bogus"}"#.into()))
            .await
            .unwrap();

        let err: serde_json::Value = serde_json::from_str(&next_text(&mut read).await).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "parse_error");
    }
}
