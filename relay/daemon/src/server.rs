//! Daemon Server Implementation
//!
//! This module provides the accept loop for the relay daemon:
//! - Accepts WebSocket connections on a TCP listener
//! - Reads the authenticated user from a handshake header
//! - Runs one fan-in per connection and tracks it in a registry
//! - Closes every connection and joins its task on shutdown
//!
//! # Connection Lifecycle
//!
//! ```text
//!   accept (counted) ──> handshake (user header, bounded) ──> Relay::serve_connection
//!                              │                                     │
//!                  timeout / shutdown ──> drop     Ok  ──> close 1000 ┤
//!                                                  Err ──> close 1011 ┘
//! ```
//!
//! A socket counts against `max_connections` from the moment it is accepted,
//! so clients stuck before the handshake cannot exceed the limit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use relay_core::fanin::websocket::{WebSocketInbound, WebSocketSink};
use relay_core::config::ServerConfig;
use relay_core::{ClientConnection, ConnectionId, MessageSink, Relay, UserId};

/// Connection state tracking
struct ConnectionState {
    /// When the socket was accepted
    connected_at: Instant,
    /// Set once the handshake names the user
    user: Option<UserId>,
    peer: SocketAddr,
}

/// Limits for the accept loop
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Time a client gets to complete the WebSocket handshake
    pub handshake_timeout: Duration,
}

impl From<&ServerConfig> for ServerLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    relay: Relay,
    limits: ServerLimits,
    /// Active connections by id
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    pub fn new(relay: Relay) -> Self {
        let limits = ServerLimits::from(&relay.config().server);
        Self {
            relay,
            limits,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Number of accepted sockets, including those still handshaking
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Bind the configured listen address and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listen = self.relay.config().server.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind to {listen}"))?;
        info!(address = %listen, "Listening for connections");

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            // Reap finished connection tasks as we go.
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Connection task panicked");
                }
            }

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if self.connections.len() >= self.limits.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::new();
            self.connections.insert(
                conn_id.clone(),
                ConnectionState {
                    connected_at: Instant::now(),
                    user: None,
                    peer,
                },
            );
            debug!(
                peer = %peer,
                active_connections = self.active_connections(),
                "Socket accepted"
            );

            let span = tracing::info_span!("connection", %conn_id, %peer);
            let relay = self.relay.clone();
            let connections = Arc::clone(&self.connections);
            let handshake_timeout = self.limits.handshake_timeout;
            let shutdown = shutdown.child_token();
            tasks.spawn(
                async move {
                    handle_connection(
                        &conn_id,
                        stream,
                        relay,
                        &connections,
                        shutdown,
                        handshake_timeout,
                    )
                    .await;
                    connections.remove(&conn_id);
                    info!(
                        active_connections = connections.len(),
                        "Connection handler finished"
                    );
                }
                .instrument(span),
            );
        }

        self.shutdown(tasks).await;
        Ok(())
    }

    /// Wait for every connection task to observe cancellation
    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        info!(
            active_connections = self.active_connections(),
            "Initiating graceful shutdown"
        );
        for entry in self.connections.iter() {
            let state = entry.value();
            debug!(
                conn_id = %entry.key(),
                user = ?state.user,
                peer = %state.peer,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                "Closing connection"
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Connection task panicked");
            }
        }
        let snapshot = self.relay.metrics().snapshot();
        info!(
            forwarded = snapshot.envelopes_forwarded,
            published = snapshot.publishes_acknowledged,
            compensations = snapshot.compensations,
            "Shutdown complete"
        );
    }
}

/// Build the handshake callback that extracts the user header
fn user_from_handshake<'a>(
    header: &'a str,
    user: &'a mut Option<UserId>,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> + Unpin + 'a {
    move |request: &Request, response: Response| {
        let value = request
            .headers()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match value {
            Some(value) => {
                *user = Some(UserId::from(value));
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some(format!("missing {header} header")));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    }
}

/// Handle a single client connection
///
/// The caller owns the registry entry and removes it once this returns.
async fn handle_connection(
    conn_id: &ConnectionId,
    stream: TcpStream,
    relay: Relay,
    connections: &DashMap<ConnectionId, ConnectionState>,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
) {
    let header = relay.config().server.user_header.clone();
    let mut user = None;
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => {
            debug!("Shutdown before handshake completed");
            return;
        }
        handshake = tokio::time::timeout(
            handshake_timeout,
            tokio_tungstenite::accept_hdr_async(stream, user_from_handshake(&header, &mut user)),
        ) => handshake,
    };
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            warn!(timeout = ?handshake_timeout, "WebSocket handshake timed out");
            return;
        }
    };
    let Some(user) = user else {
        warn!("Handshake completed without a user");
        return;
    };

    if let Some(mut state) = connections.get_mut(conn_id) {
        state.user = Some(user.clone());
    }
    info!(
        user = %user,
        active_connections = connections.len(),
        "New connection accepted"
    );

    let (write, read) = ws.split();
    let sink = Arc::new(WebSocketSink::new(write));
    let client_sink: Arc<dyn MessageSink> = sink.clone();
    let connection = ClientConnection::new(user, client_sink)
        .with_id(conn_id.clone())
        .with_inbound(Box::new(WebSocketInbound::new(read)))
        .with_shutdown(shutdown);

    let (code, reason) = match relay.serve_connection(connection).await {
        Ok(()) => (CloseCode::Normal, "bye"),
        Err(e) => {
            debug!(error = %e, "Closing connection after failure");
            (CloseCode::Error, "relay error")
        }
    };
    if let Err(e) = sink.close(code, reason).await {
        debug!(error = %e, "Close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http;

    fn request(user: Option<&str>) -> Request {
        let mut builder = http::Request::builder().uri("ws://localhost/stream");
        if let Some(user) = user {
            builder = builder.header("x-relay-user", user);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_handshake_reads_user_header() {
        let mut user = None;
        let callback = user_from_handshake("x-relay-user", &mut user);
        assert!(callback(&request(Some("alice")), Response::new(())).is_ok());
        assert_eq!(user, Some(UserId::from("alice")));
    }

    #[test]
    fn test_handshake_without_user_is_unauthorized() {
        let mut user = None;
        let callback = user_from_handshake("x-relay-user", &mut user);
        let rejection = callback(&request(None), Response::new(())).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_websocket_client_round_trip() {
        use futures::SinkExt;
        use relay_core::{
            Broker, ConversationId, InMemoryBroker, InMemoryRecordStore, RecordStore,
            RelayConfig,
        };
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::Message;

        let conversation = ConversationId::from_parts(1, 1);
        let broker = InMemoryBroker::new();
        let config = RelayConfig::default();
        broker.create_topic(&config.broker.topic, 2).unwrap();
        let records = InMemoryRecordStore::new();
        records.add_member(conversation, UserId::from("alice"));

        let broker: Arc<dyn Broker> = Arc::new(broker);
        let records: Arc<dyn RecordStore> = Arc::new(records);
        let relay = Relay::new(config, broker, records);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = DaemonServer::new(relay);
        let serving = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve(listener, shutdown).await }
        });

        let mut request = format!("ws://{addr}/stream").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("x-relay-user", http::HeaderValue::from_static("alice"));
        let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

        // Retry until the forwarder is subscribed and echoes the message back.
        let frame = format!(r#"{{"conversation_id":"{conversation}","message":"hi"}}"#);
        let echoed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                client.send(Message::Text(frame.clone())).await.unwrap();
                let wait = tokio::time::sleep(std::time::Duration::from_millis(50));
                tokio::pin!(wait);
                tokio::select! {
                    Some(Ok(Message::Text(text))) = client.next() => return text,
                    () = &mut wait => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(echoed.contains("\"message\":\"hi\""));

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_server_limits_follow_config() {
        let config = ServerConfig {
            max_connections: 3,
            handshake_timeout: Duration::from_millis(40),
            ..ServerConfig::default()
        };
        let limits = ServerLimits::from(&config);
        assert_eq!(limits.max_connections, 3);
        assert_eq!(limits.handshake_timeout, Duration::from_millis(40));
    }

    /// Server over an empty relay, serving on an ephemeral port
    async fn start_server(
        server: ServerConfig,
    ) -> (
        Arc<DaemonServer>,
        SocketAddr,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        use relay_core::{Broker, InMemoryBroker, InMemoryRecordStore, RecordStore, RelayConfig};

        let mut config = RelayConfig::default();
        config.server = server;
        let broker = InMemoryBroker::new();
        broker.create_topic(&config.broker.topic, 1).unwrap();
        let broker: Arc<dyn Broker> = Arc::new(broker);
        let records: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());

        let server = Arc::new(DaemonServer::new(Relay::new(config, broker, records)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            async move { server.serve(listener, shutdown).await }
        });
        (server, addr, shutdown, serving)
    }

    async fn wait_for_connections(server: &DaemonServer, expected: usize) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while server.active_connections() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Read until the server drops the socket
    async fn closed_by_server(stream: &mut TcpStream) -> bool {
        use tokio::io::AsyncReadExt;

        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        })
        .await;
        read.is_ok()
    }

    #[tokio::test]
    async fn test_shutdown_releases_socket_waiting_for_handshake() {
        let (server, addr, shutdown, serving) = start_server(ServerConfig::default()).await;

        let _idle = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let config = ServerConfig {
            handshake_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let (server, addr, shutdown, serving) = start_server(config).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        assert!(closed_by_server(&mut idle).await);
        wait_for_connections(&server, 0).await;

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshaking_sockets_count_against_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let (server, addr, shutdown, serving) = start_server(config).await;

        let _first = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert!(closed_by_server(&mut second).await);
        assert_eq!(server.active_connections(), 1);

        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }
}
