//! WebSocket chat server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── SessionValidator ── SessionAuthority
//!             ├── connection task ──┤
//! Client B ──┘   (one per socket)   ├── MessageRouter ── Store
//!                    ▲              ├── TypingTracker
//!                    │              ├── ReadReceiptTracker
//!                    │              └── PresenceRegistry / OfflineQueue
//!                    │
//!                    └──────── Hub (outbound queue per connection, rooms)
//! ```
//!
//! Each connection task owns its [`Connection`] and multiplexes three
//! sources, in priority order:
//! - the forced-close signal (superseded, shutdown)
//! - inbound frames (JSON text events, pings)
//! - outbound events queued for it on the hub
//!
//! plus the authentication deadline while the connection is not yet
//! authenticated. A background task periodically purges aged offline
//! events and expired cached sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastStats, Subscription};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager, Flow};
use crate::error::{ChatError, ProtocolError};
use crate::offline::QueueStats;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::SessionAuthority;
use crate::storage::Store;

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

/// Lower bound for the sweep period; a zero interval would never tick.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub online_users: usize,
    pub messages_routed: u64,
    pub queued_deliveries: u64,
    pub cached_sessions: usize,
    pub broadcast: BroadcastStats,
    pub offline: QueueStats,
}

/// The chat server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatServer {
    config: ServerConfig,
    manager: Arc<ConnectionManager>,
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        authority: Arc<dyn SessionAuthority>,
        store: Arc<dyn Store>,
    ) -> Self {
        let manager = Arc::new(ConnectionManager::new(config.clone(), authority, store));
        Self {
            config,
            manager,
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Chat server listening on {}", listener.local_addr()?);
        let _sweeper = SweepTask(self.spawn_sweeper());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let period = self.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        if period != self.config.sweep_interval {
            log::warn!(
                "Sweep interval {:?} too short, using {period:?}",
                self.config.sweep_interval
            );
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ProtocolError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);

        let (mut conn, subscription) = self.manager.open();
        self.manager.begin_authentication(&mut conn);

        let result = self.drive(ws_stream, &mut conn, subscription).await;

        // Registration state goes away before anything else can be
        // attributed to this connection.
        self.manager.disconnect(&mut conn);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {} from {addr} closed", conn.id());
        result
    }

    async fn drive<S>(
        &self,
        ws_stream: WebSocketStream<S>,
        conn: &mut Connection,
        subscription: Subscription,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let Subscription {
            events: mut outbound,
            close: mut close_signal,
        } = subscription;

        // Authentication itself is bounded by the same instant.
        let deadline = conn
            .auth_deadline()
            .unwrap_or_else(|| Instant::now() + self.config.auth_timeout);
        let auth_deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(auth_deadline);

        loop {
            tokio::select! {
                biased;

                reason = &mut close_signal => {
                    // Events routed live before the close still reach the socket.
                    flush_outbound(&mut outbound, &mut ws_sender).await?;
                    if let Ok(reason) = reason {
                        log::info!("Closing connection {}: {}", conn.id(), reason.as_str());
                        let notice = ServerEvent::ForceDisconnect {
                            reason: reason.as_str().to_string(),
                        };
                        send_event(&mut ws_sender, &notice).await?;
                    }
                    ws_sender.send(WsMessage::Close(None)).await?;
                    break;
                }

                () = &mut auth_deadline, if !conn.is_authenticated() => {
                    self.manager.reject_timeout(conn);
                    flush_outbound(&mut outbound, &mut ws_sender).await?;
                    ws_sender.send(WsMessage::Close(None)).await?;
                    break;
                }

                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match ClientEvent::from_json(text.as_str()) {
                                Ok(event) => {
                                    if self.manager.dispatch(conn, event).await == Flow::Close {
                                        flush_outbound(&mut outbound, &mut ws_sender).await?;
                                        ws_sender.send(WsMessage::Close(None)).await?;
                                        break;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode event from {}: {e}", conn.id());
                                    self.manager.report(conn.id(), &ChatError::from(e));
                                }
                            }
                        }

                        Some(Ok(WsMessage::Binary(_))) => {
                            let err = ProtocolError::UnexpectedFrame("binary".into());
                            self.manager.report(conn.id(), &ChatError::from(err));
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::debug!("Connection {} closed by peer", conn.id());
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on {}: {e}", conn.id());
                            break;
                        }

                        _ => {}
                    }
                }

                event = outbound.recv() => {
                    match event {
                        Some(event) => send_event(&mut ws_sender, &event).await?,
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        let router = self.manager.router().stats();
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            online_users: self.manager.presence().online_count(),
            messages_routed: router.messages_routed,
            queued_deliveries: router.queued_offline,
            cached_sessions: self.manager.validator().cached_sessions(),
            broadcast: self.manager.hub().stats(),
            offline: self.manager.offline().stats(),
        }
    }

    /// Signal every live connection to close.
    pub fn shutdown(&self) -> usize {
        let closed = self.manager.shutdown();
        log::info!("Shutdown signalled to {closed} connections");
        closed
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

/// Aborts the sweep task when the serve loop ends.
struct SweepTask(JoinHandle<()>);

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn send_event<S>(ws_sender: &mut WsSink<S>, event: &ServerEvent) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let json = event.to_json()?;
    ws_sender.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

/// Write whatever is already queued (e.g. `auth_error`) before closing.
async fn flush_outbound<S>(
    outbound: &mut mpsc::Receiver<Arc<ServerEvent>>,
    ws_sender: &mut WsSink<S>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(event) = outbound.try_recv() {
        send_event(ws_sender, &event).await?;
    }
    Ok(())
}
