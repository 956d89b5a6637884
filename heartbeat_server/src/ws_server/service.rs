use crate::config::WebSocketConfig;
use crate::error::AppError;
use crate::ws_server::connection::WsConnection;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use heartbeat_core::message;
use heartbeat_core::server::transport::{ServerTransport, WsStream};
use heartbeat_core::{Connection, ConnectionEvent, ConnectionId, ConnectionRef, ConnectionRegistry, EventBus, HeartbeatError};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

/// 关闭信号发出后等待写任务退出的最长时间
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket 服务：每个连接对应一个 `WsConnection`、一个写任务和一个读循环。
///
/// 连接建立时登记到注册表并发布 `Opened`；读循环把每一帧入站数据（文本、二进制、ping、pong）
/// 都以 `MessageReceived` 发布；连接结束时移除并发布 `Closed`。
pub struct WsService {
    config: WebSocketConfig,
    registry: ConnectionRegistry,
    bus: EventBus,
}

impl WsService {
    pub fn new(config: WebSocketConfig, registry: ConnectionRegistry, bus: EventBus) -> Self {
        info!("[WsService] New instance created.");
        Self { config, registry, bus }
    }

    /// 绑定配置中的地址并开始服务。
    pub async fn start(&self) -> Result<()> {
        let listen_addr = self.config.listen_addr();
        info!("[WsService] Starting WebSocket service on {}...", listen_addr);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("无法绑定 WebSocket 监听地址 {}", listen_addr))?;
        self.serve(listener).await
    }

    /// 在已绑定的监听器上服务，正常情况下不会返回。
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let queue_capacity = self.config.outbound_queue_capacity;

        let on_new_connection = move |ws_stream: WsStream, peer_addr: SocketAddr| {
            let registry = registry.clone();
            let bus = bus.clone();
            async move {
                run_session(ws_stream, peer_addr, registry, bus, queue_capacity).await;
            }
        };

        ServerTransport::serve(listener, on_new_connection)
            .await
            .map_err(|e| AppError::WebSocketService(e.to_string()))
            .context("WebSocket server operation failed")?;

        warn!("[WsService] WebSocket server has unexpectedly stopped.");
        Ok(())
    }
}

async fn run_session(
    ws_stream: WsStream,
    peer_addr: SocketAddr,
    registry: ConnectionRegistry,
    bus: EventBus,
    queue_capacity: usize,
) {
    let (connection, mut outbound_rx, close_rx) = WsConnection::new(peer_addr, queue_capacity);
    let connection_ref: ConnectionRef = connection.clone();
    let id = connection.id();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    registry.add(Arc::clone(&connection_ref));
    bus.publish(&ConnectionEvent::Opened(id));
    info!("[WsService] New client connected: ConnectionID={}, Addr={}", id, connection.addr());

    let writer_connection = Arc::clone(&connection);
    let mut writer_close_rx = close_rx.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_close_rx.changed() => {
                    debug!("[SenderTask {}] Close signal received, sender task ending.", id);
                    break;
                }
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else {
                        break;
                    };
                    let result = ws_sender.send(Message::Text(frame.text)).await;
                    writer_connection.mark_flushed(frame.bytes);
                    if let Err(e) = result {
                        warn!(
                            "[SenderTask {}] Failed to send message to client: {}. Assuming connection is broken.",
                            id,
                            HeartbeatError::from(e)
                        );
                        break;
                    }
                }
            }
        }
        if let Err(e) = ws_sender.send(Message::Close(None)).await {
            debug!("[SenderTask {}] Close frame not delivered: {}", id, e);
        }
        let _ = ws_sender.close().await;
    });

    let mut reader_close_rx = close_rx;
    loop {
        tokio::select! {
            biased;
            _ = reader_close_rx.changed() => {
                info!("[WsService] ConnectionID {}: Close requested, terminating connection handling.", id);
                break;
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(close_frame))) => {
                        info!("[WsService] ConnectionID {}: Client sent Close frame: {:?}", id, close_frame);
                        break;
                    }
                    Some(Ok(inbound)) => {
                        let envelope = match &inbound {
                            Message::Text(text) => match message::decode(text) {
                                Ok(envelope) => Some(envelope),
                                Err(e) => {
                                    debug!("[WsService] ConnectionID {}: Undecodable text frame: {}", id, e);
                                    None
                                }
                            },
                            _ => None,
                        };
                        bus.publish(&ConnectionEvent::MessageReceived {
                            connection: Arc::clone(&connection_ref),
                            envelope,
                        });
                    }
                    Some(Err(e)) => {
                        warn!(
                            "[WsService] ConnectionID {}: {}. Connection likely broken.",
                            id,
                            HeartbeatError::from(e)
                        );
                        bus.publish(&ConnectionEvent::Error(id));
                        break;
                    }
                    None => {
                        info!("[WsService] ConnectionID {}: Client connection closed by peer.", id);
                        break;
                    }
                }
            }
        }
    }

    connection.begin_closing();
    join_writer(writer, WRITER_SHUTDOWN_GRACE, id).await;
    connection.mark_closed();
    registry.remove(&id);
    bus.publish(&ConnectionEvent::Closed(id));
}

/// 等待写任务退出；对端不再读取导致 Close 帧无法写出时，超过 `grace` 即中止写任务。
async fn join_writer(mut writer: JoinHandle<()>, grace: Duration, id: ConnectionId) {
    match tokio::time::timeout(grace, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("[WsService] ConnectionID {}: Sender task panicked or was aborted: {:?}", id, e);
        }
        Err(_) => {
            warn!(
                "[WsService] ConnectionID {}: Sender task did not finish within {:?}, aborting it.",
                id, grace
            );
            writer.abort();
        }
    }
}
