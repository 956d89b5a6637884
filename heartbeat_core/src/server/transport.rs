// heartbeat_core/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和握手逻辑。

use crate::error::HeartbeatError;
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async};

/// 经过 WebSocket 握手后的 TCP 流。
pub type WsStream = WebSocketStream<TcpStream>;

/// 服务端传输层：在监听器上接受连接，为每个连接派生任务完成握手。
pub struct ServerTransport;

impl ServerTransport {
    /// 绑定地址并开始服务，见 [`serve`](Self::serve)。
    pub async fn start<F, Fut>(addr: SocketAddr, on_connect: F) -> Result<(), HeartbeatError>
    where
        F: Fn(WsStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&addr).await?;
        Self::serve(listener, on_connect).await
    }

    /// 在已绑定的监听器上持续接受连接。
    ///
    /// 每个握手成功的连接都会在新的 Tokio 任务中调用一次 `on_connect`。
    /// 单个连接接受失败或握手失败只记录日志，不影响后续连接。
    /// 只有读取监听器本地地址失败时才返回错误；正常情况下此函数不会返回。
    pub async fn serve<F, Fut>(listener: TcpListener, on_connect: F) -> Result<(), HeartbeatError>
    where
        F: Fn(WsStream, SocketAddr) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!("WebSocket 服务器正在监听地址: {}", local_addr);

        loop {
            match listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("从 {} 接受了新的 TCP 连接", peer_addr);
                    let on_connect_callback = on_connect.clone();
                    tokio::spawn(async move {
                        match accept_async(tcp_stream).await {
                            Ok(ws_stream) => {
                                info!("与 {} 的 WebSocket 握手成功", peer_addr);
                                on_connect_callback(ws_stream, peer_addr).await;
                            }
                            Err(e) => {
                                error!("与 {} 的 WebSocket 握手失败: {}", peer_addr, HeartbeatError::from(e));
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("接受 TCP 连接失败: {}。服务器将继续运行。", e);
                }
            }
        }
    }
}
