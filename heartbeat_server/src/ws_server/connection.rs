use chrono::{DateTime, Utc};
use heartbeat_core::{Connection, ConnectionId};
use heartbeat_models::ConnectionState;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// 出站队列中的一帧数据及其字节数。
#[derive(Debug)]
pub struct OutboundFrame {
    pub text: String,
    pub bytes: usize,
}

/// 代表一个已完成 WebSocket 握手的客户端连接。
///
/// `send` 只把文本帧放入有界的出站队列，由该连接专属的写任务异步刷出；
/// 已入队但尚未刷出的字节数即为 `buffered_amount`。`close` 只发出关闭信号，
/// 写任务收到后发送 Close 帧并结束，读循环随之退出并完成清理。
#[derive(Debug)]
pub struct WsConnection {
    /// 由服务端在握手成功后生成的连接标识
    id: ConnectionId,
    /// 客户端的网络地址
    addr: SocketAddr,
    /// 握手成功的时间 (UTC)
    connected_at: DateTime<Utc>,
    state: AtomicU8,
    /// 已入队但尚未刷出的字节数
    queued_bytes: Arc<AtomicUsize>,
    outbound: mpsc::Sender<OutboundFrame>,
    close_signal: watch::Sender<bool>,
}

impl WsConnection {
    /// 创建处于 `Open` 状态的连接，同时返回写任务所需的出站队列接收端与关闭信号接收端。
    pub fn new(
        addr: SocketAddr,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_signal, close_rx) = watch::channel(false);
        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            addr,
            connected_at: Utc::now(),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            queued_bytes: Arc::new(AtomicUsize::new(0)),
            outbound,
            close_signal,
        });
        (connection, outbound_rx, close_rx)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 写任务刷出一帧之后调用，扣减缓冲占用。
    pub fn mark_flushed(&self, bytes: usize) {
        let _ = self
            .queued_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                Some(queued.saturating_sub(bytes))
            });
    }

    /// 对端发起关闭或传输出错时调用：进入 `Closing` 并通知写任务退出。
    pub fn begin_closing(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open.as_u8(),
            ConnectionState::Closing.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.close_signal.send(true);
    }

    /// I/O 任务全部结束后调用，连接进入 `Closed`。
    pub fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        let lifetime = Utc::now().signed_duration_since(self.connected_at);
        info!(
            "[WsService] 连接 {} ({}) 已关闭，存活时长 {} 秒。",
            self.id,
            self.addr,
            lifetime.num_seconds()
        );
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn buffered_amount(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &str) {
        if self.state() != ConnectionState::Open {
            debug!("[WsService] 连接 {} 已不处于 OPEN 状态，丢弃出站帧。", self.id);
            return;
        }
        let bytes = frame.len();
        self.queued_bytes.fetch_add(bytes, Ordering::SeqCst);
        let outbound = OutboundFrame {
            text: frame.to_string(),
            bytes,
        };
        if let Err(e) = self.outbound.try_send(outbound) {
            self.mark_flushed(bytes);
            warn!("[WsService] 连接 {} 的出站队列无法接收新帧 ({})，该帧被丢弃。", self.id, e);
        }
    }

    fn close(&self) {
        let requested = self
            .state
            .compare_exchange(
                ConnectionState::Open.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if requested {
            info!("[WsService] 正在关闭连接 {} ({})。", self.id, self.addr);
            let _ = self.close_signal.send(true);
        }
    }
}
