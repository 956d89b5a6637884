// heartbeat_server/tests/server_heartbeat_integration_test.rs

use futures_util::{SinkExt, StreamExt};
use heartbeat_core::{Registry, Scheduler, TokioScheduler};
use heartbeat_models::ControllerState;
use heartbeat_server::config::WebSocketConfig;
use heartbeat_server::state::AppState;
use log::{info, LevelFilter};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as TungsteniteMessage};
use url::Url;

const HEARTBEAT_INTERVAL_MS: u64 = 200;

// 辅助函数：初始化日志，仅用于测试，避免多次初始化
fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Info)
        .is_test(true)
        .try_init();
}

/// 在随机端口上启动完整的服务端，返回监听地址与共享状态。
async fn start_server() -> (SocketAddr, AppState) {
    let config = WebSocketConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        backpressure_retry_delay_ms: 10,
        ..WebSocketConfig::default()
    };
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let state = AppState::new(&config, scheduler).expect("初始化服务端状态失败");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = listener.local_addr().expect("无法获取本地监听地址");
    let service = state.ws_service(config);
    tokio::spawn(async move {
        let _ = service.serve(listener).await;
    });
    info!("[Test Main] 服务器监听地址: {}", addr);
    (addr, state)
}

fn ws_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("ws://{}", addr)).expect("无法解析 WebSocket URL")
}

fn message_type(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

#[tokio::test]
async fn test_ping_is_answered_with_pong_echoing_uid() {
    init_test_logger();
    let (addr, _state) = start_server().await;

    let (mut client, _response) = connect_async(ws_url(addr).as_str()).await.expect("客户端连接失败");
    client
        .send(TungsteniteMessage::Text(r#"{"type":"ping","uid":"42"}"#.to_string()))
        .await
        .expect("发送 ping 失败");

    let pong = timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = client.next().await {
            if let TungsteniteMessage::Text(text) = message {
                // 服务端的周期 ping 可能先到达
                if message_type(&text).as_deref() == Some("pong") {
                    return Some(text);
                }
            }
        }
        None
    })
    .await
    .expect("等待 pong 超时")
    .expect("连接在收到 pong 之前被关闭");

    let value: Value = serde_json::from_str(&pong).expect("pong 应为 JSON");
    assert_eq!(value, serde_json::json!({"type": "pong", "uid": "42"}));
}

#[tokio::test]
async fn test_silent_client_is_disconnected() {
    init_test_logger();
    let (addr, state) = start_server().await;

    let (mut client, _response) = connect_async(ws_url(addr).as_str()).await.expect("客户端连接失败");

    let mut pings = 0;
    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    if message_type(&text).as_deref() == Some("ping") {
                        pings += 1;
                    }
                }
                Some(Ok(TungsteniteMessage::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("沉默的客户端应在两个心跳间隔左右被断开");

    assert!(closed);
    assert!(pings >= 1, "断开之前至少应收到一次 ping");

    // 等待服务端完成清理
    timeout(Duration::from_secs(2), async {
        while state.registry.size() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("连接应从注册表中移除");
    assert_eq!(state.controller.state(), ControllerState::Idle);
}

#[tokio::test]
async fn test_responsive_client_stays_connected() {
    init_test_logger();
    let (addr, state) = start_server().await;

    let (mut client, _response) = connect_async(ws_url(addr).as_str()).await.expect("客户端连接失败");

    // 应答服务端的每个 ping，持续五个心跳间隔
    let mut pings = 0;
    let window = Duration::from_millis(HEARTBEAT_INTERVAL_MS * 5);
    let _ = timeout(window, async {
        while let Some(Ok(message)) = client.next().await {
            if let TungsteniteMessage::Text(text) = message {
                if message_type(&text).as_deref() == Some("ping") {
                    pings += 1;
                    client
                        .send(TungsteniteMessage::Text(r#"{"type":"pong"}"#.to_string()))
                        .await
                        .expect("发送 pong 失败");
                }
            }
        }
    })
    .await;

    assert!(pings >= 3, "五个心跳间隔内应收到多次 ping，实际: {}", pings);
    assert_eq!(state.registry.size(), 1, "有应答的客户端不应被断开");
    assert_eq!(state.controller.state(), ControllerState::Active);

    client.close(None).await.expect("客户端关闭失败");
}
