use anyhow::Context;
use heartbeat_core::{Scheduler, TokioScheduler};
use heartbeat_server::config;
use heartbeat_server::state::AppState;
use log::{error, info, LevelFilter};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // 初始化日志记录器，RUST_LOG 可以覆盖默认级别
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .parse_default_env()
        .init();
    info!("[主程序] 日志系统已成功初始化 (env_logger)，默认级别: Info。");

    // 心跳回调与连接事件都在同一个线程上依次执行
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("无法创建 Tokio 运行时")?;
    let result = runtime.block_on(run());
    if let Err(e) = &result {
        error!("[主程序] 致命错误：WebSocket 服务异常退出: {:#}", e);
    }
    result
}

async fn run() -> anyhow::Result<()> {
    let ws_config = config::get_config().websocket.clone();
    info!(
        "[主程序] 应用配置已加载。WebSocket 服务地址: {}，心跳间隔: {} 毫秒",
        ws_config.listen_addr(),
        ws_config.heartbeat_interval_ms
    );

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let state = AppState::new(&ws_config, scheduler).context("初始化心跳子系统失败")?;

    info!("[主程序] 正在启动 WebSocket 服务...");
    state.ws_service(ws_config).start().await
}
