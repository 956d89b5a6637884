//! 服务端共享状态：连接注册表、事件总线与心跳控制器。
//!
//! 注册表与事件总线由 `WsService` 维护和发布；心跳控制器订阅事件总线，
//! 通过背压发送器向连接写入心跳帧。

use crate::config::WebSocketConfig;
use crate::error::AppError;
use crate::ws_server::service::WsService;
use heartbeat_core::{BackpressureSender, ConnectionRegistry, EventBus, HeartbeatController, Scheduler};
use log::info;
use std::sync::Arc;

pub struct AppState {
    pub registry: ConnectionRegistry,
    pub bus: EventBus,
    pub controller: HeartbeatController,
}

impl AppState {
    /// 校验配置，创建注册表、事件总线与心跳控制器，并启动控制器。
    pub fn new(config: &WebSocketConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self, AppError> {
        config.validate()?;
        let registry = ConnectionRegistry::new();
        let bus = EventBus::new();
        let sender = BackpressureSender::new(Arc::clone(&scheduler), config.retry_policy());
        let controller = HeartbeatController::new(
            Arc::new(registry.clone()),
            bus.clone(),
            scheduler,
            sender,
            config.heartbeat_interval(),
        )?;
        controller.start();
        info!(
            "[主程序] 心跳控制器已启动。心跳间隔: {:?}，背压重试策略: {:?}",
            config.heartbeat_interval(),
            config.retry_policy()
        );
        Ok(Self {
            registry,
            bus,
            controller,
        })
    }

    /// 创建与本状态共享注册表和事件总线的 WebSocket 服务。
    pub fn ws_service(&self, config: WebSocketConfig) -> WsService {
        WsService::new(config, self.registry.clone(), self.bus.clone())
    }
}
