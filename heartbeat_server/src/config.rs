use crate::error::AppError;
use heartbeat_core::{HeartbeatError, RetryPolicy};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// WebSocket 服务的默认主机地址
pub const DEFAULT_WS_HOST: &str = "0.0.0.0";
/// WebSocket 服务的默认端口号
pub const DEFAULT_WS_PORT: u16 = 8088;
/// 默认心跳间隔（毫秒）
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// 默认背压重试延迟（毫秒）
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;
/// 每个连接出站队列的默认容量（帧数）
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "app_settings.json";
/// 指定配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "HEARTBEAT_CONFIG";

/// WebSocket 服务端详细配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// WebSocket 服务绑定的主机地址
    pub host: String,
    /// WebSocket 服务监听的端口号
    pub port: u16,
    /// 心跳间隔（毫秒），同时也是每轮存活巡检的超时
    pub heartbeat_interval_ms: u64,
    /// 出站缓冲未排空时的重试延迟（毫秒）
    pub backpressure_retry_delay_ms: u64,
    /// 单次发送最多检查缓冲的次数；`None` 表示不设上限
    pub backpressure_max_attempts: Option<u32>,
    /// 每个连接出站队列的容量
    pub outbound_queue_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(),
            port: DEFAULT_WS_PORT,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            backpressure_retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            backpressure_max_attempts: None,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl WebSocketConfig {
    /// 校验配置取值。
    pub fn validate(&self) -> Result<(), HeartbeatError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(HeartbeatError::InvalidConfig(
                "heartbeat_interval_ms 必须大于零".to_string(),
            ));
        }
        if self.backpressure_retry_delay_ms == 0 {
            return Err(HeartbeatError::InvalidConfig(
                "backpressure_retry_delay_ms 必须大于零".to_string(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(HeartbeatError::InvalidConfig(
                "outbound_queue_capacity 必须大于零".to_string(),
            ));
        }
        Ok(())
    }

    /// 监听地址，形如 `host:port`。
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// 由重试延迟与次数上限构造背压重试策略。
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.backpressure_retry_delay_ms);
        match self.backpressure_max_attempts {
            Some(max_attempts) => RetryPolicy::bounded(delay, max_attempts),
            None => RetryPolicy::unbounded(delay),
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// WebSocket 服务的相关配置
    pub websocket: WebSocketConfig,
}

// 全局静态应用配置实例
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// 从指定路径加载配置；文件缺失或损坏时写回并返回默认配置。
pub fn load_or_create_config(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                    config_file_path, e
                );
                write_back_defaults(config_file_path)
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            write_back_defaults(config_file_path)
        }
    }
}

/// 获取配置文件路径
///
/// 依次尝试：环境变量 `HEARTBEAT_CONFIG`、当前目录、用户配置目录。
pub fn get_config_file_path() -> PathBuf {
    if let Ok(explicit) = env::var(CONFIG_PATH_ENV) {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit);
        }
    }

    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file_path = current_dir.join(CONFIG_FILE_NAME);
    let current_dir_writable = fs::metadata(&current_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);
    if config_file_path.exists() || current_dir_writable {
        return config_file_path;
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("heartbeat_server")
            .join(CONFIG_FILE_NAME);
    } else if let Ok(userprofile) = env::var("USERPROFILE") {
        // Windows环境
        return PathBuf::from(userprofile)
            .join("AppData")
            .join("Local")
            .join("heartbeat_server")
            .join(CONFIG_FILE_NAME);
    }

    config_file_path
}

/// 保存配置到文件
pub fn save_config(config: &AppConfig, path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::ConfigError(format!("创建配置目录 {:?} 失败: {}", parent, e))
            })?;
        }
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::ConfigError(format!("序列化配置信息失败: {}", e)))?;
    fs::write(path, content)
        .map_err(|e| AppError::ConfigError(format!("将配置写入文件 {:?} 时失败: {}", path, e)))?;
    info!("[配置模块] 已成功将当前配置（可能是默认配置）保存到 {:?}.", path);
    Ok(())
}

/// 写回默认配置；失败只记录日志，服务继续使用内存中的默认配置。
fn write_back_defaults(path: &Path) -> AppConfig {
    let default_config = AppConfig::default();
    if let Err(e) = save_config(&default_config, path) {
        warn!("[配置模块] 错误：{}", e);
    }
    default_config
}

/// 获取全局应用配置，首次调用时从配置文件加载。
pub fn get_config() -> &'static AppConfig {
    APP_CONFIG.get_or_init(|| {
        let config = load_or_create_config(&get_config_file_path());
        info!("[配置模块] 应用配置已成功初始化完毕。");
        config
    })
}
