// heartbeat_models/src/ws_payloads.rs

//! 包含心跳协议在 WebSocket 通信中使用的信封结构与消息类型常量。
//!
//! 线上格式是一个扁平的 JSON 对象：`type` 字段必填，`uid` 字段可选，
//! 其余任意字段作为负载并入同一个对象，例如：
//!
//! ```json
//! {"type": "pong", "uid": "42"}
//! ```

use serde_json::{Map, Value};

/// 协议识别的 Ping 消息类型（线上写法）。
pub const PING_MESSAGE_TYPE: &str = "ping";
/// 协议识别的 Pong 消息类型（线上写法）。
pub const PONG_MESSAGE_TYPE: &str = "pong";

/// 信封中的消息类型字段名。
pub const TYPE_FIELD: &str = "type";
/// 信封中的关联标识字段名。
pub const UID_FIELD: &str = "uid";

/// `Envelope` 代表一条心跳协议消息。
///
/// - `message_type`: 线上的 `type` 字段，大小写原样保留；只有在判断是否为 Ping 时才做去空白、忽略大小写的比较。
/// - `uid`: 可选的关联标识。本子系统从不解释它的内容，只在回复时原样回传。
///   缺省时线上必须**完全没有**这个字段（而不是 `null`）。
/// - `payload`: 其余所有字段，编码时并入同一个 JSON 对象。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    /// 消息类型，例如 "ping"、"pong"。其它类型由本子系统原样放行。
    pub message_type: String,
    /// 可选的关联标识，原样回传。
    pub uid: Option<String>,
    /// 附加负载字段（不包含 `type` 和 `uid`）。
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// 创建一个只有类型、没有 `uid` 和负载的信封。
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            uid: None,
            payload: Map::new(),
        }
    }

    /// 设置关联标识。
    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// 追加一个负载字段。保留字段名 `type` / `uid` 会被忽略。
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if key != TYPE_FIELD && key != UID_FIELD {
            self.payload.insert(key, value);
        }
        self
    }

    /// 把信封展开成线上使用的扁平 JSON 对象。
    ///
    /// 对象包含 `type`、负载字段，以及仅在存在时加入的 `uid`。
    /// 键按字典序排列（`serde_json::Map` 默认的 BTreeMap 实现），线上不保证字段顺序。
    /// 负载中若混入了 `type` / `uid` 同名字段，以信封自身的值为准。
    pub fn to_json_map(&self) -> Map<String, Value> {
        let mut object = Map::with_capacity(self.payload.len() + 2);
        object.insert(TYPE_FIELD.to_string(), Value::String(self.message_type.clone()));
        for (key, value) in &self.payload {
            if key == TYPE_FIELD || key == UID_FIELD {
                continue;
            }
            object.insert(key.clone(), value.clone());
        }
        if let Some(uid) = &self.uid {
            object.insert(UID_FIELD.to_string(), Value::String(uid.clone()));
        }
        object
    }
}
