// heartbeat_core/src/message.rs

//! 心跳协议的线上编解码。
//!
//! 线上格式是扁平的 JSON 对象（见 `heartbeat_models::ws_payloads::Envelope`）。
//! 编码是纯函数、不会失败；解码只用于入站帧，遇到非法帧返回 `HeartbeatError::DeserializationError`，
//! 由调用方决定如何处理（服务端会把它当作“无法识别但仍然是流量”的消息）。

use heartbeat_models::ws_payloads::{
    Envelope, PING_MESSAGE_TYPE, PONG_MESSAGE_TYPE, TYPE_FIELD, UID_FIELD,
};
use serde_json::{Map, Value};

use crate::error::HeartbeatError;

/// 编码一条协议消息。
///
/// 结果对象包含 `type`、并入的 `payload` 字段，以及仅在提供时加入的 `uid`（键按字典序排列）。
/// 未提供 `uid` 时结果中完全没有该字段。
pub fn encode(message_type: &str, payload: &Map<String, Value>, uid: Option<&str>) -> String {
    let envelope = Envelope {
        message_type: message_type.to_string(),
        uid: uid.map(str::to_string),
        payload: payload.clone(),
    };
    encode_envelope(&envelope)
}

/// 编码一个已经构造好的信封。
pub fn encode_envelope(envelope: &Envelope) -> String {
    // Value 的 Display 实现即紧凑 JSON，且不会失败
    Value::Object(envelope.to_json_map()).to_string()
}

/// 存活巡检向每个连接广播的 Ping 帧。
pub fn ping_frame() -> String {
    encode(PING_MESSAGE_TYPE, &Map::new(), None)
}

/// 对入站 Ping 的即时回复，`uid` 原样回传。
pub fn pong_frame(uid: Option<&str>) -> String {
    encode(PONG_MESSAGE_TYPE, &Map::new(), uid)
}

/// 判断消息类型是否为 Ping：去掉首尾空白并转为大写后等于 "PING"。
pub fn is_ping(message_type: &str) -> bool {
    message_type.trim().to_uppercase() == "PING"
}

/// 把一个入站文本帧解码为信封。
///
/// - 帧必须是 JSON 对象，且 `type` 字段必须是字符串；
/// - `uid` 仅在为字符串时作为关联标识提取，其它类型的 `uid` 不被解释，留在负载中；
/// - 其余字段全部进入 `payload`。
pub fn decode(frame: &str) -> Result<Envelope, HeartbeatError> {
    let value: Value = serde_json::from_str(frame).map_err(|e| {
        HeartbeatError::DeserializationError(format!("入站帧不是合法的 JSON: {}, 原始帧: '{}'", e, frame))
    })?;
    let Value::Object(mut object) = value else {
        return Err(HeartbeatError::DeserializationError(format!(
            "入站帧不是 JSON 对象, 原始帧: '{}'",
            frame
        )));
    };

    let message_type = match object.remove(TYPE_FIELD) {
        Some(Value::String(message_type)) => message_type,
        Some(other) => {
            return Err(HeartbeatError::DeserializationError(format!(
                "`type` 字段不是字符串: {}",
                other
            )));
        }
        None => {
            return Err(HeartbeatError::DeserializationError(format!(
                "入站帧缺少 `type` 字段, 原始帧: '{}'",
                frame
            )));
        }
    };

    let uid = match object.remove(UID_FIELD) {
        Some(Value::String(uid)) => Some(uid),
        Some(other) => {
            object.insert(UID_FIELD.to_string(), other);
            None
        }
        None => None,
    };

    Ok(Envelope {
        message_type,
        uid,
        payload: object,
    })
}
