// heartbeat_core/src/registry.rs

//! 连接注册表。
//!
//! 注册表是“当前所有已打开连接”的权威集合，由外部服务端独占维护：
//! 连接建立时 `add`，连接关闭时 `remove`。心跳控制器与存活巡检只通过 `Registry` trait
//! 读取占用数量和成员快照，从不修改它。

use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;

use crate::connection::{ConnectionId, ConnectionRef};

/// 心跳子系统对连接注册表的只读视图。
pub trait Registry: Send + Sync {
    /// 当前已登记的连接数量。
    fn size(&self) -> usize;

    /// 当前成员的不可变副本。之后注册表的变化不会影响已取得的快照。
    fn snapshot(&self) -> Vec<ConnectionRef>;
}

/// 基于 `DashMap` 的连接注册表，由服务端持有并维护。
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// Key: 连接标识; Value: 连接的共享引用
    clients: Arc<DashMap<ConnectionId, ConnectionRef>>,
}

impl ConnectionRegistry {
    /// 创建一个空的注册表。
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// 登记一个新建立的连接。同一标识重复登记时以新连接为准。
    pub fn add(&self, connection: ConnectionRef) {
        let id = connection.id();
        if self.clients.insert(id, connection).is_some() {
            warn!("[连接注册表] 连接 {} 被重复登记，旧的引用已被替换。", id);
        }
        info!("[连接注册表] 新连接已登记: id={}，当前连接总数: {}", id, self.clients.len());
    }

    /// 移除一个连接。返回被移除的连接；连接不存在时返回 `None`。
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionRef> {
        match self.clients.remove(id) {
            Some((_id, connection)) => {
                info!("[连接注册表] 连接已移除: id={}，剩余连接总数: {}", id, self.clients.len());
                Some(connection)
            }
            None => {
                debug!("[连接注册表] 尝试移除不存在的连接: id={}", id);
                None
            }
        }
    }

    /// 按标识查找连接。
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionRef> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Registry for ConnectionRegistry {
    fn size(&self) -> usize {
        self.clients.len()
    }

    fn snapshot(&self) -> Vec<ConnectionRef> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
