//! 控制面消息总线
//!
//! 按频道路由的发布/订阅总线，至多一次投递：
//! - 发布即忘，不落盘、不重放，订阅晚了收不到历史消息
//! - 没有活跃订阅者不算发布失败，消息直接丢弃
//! - 慢订阅者超出缓冲会丢消息（Lagged），由周期性全量同步兜底

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::bus::message::NodeMessage;
use crate::error::Result;

/// 默认频道缓冲区大小
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// 控制面总线
pub struct ControlBus {
    /// 频道 -> 广播发送端
    channels: DashMap<String, broadcast::Sender<String>>,
    /// 每个频道的缓冲区大小
    capacity: usize,
}

impl ControlBus {
    /// 创建新的总线
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// 取得（或创建）频道的发送端
    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// 发布一条控制消息
    ///
    /// 只有消息编码失败才返回错误；频道没有订阅者时消息丢弃、正常返回。
    pub fn publish(&self, channel: &str, msg: &NodeMessage) -> Result<()> {
        let payload = serde_json::to_string(msg)?;
        debug!("发布消息到频道 {}: {}", channel, msg.kind());
        self.publish_raw(channel, payload);
        Ok(())
    }

    /// 发布原始文本负载
    pub fn publish_raw(&self, channel: &str, payload: String) {
        let sender = self.sender(channel);
        match sender.send(payload) {
            Ok(n) => debug!("频道 {} 已投递 {} 个订阅者", channel, n),
            // 没有活跃订阅者不算错误，消息按设计丢弃
            Err(_) => debug!("频道 {} 没有活跃订阅者，消息丢弃", channel),
        }
    }

    /// 订阅频道，返回接收端
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// 频道当前的订阅者数量
    pub fn receiver_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
