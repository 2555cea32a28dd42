//! 节点间控制消息定义

use serde::{Deserialize, Serialize};

/// 广播给全部节点的公共频道
pub const CHANNEL_ALL_NODES: &str = "nodes:public";

/// 单个节点的专属频道
pub fn node_channel(node_id: &str) -> String {
    format!("nodes:{}", node_id)
}

/// 节点控制消息
///
/// 消息以 JSON 文本在总线上传输，`type` 字段区分消息类型。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// 删除爬虫：各节点据此清理本地镜像目录
    ///
    /// 消息携带爬虫名称，处理端无需再查记录（记录此时可能已被删除）。
    RemoveSpider {
        spider_id: String,
        spider_name: String,
    },
}

impl NodeMessage {
    /// 消息类型标签（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::RemoveSpider { .. } => "remove_spider",
        }
    }
}
