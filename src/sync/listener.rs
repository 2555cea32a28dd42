//! 节点控制消息监听
//!
//! 订阅公共频道与本节点专属频道，处理控制面消息。
//! 单条消息处理失败（包括无法解码的负载）只记日志，监听循环不退出。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{node_channel, ControlBus, NodeMessage, CHANNEL_ALL_NODES};
use crate::sync::mirror::MirrorSync;

/// 节点消息监听器
pub struct NodeListener {
    /// 控制面总线
    bus: Arc<ControlBus>,
    /// 镜像同步器
    mirror: Arc<MirrorSync>,
    /// 本节点 ID
    node_id: String,
    /// 停止信号
    cancel: CancellationToken,
}

impl NodeListener {
    /// 创建监听器
    pub fn new(bus: Arc<ControlBus>, mirror: Arc<MirrorSync>, node_id: &str) -> Self {
        Self {
            bus,
            mirror,
            node_id: node_id.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// 启动监听循环
    pub fn start(&self) -> JoinHandle<()> {
        let mut all_rx = self.bus.subscribe(CHANNEL_ALL_NODES);
        let mut own_rx = self.bus.subscribe(&node_channel(&self.node_id));
        let mirror = Arc::clone(&self.mirror);
        let cancel = self.cancel.clone();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            info!("节点 {} 开始监听控制消息", node_id);

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("节点 {} 停止监听控制消息", node_id);
                        break;
                    }
                    msg = all_rx.recv() => msg,
                    msg = own_rx.recv() => msg,
                };

                match received {
                    Ok(payload) => {
                        // 镜像目录删除是阻塞文件操作，放到阻塞线程池执行
                        let mirror = Arc::clone(&mirror);
                        let handled = tokio::task::spawn_blocking(move || {
                            handle_payload(&mirror, &payload)
                        })
                        .await;
                        if let Err(e) = handled {
                            warn!("控制消息处理任务异常退出: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // 落后丢弃的消息由周期性全量同步兜底
                        warn!("控制消息积压，丢弃 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("控制频道已关闭，监听退出");
                        break;
                    }
                }
            }
        })
    }

    /// 发出停止信号
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// 处理一条控制消息，任何失败只记日志
fn handle_payload(mirror: &MirrorSync, payload: &str) {
    let msg: NodeMessage = match serde_json::from_str(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("控制消息无法解码，已忽略: {} - {}", payload, e);
            return;
        }
    };

    match msg {
        NodeMessage::RemoveSpider {
            spider_id,
            spider_name,
        } => {
            info!("收到删除爬虫消息: {} ({})", spider_name, spider_id);
            if let Err(e) = mirror.remove_mirror(&spider_name) {
                warn!("删除爬虫镜像 {} 失败: {}", spider_name, e);
            }
        }
    }
}
