use std::sync::Arc;

use spiderhub::bus::ControlBus;
use spiderhub::config::AppConfig;
use spiderhub::scheduler::SpiderScheduler;
use spiderhub::spider::SpiderManager;
use spiderhub::store::{BlobStore, RecordStore};
use spiderhub::sync::{MirrorSync, NodeListener};
use tracing::info;

/// 残留暂存文件的清理阈值（秒）
const STAGING_MAX_AGE_SECS: u64 = 24 * 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("SpiderHub 集群同步与调度引擎启动中...");

    // 加载配置
    let config = AppConfig::load_or_default("config.toml").await;
    info!("节点 ID: {}", config.node.id);

    // 初始化存储
    let data_dir = &config.storage.data_dir;
    let blob_store = Arc::new(BlobStore::new(&data_dir.join("blobs"))?);
    let records = Arc::new(RecordStore::new(&data_dir.join("spiderhub.db"))?);

    // 控制面总线与镜像同步器
    let bus = Arc::new(ControlBus::new(config.bus.capacity));
    let mirror = Arc::new(MirrorSync::new(
        Arc::clone(&blob_store),
        Arc::clone(&records),
        &config,
    ));

    // 节点消息监听
    let listener = NodeListener::new(Arc::clone(&bus), Arc::clone(&mirror), &config.node.id);
    let listener_handle = listener.start();

    // 调度器（内部的全量同步任务每分钟触发一次）
    let scheduler = Arc::new(SpiderScheduler::new(
        Arc::clone(&records),
        Arc::clone(&mirror),
    ));
    let scheduler_handle = scheduler.start()?;

    // 管理入口
    let manager = SpiderManager::new(
        Arc::clone(&blob_store),
        Arc::clone(&records),
        Arc::clone(&mirror),
        Arc::clone(&bus),
        Arc::clone(&scheduler),
        &config,
    )?;

    // 清理上次运行遗留的暂存文件
    let cleaned = manager.cleanup_staging(STAGING_MAX_AGE_SECS)?;
    if cleaned > 0 {
        info!("已清理 {} 个残留暂存文件", cleaned);
    }

    // 启动时先做一轮全量镜像同步
    mirror.sync_all().await;

    info!("SpiderHub 启动完成");

    // 等待退出信号
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，正在停止...");

    scheduler.shutdown();
    listener.shutdown();
    let _ = scheduler_handle.await;
    let _ = listener_handle.await;

    info!("SpiderHub 已退出");
    Ok(())
}
