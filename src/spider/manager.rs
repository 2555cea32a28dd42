//! 爬虫管理
//!
//! 对外的管理入口：上传爬虫包、发布、删除、统计。
//! 删除爬虫时先广播控制消息再删记录，其他节点据消息清理各自的镜像，
//! 漏掉消息的节点由下一轮全量同步兜底。

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::bus::{ControlBus, NodeMessage, CHANNEL_ALL_NODES};
use crate::common::TempStaging;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::scheduler::SpiderScheduler;
use crate::store::model::{DailyStats, Spider, SpiderStats};
use crate::store::{BlobStore, RecordStore};
use crate::sync::{MirrorSync, SyncOutcome};

/// 执行统计的时间窗口（天）
pub const STATS_WINDOW_DAYS: i64 = 30;

/// 爬虫管理器
pub struct SpiderManager {
    /// 包存储
    blob_store: Arc<BlobStore>,
    /// 记录存储
    records: Arc<RecordStore>,
    /// 镜像同步器
    mirror: Arc<MirrorSync>,
    /// 控制面总线
    bus: Arc<ControlBus>,
    /// 调度器
    scheduler: Arc<SpiderScheduler>,
    /// 上传暂存目录
    staging: TempStaging,
}

impl SpiderManager {
    /// 创建爬虫管理器
    pub fn new(
        blob_store: Arc<BlobStore>,
        records: Arc<RecordStore>,
        mirror: Arc<MirrorSync>,
        bus: Arc<ControlBus>,
        scheduler: Arc<SpiderScheduler>,
        config: &AppConfig,
    ) -> Result<Self> {
        let staging = TempStaging::new(config.storage.tmp_dir.clone())?;

        Ok(Self {
            blob_store,
            records,
            mirror,
            bus,
            scheduler,
            staging,
        })
    }

    // ==================== 上传与发布 ====================

    /// 上传爬虫包
    ///
    /// 包名（去掉 .zip）就是爬虫名。内容先落暂存目录再分块转入包存储，
    /// 同名旧包被覆盖；记录创建或更新后立即做一次本地镜像同步。
    /// 分块拷贝、MD5 计算和落库都是阻塞操作，放到阻塞线程池执行。
    pub async fn upload_package(&self, file_name: &str, content: &[u8]) -> Result<Spider> {
        let spider_name = validate_package_name(file_name)?;

        let staged = self.staging.stage(".zip", content).await?;

        let blob_store = Arc::clone(&self.blob_store);
        let records = Arc::clone(&self.records);
        let mirror = Arc::clone(&self.mirror);
        let file_name = file_name.to_string();

        tokio::task::spawn_blocking(move || -> Result<Spider> {
            let meta = blob_store.save_file(&file_name, staged.path())?;

            let spider = match records.get_spider_by_name(&spider_name)? {
                Some(mut spider) => {
                    spider.file_id = meta.id.clone();
                    spider.updated_at = Utc::now();
                    spider
                }
                None => {
                    let src = mirror
                        .mirror_dir(&spider_name)
                        .to_string_lossy()
                        .into_owned();
                    let mut spider = Spider::new(&spider_name, "customized", &src);
                    spider.file_id = meta.id.clone();
                    spider
                }
            };
            records.save_spider(&spider)?;

            // 立即同步本地镜像，失败交给周期扫描兜底
            if let Err(e) = mirror.sync_spider(&spider) {
                warn!("上传后立即同步失败，等待下一轮扫描: {}", e);
            }

            info!("爬虫包上传完成: {} -> {}", file_name, spider.name);
            Ok(spider)
        })
        .await
        .map_err(|e| SyncError::Other(format!("上传任务异常退出: {}", e)))?
    }

    /// 立即同步某个爬虫的本地镜像
    ///
    /// 周期扫描发现包丢失只是顺手修正记录；显式发布时修正照常发生，
    /// 但要把这个不一致作为错误告诉调用方。
    pub fn publish_spider(&self, spider_id: &str) -> Result<SyncOutcome> {
        let spider = self
            .records
            .get_spider(spider_id)?
            .ok_or_else(|| SyncError::RecordNotFound(spider_id.to_string()))?;

        match self.mirror.sync_spider(&spider)? {
            SyncOutcome::OrphanRemoved => Err(SyncError::OrphanedRecord {
                spider: spider.name,
                file_id: spider.file_id,
            }),
            outcome => Ok(outcome),
        }
    }

    // ==================== 删除 ====================

    /// 删除爬虫
    ///
    /// 依次：清理本节点镜像、广播删除消息、删除包、删除调度（并重建
    /// 调度快照）、删除任务记录、删除爬虫记录。广播在记录删除之前，
    /// 消息里带着爬虫名称，处理端不依赖记录是否还在。
    pub fn remove_spider(&self, id: &str) -> Result<()> {
        let spider = self
            .records
            .get_spider(id)?
            .ok_or_else(|| SyncError::RecordNotFound(id.to_string()))?;

        self.mirror.remove_mirror(&spider.name)?;

        self.bus.publish(
            CHANNEL_ALL_NODES,
            &NodeMessage::RemoveSpider {
                spider_id: spider.id.clone(),
                spider_name: spider.name.clone(),
            },
        )?;

        if spider.has_package() {
            self.blob_store.remove_by_id(&spider.file_id)?;
        }

        let removed = self.scheduler.remove_for_spider(&spider.id)?;
        if removed > 0 {
            info!("已删除爬虫 {} 的 {} 条调度", spider.name, removed);
        }

        self.records.remove_tasks_for_spider(&spider.id)?;
        self.records.remove_spider(&spider.id)?;

        info!("爬虫已删除: {} ({})", spider.name, spider.id);
        Ok(())
    }

    // ==================== 查询 ====================

    /// 按 ID 查询爬虫
    pub fn get_spider(&self, id: &str) -> Result<Option<Spider>> {
        self.records.get_spider(id)
    }

    /// 列出全部爬虫
    pub fn list_spiders(&self) -> Result<Vec<Spider>> {
        self.records.list_spiders()
    }

    /// 最近 30 天的执行统计概览
    pub fn spider_stats(&self, spider_id: &str) -> Result<SpiderStats> {
        let spider = self
            .records
            .get_spider(spider_id)?
            .ok_or_else(|| SyncError::RecordNotFound(spider_id.to_string()))?;

        let since = Utc::now() - chrono::Duration::days(STATS_WINDOW_DAYS);
        self.records.spider_stats(&spider.id, since)
    }

    /// 最近 30 天按天聚合的执行统计
    pub fn spider_daily_stats(&self, spider_id: &str) -> Result<Vec<DailyStats>> {
        let spider = self
            .records
            .get_spider(spider_id)?
            .ok_or_else(|| SyncError::RecordNotFound(spider_id.to_string()))?;

        let since = Utc::now() - chrono::Duration::days(STATS_WINDOW_DAYS);
        self.records.daily_task_stats(&spider.id, since)
    }

    /// 清理暂存目录中超龄的残留文件
    pub fn cleanup_staging(&self, max_age_secs: u64) -> Result<usize> {
        Ok(self.staging.cleanup_old(max_age_secs)?)
    }
}

/// 校验上传的包名并取出爬虫名
fn validate_package_name(file_name: &str) -> Result<String> {
    let Some(stem) = file_name.strip_suffix(".zip") else {
        return Err(SyncError::InvalidPackage(format!(
            "仅支持 zip 包: {}",
            file_name
        )));
    };
    if stem.is_empty() {
        return Err(SyncError::InvalidPackage("包名不能为空".to_string()));
    }
    // 爬虫名会成为镜像目录名，不允许路径穿越
    if stem.contains('/') || stem.contains('\\') || stem.contains("..") {
        return Err(SyncError::InvalidPackage(format!(
            "包名含有非法字符: {}",
            file_name
        )));
    }

    Ok(stem.to_string())
}
