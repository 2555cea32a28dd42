//! 爬虫镜像同步
//!
//! 把包存储中的爬虫包同步到本地镜像目录。每个镜像目录里有一个固定名称的
//! 校验标记文件（md5.txt），记录当前镜像对应的包 MD5：
//! - 包不存在 -> 孤儿记录，删除爬虫记录
//! - 目录不存在 -> 全新下载
//! - 标记不存在 -> 清空重建
//! - 标记与包 MD5 不一致 -> 清空重建
//! - 一致 -> 不动
//!
//! 校验标记总是在内容写完之后才落盘，中断的下载会在下一轮扫描被重做。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::store::model::{BlobMeta, Spider};
use crate::store::{BlobStore, RecordStore};

/// 校验标记文件名
pub const MD5_FILE: &str = "md5.txt";

/// 单个爬虫一次同步的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 镜像与包一致，未做任何操作
    UpToDate,
    /// 镜像目录不存在，完成了全新下载
    Created,
    /// 校验标记缺失或不一致，镜像被清空重建
    Replaced,
    /// 包已不存在，孤儿记录被删除
    OrphanRemoved,
    /// 爬虫尚未关联包，跳过
    Skipped,
}

/// 一轮全量同步的汇总
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub total: usize,
    pub up_to_date: usize,
    pub created: usize,
    pub replaced: usize,
    pub orphans_removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::UpToDate => self.up_to_date += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Replaced => self.replaced += 1,
            SyncOutcome::OrphanRemoved => self.orphans_removed += 1,
            SyncOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// 镜像同步器
pub struct MirrorSync {
    /// 包存储
    blob_store: Arc<BlobStore>,
    /// 记录存储
    records: Arc<RecordStore>,
    /// 镜像根目录
    spider_dir: PathBuf,
    /// 全量同步的最大并发数
    max_concurrent: usize,
    /// 单个爬虫的同步超时
    sync_timeout: Duration,
}

impl MirrorSync {
    /// 创建镜像同步器
    pub fn new(
        blob_store: Arc<BlobStore>,
        records: Arc<RecordStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            blob_store,
            records,
            spider_dir: config.storage.spider_dir.clone(),
            max_concurrent: config.sync.max_concurrent.max(1),
            sync_timeout: Duration::from_secs(config.sync.sync_timeout_secs),
        }
    }

    /// 某个爬虫的镜像目录
    pub fn mirror_dir(&self, spider_name: &str) -> PathBuf {
        self.spider_dir.join(spider_name)
    }

    // ==================== 单爬虫同步 ====================

    /// 同步单个爬虫的本地镜像
    pub fn sync_spider(&self, spider: &Spider) -> Result<SyncOutcome> {
        if !spider.has_package() {
            debug!("爬虫 {} 尚未上传包，跳过同步", spider.name);
            return Ok(SyncOutcome::Skipped);
        }

        // 包不存在：记录成了孤儿，删除记录并停止
        let Some(meta) = self.blob_store.get_meta_by_id(&spider.file_id)? else {
            warn!(
                "爬虫 {} 关联的包 {} 已不存在，删除孤儿记录",
                spider.name, spider.file_id
            );
            self.records.remove_spider(&spider.id)?;
            return Ok(SyncOutcome::OrphanRemoved);
        };

        let dir = self.mirror_dir(&spider.name);

        // 镜像目录不存在：全新下载
        if !dir.exists() {
            info!("镜像目录不存在: {}", dir.display());
            self.download(&dir, &meta)?;
            return Ok(SyncOutcome::Created);
        }

        // 校验标记不存在：清空重建
        let marker = dir.join(MD5_FILE);
        if !marker.exists() {
            info!("校验标记不存在: {}", marker.display());
            self.wipe(&dir)?;
            self.download(&dir, &meta)?;
            return Ok(SyncOutcome::Replaced);
        }

        // 校验标记与包 MD5 不一致：清空重建
        let local_md5 = read_marker(&marker)?;
        if local_md5 != meta.md5 {
            info!("MD5 不一致, 包: {}, 本地: {}", meta.md5, local_md5);
            self.wipe(&dir)?;
            self.download(&dir, &meta)?;
            return Ok(SyncOutcome::Replaced);
        }

        Ok(SyncOutcome::UpToDate)
    }

    /// 下载包内容到镜像目录并写入校验标记
    fn download(&self, dir: &Path, meta: &BlobMeta) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let archive = dir.join(&meta.file_name);
        self.blob_store.export_to_file(&meta.id, &archive)?;

        // 校验标记最后写入：下载中断时标记缺失，下一轮扫描会重建镜像
        std::fs::write(dir.join(MD5_FILE), format!("{}\n", meta.md5))?;

        Ok(())
    }

    /// 清空镜像目录
    fn wipe(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// 删除某个爬虫的镜像目录（幂等）
    pub fn remove_mirror(&self, spider_name: &str) -> Result<()> {
        let dir = self.mirror_dir(spider_name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            info!("已删除爬虫镜像目录: {}", dir.display());
        }
        Ok(())
    }

    // ==================== 全量同步 ====================

    /// 同步全部爬虫的本地镜像
    ///
    /// 并发执行，单个爬虫的失败只记日志并跳过，等下一轮扫描重试。
    pub async fn sync_all(self: &Arc<Self>) -> SweepReport {
        let spiders = match self.records.list_spiders() {
            Ok(spiders) => spiders,
            Err(e) => {
                error!("读取爬虫列表失败，本轮同步跳过: {}", e);
                return SweepReport::default();
            }
        };

        let mut report = SweepReport {
            total: spiders.len(),
            ..Default::default()
        };
        if spiders.is_empty() {
            return report;
        }

        info!("开始同步爬虫镜像，共 {} 个", spiders.len());

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::new();

        for spider in spiders {
            let mirror = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return (spider.name, Err(SyncError::Other(format!("获取并发许可失败: {}", e))))
                    }
                };

                let spider_name = spider.name.clone();
                let timeout = mirror.sync_timeout;
                // 阻塞中的同步无法取消；许可随闭包走，超时后也要等同步真正结束才释放额度
                let task = tokio::task::spawn_blocking({
                    let mirror = Arc::clone(&mirror);
                    move || {
                        let _permit = permit;
                        mirror.sync_spider(&spider)
                    }
                });

                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => (spider_name, result),
                    Ok(Err(e)) => (
                        spider_name,
                        Err(SyncError::Other(format!("同步任务异常退出: {}", e))),
                    ),
                    Err(_) => {
                        let name = spider_name.clone();
                        (spider_name, Err(SyncError::SyncTimeout(name)))
                    }
                }
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((name, Ok(outcome))) => {
                    debug!("爬虫 {} 同步结果: {:?}", name, outcome);
                    report.record(outcome);
                }
                Ok((name, Err(e))) => {
                    // 瞬时错误留给下一轮扫描自愈，其余类别单独标出
                    if e.is_transient() {
                        warn!("同步爬虫 {} 失败，等待下一轮扫描重试: {}", name, e);
                    } else {
                        error!("同步爬虫 {} 失败（类别 {:?}）: {}", name, e.category(), e);
                    }
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("同步任务 join 失败: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "镜像同步完成: 共 {} 个, 一致 {}, 新建 {}, 重建 {}, 孤儿清理 {}, 跳过 {}, 失败 {}",
            report.total,
            report.up_to_date,
            report.created,
            report.replaced,
            report.orphans_removed,
            report.skipped,
            report.failed
        );

        report
    }
}

/// 读取校验标记的首行并去掉所有空白字符
fn read_marker(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let first_line = content.lines().next().unwrap_or("");
    Ok(first_line.split_whitespace().collect())
}
