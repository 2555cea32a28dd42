//! 爬虫调度器
//!
//! 维护一份不可变的任务快照（内部同步任务 + 用户调度任务），每秒评估一次：
//! - 到期任务并发触发，互不等待
//! - 上一轮还在执行的任务本次触发直接跳过，不排队补跑
//! - 重建（rebuild）构造全新快照后整体原子替换，评估循环要么看到旧表要么看到新表
//!
//! 用户调度到期时生成一条待执行任务记录；内部任务到期时做一轮全量镜像同步。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::store::model::{Schedule, Task};
use crate::store::RecordStore;
use crate::sync::MirrorSync;

/// 内部全量同步任务的 cron（每分钟第 0 秒触发）
pub const SPIDER_SYNC_CRON: &str = "0 * * * * *";

/// 内部全量同步任务的固定键
pub const SPIDER_SYNC_JOB_ID: &str = "internal:spider-sync";

/// 评估间隔
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// 任务动作：返回可等待的执行过程
type JobAction = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// 一个已装配的调度任务
struct JobEntry {
    /// 任务键（内部任务用固定键，用户任务用调度记录 ID）
    id: String,
    /// 任务名称（日志用）
    name: String,
    /// 原始 cron 表达式
    cron_expr: String,
    /// 解析后的 cron
    schedule: CronSchedule,
    /// 下一次触发时间（None 表示永不触发）
    next_run: Mutex<Option<DateTime<Utc>>>,
    /// 是否正在执行（重建时随 (id, cron) 不变的任务一起保留）
    running: Arc<AtomicBool>,
    /// 到期执行的动作
    action: JobAction,
}

/// 爬虫调度器
pub struct SpiderScheduler {
    /// 记录存储
    records: Arc<RecordStore>,
    /// 镜像同步器（内部任务使用）
    mirror: Arc<MirrorSync>,
    /// 当前任务快照，重建时整体替换
    jobs: RwLock<Arc<Vec<Arc<JobEntry>>>>,
    /// 停止信号
    cancel: CancellationToken,
    /// 评估循环是否已启动
    started: AtomicBool,
}

impl SpiderScheduler {
    /// 创建调度器
    pub fn new(records: Arc<RecordStore>, mirror: Arc<MirrorSync>) -> Self {
        Self {
            records,
            mirror,
            jobs: RwLock::new(Arc::new(Vec::new())),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    // ==================== 生命周期 ====================

    /// 启动评估循环
    ///
    /// 启动前先做一次重建，把持久化的调度投影成任务快照。
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::SchedulerRunning);
        }

        self.rebuild()?;

        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();

        Ok(tokio::spawn(async move {
            info!("调度器启动，每 {:?} 评估一次", TICK_INTERVAL);
            let mut interval = tokio::time::interval(TICK_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("调度器停止");
                        break;
                    }
                    _ = interval.tick() => {
                        let snapshot = { scheduler.jobs.read().clone() };
                        evaluate_tick(&snapshot, Utc::now());
                    }
                }
            }
        }))
    }

    /// 发出停止信号
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ==================== 调度管理 ====================

    /// 新增或更新调度
    ///
    /// cron 校验不通过时不落库、不改动任务快照。
    pub fn add_or_update(&self, schedule: &Schedule) -> Result<()> {
        validate_cron(&schedule.cron)?;
        self.records.save_schedule(schedule)?;
        self.rebuild()
    }

    /// 删除调度（幂等）
    pub fn remove(&self, schedule_id: &str) -> Result<()> {
        self.records.remove_schedule(schedule_id)?;
        self.rebuild()
    }

    /// 删除某个爬虫的全部调度，返回删除条数
    pub fn remove_for_spider(&self, spider_id: &str) -> Result<usize> {
        let removed = self.records.remove_schedules_for_spider(spider_id)?;
        if removed > 0 {
            self.rebuild()?;
        }
        Ok(removed)
    }

    /// 从持久化记录重建任务快照
    ///
    /// (id, cron) 都没变的任务保留原有的执行标志与触发相位；
    /// 快照构造完成后一次性替换，评估循环不会看到半新半旧的任务表。
    pub fn rebuild(&self) -> Result<()> {
        let schedules = self.records.list_enabled_schedules()?;

        let old_snapshot = { self.jobs.read().clone() };
        let old_by_key: HashMap<(&str, &str), &Arc<JobEntry>> = old_snapshot
            .iter()
            .map(|job| ((job.id.as_str(), job.cron_expr.as_str()), job))
            .collect();

        let mut jobs: Vec<Arc<JobEntry>> = Vec::with_capacity(schedules.len() + 1);

        // 内部全量同步任务始终在快照里
        let internal_old = old_by_key
            .get(&(SPIDER_SYNC_JOB_ID, SPIDER_SYNC_CRON))
            .copied();
        jobs.push(build_entry(
            SPIDER_SYNC_JOB_ID,
            "spider_sync",
            SPIDER_SYNC_CRON,
            internal_sync_action(Arc::clone(&self.mirror)),
            internal_old,
        )?);

        for schedule in &schedules {
            let old = old_by_key
                .get(&(schedule.id.as_str(), schedule.cron.as_str()))
                .copied();
            let action = user_schedule_action(Arc::clone(&self.records), schedule);
            match build_entry(&schedule.id, &schedule.name, &schedule.cron, action, old) {
                Ok(entry) => jobs.push(entry),
                // 落库前都校验过，走到这里说明库里有脏数据
                Err(e) => error!("调度 {} 的 cron 表达式无效，跳过: {}", schedule.id, e),
            }
        }

        let count = jobs.len();
        *self.jobs.write() = Arc::new(jobs);
        debug!("调度快照已重建: {} 个任务（含内部同步任务）", count);

        Ok(())
    }

    // ==================== 快照检视 ====================

    /// 当前快照中的任务数量（含内部同步任务）
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// 当前快照中的任务键
    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().iter().map(|job| job.id.clone()).collect()
    }
}

// ==================== cron 校验 ====================

/// 校验六段 cron 表达式（秒 分 时 日 月 周）
pub fn validate_cron(expr: &str) -> Result<CronSchedule> {
    let fields = expr.split_whitespace().count();
    if fields != 6 {
        return Err(SyncError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("需要六段(秒 分 时 日 月 周)，实际 {} 段", fields),
        });
    }

    CronSchedule::from_str(expr).map_err(|e| SyncError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

// ==================== 任务装配 ====================

fn build_entry(
    id: &str,
    name: &str,
    cron_expr: &str,
    action: JobAction,
    old: Option<&Arc<JobEntry>>,
) -> Result<Arc<JobEntry>> {
    let schedule = validate_cron(cron_expr)?;

    let (next_run, running) = match old {
        Some(prev) => (*prev.next_run.lock(), Arc::clone(&prev.running)),
        None => (
            schedule.upcoming(Utc).next(),
            Arc::new(AtomicBool::new(false)),
        ),
    };

    Ok(Arc::new(JobEntry {
        id: id.to_string(),
        name: name.to_string(),
        cron_expr: cron_expr.to_string(),
        schedule,
        next_run: Mutex::new(next_run),
        running,
        action,
    }))
}

/// 内部任务：一轮全量镜像同步
fn internal_sync_action(mirror: Arc<MirrorSync>) -> JobAction {
    Arc::new(move || {
        let mirror = Arc::clone(&mirror);
        Box::pin(async move {
            mirror.sync_all().await;
        })
    })
}

/// 用户任务：生成一条待执行任务记录
fn user_schedule_action(records: Arc<RecordStore>, schedule: &Schedule) -> JobAction {
    let spider_id = schedule.spider_id.clone();
    let schedule_id = schedule.id.clone();
    let param = schedule.param.clone();

    Arc::new(move || {
        let records = Arc::clone(&records);
        let spider_id = spider_id.clone();
        let schedule_id = schedule_id.clone();
        let param = param.clone();

        Box::pin(async move {
            match records.get_spider(&spider_id) {
                Ok(Some(spider)) => {
                    let mut task = Task::new(&spider.id, Some(&schedule_id));
                    task.param = param;
                    match records.save_task(&task) {
                        Ok(()) => {
                            info!("调度触发爬虫 {} 的执行任务: {}", spider.name, task.id)
                        }
                        Err(e) => error!("创建调度任务记录失败: {}", e),
                    }
                }
                Ok(None) => {
                    warn!("调度 {} 关联的爬虫 {} 不存在，本次触发跳过", schedule_id, spider_id)
                }
                Err(e) => error!("读取爬虫记录失败: {}", e),
            }
        })
    })
}

// ==================== 评估 ====================

/// 评估一次快照：触发所有到期任务，返回实际触发的数量
///
/// 到期但上一轮仍在执行的任务只推进下一次触发时间，不补跑。
fn evaluate_tick(jobs: &[Arc<JobEntry>], now: DateTime<Utc>) -> usize {
    let mut fired = 0;

    for job in jobs {
        let due = {
            let mut next_run = job.next_run.lock();
            match *next_run {
                Some(at) if now >= at => {
                    // 先推进触发时间，本次无论执行还是跳过都不会重复到期
                    *next_run = job.schedule.after(&now).next();
                    true
                }
                _ => false,
            }
        };
        if !due {
            continue;
        }

        match job
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                fired += 1;
                debug!("触发调度任务: {}", job.name);

                let action = Arc::clone(&job.action);
                let running = Arc::clone(&job.running);
                tokio::spawn(async move {
                    action().await;
                    running.store(false, Ordering::SeqCst);
                });
            }
            Err(_) => {
                info!("调度任务 {} 上一轮仍在执行，本次触发跳过", job.name);
            }
        }
    }

    fired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, StorageConfig, SyncConfig};
    use crate::store::BlobStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        blob_store: Arc<BlobStore>,
        records: Arc<RecordStore>,
        mirror: Arc<MirrorSync>,
        scheduler: Arc<SpiderScheduler>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let blob_store = Arc::new(BlobStore::new(&dir.path().join("blobs")).unwrap());
        let records = Arc::new(RecordStore::new_in_memory().unwrap());

        let config = AppConfig {
            storage: StorageConfig {
                spider_dir: dir.path().join("spiders"),
                ..Default::default()
            },
            sync: SyncConfig {
                max_concurrent: 2,
                sync_timeout_secs: 30,
            },
            ..Default::default()
        };
        let mirror = Arc::new(MirrorSync::new(
            Arc::clone(&blob_store),
            Arc::clone(&records),
            &config,
        ));
        let scheduler = Arc::new(SpiderScheduler::new(
            Arc::clone(&records),
            Arc::clone(&mirror),
        ));

        Fixture {
            _dir: dir,
            blob_store,
            records,
            mirror,
            scheduler,
        }
    }

    /// 造一个到期时间可控的测试任务
    fn test_entry(id: &str, next_run: Option<DateTime<Utc>>, counter: Arc<AtomicUsize>) -> Arc<JobEntry> {
        let action: JobAction = Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let entry = build_entry(id, id, "0 * * * * *", action, None).unwrap();
        *entry.next_run.lock() = next_run;
        entry
    }

    #[test]
    fn test_validate_cron_six_fields() {
        assert!(validate_cron("0 */5 * * * *").is_ok());
        assert!(validate_cron("0 * * * * *").is_ok());
        assert!(validate_cron("* * * * * *").is_ok());

        // 段数不对
        assert!(matches!(
            validate_cron("99 * * *"),
            Err(SyncError::InvalidCron { .. })
        ));
        assert!(matches!(
            validate_cron("* * * * *"),
            Err(SyncError::InvalidCron { .. })
        ));
        assert!(matches!(
            validate_cron("0 0 0 * * * 2030"),
            Err(SyncError::InvalidCron { .. })
        ));

        // 段数对但取值非法
        assert!(matches!(
            validate_cron("99 * * * * *"),
            Err(SyncError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_add_rejects_invalid_cron_without_persisting() {
        let fx = fixture();

        let schedule = Schedule::new("bad", "spider-1", "99 * * *");
        let err = fx.scheduler.add_or_update(&schedule).unwrap_err();
        assert!(matches!(err, SyncError::InvalidCron { .. }));

        // 校验失败的调度不落库
        assert!(fx.records.get_schedule(&schedule.id).unwrap().is_none());
    }

    #[test]
    fn test_add_and_remove_rebuild_snapshot() {
        let fx = fixture();

        let schedule = Schedule::new("five_min", "spider-1", "0 */5 * * * *");
        fx.scheduler.add_or_update(&schedule).unwrap();

        let ids = fx.scheduler.job_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&SPIDER_SYNC_JOB_ID.to_string()));
        assert!(ids.contains(&schedule.id));

        fx.scheduler.remove(&schedule.id).unwrap();
        assert_eq!(fx.scheduler.job_ids(), vec![SPIDER_SYNC_JOB_ID.to_string()]);

        // 重复删除是无害的
        fx.scheduler.remove(&schedule.id).unwrap();
    }

    #[test]
    fn test_rebuild_projects_only_enabled_schedules() {
        let fx = fixture();

        let enabled = Schedule::new("on", "spider-1", "0 0 * * * *");
        let mut disabled = Schedule::new("off", "spider-1", "0 30 * * * *");
        disabled.enabled = false;
        fx.records.save_schedule(&enabled).unwrap();
        fx.records.save_schedule(&disabled).unwrap();

        fx.scheduler.rebuild().unwrap();

        let ids = fx.scheduler.job_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&enabled.id));
        assert!(!ids.contains(&disabled.id));
    }

    #[test]
    fn test_rebuild_carries_running_flag_for_unchanged_jobs() {
        let fx = fixture();

        let schedule = Schedule::new("hourly", "spider-1", "0 0 * * * *");
        fx.scheduler.add_or_update(&schedule).unwrap();

        // 模拟任务执行中
        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == schedule.id).unwrap();
        entry.running.store(true, Ordering::SeqCst);
        let phase = *entry.next_run.lock();

        // cron 不变的重建保留执行标志与触发相位
        fx.scheduler.rebuild().unwrap();
        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == schedule.id).unwrap();
        assert!(entry.running.load(Ordering::SeqCst));
        assert_eq!(*entry.next_run.lock(), phase);

        // cron 变了则是全新任务
        let mut changed = schedule.clone();
        changed.cron = "30 0 * * * *".to_string();
        fx.scheduler.add_or_update(&changed).unwrap();
        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == schedule.id).unwrap();
        assert!(!entry.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_evaluate_fires_due_jobs_and_advances_next_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let past = Utc::now() - ChronoDuration::seconds(5);
        let entry = test_entry("due", Some(past), Arc::clone(&counter));
        let future_entry = test_entry(
            "not_due",
            Some(Utc::now() + ChronoDuration::hours(1)),
            Arc::clone(&counter),
        );
        let never = test_entry("never", None, Arc::clone(&counter));

        let fired = evaluate_tick(
            &[Arc::clone(&entry), future_entry, never],
            Utc::now(),
        );
        assert_eq!(fired, 1);

        // 触发时间已推进到未来
        let next = (*entry.next_run.lock()).unwrap();
        assert!(next > Utc::now());

        // 动作在后台执行
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped_not_queued() {
        let counter = Arc::new(AtomicUsize::new(0));
        let past = Utc::now() - ChronoDuration::seconds(5);
        let entry = test_entry("busy", Some(past), Arc::clone(&counter));

        // 上一轮还在执行
        entry.running.store(true, Ordering::SeqCst);

        let fired = evaluate_tick(&[Arc::clone(&entry)], Utc::now());
        assert_eq!(fired, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // 跳过的触发不排队：时间照常推进，之后也不会补跑
        let next = (*entry.next_run.lock()).unwrap();
        assert!(next > Utc::now());
        let fired = evaluate_tick(&[Arc::clone(&entry)], Utc::now());
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn test_due_jobs_fire_concurrently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let past = Utc::now() - ChronoDuration::seconds(5);
        let a = test_entry("a", Some(past), Arc::clone(&counter));
        let b = test_entry("b", Some(past), Arc::clone(&counter));

        let fired = evaluate_tick(&[a, b], Utc::now());
        assert_eq!(fired, 2);

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_user_schedule_creates_task_record() {
        let fx = fixture();

        let spider = crate::store::model::Spider::new("news_crawler", "customized", "");
        fx.records.save_spider(&spider).unwrap();
        let mut schedule = Schedule::new("every_sec", &spider.id, "* * * * * *");
        schedule.param = "--depth 3".to_string();
        fx.scheduler.add_or_update(&schedule).unwrap();

        // 手动把用户任务拨到期再评估一次
        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == schedule.id).unwrap();
        *entry.next_run.lock() = Some(Utc::now() - ChronoDuration::seconds(1));
        evaluate_tick(&snapshot, Utc::now());

        let mut tasks = Vec::new();
        for _ in 0..100 {
            tasks = fx.records.list_tasks_for_spider(&spider.id, 10).unwrap();
            if !tasks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].schedule_id.as_deref(), Some(schedule.id.as_str()));
        assert_eq!(tasks[0].param, "--depth 3");
    }

    #[tokio::test]
    async fn test_schedule_for_missing_spider_creates_nothing() {
        let fx = fixture();

        let schedule = Schedule::new("ghost", "no-such-spider", "* * * * * *");
        fx.scheduler.add_or_update(&schedule).unwrap();

        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == schedule.id).unwrap();
        *entry.next_run.lock() = Some(Utc::now() - ChronoDuration::seconds(1));
        let fired = evaluate_tick(&snapshot, Utc::now());
        assert_eq!(fired, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let tasks = fx.records.list_tasks_for_spider("no-such-spider", 10).unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_internal_job_syncs_mirrors() {
        let fx = fixture();

        let meta = fx.blob_store.put("news_crawler.zip", b"package").unwrap();
        let mut spider = crate::store::model::Spider::new("news_crawler", "customized", "");
        spider.file_id = meta.id;
        fx.records.save_spider(&spider).unwrap();

        fx.scheduler.rebuild().unwrap();

        // 把内部同步任务拨到期
        let snapshot = { fx.scheduler.jobs.read().clone() };
        let entry = snapshot.iter().find(|j| j.id == SPIDER_SYNC_JOB_ID).unwrap();
        *entry.next_run.lock() = Some(Utc::now() - ChronoDuration::seconds(1));
        let fired = evaluate_tick(&snapshot, Utc::now());
        assert_eq!(fired, 1);

        let dir = fx.mirror.mirror_dir("news_crawler");
        let mut synced = false;
        for _ in 0..200 {
            if dir.join(crate::sync::MD5_FILE).exists() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fx = fixture();

        let handle = fx.scheduler.start().unwrap();
        let err = fx.scheduler.start().unwrap_err();
        assert!(matches!(err, SyncError::SchedulerRunning));

        fx.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_running_loop_fires_every_second_schedule() {
        let fx = fixture();

        let spider = crate::store::model::Spider::new("news_crawler", "customized", "");
        fx.records.save_spider(&spider).unwrap();
        let schedule = Schedule::new("every_sec", &spider.id, "* * * * * *");
        fx.scheduler.add_or_update(&schedule).unwrap();

        let handle = fx.scheduler.start().unwrap();

        // 每秒触发的调度在几秒内必然产生任务记录
        let mut tasks = Vec::new();
        for _ in 0..50 {
            tasks = fx.records.list_tasks_for_spider(&spider.id, 10).unwrap();
            if !tasks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!tasks.is_empty());

        fx.scheduler.shutdown();
        handle.await.unwrap();
    }
}
