//! 爬虫与调度记录持久化模块
//!
//! 爬虫、调度、执行任务三类记录存 SQLite，调度重建与镜像同步都从这里读取

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SyncError};
use crate::store::model::{DailyStats, Schedule, Spider, SpiderStats, Task, TaskStatus};

/// 记录持久化管理器
pub struct RecordStore {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

/// 任务行（status 需要单独解析）
struct TaskRow {
    id: String,
    spider_id: String,
    schedule_id: Option<String>,
    status: String,
    param: String,
    error: Option<String>,
    result_count: i64,
    wait_duration: f64,
    runtime_duration: f64,
    create_ts: i64,
    finish_ts: Option<i64>,
}

impl RecordStore {
    /// 创建新的记录管理器
    pub fn new(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;

        Ok(store)
    }

    /// 内存数据库（仅测试用）
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            -- ============================================
            -- 表: spiders (爬虫记录表)
            -- 描述: 爬虫的名称、类型与关联包信息
            -- ============================================
            CREATE TABLE IF NOT EXISTS spiders (
                id TEXT PRIMARY KEY,                    -- 爬虫唯一标识 (UUID)
                name TEXT NOT NULL UNIQUE,              -- 爬虫名称（包存储中的逻辑文件名）
                display_name TEXT NOT NULL,             -- 展示名称
                spider_type TEXT NOT NULL,              -- 爬虫类型: customized/configurable
                cmd TEXT NOT NULL,                      -- 执行命令
                file_id TEXT NOT NULL,                  -- 关联的包元数据 ID（未上传时为空串）
                src TEXT NOT NULL,                      -- 本地镜像目录
                created_at INTEGER NOT NULL,            -- 创建时间 (Unix timestamp 秒)
                updated_at INTEGER NOT NULL             -- 更新时间
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            -- ============================================
            -- 表: schedules (定时调度表)
            -- 描述: 用户配置的六段 cron 调度
            -- ============================================
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,                    -- 调度唯一标识 (UUID)
                name TEXT NOT NULL,                     -- 调度名称
                spider_id TEXT NOT NULL,                -- 关联的爬虫 ID
                cron TEXT NOT NULL,                     -- 六段 cron 表达式
                param TEXT NOT NULL,                    -- 执行参数
                enabled INTEGER NOT NULL DEFAULT 1,     -- 是否启用
                created_at INTEGER NOT NULL,            -- 创建时间 (Unix timestamp 秒)
                updated_at INTEGER NOT NULL             -- 更新时间
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_spider ON schedules(spider_id)",
            [],
        )?;

        conn.execute(
            r#"
            -- ============================================
            -- 表: tasks (执行任务表)
            -- 描述: 每次爬虫执行的状态与统计信息
            -- ============================================
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,                    -- 任务唯一标识 (UUID)
                spider_id TEXT NOT NULL,                -- 关联的爬虫 ID
                schedule_id TEXT,                       -- 触发任务的调度 ID（手动触发为 NULL）
                status TEXT NOT NULL,                   -- 任务状态: pending/running/finished/error/cancelled
                param TEXT NOT NULL DEFAULT '',         -- 执行参数
                error TEXT,                             -- 错误信息(失败时记录)
                result_count INTEGER DEFAULT 0,         -- 抓取结果数
                wait_duration REAL DEFAULT 0,           -- 等待时长（秒）
                runtime_duration REAL DEFAULT 0,        -- 运行时长（秒）
                create_ts INTEGER NOT NULL,             -- 创建时间 (Unix timestamp 秒)
                finish_ts INTEGER                       -- 完成时间
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_spider ON tasks(spider_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Other(format!("获取数据库锁失败: {}", e)))
    }

    // ==================== 爬虫记录 ====================

    /// 保存爬虫记录（存在则覆盖）
    pub fn save_spider(&self, spider: &Spider) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO spiders (
                id, name, display_name, spider_type, cmd, file_id, src,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                spider.id,
                spider.name,
                spider.display_name,
                spider.spider_type,
                spider.cmd,
                spider.file_id,
                spider.src,
                spider.created_at.timestamp(),
                spider.updated_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    /// 按 ID 加载爬虫记录
    pub fn get_spider(&self, id: &str) -> Result<Option<Spider>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT id, name, display_name, spider_type, cmd, file_id, src,
                       created_at, updated_at
                FROM spiders WHERE id = ?1
                "#,
                params![id],
                row_to_spider,
            )
            .optional()?;

        Ok(row)
    }

    /// 按名称加载爬虫记录
    pub fn get_spider_by_name(&self, name: &str) -> Result<Option<Spider>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT id, name, display_name, spider_type, cmd, file_id, src,
                       created_at, updated_at
                FROM spiders WHERE name = ?1
                "#,
                params![name],
                row_to_spider,
            )
            .optional()?;

        Ok(row)
    }

    /// 列出全部爬虫记录
    pub fn list_spiders(&self) -> Result<Vec<Spider>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, display_name, spider_type, cmd, file_id, src,
                   created_at, updated_at
            FROM spiders ORDER BY name
            "#,
        )?;
        let rows = stmt.query_map([], row_to_spider)?;

        let mut spiders = Vec::new();
        for row in rows {
            spiders.push(row?);
        }
        Ok(spiders)
    }

    /// 删除爬虫记录（幂等）
    pub fn remove_spider(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM spiders WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ==================== 调度记录 ====================

    /// 保存调度记录（存在则覆盖）
    pub fn save_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO schedules (
                id, name, spider_id, cron, param, enabled, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                schedule.id,
                schedule.name,
                schedule.spider_id,
                schedule.cron,
                schedule.param,
                schedule.enabled,
                schedule.created_at.timestamp(),
                schedule.updated_at.timestamp(),
            ],
        )?;

        Ok(())
    }

    /// 按 ID 加载调度记录
    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT id, name, spider_id, cron, param, enabled, created_at, updated_at
                FROM schedules WHERE id = ?1
                "#,
                params![id],
                row_to_schedule,
            )
            .optional()?;

        Ok(row)
    }

    /// 列出全部调度记录
    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, spider_id, cron, param, enabled, created_at, updated_at
            FROM schedules ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map([], row_to_schedule)?;

        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row?);
        }
        Ok(schedules)
    }

    /// 列出启用的调度记录（调度器重建用）
    pub fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, spider_id, cron, param, enabled, created_at, updated_at
            FROM schedules WHERE enabled = 1 ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map([], row_to_schedule)?;

        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row?);
        }
        Ok(schedules)
    }

    /// 列出某个爬虫下的全部调度
    pub fn list_schedules_for_spider(&self, spider_id: &str) -> Result<Vec<Schedule>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, spider_id, cron, param, enabled, created_at, updated_at
            FROM schedules WHERE spider_id = ?1 ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map(params![spider_id], row_to_schedule)?;

        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row?);
        }
        Ok(schedules)
    }

    /// 删除调度记录（幂等）
    pub fn remove_schedule(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// 删除某个爬虫下的全部调度，返回删除条数
    pub fn remove_schedules_for_spider(&self, spider_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let n = conn.execute(
            "DELETE FROM schedules WHERE spider_id = ?1",
            params![spider_id],
        )?;
        Ok(n)
    }

    // ==================== 任务记录 ====================

    /// 保存任务记录（存在则覆盖）
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn()?;

        let status = format!("{:?}", task.status).to_lowercase();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO tasks (
                id, spider_id, schedule_id, status, param, error,
                result_count, wait_duration, runtime_duration,
                create_ts, finish_ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                task.id,
                task.spider_id,
                task.schedule_id,
                status,
                task.param,
                task.error,
                task.result_count,
                task.wait_duration,
                task.runtime_duration,
                task.create_ts.timestamp(),
                task.finish_ts.map(|t| t.timestamp()),
            ],
        )?;

        Ok(())
    }

    /// 按 ID 加载任务记录
    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r#"
                SELECT id, spider_id, schedule_id, status, param, error,
                       result_count, wait_duration, runtime_duration,
                       create_ts, finish_ts
                FROM tasks WHERE id = ?1
                "#,
                params![id],
                row_to_task_row,
            )
            .optional()?;

        match result {
            Some(row) => Ok(Some(task_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// 更新任务状态
    pub fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;

        let status_str = format!("{:?}", status).to_lowercase();
        conn.execute(
            "UPDATE tasks SET status = ?1, error = ?2 WHERE id = ?3",
            params![status_str, error, task_id],
        )?;

        Ok(())
    }

    /// 列出某个爬虫最近的任务
    pub fn list_tasks_for_spider(&self, spider_id: &str, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, spider_id, schedule_id, status, param, error,
                   result_count, wait_duration, runtime_duration,
                   create_ts, finish_ts
            FROM tasks WHERE spider_id = ?1
            ORDER BY create_ts DESC LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![spider_id, limit as i64], row_to_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(task_from_row(row?)?);
        }
        Ok(tasks)
    }

    /// 删除某个爬虫下的全部任务记录，返回删除条数
    pub fn remove_tasks_for_spider(&self, spider_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let n = conn.execute("DELETE FROM tasks WHERE spider_id = ?1", params![spider_id])?;
        Ok(n)
    }

    /// 统计某个爬虫自指定时间以来的执行概览
    ///
    /// 窗口内没有任何任务时各项为 0，成功率为 0.0。
    pub fn spider_stats(&self, spider_id: &str, since: DateTime<Utc>) -> Result<SpiderStats> {
        let conn = self.lock_conn()?;

        let (task_count, success_count, avg_wait, avg_runtime, result_count) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   IFNULL(SUM(CASE WHEN status = 'finished' THEN 1 ELSE 0 END), 0),
                   IFNULL(AVG(wait_duration), 0.0),
                   IFNULL(AVG(runtime_duration), 0.0),
                   IFNULL(SUM(result_count), 0)
            FROM tasks
            WHERE spider_id = ?1 AND create_ts >= ?2
            "#,
            params![spider_id, since.timestamp()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;

        // 任务数为 0 时成功率直接取 0，避免除零
        let success_rate = if task_count > 0 {
            success_count as f64 / task_count as f64
        } else {
            0.0
        };

        Ok(SpiderStats {
            task_count,
            success_count,
            success_rate,
            avg_wait_duration: avg_wait,
            avg_runtime_duration: avg_runtime,
            result_count,
        })
    }

    /// 按天聚合某个爬虫自指定时间以来的执行情况（按日期升序）
    pub fn daily_task_stats(
        &self,
        spider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DailyStats>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT strftime('%Y-%m-%d', create_ts, 'unixepoch') AS day,
                   COUNT(*),
                   IFNULL(SUM(CASE WHEN status = 'finished' THEN 1 ELSE 0 END), 0),
                   IFNULL(AVG(runtime_duration), 0.0)
            FROM tasks
            WHERE spider_id = ?1 AND create_ts >= ?2
            GROUP BY day ORDER BY day
            "#,
        )?;
        let rows = stmt.query_map(params![spider_id, since.timestamp()], |row| {
            Ok(DailyStats {
                date: row.get(0)?,
                task_count: row.get(1)?,
                success_count: row.get(2)?,
                avg_runtime_duration: row.get(3)?,
            })
        })?;

        let mut days = Vec::new();
        for row in rows {
            days.push(row?);
        }
        Ok(days)
    }
}

// ==================== 行转换 ====================

fn row_to_spider(row: &rusqlite::Row<'_>) -> rusqlite::Result<Spider> {
    let created_at: i64 = row.get(7)?;
    let updated_at: i64 = row.get(8)?;

    Ok(Spider {
        id: row.get(0)?,
        name: row.get(1)?,
        display_name: row.get(2)?,
        spider_type: row.get(3)?,
        cmd: row.get(4)?,
        file_id: row.get(5)?,
        src: row.get(6)?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let created_at: i64 = row.get(6)?;
    let updated_at: i64 = row.get(7)?;

    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        spider_id: row.get(2)?,
        cron: row.get(3)?,
        param: row.get(4)?,
        enabled: row.get(5)?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

fn row_to_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        spider_id: row.get(1)?,
        schedule_id: row.get(2)?,
        status: row.get(3)?,
        param: row.get(4)?,
        error: row.get(5)?,
        result_count: row.get(6)?,
        wait_duration: row.get(7)?,
        runtime_duration: row.get(8)?,
        create_ts: row.get(9)?,
        finish_ts: row.get(10)?,
    })
}

fn task_from_row(row: TaskRow) -> Result<Task> {
    let status = parse_task_status(&row.status)?;

    Ok(Task {
        id: row.id,
        spider_id: row.spider_id,
        schedule_id: row.schedule_id,
        status,
        param: row.param,
        error: row.error,
        result_count: row.result_count,
        wait_duration: row.wait_duration,
        runtime_duration: row.runtime_duration,
        create_ts: chrono::DateTime::from_timestamp(row.create_ts, 0).unwrap_or_else(Utc::now),
        finish_ts: row.finish_ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
    })
}

fn parse_task_status(s: &str) -> Result<TaskStatus> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "finished" => Ok(TaskStatus::Finished),
        "error" => Ok(TaskStatus::Error),
        "cancelled" => Ok(TaskStatus::Cancelled),
        _ => Err(SyncError::Other(format!("未知的任务状态: {}", s))),
    }
}
