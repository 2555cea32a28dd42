//! 爬虫平台数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待调度
    Pending,
    /// 执行中
    Running,
    /// 已完成
    Finished,
    /// 执行出错
    Error,
    /// 已取消
    Cancelled,
}

/// 爬虫包元数据（内容寻址存储中的一条记录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    /// 包唯一标识 (UUID)
    pub id: String,
    /// 逻辑文件名（按名称覆盖写入的键）
    pub file_name: String,
    /// 内容 MD5 校验和（十六进制小写）
    pub md5: String,
    /// 内容字节数
    pub size: u64,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最近一次覆盖写入时间
    pub updated_at: DateTime<Utc>,
}

/// 爬虫记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spider {
    /// 爬虫唯一标识 (UUID)
    pub id: String,
    /// 爬虫名称（也是包存储中的逻辑文件名，不含扩展名）
    pub name: String,
    /// 展示名称
    pub display_name: String,
    /// 爬虫类型（如 customized / configurable）
    pub spider_type: String,
    /// 执行命令
    pub cmd: String,
    /// 关联的包元数据 ID（爬虫尚未上传包时为空）
    pub file_id: String,
    /// 本地镜像目录
    pub src: String,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl Spider {
    /// 创建新的爬虫记录
    pub fn new(name: &str, spider_type: &str, src: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            display_name: name.to_string(),
            spider_type: spider_type.to_string(),
            cmd: String::new(),
            file_id: String::new(),
            src: src.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 爬虫是否已关联上传包
    pub fn has_package(&self) -> bool {
        !self.file_id.is_empty()
    }
}

/// 定时调度记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// 调度唯一标识 (UUID)
    pub id: String,
    /// 调度名称
    pub name: String,
    /// 关联的爬虫 ID
    pub spider_id: String,
    /// 六段 cron 表达式（秒 分 时 日 月 周）
    pub cron: String,
    /// 执行参数
    pub param: String,
    /// 是否启用
    pub enabled: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// 创建新的调度记录
    pub fn new(name: &str, spider_id: &str, cron: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            spider_id: spider_id.to_string(),
            cron: cron.to_string(),
            param: String::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 执行任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务唯一标识 (UUID)
    pub id: String,
    /// 关联的爬虫 ID
    pub spider_id: String,
    /// 触发该任务的调度 ID（手动触发时为空）
    pub schedule_id: Option<String>,
    /// 任务状态
    pub status: TaskStatus,
    /// 执行参数（来自调度记录或手动触发时指定）
    pub param: String,
    /// 错误信息（失败时记录）
    pub error: Option<String>,
    /// 抓取结果数
    pub result_count: i64,
    /// 等待时长（秒）
    pub wait_duration: f64,
    /// 运行时长（秒）
    pub runtime_duration: f64,
    /// 创建时间
    pub create_ts: DateTime<Utc>,
    /// 完成时间
    pub finish_ts: Option<DateTime<Utc>>,
}

impl Task {
    /// 创建新的待执行任务
    pub fn new(spider_id: &str, schedule_id: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spider_id: spider_id.to_string(),
            schedule_id: schedule_id.map(|s| s.to_string()),
            status: TaskStatus::Pending,
            param: String::new(),
            error: None,
            result_count: 0,
            wait_duration: 0.0,
            runtime_duration: 0.0,
            create_ts: Utc::now(),
            finish_ts: None,
        }
    }
}

/// 爬虫执行统计概览
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderStats {
    /// 统计窗口内的任务总数
    pub task_count: i64,
    /// 成功任务数
    pub success_count: i64,
    /// 成功率（任务数为 0 时为 0.0）
    pub success_rate: f64,
    /// 平均等待时长（秒）
    pub avg_wait_duration: f64,
    /// 平均运行时长（秒）
    pub avg_runtime_duration: f64,
    /// 结果总数
    pub result_count: i64,
}

/// 爬虫按天聚合的执行统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    /// 日期（YYYY-MM-DD）
    pub date: String,
    /// 当日任务数
    pub task_count: i64,
    /// 当日成功任务数
    pub success_count: i64,
    /// 当日平均运行时长（秒）
    pub avg_runtime_duration: f64,
}
