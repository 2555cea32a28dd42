//! 同步引擎错误处理模块
//!
//! 提供统一的错误类型和错误分类，区分校验错误、瞬时 I/O 错误、
//! 一致性异常与致命错误

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// cron 表达式无效
    #[error("无效的 cron 表达式 \"{expr}\": {reason}")]
    InvalidCron { expr: String, reason: String },

    /// 上传的爬虫包无效
    #[error("无效的爬虫包: {0}")]
    InvalidPackage(String),

    /// 爬虫包不存在
    #[error("爬虫包不存在: {0}")]
    BlobNotFound(String),

    /// 记录不存在
    #[error("记录不存在: {0}")]
    RecordNotFound(String),

    /// 爬虫记录引用的包已丢失（孤儿记录）
    #[error("爬虫 {spider} 引用的包 {file_id} 已丢失")]
    OrphanedRecord { spider: String, file_id: String },

    /// 调度器已在运行
    #[error("调度器已在运行")]
    SchedulerRunning,

    /// 同步超时
    #[error("爬虫 {0} 同步超时")]
    SyncTimeout(String),

    /// 消息编解码失败
    #[error("消息编解码失败: {0}")]
    Codec(#[from] serde_json::Error),

    /// 文件系统错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 其他错误
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// 获取错误分类
    pub fn category(&self) -> ErrorCategory {
        classify_error(self)
    }

    /// 是否为瞬时错误（下一轮巡检会重新尝试）
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// 错误分类
///
/// - 校验错误在管理入口同步拒绝，不触及任何持久化或调度状态
/// - 瞬时错误记录日志后跳过本轮，由下一轮巡检自愈
/// - 一致性异常通过删除孤儿记录自动纠正
/// - 致命错误只在启动阶段出现，向上传播导致进程启动失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 校验错误
    Validation,
    /// 瞬时错误
    Transient,
    /// 一致性异常
    Consistency,
    /// 致命错误
    Fatal,
}

/// 错误分类函数
pub fn classify_error(error: &SyncError) -> ErrorCategory {
    match error {
        SyncError::InvalidCron { .. } => ErrorCategory::Validation,
        SyncError::InvalidPackage(_) => ErrorCategory::Validation,
        SyncError::BlobNotFound(_) => ErrorCategory::Consistency,
        SyncError::OrphanedRecord { .. } => ErrorCategory::Consistency,
        SyncError::RecordNotFound(_) => ErrorCategory::Validation,
        SyncError::SchedulerRunning => ErrorCategory::Fatal,
        SyncError::SyncTimeout(_) => ErrorCategory::Transient,
        SyncError::Codec(_) => ErrorCategory::Transient,
        SyncError::Io(_) => ErrorCategory::Transient,
        SyncError::Database(_) => ErrorCategory::Transient,
        SyncError::Other(_) => ErrorCategory::Transient,
    }
}

/// 同步引擎统一结果类型
pub type Result<T> = std::result::Result<T, SyncError>;
