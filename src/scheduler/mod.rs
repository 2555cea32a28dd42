//! 调度器：内部同步任务与用户定时调度的统一评估

pub mod core;

pub use core::{validate_cron, SpiderScheduler, SPIDER_SYNC_CRON, SPIDER_SYNC_JOB_ID};
