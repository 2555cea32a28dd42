// SpiderHub 集群同步与调度引擎
// 分布式爬虫平台的包存储、镜像同步与定时调度核心库

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 通用基础设施模块
pub mod common;

// 存储层（包存储 + 记录持久化）
pub mod store;

// 控制面消息总线
pub mod bus;

// 镜像同步模块
pub mod sync;

// 调度器模块
pub mod scheduler;

// 爬虫管理模块
pub mod spider;

// 导出常用类型
pub use bus::{ControlBus, NodeMessage, CHANNEL_ALL_NODES};
pub use config::AppConfig;
pub use error::{Result, SyncError};
pub use scheduler::{SpiderScheduler, SPIDER_SYNC_CRON};
pub use spider::SpiderManager;
pub use store::{BlobStore, RecordStore, Schedule, Spider, Task, TaskStatus};
pub use sync::{MirrorSync, NodeListener, SyncOutcome};
