//! 存储层：爬虫包内容寻址存储与记录持久化

pub mod blob;
pub mod model;
pub mod records;

pub use blob::BlobStore;
pub use model::{BlobMeta, DailyStats, Schedule, Spider, SpiderStats, Task, TaskStatus};
pub use records::RecordStore;
