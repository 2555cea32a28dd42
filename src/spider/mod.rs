//! 爬虫管理入口

pub mod manager;

pub use manager::{SpiderManager, STATS_WINDOW_DAYS};
