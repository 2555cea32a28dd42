//! 镜像同步：包存储到本地目录的收敛，以及控制消息处理

pub mod listener;
pub mod mirror;

pub use listener::NodeListener;
pub use mirror::{MirrorSync, SweepReport, SyncOutcome, MD5_FILE};
