//! 通用基础设施模块

pub mod temp_file;

pub use temp_file::{TempFileGuard, TempStaging};
