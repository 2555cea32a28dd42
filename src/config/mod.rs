// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use uuid::Uuid;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 节点配置
    pub node: NodeConfig,
    /// 存储配置
    pub storage: StorageConfig,
    /// 同步配置
    pub sync: SyncConfig,
    /// 消息总线配置
    pub bus: BusConfig,
}

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 节点标识（首次启动时生成并写回配置文件）
    #[serde(default = "default_node_id")]
    pub id: String,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 数据根目录（记录数据库和爬虫包存放于此）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 爬虫镜像根目录（每个爬虫一个子目录）
    #[serde(default = "default_spider_dir")]
    pub spider_dir: PathBuf,
    /// 上传暂存目录
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 单轮巡检的最大并发同步数
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 单个爬虫同步的超时时间（秒）
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

/// 消息总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 每个频道的广播缓冲区容量
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_node_id() -> String {
    format!("node-{}", Uuid::new_v4().simple())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_spider_dir() -> PathBuf {
    PathBuf::from("data/spiders")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("data/tmp")
}

fn default_max_concurrent() -> usize {
    8
}

fn default_sync_timeout() -> u64 {
    300
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            spider_dir: default_spider_dir(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            sync_timeout_secs: default_sync_timeout(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 加载失败时使用默认配置并写回文件，保证节点标识在重启后保持稳定
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.node.id.starts_with("node-"));
        assert_eq!(config.sync.max_concurrent, 8);
        assert_eq!(config.bus.capacity, 1024);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let config = AppConfig::default();
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.node.id, config.node.id);
        assert_eq!(loaded.storage.spider_dir, config.storage.spider_dir);
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        tokio::fs::write(path, "[sync]\nmax_concurrent = 2\n")
            .await
            .unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.sync.max_concurrent, 2);
        assert_eq!(loaded.sync.sync_timeout_secs, 300);
        assert_eq!(loaded.storage.data_dir, PathBuf::from("data"));
    }
}
