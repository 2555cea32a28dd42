//! 临时文件管理
//!
//! 上传暂存文件与包存储写入过程中的中间文件都通过 RAII 守卫管理：
//! 守卫被丢弃时自动删除文件，除非已显式持久化（重命名进入正式存储）

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// 临时文件守卫
///
/// 守卫被丢弃时自动删除对应文件，无论当时的调用路径是成功还是出错。
pub struct TempFileGuard {
    /// 临时文件路径
    path: PathBuf,
    /// 是否已被持久化（如果是，则不删除）
    persisted: AtomicBool,
}

impl TempFileGuard {
    /// 创建新的临时文件守卫
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: AtomicBool::new(false),
        }
    }

    /// 获取文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 标记文件已持久化（不会被自动删除）
    pub fn persist(&self) {
        self.persisted.store(true, Ordering::SeqCst);
    }

    /// 检查文件是否已持久化
    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    /// 检查文件是否存在
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 手动删除文件
    pub fn remove(&self) -> std::io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// 重命名/移动文件（同时标记为持久化）
    pub fn rename_to(&self, new_path: &Path) -> std::io::Result<()> {
        std::fs::rename(&self.path, new_path)?;
        self.persist();
        Ok(())
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.is_persisted() {
            if let Err(e) = self.remove() {
                tracing::warn!("清理临时文件失败: {} - {}", self.path.display(), e);
            }
        }
    }
}

impl std::fmt::Debug for TempFileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFileGuard")
            .field("path", &self.path)
            .field("persisted", &self.is_persisted())
            .finish()
    }
}

/// 上传暂存目录管理器
///
/// 上传的爬虫包先落到暂存目录（uuid 命名），入库完成后由守卫删除；
/// 进程异常退出遗留的暂存文件由 `cleanup_old` 兜底清理。
pub struct TempStaging {
    /// 暂存目录
    staging_dir: PathBuf,
    /// 文件前缀
    prefix: String,
}

impl TempStaging {
    /// 创建新的暂存目录管理器
    pub fn new(staging_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&staging_dir)?;

        Ok(Self {
            staging_dir,
            prefix: "stage_".to_string(),
        })
    }

    /// 获取暂存目录路径
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// 分配一个新的暂存文件路径（带守卫）
    pub fn create(&self, extension: &str) -> TempFileGuard {
        let filename = format!("{}{}{}", self.prefix, uuid::Uuid::new_v4(), extension);
        TempFileGuard::new(self.staging_dir.join(filename))
    }

    /// 将一段内容写入新的暂存文件
    pub async fn stage(&self, extension: &str, content: &[u8]) -> std::io::Result<TempFileGuard> {
        let guard = self.create(extension);
        tokio::fs::write(guard.path(), content).await?;
        Ok(guard)
    }

    /// 清理所有残留的暂存文件
    pub fn cleanup_all(&self) -> std::io::Result<usize> {
        let mut cleaned = 0;

        if let Ok(entries) = std::fs::read_dir(&self.staging_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let matches_prefix = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&self.prefix))
                    .unwrap_or(false);
                if !matches_prefix {
                    continue;
                }
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!("删除残留暂存文件失败: {} - {}", path.display(), e);
                } else {
                    tracing::info!("已清理残留暂存文件: {}", path.display());
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }

    /// 清理超过指定时间的暂存文件
    pub fn cleanup_old(&self, max_age_secs: u64) -> std::io::Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();
        let max_age = std::time::Duration::from_secs(max_age_secs);

        if let Ok(entries) = std::fs::read_dir(&self.staging_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let matches_prefix = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&self.prefix))
                    .unwrap_or(false);
                if !matches_prefix {
                    continue;
                }

                let expired = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .map(|age| age > max_age)
                    .unwrap_or(false);

                if expired {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!("删除过期暂存文件失败: {} - {}", path.display(), e);
                    } else {
                        tracing::info!("已清理过期暂存文件: {}", path.display());
                        cleaned += 1;
                    }
                }
            }
        }

        Ok(cleaned)
    }

    /// 获取暂存文件数量
    pub fn count(&self) -> std::io::Result<usize> {
        let mut count = 0;

        if let Ok(entries) = std::fs::read_dir(&self.staging_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        if name.starts_with(&self.prefix) {
                            count += 1;
                        }
                    }
                }
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_guard_auto_cleanup() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("staged.zip");

        std::fs::write(&file_path, "package bytes").unwrap();
        assert!(file_path.exists());

        {
            let _guard = TempFileGuard::new(file_path.clone());
            assert!(file_path.exists());
        }

        // 守卫丢弃后文件应被删除
        assert!(!file_path.exists());
    }

    #[test]
    fn test_guard_rename_persists() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("staged.zip");
        let dst = dir.path().join("final.zip");

        std::fs::write(&src, "package bytes").unwrap();

        {
            let guard = TempFileGuard::new(src.clone());
            guard.rename_to(&dst).unwrap();
        }

        // 重命名入库后原路径不存在、目标保留
        assert!(!src.exists());
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_stage_and_cleanup() {
        let dir = tempdir().unwrap();
        let staging = TempStaging::new(dir.path().to_path_buf()).unwrap();

        let guard = staging.stage(".zip", b"content").await.unwrap();
        assert!(guard.exists());
        assert_eq!(staging.count().unwrap(), 1);

        guard.persist();
        drop(guard);
        assert_eq!(staging.count().unwrap(), 1);

        let cleaned = staging.cleanup_all().unwrap();
        assert_eq!(cleaned, 1);
        assert_eq!(staging.count().unwrap(), 0);
    }

    #[test]
    fn test_cleanup_ignores_other_files() {
        let dir = tempdir().unwrap();
        let staging = TempStaging::new(dir.path().to_path_buf()).unwrap();

        let other = dir.path().join("spider_list.json");
        std::fs::write(&other, "{}").unwrap();

        let cleaned = staging.cleanup_all().unwrap();
        assert_eq!(cleaned, 0);
        assert!(other.exists());
    }
}
