//! 爬虫包内容寻址存储
//!
//! 包内容以 UUID 命名落盘，元数据（逻辑文件名、MD5、大小）存 SQLite。
//! 同名上传按"后写覆盖"处理：旧内容与旧元数据删除，生成全新记录。

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::common::TempFileGuard;
use crate::error::{Result, SyncError};
use crate::store::model::BlobMeta;

/// 分块读写大小（4 KiB）
pub const CHUNK_SIZE: usize = 4096;

/// 爬虫包存储
pub struct BlobStore {
    /// 包内容目录
    content_dir: PathBuf,
    /// 元数据库连接
    conn: Mutex<Connection>,
}

impl BlobStore {
    /// 打开（或初始化）指定目录下的包存储
    pub fn new(root: &Path) -> Result<Self> {
        let content_dir = root.join("content");
        std::fs::create_dir_all(&content_dir)?;

        let conn = Connection::open(root.join("meta.db"))?;
        let store = Self {
            content_dir,
            conn: Mutex::new(conn),
        };
        store.init_tables()?;

        Ok(store)
    }

    /// 初始化元数据表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            -- ============================================
            -- 表: blobs (爬虫包元数据表)
            -- 描述: 内容寻址存储的索引，逻辑文件名唯一
            -- ============================================
            CREATE TABLE IF NOT EXISTS blobs (
                id TEXT PRIMARY KEY,                    -- 包唯一标识 (UUID)
                file_name TEXT NOT NULL UNIQUE,         -- 逻辑文件名（覆盖写入的键）
                md5 TEXT NOT NULL,                      -- 内容 MD5 校验和
                size INTEGER NOT NULL,                  -- 内容字节数
                created_at INTEGER NOT NULL,            -- 创建时间 (Unix timestamp 秒)
                updated_at INTEGER NOT NULL             -- 更新时间
            )
            "#,
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Other(format!("获取数据库锁失败: {}", e)))
    }

    /// 包内容文件路径
    fn content_path(&self, id: &str) -> PathBuf {
        self.content_dir.join(id)
    }

    // ==================== 写入 ====================

    /// 写入一段内存中的包内容
    pub fn put(&self, file_name: &str, content: &[u8]) -> Result<BlobMeta> {
        let id = uuid::Uuid::new_v4().to_string();
        let guard = TempFileGuard::new(self.content_dir.join(format!("{}.tmp", id)));

        let mut md5_ctx = md5::Context::new();
        {
            let mut out = std::fs::File::create(guard.path())?;
            for chunk in content.chunks(CHUNK_SIZE) {
                md5_ctx.consume(chunk);
                out.write_all(chunk)?;
            }
            out.sync_all()?;
        }

        let md5 = format!("{:x}", md5_ctx.compute());
        self.commit(file_name, &id, guard, &md5, content.len() as u64)
    }

    /// 从暂存文件分块读入包内容
    ///
    /// 传输结束后无论成功失败都会删除暂存源文件。
    pub fn save_file(&self, file_name: &str, source: &Path) -> Result<BlobMeta> {
        let result = self.ingest_file(file_name, source);

        // 传输完成后删除暂存源文件，失败路径同样删除
        if let Err(e) = std::fs::remove_file(source) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("删除暂存源文件失败: {} - {}", source.display(), e);
            }
        }

        result
    }

    fn ingest_file(&self, file_name: &str, source: &Path) -> Result<BlobMeta> {
        let id = uuid::Uuid::new_v4().to_string();
        let guard = TempFileGuard::new(self.content_dir.join(format!("{}.tmp", id)));

        let mut md5_ctx = md5::Context::new();
        let mut size: u64 = 0;
        {
            let mut input = std::fs::File::open(source)?;
            let mut out = std::fs::File::create(guard.path())?;
            let mut buffer = [0u8; CHUNK_SIZE];
            loop {
                let n = input.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                md5_ctx.consume(&buffer[..n]);
                out.write_all(&buffer[..n])?;
                size += n as u64;
            }
            out.sync_all()?;
        }

        let md5 = format!("{:x}", md5_ctx.compute());
        self.commit(file_name, &id, guard, &md5, size)
    }

    /// 提交一次写入：删除同名旧包，临时内容转正，插入新元数据
    fn commit(
        &self,
        file_name: &str,
        id: &str,
        guard: TempFileGuard,
        md5: &str,
        size: u64,
    ) -> Result<BlobMeta> {
        // 同名覆盖：先清掉旧内容与旧元数据
        self.remove(file_name)?;

        guard.rename_to(&self.content_path(id))?;

        let now = Utc::now();
        if let Err(e) = self.insert_meta(id, file_name, md5, size, now) {
            // 元数据没写成的内容文件不会再有引用，当场清掉
            if let Err(rm) = std::fs::remove_file(self.content_path(id)) {
                warn!(
                    "清理未入库的内容文件失败: {} - {}",
                    self.content_path(id).display(),
                    rm
                );
            }
            return Err(e);
        }

        info!("爬虫包已入库: {} (md5={}, {} 字节)", file_name, md5, size);

        Ok(BlobMeta {
            id: id.to_string(),
            file_name: file_name.to_string(),
            md5: md5.to_string(),
            size,
            created_at: now,
            updated_at: now,
        })
    }

    fn insert_meta(
        &self,
        id: &str,
        file_name: &str,
        md5: &str,
        size: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO blobs (id, file_name, md5, size, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                id,
                file_name,
                md5,
                size as i64,
                now.timestamp(),
                now.timestamp()
            ],
        )?;
        Ok(())
    }

    // ==================== 查询 ====================

    /// 按逻辑文件名查询元数据
    pub fn get_meta(&self, file_name: &str) -> Result<Option<BlobMeta>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT id, file_name, md5, size, created_at, updated_at
                FROM blobs WHERE file_name = ?1
                "#,
                params![file_name],
                row_to_meta,
            )
            .optional()?;

        Ok(row)
    }

    /// 按包 ID 查询元数据
    pub fn get_meta_by_id(&self, id: &str) -> Result<Option<BlobMeta>> {
        let conn = self.lock_conn()?;

        let row = conn
            .query_row(
                r#"
                SELECT id, file_name, md5, size, created_at, updated_at
                FROM blobs WHERE id = ?1
                "#,
                params![id],
                row_to_meta,
            )
            .optional()?;

        Ok(row)
    }

    /// 列出全部包元数据
    pub fn list(&self) -> Result<Vec<BlobMeta>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, file_name, md5, size, created_at, updated_at
            FROM blobs ORDER BY file_name
            "#,
        )?;
        let rows = stmt.query_map([], row_to_meta)?;

        let mut metas = Vec::new();
        for row in rows {
            metas.push(row?);
        }
        Ok(metas)
    }

    // ==================== 导出 ====================

    /// 将包内容分块导出到目标文件
    pub fn export_to_file(&self, id: &str, dest: &Path) -> Result<BlobMeta> {
        let meta = self
            .get_meta_by_id(id)?
            .ok_or_else(|| SyncError::BlobNotFound(id.to_string()))?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut input = std::fs::File::open(self.content_path(id))?;
        let mut out = std::fs::File::create(dest)?;
        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let n = input.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
        }
        out.sync_all()?;

        debug!("爬虫包已导出: {} -> {}", meta.file_name, dest.display());
        Ok(meta)
    }

    /// 读出包的完整内容
    pub fn read(&self, id: &str) -> Result<Vec<u8>> {
        let meta = self
            .get_meta_by_id(id)?
            .ok_or_else(|| SyncError::BlobNotFound(id.to_string()))?;

        let mut content = Vec::with_capacity(meta.size as usize);
        let mut input = std::fs::File::open(self.content_path(id))?;
        input.read_to_end(&mut content)?;
        Ok(content)
    }

    // ==================== 删除 ====================

    /// 按逻辑文件名删除包（幂等：不存在时静默返回）
    pub fn remove(&self, file_name: &str) -> Result<()> {
        let old = self.get_meta(file_name)?;
        let Some(meta) = old else {
            return Ok(());
        };

        self.delete_content_and_meta(&meta)
    }

    /// 按包 ID 删除（幂等：不存在时静默返回）
    pub fn remove_by_id(&self, id: &str) -> Result<()> {
        let old = self.get_meta_by_id(id)?;
        let Some(meta) = old else {
            return Ok(());
        };

        self.delete_content_and_meta(&meta)
    }

    fn delete_content_and_meta(&self, meta: &BlobMeta) -> Result<()> {
        let path = self.content_path(&meta.id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM blobs WHERE id = ?1", params![meta.id])?;

        info!("爬虫包已删除: {} (id={})", meta.file_name, meta.id);
        Ok(())
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlobMeta> {
    let created_at: i64 = row.get(4)?;
    let updated_at: i64 = row.get(5)?;
    let size: i64 = row.get(3)?;

    Ok(BlobMeta {
        id: row.get(0)?,
        file_name: row.get(1)?,
        md5: row.get(2)?,
        size: size as u64,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_store(dir: &Path) -> BlobStore {
        BlobStore::new(dir).unwrap()
    }

    #[test]
    fn test_put_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let meta = store.put("news_crawler", b"spider package bytes").unwrap();
        assert_eq!(meta.file_name, "news_crawler");
        assert_eq!(meta.size, 20);
        assert_eq!(meta.md5, format!("{:x}", md5::compute(b"spider package bytes")));

        let content = store.read(&meta.id).unwrap();
        assert_eq!(content, b"spider package bytes");
    }

    #[test]
    fn test_multi_chunk_content_md5() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        // 跨多个 4 KiB 分块的内容
        let content: Vec<u8> = (0..CHUNK_SIZE * 3 + 123).map(|i| (i % 251) as u8).collect();
        let meta = store.put("big_spider", &content).unwrap();

        assert_eq!(meta.size, content.len() as u64);
        assert_eq!(meta.md5, format!("{:x}", md5::compute(&content)));
        assert_eq!(store.read(&meta.id).unwrap(), content);
    }

    #[test]
    fn test_overwrite_same_name_yields_fresh_meta() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let first = store.put("news_crawler", b"version one").unwrap();
        let second = store.put("news_crawler", b"version two").unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.md5, second.md5);

        // 旧包内容与元数据不再可见
        assert!(store.get_meta_by_id(&first.id).unwrap().is_none());
        assert!(store.read(&first.id).is_err());

        let meta = store.get_meta("news_crawler").unwrap().unwrap();
        assert_eq!(meta.id, second.id);
        assert_eq!(store.read(&second.id).unwrap(), b"version two");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        store.put("news_crawler", b"bytes").unwrap();
        store.remove("news_crawler").unwrap();
        assert!(store.get_meta("news_crawler").unwrap().is_none());

        // 再次删除与删除不存在的名称都不报错
        store.remove("news_crawler").unwrap();
        store.remove("never_uploaded").unwrap();
        store.remove_by_id("no-such-id").unwrap();
    }

    #[test]
    fn test_save_file_deletes_source_on_success() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let source = dir.path().join("staged.zip");
        std::fs::write(&source, b"uploaded package").unwrap();

        let meta = store.save_file("news_crawler", &source).unwrap();
        assert_eq!(meta.size, 16);
        assert!(!source.exists());
    }

    #[test]
    fn test_save_file_deletes_source_on_failure() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        // 源是目录而不是文件，入库必然失败
        let source = dir.path().join("staged_dir");
        std::fs::create_dir(&source).unwrap();

        assert!(store.save_file("news_crawler", &source).is_err());
        assert!(store.get_meta("news_crawler").unwrap().is_none());
    }

    #[test]
    fn test_meta_insert_failure_leaves_no_content_file() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        // 用触发器人为让元数据插入失败
        let raw = Connection::open(dir.path().join("meta.db")).unwrap();
        raw.execute_batch(
            "CREATE TRIGGER block_insert BEFORE INSERT ON blobs \
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .unwrap();

        assert!(store.put("news_crawler", b"bytes").is_err());

        // 既没有元数据也不留内容文件
        assert!(store.get_meta("news_crawler").unwrap().is_none());
        let content_dir = dir.path().join("content");
        assert_eq!(std::fs::read_dir(&content_dir).unwrap().count(), 0);

        // 解除限制后存储照常可用
        raw.execute_batch("DROP TRIGGER block_insert").unwrap();
        let meta = store.put("news_crawler", b"bytes").unwrap();
        assert_eq!(store.read(&meta.id).unwrap(), b"bytes");
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let content: Vec<u8> = (0..CHUNK_SIZE + 7).map(|i| (i % 253) as u8).collect();
        let meta = store.put("news_crawler", &content).unwrap();

        let dest = dir.path().join("mirror").join("news_crawler.zip");
        let exported = store.export_to_file(&meta.id, &dest).unwrap();
        assert_eq!(exported.md5, meta.md5);
        assert_eq!(std::fs::read(&dest).unwrap(), content);
    }

    #[test]
    fn test_export_missing_blob_fails() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());

        let dest = dir.path().join("out.zip");
        let err = store.export_to_file("missing-id", &dest).unwrap_err();
        assert!(matches!(err, SyncError::BlobNotFound(_)));
    }
}
