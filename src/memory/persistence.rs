//! 记忆持久化接口
//!
//! 持久化引擎只需实现 `save(scope, key, blob)` / `load(scope, key)`；存储格式由引擎决定。
//! 内置 InMemoryStore（测试）与 FileStore（`<root>/<scope>/<key>.json`）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::HiveError;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn save(&self, scope: &str, key: &str, blob: Vec<u8>) -> Result<(), HiveError>;

    /// 不存在时返回 Ok(None)
    async fn load(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, HiveError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn save(&self, scope: &str, key: &str, blob: Vec<u8>) -> Result<(), HiveError> {
        self.blobs
            .lock()
            .map_err(|_| HiveError::Fatal("memory store lock poisoned".into()))?
            .insert((scope.to_string(), key.to_string()), blob);
        Ok(())
    }

    async fn load(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, HiveError> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| HiveError::Fatal("memory store lock poisoned".into()))?
            .get(&(scope.to_string(), key.to_string()))
            .cloned())
    }
}

/// 文件持久化：每个 (scope, key) 一个 JSON 文件；父目录不存在时自动创建
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, scope: &str, key: &str) -> PathBuf {
        self.root
            .join(safe_segment(scope))
            .join(format!("{}.json", safe_segment(key)))
    }
}

fn safe_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn io_err(e: std::io::Error) -> HiveError {
    HiveError::Transient(format!("memory store io: {e}"))
}

#[async_trait]
impl MemoryStore for FileStore {
    async fn save(&self, scope: &str, key: &str, blob: Vec<u8>) -> Result<(), HiveError> {
        let path = self.path_for(scope, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, blob).await.map_err(io_err)
    }

    async fn load(&self, scope: &str, key: &str) -> Result<Option<Vec<u8>>, HiveError> {
        let path = self.path_for(scope, key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryStore::new();
        assert!(store.load("agent:a", "memory").await.unwrap().is_none());
        store.save("agent:a", "memory", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.load("agent:a", "memory").await.unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_file_store_creates_dirs_and_sanitizes_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store
            .save("agent:../writer", "memory", b"[1,2]".to_vec())
            .await
            .unwrap();
        assert!(dir.path().join("agent____writer").join("memory.json").exists());
        let blob = store.load("agent:../writer", "memory").await.unwrap();
        assert_eq!(blob.unwrap(), b"[1,2]");
        assert!(store.load("other", "memory").await.unwrap().is_none());
    }
}
