//! 内容寻址结果缓存
//!
//! 键为原始字符串（查询或任务）的 SHA-256；值为不透明的序列化结果，带 TTL。
//! DashMap 分片存储：不同键的读写互不阻塞，store 为原子 upsert。
//! 配置了 path 时启动加载 JSON 文件，并在每次 store 后整体原子重写（先写 .tmp 再 rename）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::AgentError;

/// 确定性缓存键：sha256(source) 的十六进制
pub fn cache_key(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: String,
    /// 过期时间（Unix 毫秒）
    pub expires_at_ms: i64,
}

#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    path: Option<PathBuf>,
    /// 串行化文件重写
    persist_lock: Mutex<()>,
}

impl ResultCache {
    /// 仅内存缓存
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// 文件持久化缓存：文件不存在时为空；内容损坏时告警并以空缓存启动；已过期条目不加载
    pub async fn open(path: impl Into<PathBuf>, ttl: Duration) -> Result<Self, AgentError> {
        let path = path.into();
        let cache = Self {
            path: Some(path.clone()),
            ..Self::in_memory(ttl)
        };
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, CacheEntry>>(&bytes) {
                Ok(map) => {
                    let now = now_ms();
                    for (key, entry) in map.into_iter().filter(|(_, e)| e.expires_at_ms > now) {
                        cache.entries.insert(key, entry);
                    }
                    debug!(path = %path.display(), entries = cache.entries.len(), "cache loaded");
                }
                Err(err) => warn!(%err, path = %path.display(), "failed to parse cache file, starting empty"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(cache)
    }

    /// 读取未过期的值；过期条目顺带删除
    pub fn load(&self, key_source: &str) -> Option<String> {
        self.lookup(&cache_key(key_source), now_ms())
    }

    fn lookup(&self, key: &str, now: i64) -> Option<String> {
        let hit = self
            .entries
            .get(key)
            .map(|e| (e.expires_at_ms > now, e.value.clone()));
        match hit {
            Some((true, value)) => {
                debug!(key = %&key[..8.min(key.len())], "cache hit");
                Some(value)
            }
            Some((false, _)) => {
                self.entries.remove_if(key, |_, e| e.expires_at_ms <= now);
                None
            }
            None => None,
        }
    }

    /// 写入（覆盖同键），配置了文件时持久化
    pub async fn store(&self, key_source: &str, value: impl Into<String>) -> Result<(), AgentError> {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            value: value.into(),
            expires_at_ms: now_ms().saturating_add(ttl_ms),
        };
        self.entries.insert(cache_key(key_source), entry);
        self.persist().await
    }

    pub fn load_json<T: DeserializeOwned>(&self, key_source: &str) -> Option<T> {
        let raw = self.load(key_source)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%err, "cached value has unexpected shape, ignoring");
                None
            }
        }
    }

    pub async fn store_json<T: Serialize>(&self, key_source: &str, value: &T) -> Result<(), AgentError> {
        self.store(key_source, serde_json::to_string(value)?).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn persist(&self) -> Result<(), AgentError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let snapshot: BTreeMap<String, CacheEntry> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let payload = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(path, &payload).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    fs::rename(tmp, path).await
}
