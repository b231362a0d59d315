use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::evidence::{ScoreValue, Source};

/// 模块：结果缓存 (Result Cache)
///
/// **职责**: 内容寻址。同样的字节 (同一个 SHA-256) 只打一次分，之后直接复用。
///
/// **存储形态**: 一个扁平的 JSON 对象 `{ "<sha256>": CachedVerdict, ... }`。
/// - 启动时整体读入内存；读失败降级为空缓存 (记日志，不致命)。
/// - 每新增一条就整体重写一次文件 (尽力而为，失败只记日志)。
///
/// **并发**: 一把 `Mutex` 同时保护 map 和落盘。
/// - 同一个 hash 的并发首写被串行化：第一个写入者胜出，之后的写入不会覆盖。
/// - 锁里只有内存操作和本地文件 IO，绝不会跨网络调用持锁。
///
/// **原子落盘**: 先写同目录下的临时文件，再 rename 覆盖正式文件。
/// 进程在写到一半时崩溃，磁盘上要么是旧文件，要么是新文件，不会出现截断的 JSON。
pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, CachedVerdict>>,
}

/// 缓存条目：最终 (整形 + 取整后) 的结果，加上产出来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedVerdict {
    pub real: ScoreValue,
    pub fake: ScoreValue,
    pub message: String,
    pub details: Vec<String>,
    pub source: Source,
    /// 首次写入的 Unix 时间戳 (秒)
    #[serde(default)]
    pub cached_at: i64,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),

    #[error("cache file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl ResultCache {
    /// 加载缓存文件。任何失败都降级为空缓存。
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_store(&path) {
            Ok(Some(map)) => {
                info!(path = %path.display(), entries = map.len(), "result cache loaded");
                map
            }
            Ok(None) => {
                info!(path = %path.display(), "no result cache on disk, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "result cache unreadable, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 命中时返回一份拷贝
    pub fn get(&self, key: &str) -> Option<CachedVerdict> {
        self.entries.lock().get(key).cloned()
    }

    /// 首写胜出 (First Writer Wins)
    ///
    /// - key 不存在：插入并落盘，返回刚写入的条目。
    /// - key 已存在：什么都不改，返回已有条目 (调用方据此对外报告，保证同一内容的结果一致)。
    ///
    /// 落盘失败只记 warn，在这里被有意丢弃，请求照常完成。
    pub fn insert_if_absent(&self, key: &str, entry: CachedVerdict) -> CachedVerdict {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            debug!(key, "cache entry already present, keeping first writer");
            return existing.clone();
        }

        entries.insert(key.to_string(), entry.clone());
        if let Err(e) = write_store(&self.path, &entries) {
            warn!(path = %self.path.display(), error = %e, "result cache persist failed");
        }
        entry
    }
}

/// 文件不存在返回 Ok(None)
fn read_store(path: &Path) -> Result<Option<HashMap<String, CachedVerdict>>, CacheError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// 临时文件 + rename。临时文件必须和目标在同一目录 (同一文件系统)，rename 才是原子的。
fn write_store(path: &Path, entries: &HashMap<String, CachedVerdict>) -> Result<(), CacheError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, entries)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
