//! 模式记忆：LearnedPattern 追加存储 + GoalSession 按 ID 存取
//!
//! 模式保存在 `{memory_dir}/learned_patterns.json`，会话保存在 `{sessions_dir}/{file_stem(id)}.json`。
//! 存储读写失败只记 warn（StorageDegraded），读退化为空结果，写被吞掉，不向调用方传播。
//! 同一进程内的写入由锁串行化；多进程并发写同一目录时为最后写入者胜出。

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::Utc;
use serde::Deserialize;

use crate::core::{EngineError, GoalSession};
use crate::memory::patterns::LearnedPattern;
use crate::memory::persistence::{file_stem, JsonFile};
use crate::workflow::Params;

const PATTERNS_FILE: &str = "learned_patterns.json";

#[derive(Debug)]
struct Storage {
    patterns: JsonFile,
    sessions_dir: PathBuf,
}

pub struct PatternMemory {
    patterns: RwLock<Vec<LearnedPattern>>,
    storage: Option<Storage>,
    /// 仅在内存模式下保存会话
    sessions: Mutex<Vec<GoalSession>>,
    session_write: Mutex<()>,
}

impl PatternMemory {
    /// 纯内存存储（测试 / 不需要跨进程保留时）
    pub fn in_memory() -> Self {
        Self {
            patterns: RwLock::new(Vec::new()),
            storage: None,
            sessions: Mutex::new(Vec::new()),
            session_write: Mutex::new(()),
        }
    }

    /// 打开目录存储；已有模式文件读取失败时从空集合开始
    pub fn open(memory_dir: impl AsRef<Path>, sessions_dir: impl AsRef<Path>) -> Self {
        let memory_dir = memory_dir.as_ref();
        let sessions_dir = sessions_dir.as_ref().to_path_buf();
        for dir in [memory_dir, sessions_dir.as_path()] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                degraded(format!("create {}: {e}", dir.display()));
            }
        }

        let file = JsonFile::new(memory_dir.join(PATTERNS_FILE));
        let patterns = match file.load::<Vec<LearnedPattern>>() {
            Ok(loaded) => loaded.unwrap_or_default(),
            Err(e) => {
                degraded(format!("load patterns: {e:#}"));
                Vec::new()
            }
        };
        tracing::info!(path = %file.path().display(), patterns = patterns.len(), "pattern memory opened");

        Self {
            patterns: RwLock::new(patterns),
            storage: Some(Storage {
                patterns: file,
                sessions_dir,
            }),
            sessions: Mutex::new(Vec::new()),
            session_write: Mutex::new(()),
        }
    }

    pub fn save(&self, pattern: LearnedPattern) {
        self.save_all(vec![pattern]);
    }

    /// 追加并立即持久化
    pub fn save_all(&self, patterns: Vec<LearnedPattern>) {
        if patterns.is_empty() {
            return;
        }
        let mut guard = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        guard.extend(patterns);
        self.persist(&guard);
    }

    /// 按类型与上下文过滤，按 (confidence, usage_count) 降序稳定排序
    pub fn get(&self, pattern_type: Option<&str>, context: Option<&Params>) -> Vec<LearnedPattern> {
        let guard = self.patterns.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<LearnedPattern> = guard
            .iter()
            .filter(|p| p.matches(pattern_type, context))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(b.usage_count.cmp(&a.usage_count))
        });
        matched
    }

    /// 使用计数 +1 并刷新 last_used；找不到时返回 false
    pub fn touch(&self, pattern_id: &str) -> bool {
        let mut guard = self.patterns.write().unwrap_or_else(PoisonError::into_inner);
        let Some(pattern) = guard.iter_mut().find(|p| p.id == pattern_id) else {
            return false;
        };
        pattern.usage_count += 1;
        pattern.last_used = Utc::now();
        self.persist(&guard);
        true
    }

    pub fn len(&self) -> usize {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save_session(&self, session: &GoalSession) {
        let Some(storage) = &self.storage else {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            match sessions.iter_mut().find(|s| s.id == session.id) {
                Some(existing) => *existing = session.clone(),
                None => sessions.push(session.clone()),
            }
            return;
        };
        let _write = self.session_write.lock().unwrap_or_else(PoisonError::into_inner);
        let file = session_file(storage, &session.id);
        if let Err(e) = file.save(session) {
            degraded(format!("save session {}: {e:#}", session.id));
        }
    }

    /// 读取会话；不存在或无法读取时返回 None。返回前重新对齐 plan 与 goal 的任务实例
    pub fn load_session(&self, session_id: &str) -> Option<GoalSession> {
        let mut session = match &self.storage {
            None => self
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .find(|s| s.id == session_id)
                .map(clone_detached)?,
            Some(storage) => match session_file(storage, session_id).load::<GoalSession>() {
                Ok(session) => session?,
                Err(e) => {
                    degraded(format!("load session {session_id}: {e:#}"));
                    return None;
                }
            },
        };
        session.relink();
        Some(session)
    }

    pub fn list_sessions(&self) -> Vec<String> {
        let Some(storage) = &self.storage else {
            let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            return sessions.iter().map(|s| s.id.clone()).collect();
        };
        let entries = match std::fs::read_dir(&storage.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                degraded(format!("list sessions: {e}"));
                return Vec::new();
            }
        };
        // 文件名可能带清洗后缀，ID 以文件内容为准
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| match JsonFile::new(&p).load::<SessionId>() {
                Ok(Some(record)) => Some(record.id),
                Ok(None) => None,
                Err(e) => {
                    degraded(format!("list sessions: {e:#}"));
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    fn persist(&self, patterns: &[LearnedPattern]) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.patterns.save(patterns) {
                degraded(format!("save patterns: {e:#}"));
            }
        }
    }
}

#[derive(Deserialize)]
struct SessionId {
    id: String,
}

fn session_file(storage: &Storage, session_id: &str) -> JsonFile {
    JsonFile::new(storage.sessions_dir.join(format!("{}.json", file_stem(session_id))))
}

/// 内存模式下返回与存储副本不共享任务实例的拷贝
fn clone_detached(session: &GoalSession) -> GoalSession {
    serde_json::to_value(session)
        .and_then(serde_json::from_value)
        .unwrap_or_else(|_| session.clone())
}

fn degraded(message: String) {
    tracing::warn!(error = %EngineError::StorageDegraded(message), "pattern memory");
}
