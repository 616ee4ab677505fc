//! 断点持久化
//!
//! 每个会话一条带版本号的记录，整体覆盖写入：
//! - InMemoryCheckpointStore：进程内（测试、单次运行）
//! - FileCheckpointStore：每会话一个 JSON 文件，先写临时文件再 rename，读者不会看到半截内容
//! - SqliteCheckpointStore：单表，事务内 upsert

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CheckpointSection;
use crate::core::state::TaskState;

/// 当前记录格式版本
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unsupported checkpoint version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("checkpoint belongs to session '{found}', not '{expected}'")]
    SessionMismatch { expected: String, found: String },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// 持久化的断点记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub session_id: String,
    pub seq: u64,
    pub saved_at: DateTime<Utc>,
    pub state: TaskState,
}

impl CheckpointRecord {
    pub fn new(state: &TaskState) -> Self {
        let mut state = state.clone();
        state.cache_feedback.clear();
        Self {
            version: CHECKPOINT_VERSION,
            session_id: state.session_id.clone(),
            seq: state.seq,
            saved_at: Utc::now(),
            state,
        }
    }

    fn checked(self) -> Result<Self, CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(self)
    }
}

/// 断点存储：save 必须是原子的（要么是旧记录，要么是完整的新记录）
pub trait CheckpointStore: Send + Sync {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    fn load(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError>;

    fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> CheckpointError {
    CheckpointError::Unavailable("lock poisoned".to_string())
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let record = self.records.read().map_err(poisoned)?.get(session_id).cloned();
        record.map(CheckpointRecord::checked).transpose()
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        self.records.write().map_err(poisoned)?.remove(session_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.records.read().map_err(poisoned)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// JSON 文件存储：{dir}/{hex(session)}.json
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// 文件名是会话 id 的 UTF-8 十六进制编码，不同会话不会落到同一个文件
    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_session(session_id)))
    }
}

fn encode_session(session_id: &str) -> String {
    session_id.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_session(stem: &str) -> Option<String> {
    if stem.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..stem.len())
        .step_by(2)
        .map(|i| stem.get(i..i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()))
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let target = self.path_for(&record.session_id);
        let tmp = target.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, &body)?;
        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let body = std::fs::read(&path)?;
        let record: CheckpointRecord = serde_json::from_slice(&body)?;
        if record.session_id != session_id {
            return Err(CheckpointError::SessionMismatch {
                expected: session_id.to_string(),
                found: record.session_id,
            });
        }
        record.checked().map(Some)
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                match path.file_stem().and_then(|s| s.to_str()).and_then(decode_session) {
                    Some(id) => ids.push(id),
                    None => tracing::debug!(path = %path.display(), "skipping unrecognized checkpoint file"),
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// SQLite 存储
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                saved_at TEXT NOT NULL,
                state TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let state = serde_json::to_string(&record.state)?;
        let mut conn = self.conn.lock().map_err(poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO checkpoints (session_id, version, seq, saved_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.version,
                record.seq as i64,
                record.saved_at,
                state
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let row = conn
            .query_row(
                "SELECT version, seq, saved_at, state FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((version, seq, saved_at, state)) = row else {
            return Ok(None);
        };
        let record = CheckpointRecord {
            version,
            session_id: session_id.to_string(),
            seq: seq as u64,
            saved_at,
            state: serde_json::from_str(&state)?,
        };
        record.checked().map(Some)
    }

    fn delete(&self, session_id: &str) -> Result<(), CheckpointError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute("DELETE FROM checkpoints WHERE session_id = ?1", params![session_id])?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare("SELECT session_id FROM checkpoints ORDER BY session_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }
}

/// 按配置创建断点存储
pub fn create_checkpoint_store(cfg: &CheckpointSection) -> Result<Box<dyn CheckpointStore>, CheckpointError> {
    match cfg.backend.as_str() {
        "file" => {
            let dir = cfg.path.clone().unwrap_or_else(|| PathBuf::from("checkpoints"));
            Ok(Box::new(FileCheckpointStore::new(dir)?))
        }
        "sqlite" => {
            let path = cfg.path.clone().unwrap_or_else(|| PathBuf::from("checkpoints.db"));
            Ok(Box::new(SqliteCheckpointStore::open(path)?))
        }
        "memory" => Ok(Box::new(InMemoryCheckpointStore::new())),
        other => Err(CheckpointError::Unavailable(format!("unknown checkpoint backend '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{Phase, PausePoint};

    fn state(seq: u64) -> TaskState {
        let mut s = TaskState::new("session/1", "search sea");
        s.seq = seq;
        s.phase = Phase::Paused(PausePoint::BeforeExecute);
        s.record_finished("open site");
        s
    }

    fn exercise(store: &dyn CheckpointStore) {
        assert!(store.load("session/1").unwrap().is_none());
        store.save(&CheckpointRecord::new(&state(1))).unwrap();
        store.save(&CheckpointRecord::new(&state(2))).unwrap();
        let loaded = store.load("session/1").unwrap().unwrap();
        assert_eq!(loaded.seq, 2);
        assert_eq!(loaded.state, state(2));
        assert_eq!(store.list().unwrap().len(), 1);
        store.delete("session/1").unwrap();
        assert!(store.load("session/1").unwrap().is_none());
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryCheckpointStore::new());
    }

    #[test]
    fn test_file_store_atomic_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        exercise(&store);
        store.save(&CheckpointRecord::new(&state(3))).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_file_store_keeps_similar_session_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let mut dotted = TaskState::new("user.1", "task one");
        dotted.seq = 1;
        let mut underscored = TaskState::new("user_1", "task two");
        underscored.seq = 7;
        store.save(&CheckpointRecord::new(&dotted)).unwrap();
        store.save(&CheckpointRecord::new(&underscored)).unwrap();

        assert_eq!(store.load("user.1").unwrap().unwrap().state.user_task, "task one");
        assert_eq!(store.load("user_1").unwrap().unwrap().state.user_task, "task two");
        assert_eq!(store.list().unwrap(), vec!["user.1".to_string(), "user_1".to_string()]);

        store.delete("user.1").unwrap();
        assert!(store.load("user.1").unwrap().is_none());
        assert_eq!(store.load("user_1").unwrap().unwrap().seq, 7);
    }

    #[test]
    fn test_file_store_rejects_record_for_other_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.save(&CheckpointRecord::new(&state(1))).unwrap();
        std::fs::rename(store.path_for("session/1"), store.path_for("intruder")).unwrap();
        assert!(matches!(
            store.load("intruder"),
            Err(CheckpointError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteCheckpointStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        SqliteCheckpointStore::open(&path)
            .unwrap()
            .save(&CheckpointRecord::new(&state(5)))
            .unwrap();
        let reopened = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.load("session/1").unwrap().unwrap().seq, 5);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let store = InMemoryCheckpointStore::new();
        let mut record = CheckpointRecord::new(&state(1));
        record.version = 99;
        store.save(&record).unwrap();
        assert!(matches!(
            store.load("session/1"),
            Err(CheckpointError::Version { found: 99, .. })
        ));
    }
}
