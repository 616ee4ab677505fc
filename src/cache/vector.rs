//! 动作缓存的向量存储抽象与内存实现

use std::sync::RwLock;

use super::action::ActionEntry;
use super::StoreError;

/// 向量存储：保存已验证脚本及其三个维度的嵌入
pub trait VectorStore: Send + Sync {
    /// 插入或按 id 覆盖
    fn upsert(&self, entry: ActionEntry) -> Result<(), StoreError>;

    /// 返回全部候选（由调用方打分排序）
    fn candidates(&self) -> Result<Vec<ActionEntry>, StoreError>;

    /// 原地修改；返回是否找到
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut ActionEntry)) -> Result<bool, StoreError>;

    fn remove(&self, id: &str) -> Result<bool, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// 内存向量存储：超出容量时移除最旧条目
#[derive(Debug)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<ActionEntry>>,
    max_entries: usize,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryVectorStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("vector store lock poisoned".to_string())
}

impl VectorStore for InMemoryVectorStore {
    fn upsert(&self, entry: ActionEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if let Some(existing) = entries.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry;
            return Ok(());
        }
        entries.push(entry);
        if entries.len() > self.max_entries {
            let overflow = entries.len() - self.max_entries;
            entries.drain(0..overflow);
        }
        Ok(())
    }

    fn candidates(&self) -> Result<Vec<ActionEntry>, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.clone())
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut ActionEntry)) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                f(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        Ok(entries.len() != before)
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }
}

/// 余弦相似度；维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
