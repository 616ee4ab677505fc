//! L1 感知缓存
//!
//! 以 (指纹, 来源标识) 精确匹配复用页面分析结果（定位策略）。条目带 TTL，可立即失效；
//! 查询从不报错，后端故障一律按未命中处理。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::fingerprint::normalize_source;
use super::StoreError;
use crate::capability::LocatorStrategy;

/// 一条感知缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionEntry {
    pub fingerprint: String,
    /// 归一化后的来源标识
    pub source_id: String,
    pub strategy: LocatorStrategy,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: i64,
    pub hit_count: u64,
    pub invalidated: bool,
}

impl PerceptionEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_secs)
    }

    /// 未失效且 now < created_at + ttl
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.invalidated && now < self.expires_at()
    }
}

/// 感知缓存后端（可失败）
pub trait PerceptionStore: Send + Sync {
    fn get(&self, fingerprint: &str, source_id: &str) -> Result<Option<PerceptionEntry>, StoreError>;

    /// 同键覆盖（后写者胜）
    fn put(&self, entry: PerceptionEntry) -> Result<(), StoreError>;

    fn record_hit(&self, fingerprint: &str, source_id: &str) -> Result<(), StoreError>;

    /// 标记失效；返回是否存在该条目
    fn invalidate(&self, fingerprint: &str, source_id: &str) -> Result<bool, StoreError>;

    /// 删除过期与失效条目，返回删除数
    fn purge(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

type EntryKey = (String, String);

/// 内存后端
#[derive(Debug, Default)]
pub struct InMemoryPerceptionStore {
    entries: RwLock<HashMap<EntryKey, PerceptionEntry>>,
}

impl InMemoryPerceptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("perception store lock poisoned".to_string())
}

impl PerceptionStore for InMemoryPerceptionStore {
    fn get(&self, fingerprint: &str, source_id: &str) -> Result<Option<PerceptionEntry>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(&(fingerprint.to_string(), source_id.to_string()))
            .cloned())
    }

    fn put(&self, entry: PerceptionEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert((entry.fingerprint.clone(), entry.source_id.clone()), entry);
        Ok(())
    }

    fn record_hit(&self, fingerprint: &str, source_id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if let Some(e) = entries.get_mut(&(fingerprint.to_string(), source_id.to_string())) {
            e.hit_count += 1;
        }
        Ok(())
    }

    fn invalidate(&self, fingerprint: &str, source_id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get_mut(&(fingerprint.to_string(), source_id.to_string())) {
            Some(e) => {
                e.invalidated = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn purge(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, e| e.is_eligible(now));
        Ok(before - entries.len())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }
}

/// 命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// L1 感知缓存
pub struct PerceptionCache {
    store: Arc<dyn PerceptionStore>,
    default_ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PerceptionCache {
    pub fn new(store: Arc<dyn PerceptionStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            enabled: true,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryPerceptionStore::new()), default_ttl)
    }

    pub fn from_config(cfg: &crate::config::PerceptionCacheSection) -> Self {
        let mut cache = Self::in_memory(cfg.ttl());
        cache.enabled = cfg.enabled;
        cache
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lookup(&self, fingerprint: &str, source_id: &str) -> Option<LocatorStrategy> {
        self.lookup_at(fingerprint, source_id, Utc::now())
    }

    /// 精确匹配 (fingerprint, source_id)；过期、失效、后端故障均返回 None
    pub fn lookup_at(&self, fingerprint: &str, source_id: &str, now: DateTime<Utc>) -> Option<LocatorStrategy> {
        if !self.enabled {
            return None;
        }
        let source = normalize_source(source_id);
        let found = match self.store.get(fingerprint, &source) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "perception cache lookup degraded to miss");
                None
            }
        };
        match found {
            Some(entry) if entry.is_eligible(now) => {
                if let Err(e) = self.store.record_hit(fingerprint, &source) {
                    tracing::debug!(error = %e, "perception cache hit count not recorded");
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::info!(fingerprint, source = %source, "perception cache hit");
                Some(entry.strategy)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint, source = %source, "perception cache miss");
                None
            }
        }
    }

    pub fn store(&self, fingerprint: &str, source_id: &str, strategy: &LocatorStrategy, ttl: Option<Duration>) {
        self.store_at(fingerprint, source_id, strategy, ttl, Utc::now())
    }

    /// 写入（同键覆盖）；空策略不缓存；写失败只记录日志
    pub fn store_at(
        &self,
        fingerprint: &str,
        source_id: &str,
        strategy: &LocatorStrategy,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        if !self.enabled || strategy.is_empty() {
            return;
        }
        let entry = PerceptionEntry {
            fingerprint: fingerprint.to_string(),
            source_id: normalize_source(source_id),
            strategy: strategy.clone(),
            created_at: now,
            ttl_secs: ttl.unwrap_or(self.default_ttl).num_seconds(),
            hit_count: 0,
            invalidated: false,
        };
        match self.store.put(entry) {
            Ok(()) => tracing::debug!(fingerprint, "perception cache stored"),
            Err(e) => tracing::warn!(error = %e, "perception cache store failed"),
        }
    }

    /// 立即失效，之后的 lookup 必然未命中
    pub fn invalidate(&self, fingerprint: &str, source_id: &str) {
        let source = normalize_source(source_id);
        match self.store.invalidate(fingerprint, &source) {
            Ok(true) => tracing::info!(fingerprint, source = %source, "perception cache entry invalidated"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "perception cache invalidate failed"),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge(Utc::now()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "perception cache purge failed");
            0
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len().unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::LocatorTarget;

    fn strategy() -> LocatorStrategy {
        LocatorStrategy::default().with_target(
            "search_box",
            LocatorTarget::new("input[name=q]", "primary search field"),
        )
    }

    struct BrokenStore;

    impl PerceptionStore for BrokenStore {
        fn get(&self, _: &str, _: &str) -> Result<Option<PerceptionEntry>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn put(&self, _: PerceptionEntry) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn record_hit(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn invalidate(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn purge(&self, _: DateTime<Utc>) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        fn len(&self) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_hit_on_exact_match() {
        let cache = PerceptionCache::in_memory(Duration::hours(1));
        cache.store("fp1", "https://example.com/a", &strategy(), None);
        assert_eq!(cache.lookup("fp1", "https://example.com/a"), Some(strategy()));
        assert_eq!(cache.lookup("fp2", "https://example.com/a"), None);
        assert_eq!(cache.lookup("fp1", "https://example.com/b"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_ttl_expiry_is_miss() {
        let cache = PerceptionCache::in_memory(Duration::hours(168));
        let t0 = Utc::now();
        cache.store_at("fp", "https://example.com", &strategy(), Some(Duration::hours(1)), t0);
        assert!(cache.lookup_at("fp", "https://example.com", t0 + Duration::minutes(59)).is_some());
        assert!(cache.lookup_at("fp", "https://example.com", t0 + Duration::hours(2)).is_none());
        assert!(cache.lookup_at("fp", "https://example.com", t0 + Duration::hours(1)).is_none());
    }

    #[test]
    fn test_invalidate_is_immediate() {
        let cache = PerceptionCache::in_memory(Duration::hours(1));
        cache.store("fp", "https://example.com", &strategy(), None);
        cache.invalidate("fp", "https://example.com");
        assert!(cache.lookup("fp", "https://example.com").is_none());
    }

    #[test]
    fn test_last_writer_wins_after_invalidate() {
        let cache = PerceptionCache::in_memory(Duration::hours(1));
        cache.store("fp", "https://example.com", &strategy(), None);
        cache.invalidate("fp", "https://example.com");
        let fresh = LocatorStrategy::default()
            .with_target("search_box", LocatorTarget::new("#q", "renamed"));
        cache.store("fp", "https://example.com", &fresh, None);
        assert_eq!(cache.lookup("fp", "https://example.com"), Some(fresh));
    }

    #[test]
    fn test_empty_strategy_not_stored() {
        let cache = PerceptionCache::in_memory(Duration::hours(1));
        cache.store("fp", "https://example.com", &LocatorStrategy::default(), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_backend_failure_degrades_to_miss() {
        let cache = PerceptionCache::new(Arc::new(BrokenStore), Duration::hours(1));
        cache.store("fp", "https://example.com", &strategy(), None);
        assert!(cache.lookup("fp", "https://example.com").is_none());
        cache.invalidate("fp", "https://example.com");
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn test_purge_removes_invalidated() {
        let cache = PerceptionCache::in_memory(Duration::hours(1));
        cache.store("a", "https://example.com", &strategy(), None);
        cache.store("b", "https://example.com", &strategy(), None);
        cache.invalidate("a", "https://example.com");
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let cache = PerceptionCache::in_memory(Duration::hours(1)).with_enabled(false);
        cache.store("fp", "https://example.com", &strategy(), None);
        assert!(cache.lookup("fp", "https://example.com").is_none());
    }
}
