//! L2 动作缓存
//!
//! 按 目标 / 方法提示 / 上下文 三个维度做加权余弦检索，复用已验证的脚本。
//! 只有被判定为成功的步骤才能写入：写入口只接受 [`VerifiedScript`]，而它只能由结果分类器构造。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join3;
use serde::{Deserialize, Serialize};

use super::vector::{cosine_similarity, VectorStore};
use crate::config::{ActionCacheSection, FacetWeights};
use crate::llm::EmbeddingProvider;

/// 经验证的脚本；构造函数仅在 crate 内可见
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedScript(String);

impl VerifiedScript {
    pub(crate) fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// 一条动作缓存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    pub goal: String,
    pub method_hints: String,
    pub context: String,
    pub goal_embedding: Vec<f32>,
    pub method_embedding: Vec<f32>,
    pub context_embedding: Vec<f32>,
    /// 写入时的用户任务原文（用于参数差分）
    pub original_task: String,
    pub script: String,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
    pub fail_count: u32,
}

#[cfg(test)]
impl ActionEntry {
    pub(crate) fn for_test(id: &str, script: &str) -> Self {
        Self {
            id: id.to_string(),
            goal: String::new(),
            method_hints: String::new(),
            context: String::new(),
            goal_embedding: vec![1.0, 0.0],
            method_embedding: vec![1.0, 0.0],
            context_embedding: vec![1.0, 0.0],
            original_task: String::new(),
            script: script.to_string(),
            created_at: Utc::now(),
            hit_count: 0,
            fail_count: 0,
        }
    }
}

/// 单个候选在三个维度上的余弦分
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetScores {
    pub goal: f32,
    pub method: f32,
    pub context: f32,
}

impl FacetScores {
    pub fn composite(&self, weights: &FacetWeights) -> f32 {
        self.goal * weights.goal + self.method * weights.method + self.context * weights.context
    }
}

/// 检索结果
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub entry: ActionEntry,
    pub score: f32,
    pub facets: FacetScores,
}

/// 写入结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(String),
    /// 与已有条目近似重复，刷新了该条目
    Refreshed(String),
    SkippedShort,
    SkippedNavigation,
    Disabled,
    Failed(String),
}

struct FacetQuery {
    goal: Vec<f32>,
    method: Vec<f32>,
    context: Vec<f32>,
}

impl FacetQuery {
    fn scores(&self, entry: &ActionEntry) -> FacetScores {
        FacetScores {
            goal: cosine_similarity(&self.goal, &entry.goal_embedding),
            method: cosine_similarity(&self.method, &entry.method_embedding),
            context: cosine_similarity(&self.context, &entry.context_embedding),
        }
    }
}

/// 纯函数选择：按复合分降序，取最高者；与最高分相差不超过 epsilon 的候选中取最新创建者；低于阈值返回 None
pub fn select_best(
    scored: Vec<(ActionEntry, FacetScores)>,
    weights: &FacetWeights,
    threshold: f32,
    tie_epsilon: f32,
) -> Option<RetrievalResult> {
    let weights = weights.normalized();
    let mut ranked: Vec<RetrievalResult> = scored
        .into_iter()
        .map(|(entry, facets)| RetrievalResult {
            score: facets.composite(&weights),
            entry,
            facets,
        })
        .filter(|r| r.score.is_finite())
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let top_score = ranked.first()?.score;
    if top_score < threshold {
        return None;
    }
    ranked
        .into_iter()
        .take_while(|r| top_score - r.score <= tie_epsilon.max(0.0))
        .max_by(|a, b| {
            a.entry
                .created_at
                .cmp(&b.entry.created_at)
                .then(a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        })
}

/// 只做跳转的短脚本不值得缓存：整体很短，且每一行有效代码都是跳转
pub fn is_navigation_only(script: &str) -> bool {
    const MAX_NAV_CHARS: usize = 200;
    const NAV_MARKERS: [&str; 6] = [
        "tab.get(",
        ".goto(",
        "navigate_to(",
        "window.location",
        "location.href",
        "page.goto",
    ];
    let meaningful: Vec<&str> = script
        .lines()
        .map(str::trim)
        .filter(|l| {
            !l.is_empty()
                && !l.starts_with('#')
                && !l.starts_with("//")
                && !l.starts_with("import ")
                && !l.starts_with("from ")
        })
        .collect();
    script.trim().chars().count() <= MAX_NAV_CHARS
        && !meaningful.is_empty()
        && meaningful.len() <= 3
        && meaningful.iter().all(|l| NAV_MARKERS.iter().any(|m| l.contains(m)))
}

/// L2 动作缓存
pub struct ActionCache {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: ActionCacheSection,
}

impl ActionCache {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>, settings: ActionCacheSection) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &ActionCacheSection {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// 三个维度并发嵌入；任一失败或为空向量则返回 None
    async fn embed_facets(&self, goal: &str, method_hints: &str, context: &str) -> Option<FacetQuery> {
        let (g, m, c) = join3(
            self.embedder.embed(goal),
            self.embedder.embed(method_hints),
            self.embedder.embed(context),
        )
        .await;
        match (g, m, c) {
            (Ok(goal), Ok(method), Ok(context))
                if !goal.is_empty() && !method.is_empty() && !context.is_empty() =>
            {
                Some(FacetQuery {
                    goal,
                    method,
                    context,
                })
            }
            (g, m, c) => {
                let reason = [g.err(), m.err(), c.err()]
                    .into_iter()
                    .flatten()
                    .next()
                    .unwrap_or_else(|| "empty embedding".to_string());
                tracing::warn!(error = %reason, "action cache embedding degraded to miss");
                None
            }
        }
    }

    /// 使用配置中的权重与阈值检索
    pub async fn lookup(&self, goal: &str, method_hints: &str, context: &str) -> Option<RetrievalResult> {
        let weights = self.settings.weights;
        let threshold = self.settings.threshold;
        self.lookup_with(goal, method_hints, context, &weights, threshold).await
    }

    /// 加权混合检索；嵌入失败、存储故障、无候选、低于阈值均为 None
    pub async fn lookup_with(
        &self,
        goal: &str,
        method_hints: &str,
        context: &str,
        weights: &FacetWeights,
        threshold: f32,
    ) -> Option<RetrievalResult> {
        if !self.settings.enabled {
            return None;
        }
        let candidates = match self.store.candidates() {
            Ok(c) if c.is_empty() => {
                tracing::debug!("action cache empty");
                return None;
            }
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "action cache store degraded to miss");
                return None;
            }
        };
        let query = self.embed_facets(goal, method_hints, context).await?;
        let scored = candidates
            .into_iter()
            .map(|entry| {
                let facets = query.scores(&entry);
                (entry, facets)
            })
            .collect();
        let result = select_best(scored, weights, threshold, self.settings.tie_epsilon);
        match &result {
            Some(r) => tracing::info!(id = %r.entry.id, score = r.score, "action cache hit"),
            None => tracing::info!(goal, "action cache miss"),
        }
        result
    }

    /// 写入已验证脚本；过短、纯跳转的脚本不写入。
    /// 近似重复时已有条目的脚本与原始任务保持不变，只刷新排序用的命中计数。
    pub async fn store(
        &self,
        goal: &str,
        method_hints: &str,
        context: &str,
        script: VerifiedScript,
        original_task: &str,
    ) -> StoreOutcome {
        if !self.settings.enabled {
            return StoreOutcome::Disabled;
        }
        let code = script.into_inner();
        if code.trim().chars().count() < self.settings.min_script_chars {
            tracing::debug!("action cache skip: script too short");
            return StoreOutcome::SkippedShort;
        }
        if is_navigation_only(&code) {
            tracing::debug!("action cache skip: navigation-only script");
            return StoreOutcome::SkippedNavigation;
        }
        let Some(query) = self.embed_facets(goal, method_hints, context).await else {
            return StoreOutcome::Failed("embedding unavailable".to_string());
        };

        let weights = self.settings.weights.normalized();
        let duplicate = self.store.candidates().ok().and_then(|candidates| {
            candidates
                .into_iter()
                .map(|e| {
                    let score = query.scores(&e).composite(&weights);
                    (e, score)
                })
                .filter(|(_, score)| *score >= self.settings.duplicate_threshold)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        });

        if let Some((existing, score)) = duplicate {
            let id = existing.id.clone();
            let refreshed = self.store.update(&id, &mut |e: &mut ActionEntry| e.hit_count += 1);
            return match refreshed {
                Ok(_) => {
                    tracing::info!(id = %id, score, "action cache refreshed duplicate entry");
                    StoreOutcome::Refreshed(id)
                }
                Err(e) => StoreOutcome::Failed(e.to_string()),
            };
        }

        let entry = ActionEntry {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            method_hints: method_hints.to_string(),
            context: context.to_string(),
            goal_embedding: query.goal,
            method_embedding: query.method,
            context_embedding: query.context,
            original_task: original_task.to_string(),
            script: code,
            created_at: Utc::now(),
            hit_count: 0,
            fail_count: 0,
        };
        let id = entry.id.clone();
        match self.store.upsert(entry) {
            Ok(()) => {
                tracing::info!(id = %id, "action cache stored");
                StoreOutcome::Stored(id)
            }
            Err(e) => {
                tracing::warn!(error = %e, "action cache store failed");
                StoreOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn record_hit(&self, id: &str) {
        if let Err(e) = self.store.update(id, &mut |e: &mut ActionEntry| e.hit_count += 1) {
            tracing::debug!(error = %e, "action cache hit not recorded");
        }
    }

    /// 失败计数达到上限的条目被淘汰
    pub fn record_failure(&self, id: &str) {
        let max_failures = self.settings.max_failures.max(1);
        let mut evict = false;
        let updated = self.store.update(id, &mut |e: &mut ActionEntry| {
            e.fail_count += 1;
            evict = e.fail_count >= max_failures;
        });
        if let Err(e) = updated {
            tracing::debug!(error = %e, "action cache failure not recorded");
            return;
        }
        if evict {
            match self.store.remove(id) {
                Ok(_) => tracing::info!(id, "action cache entry evicted after repeated failures"),
                Err(e) => tracing::warn!(error = %e, "action cache eviction failed"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.store.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::vector::InMemoryVectorStore;
    use crate::llm::mock::{FailingEmbedder, MockEmbedder};
    use chrono::Duration;

    const SCRIPT: &str = "const box = document.querySelector('input[name=q]');\nbox.value = 'sea';\nbox.form.submit();";

    fn entry(id: &str, age_secs: i64) -> ActionEntry {
        let mut e = ActionEntry::for_test(id, SCRIPT);
        e.created_at = Utc::now() - Duration::seconds(age_secs);
        e
    }

    fn facets(goal: f32, context: f32) -> FacetScores {
        FacetScores {
            goal,
            method: 0.0,
            context,
        }
    }

    fn cache(embedder: Arc<dyn EmbeddingProvider>) -> ActionCache {
        let settings = ActionCacheSection {
            threshold: 0.7,
            ..ActionCacheSection::default()
        };
        ActionCache::new(Arc::new(InMemoryVectorStore::default()), embedder, settings)
    }

    #[test]
    fn test_weighted_selection_prefers_goal_heavy_candidate() {
        let weights = FacetWeights::new(0.6, 0.0, 0.4);
        let scored = vec![(entry("b", 10), facets(0.5, 0.95)), (entry("a", 20), facets(0.9, 0.5))];
        let best = select_best(scored, &weights, 0.7, 1e-3).unwrap();
        assert_eq!(best.entry.id, "a");
        assert!((best.score - 0.74).abs() < 1e-4);
    }

    #[test]
    fn test_below_threshold_is_miss() {
        let weights = FacetWeights::new(0.6, 0.0, 0.4);
        let scored = vec![(entry("a", 0), facets(0.9, 0.5))];
        assert!(select_best(scored, &weights, 0.75, 1e-3).is_none());
    }

    #[test]
    fn test_tie_prefers_most_recent() {
        let weights = FacetWeights::new(1.0, 0.0, 0.0);
        let scored = vec![
            (entry("old", 3600), facets(0.9500, 0.0)),
            (entry("new", 5), facets(0.9495, 0.0)),
            (entry("far", 1), facets(0.90, 0.0)),
        ];
        let best = select_best(scored, &weights, 0.5, 1e-3).unwrap();
        assert_eq!(best.entry.id, "new");
    }

    #[test]
    fn test_empty_candidates_is_miss() {
        assert!(select_best(vec![], &FacetWeights::default(), 0.0, 1e-3).is_none());
    }

    #[test]
    fn test_navigation_only_detection() {
        assert!(is_navigation_only("tab.get('https://example.com')"));
        assert!(is_navigation_only("// go\nwindow.location.href = 'https://a.com';"));
        assert!(!is_navigation_only(SCRIPT));
    }

    #[test]
    fn test_mixed_short_script_with_redirect_is_cacheable() {
        let fill_submit_redirect = "document.querySelector('#kw').value = 'sea';\n\
                                    document.querySelector('#form').submit();\n\
                                    location.href = 'https://www.baidu.com/s?wd=sea';";
        assert!(!is_navigation_only(fill_submit_redirect));

        let long_redirect = format!("window.location.href = 'https://a.com/?q={}';", "x".repeat(220));
        assert!(!is_navigation_only(&long_redirect));
    }

    #[tokio::test]
    async fn test_store_then_lookup_same_facets_hits() {
        let cache = cache(Arc::new(MockEmbedder::default()));
        let outcome = cache
            .store("search for sea", "search_box: input[name=q]", "example.com", VerifiedScript::new(SCRIPT), "search sea")
            .await;
        assert!(matches!(outcome, StoreOutcome::Stored(_)));
        let hit = cache
            .lookup("search for sea", "search_box: input[name=q]", "example.com")
            .await
            .unwrap();
        assert_eq!(hit.entry.original_task, "search sea");
        assert!(hit.score > 0.99);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_miss() {
        let store = Arc::new(InMemoryVectorStore::default());
        store.upsert(entry("a", 0)).unwrap();
        let cache = ActionCache::new(store, Arc::new(FailingEmbedder), ActionCacheSection::default());
        assert!(cache.lookup("g", "m", "c").await.is_none());
    }

    #[tokio::test]
    async fn test_short_and_duplicate_scripts() {
        let cache = cache(Arc::new(MockEmbedder::default()));
        let short = cache.store("g", "m", "c", VerifiedScript::new("x()"), "t").await;
        assert_eq!(short, StoreOutcome::SkippedShort);

        let first = cache.store("goal text", "method", "ctx", VerifiedScript::new(SCRIPT), "t1").await;
        let second = cache.store("goal text", "method", "ctx", VerifiedScript::new(SCRIPT), "t2").await;
        match (first, second) {
            (StoreOutcome::Stored(a), StoreOutcome::Refreshed(b)) => assert_eq!(a, b),
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_store_keeps_original_script() {
        let cache = cache(Arc::new(MockEmbedder::default()));
        let v2 = "const box = document.querySelector('#other');\nbox.value = 'changed';\nbox.form.submit();";
        let StoreOutcome::Stored(id) = cache.store("goal text", "method", "ctx", VerifiedScript::new(SCRIPT), "t1").await
        else {
            panic!("expected stored");
        };
        let second = cache.store("goal text", "method", "ctx", VerifiedScript::new(v2), "t2").await;
        assert_eq!(second, StoreOutcome::Refreshed(id.clone()));

        let hit = cache.lookup("goal text", "method", "ctx").await.unwrap();
        assert_eq!(hit.entry.id, id);
        assert_eq!(hit.entry.script, SCRIPT);
        assert_eq!(hit.entry.original_task, "t1");
        assert_eq!(hit.entry.hit_count, 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_evict() {
        let cache = cache(Arc::new(MockEmbedder::default()));
        let StoreOutcome::Stored(id) = cache.store("goal", "method", "ctx", VerifiedScript::new(SCRIPT), "t").await else {
            panic!("expected stored");
        };
        cache.record_failure(&id);
        cache.record_failure(&id);
        assert_eq!(cache.len(), 1);
        cache.record_failure(&id);
        assert!(cache.is_empty());
    }
}
