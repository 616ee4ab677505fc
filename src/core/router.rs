//! 路由：静态关键词分类（不调用模型）
//!
//! 规划结果走动作流水线还是知识库流水线，只由关键词表决定；同样的输入永远得到同样的路由。

use serde::{Deserialize, Serialize};

use crate::config::RoutingSection;
use crate::core::state::KnowledgeOp;

/// 路由标签（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTag {
    Action,
    KnowledgeStore,
    KnowledgeQuery,
}

impl RouteTag {
    pub fn knowledge_op(&self) -> Option<KnowledgeOp> {
        match self {
            RouteTag::Action => None,
            RouteTag::KnowledgeStore => Some(KnowledgeOp::Store),
            RouteTag::KnowledgeQuery => Some(KnowledgeOp::Query),
        }
    }
}

/// 完成前的知识库写入标记，写入已完成步骤清单
pub const KNOWLEDGE_STORE_MARK: &str = "[knowledge:store]";

#[derive(Debug, Clone, Default)]
pub struct Router {
    keywords: RoutingSection,
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    let lowered = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .any(|k| lowered.contains(&k.to_lowercase()))
}

impl Router {
    pub fn new(keywords: RoutingSection) -> Self {
        Self { keywords }
    }

    /// 写入关键词优先于问答关键词
    pub fn classify(&self, step: &str) -> RouteTag {
        if contains_any(step, &self.keywords.store_keywords) {
            RouteTag::KnowledgeStore
        } else if contains_any(step, &self.keywords.query_keywords) {
            RouteTag::KnowledgeQuery
        } else {
            RouteTag::Action
        }
    }

    /// 用户任务要求写入知识库，且已完成步骤中还没有写入记录
    pub fn needs_knowledge_store(&self, user_task: &str, finished_steps: &[String]) -> bool {
        if !contains_any(user_task, &self.keywords.goal_keywords) {
            return false;
        }
        !finished_steps.iter().any(|s| {
            s.contains(KNOWLEDGE_STORE_MARK) || contains_any(s, &self.keywords.done_keywords)
        })
    }

    /// 同一会话上的新任务是否延续旧任务：含延续关键词，或提到当前域名
    pub fn is_continuation(&self, new_task: &str, current_source: &str) -> bool {
        if contains_any(new_task, &self.keywords.continue_keywords) {
            return true;
        }
        let domain = domain_of(current_source);
        !domain.is_empty() && new_task.to_lowercase().contains(&domain)
    }
}

fn domain_of(source: &str) -> String {
    let rest = source.split_once("://").map(|(_, r)| r).unwrap_or(source);
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host.strip_prefix("www.").unwrap_or(host).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(RoutingSection::default())
    }

    #[test]
    fn test_classify_is_deterministic_keyword_match() {
        let r = router();
        assert_eq!(r.classify("1. 打开百度并搜索大海"), RouteTag::Action);
        assert_eq!(r.classify("把抓取结果存入知识库"), RouteTag::KnowledgeStore);
        assert_eq!(r.classify("查询知识库: 大海有多深"), RouteTag::KnowledgeQuery);
        assert_eq!(r.classify("Store in knowledge base"), RouteTag::KnowledgeStore);
        assert_eq!(r.classify("把抓取结果存入知识库"), r.classify("把抓取结果存入知识库"));
    }

    #[test]
    fn test_knowledge_gate() {
        let r = router();
        assert!(r.needs_knowledge_store("抓取新闻并存入知识库", &[]));
        assert!(!r.needs_knowledge_store(
            "抓取新闻并存入知识库",
            &[format!("{KNOWLEDGE_STORE_MARK} 写入 12 条")]
        ));
        assert!(!r.needs_knowledge_store("抓取新闻", &[]));
    }

    #[test]
    fn test_task_continuity() {
        let r = router();
        assert!(r.is_continuation("继续抓取下一页", "https://news.example.com/list"));
        assert!(r.is_continuation("open news.example.com hot list", "https://www.news.example.com/"));
        assert!(!r.is_continuation("search github for rust", "https://news.example.com/list"));
        assert!(!r.is_continuation("search anything", ""));
    }
}
