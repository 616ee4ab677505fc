//! 演练环境（无浏览器时使用）
//!
//! 不执行脚本，只识别其中的跳转语句更新当前地址，并回显脚本摘要。

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use async_trait::async_trait;
use regex::Regex;

use crate::capability::{EnvironmentHandle, ExecutionCapability, ExecutionResult, RawObservation};
use crate::core::AgentError;

fn navigation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:location(?:\.href)?\s*=|location\.assign\(|goto\(|navigate\(|get\()\s*['"`]([^'"`]+)['"`]"#)
            .expect("valid navigation regex")
    })
}

#[derive(Debug, Default)]
pub struct DryRunEnvironment {
    pages: RwLock<HashMap<String, String>>,
    start_url: Option<String>,
}

impl DryRunEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新会话的初始地址
    pub fn with_start_url(mut self, url: impl Into<String>) -> Self {
        self.start_url = Some(url.into());
        self
    }

    fn current(&self, session_id: &str) -> String {
        self.pages
            .read()
            .ok()
            .and_then(|p| p.get(session_id).cloned())
            .or_else(|| self.start_url.clone())
            .unwrap_or_else(|| "about:blank".to_string())
    }
}

#[async_trait]
impl ExecutionCapability for DryRunEnvironment {
    async fn capture(&self, handle: &EnvironmentHandle) -> Result<RawObservation, AgentError> {
        let source_id = self.current(&handle.session_id);
        Ok(RawObservation {
            structure: format!("body\n  main \"dry-run page for {source_id}\""),
            source_id,
        })
    }

    async fn execute(&self, script: &str, handle: &EnvironmentHandle) -> Result<ExecutionResult, AgentError> {
        if let Some(url) = navigation_re().captures(script).and_then(|c| c.get(1)) {
            if let Ok(mut pages) = self.pages.write() {
                pages.insert(handle.session_id.clone(), url.as_str().to_string());
            }
        }
        let preview: String = script.chars().take(120).collect();
        tracing::info!(session_id = %handle.session_id, "dry-run execute");
        Ok(ExecutionResult::ok(format!("dry-run: {preview}")).with_source(self.current(&handle.session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_navigation_updates_source() {
        let env = DryRunEnvironment::new();
        let handle = EnvironmentHandle::new("s1", "");
        assert_eq!(env.capture(&handle).await.unwrap().source_id, "about:blank");
        let r = env
            .execute("window.location.href = 'https://www.baidu.com';", &handle)
            .await
            .unwrap();
        assert!(r.success);
        assert_eq!(r.source_id.as_deref(), Some("https://www.baidu.com"));
        let other = EnvironmentHandle::new("s2", "");
        assert_eq!(env.capture(&other).await.unwrap().source_id, "about:blank");
    }

    #[tokio::test]
    async fn test_start_url() {
        let env = DryRunEnvironment::new().with_start_url("https://example.com");
        let handle = EnvironmentHandle::new("s1", "");
        assert_eq!(env.capture(&handle).await.unwrap().source_id, "https://example.com");
    }
}
