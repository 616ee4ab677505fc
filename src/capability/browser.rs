//! Headless Chrome 执行环境
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 每个会话一个 Tab；capture 抽取 DOM 骨架，execute 以 async 函数体执行 JavaScript。
//! headless_chrome 是同步 API，所有调用放在 spawn_blocking 中。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, Tab};

use crate::capability::{EnvironmentHandle, ExecutionCapability, ExecutionResult, RawObservation};
use crate::core::AgentError;

/// 抽取可见元素骨架：每行 `tag#id.class [属性] "文本"`，交互元素带 name/type/href
const SKELETON_JS: &str = r#"
(function() {
    const lines = [];
    const walk = (el, depth) => {
        if (depth > 25 || lines.length > 1500) return;
        const style = window.getComputedStyle(el);
        if (style && (style.display === 'none' || style.visibility === 'hidden')) return;
        const tag = el.tagName.toLowerCase();
        if (['script', 'style', 'noscript', 'svg', 'meta', 'link'].includes(tag)) return;
        let line = '  '.repeat(depth) + tag;
        if (el.id) line += '#' + el.id;
        if (typeof el.className === 'string' && el.className.trim()) {
            line += '.' + el.className.trim().split(/\s+/).slice(0, 3).join('.');
        }
        for (const attr of ['name', 'type', 'href', 'placeholder', 'aria-label', 'role']) {
            const v = el.getAttribute(attr);
            if (v) line += ' [' + attr + '=' + v.substring(0, 80) + ']';
        }
        const own = Array.from(el.childNodes)
            .filter(n => n.nodeType === Node.TEXT_NODE)
            .map(n => n.textContent.trim())
            .join(' ')
            .trim();
        if (own) line += ' "' + own.substring(0, 60) + '"';
        lines.push(line);
        for (const child of el.children) walk(child, depth + 1);
    };
    if (document.body) walk(document.body, 0);
    return lines.join('\n');
})()
"#;

pub struct ChromeEnvironment {
    browser: Arc<RwLock<Option<Browser>>>,
    tabs: Arc<RwLock<HashMap<String, Arc<Tab>>>>,
    settle: Duration,
}

impl Default for ChromeEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl ChromeEnvironment {
    pub fn new() -> Self {
        Self {
            browser: Arc::new(RwLock::new(None)),
            tabs: Arc::new(RwLock::new(HashMap::new())),
            settle: Duration::from_millis(500),
        }
    }

    /// 取会话的 Tab，首次使用时启动浏览器并打开新 Tab
    fn tab_for(
        browser: &RwLock<Option<Browser>>,
        tabs: &RwLock<HashMap<String, Arc<Tab>>>,
        session_id: &str,
    ) -> Result<Arc<Tab>, String> {
        if let Some(tab) = tabs.read().map_err(|e| e.to_string())?.get(session_id) {
            return Ok(tab.clone());
        }
        let mut guard = browser.write().map_err(|e| e.to_string())?;
        if guard.is_none() {
            let launched = Browser::default().map_err(|e| format!("Chrome launch failed: {}", e))?;
            *guard = Some(launched);
        }
        let Some(b) = guard.as_ref() else {
            return Err("browser unavailable".to_string());
        };
        let tab = b.new_tab().map_err(|e| format!("Browser tab failed: {}", e))?;
        tabs.write()
            .map_err(|e| e.to_string())?
            .insert(session_id.to_string(), tab.clone());
        Ok(tab)
    }

    /// 关闭会话的 Tab
    pub fn close_session(&self, session_id: &str) {
        let tab = self.tabs.write().ok().and_then(|mut t| t.remove(session_id));
        if let Some(tab) = tab {
            if let Err(e) = tab.close(false) {
                tracing::debug!(error = %e, "tab close failed");
            }
        }
    }
}

fn value_to_output(value: Option<serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl ExecutionCapability for ChromeEnvironment {
    async fn capture(&self, handle: &EnvironmentHandle) -> Result<RawObservation, AgentError> {
        let browser = Arc::clone(&self.browser);
        let tabs = Arc::clone(&self.tabs);
        let session_id = handle.session_id.clone();

        tokio::task::spawn_blocking(move || {
            let tab = Self::tab_for(&browser, &tabs, &session_id)?;
            let source_id = tab.get_url();
            let structure = tab
                .evaluate(SKELETON_JS, false)
                .map(|r| value_to_output(r.value))
                .map_err(|e| format!("Skeleton extraction failed: {}", e))?;
            Ok::<_, String>(RawObservation { structure, source_id })
        })
        .await
        .map_err(|e| AgentError::capability("environment", format!("Task join: {}", e)))?
        .map_err(|e| AgentError::capability("environment", e))
    }

    async fn execute(&self, script: &str, handle: &EnvironmentHandle) -> Result<ExecutionResult, AgentError> {
        let browser = Arc::clone(&self.browser);
        let tabs = Arc::clone(&self.tabs);
        let session_id = handle.session_id.clone();
        let settle = self.settle;
        let js = format!("(async () => {{\n{script}\n}})()");

        tracing::info!(session_id = %session_id, chars = js.len(), "browser evaluate");

        let result = tokio::task::spawn_blocking(move || {
            let tab = Self::tab_for(&browser, &tabs, &session_id)?;
            let before = tab.get_url();
            let evaluated = tab.evaluate(&js, true);
            std::thread::sleep(settle);
            if tab.get_url() != before {
                if let Err(e) = tab.wait_until_navigated() {
                    tracing::debug!(error = %e, "navigation wait failed");
                }
            }
            let after = tab.get_url();
            let result = match evaluated {
                Ok(obj) => ExecutionResult::ok(value_to_output(obj.value)),
                Err(e) => ExecutionResult::failed(format!("Runtime Error: {}", e)),
            };
            Ok::<_, String>(result.with_source(after))
        })
        .await
        .map_err(|e| AgentError::capability("environment", format!("Task join: {}", e)))?
        .map_err(|e| AgentError::capability("environment", e))?;

        Ok(result)
    }
}
