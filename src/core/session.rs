//! 会话取消注册表
//!
//! 每个正在运行的会话持有一个 CancellationToken；cancel(session) 只影响该会话，
//! cancel_all 用于进程退出（Ctrl+C / SIGTERM）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone)]
pub struct SessionRegistry {
    root: CancellationToken,
    sessions: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为会话创建（或复用未取消的）令牌；根令牌取消时所有子令牌一同取消
    pub fn token(&self, session_id: &str) -> CancellationToken {
        let Ok(mut sessions) = self.sessions.lock() else {
            return self.root.child_token();
        };
        match sessions.get(session_id) {
            Some(t) if !t.is_cancelled() => t.clone(),
            _ => {
                let t = self.root.child_token();
                sessions.insert(session_id.to_string(), t.clone());
                t
            }
        }
    }

    /// 取消单个会话；返回是否存在该会话
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut s| s.remove(session_id));
        match token {
            Some(t) => {
                tracing::info!(session_id, "session cancelled");
                t.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        tracing::info!("cancelling all sessions");
        self.root.cancel();
        if let Ok(mut s) = self.sessions.lock() {
            s.clear();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 会话结束后移除令牌
    pub fn finish(&self, session_id: &str) {
        if let Ok(mut s) = self.sessions.lock() {
            s.remove(session_id);
        }
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)：收到信号即取消所有会话
    pub fn install_signal_handlers(&self) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling running sessions...");
                registry.cancel_all();
            }
        });

        #[cfg(unix)]
        {
            let registry = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling running sessions...");
                    registry.cancel_all();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_session() {
        let reg = SessionRegistry::new();
        let a = reg.token("a");
        let b = reg.token("b");
        assert!(reg.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!reg.cancel("a"));
    }

    #[test]
    fn test_cancel_all_cascades() {
        let reg = SessionRegistry::new();
        let a = reg.token("a");
        reg.cancel_all();
        assert!(a.is_cancelled());
        assert!(reg.is_shutdown());
    }

    #[test]
    fn test_token_reused_until_cancelled() {
        let reg = SessionRegistry::new();
        let a1 = reg.token("a");
        let a2 = reg.token("a");
        a1.cancel();
        assert!(a2.is_cancelled());
        let a3 = reg.token("a");
        assert!(!a3.is_cancelled());
    }
}
