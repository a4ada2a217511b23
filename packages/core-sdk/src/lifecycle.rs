use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/**
 * \brief 进程内关闭钩子。触发后服务优雅关闭监听；重复触发不报错。
 */
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
    triggered: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 请求关闭。返回 true 表示本次调用发起了关闭，false 表示此前已触发。
     */
    pub fn trigger(&self, reason: &str) -> bool {
        let first = !self.triggered.swap(true, Ordering::SeqCst);
        if first {
            tracing::info!(reason, "shutdown requested");
            self.token.cancel();
        } else {
            tracing::debug!(reason, "shutdown already in progress");
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /** \brief 等待关闭被触发。 */
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/**
 * \brief 监听 Ctrl-C 与 SIGTERM（unix），收到后触发关闭。
 */
pub async fn watch_signals(handle: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { handle.trigger("ctrl-c"); }
        _ = terminate => { handle.trigger("SIGTERM"); }
        _ = handle.wait() => {}
    }
}
