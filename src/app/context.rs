use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::adapter::PlatformInterface;

use super::reload::ReloadNotifier;

/// Shared lifetime context handed to every component of a box.
#[derive(Clone)]
pub struct BoxContext {
    pub token: CancellationToken,
    pub pause: PauseManager,
    pub reload: ReloadNotifier,
    pub platform: Option<Arc<dyn PlatformInterface>>,
}

impl BoxContext {
    pub fn new(
        parent: Option<&CancellationToken>,
        reload: ReloadNotifier,
        platform: Option<Arc<dyn PlatformInterface>>,
    ) -> Self {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            token,
            pause: PauseManager::new(),
            reload,
            platform,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// 暂停协调：设备休眠时后台任务应暂停工作
#[derive(Clone, Debug)]
pub struct PauseManager {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseManager {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
        tracing::debug!("device paused");
    }

    pub fn wake(&self) {
        self.tx.send_replace(false);
        tracing::debug!("device woke");
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the device is (or becomes) active.
    pub async fn wait_active(&self) {
        let mut rx = self.tx.subscribe();
        // 发送端由 self 持有，不会关闭
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl Default for PauseManager {
    fn default() -> Self {
        Self::new()
    }
}
