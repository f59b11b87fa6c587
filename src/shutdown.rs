//! Process shutdown.
//!
//! On Ctrl-C the manager cancels the shared token (which closes the
//! transport's listening socket), aborts every registered task and exits
//! immediately. Queued outbound packets are not drained.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Coordinates termination of the daemon's tasks
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Cancel the token and abort every registered task.
    pub fn shutdown(&mut self) {
        self.cancel_token.cancel();
        for handle in self.task_handles.drain(..) {
            handle.abort();
        }
    }

    /// Wait for ctrl+c, tear everything down and exit the process.
    pub async fn wait_for_shutdown(mut self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }

        tracing::info!("🛑 Shutdown signal received, exiting");
        self.shutdown();
        std::process::exit(0);
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_cancels_and_aborts() {
        let mut manager = ShutdownManager::new();
        let token = manager.token();

        let cooperative = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        let stubborn = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        manager.register_task(stubborn);
        assert_eq!(manager.task_count(), 1);

        manager.shutdown();
        assert!(token.is_cancelled());
        assert_eq!(manager.task_count(), 0);
        tokio::time::timeout(Duration::from_secs(1), cooperative)
            .await
            .unwrap()
            .unwrap();
    }
}
