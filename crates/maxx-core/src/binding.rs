use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOutcome {
    Bound(i64),
    TimedOut,
    Cancelled,
}

/// Parks project-less requests until an operator binds their session.
#[derive(Clone, Default)]
pub struct BindingHub {
    waiters: Arc<Mutex<HashMap<String, broadcast::Sender<i64>>>>,
}

impl BindingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait_for_binding(
        &self,
        session_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BindingOutcome {
        let mut rx = {
            let mut waiters = self.waiters.lock().await;
            waiters
                .entry(session_id.to_string())
                .or_insert_with(|| broadcast::channel(4).0)
                .subscribe()
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => BindingOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => BindingOutcome::TimedOut,
            received = rx.recv() => match received {
                Ok(project_id) => BindingOutcome::Bound(project_id),
                Err(_) => BindingOutcome::TimedOut,
            },
        };

        let mut waiters = self.waiters.lock().await;
        if let Some(tx) = waiters.get(session_id)
            && tx.receiver_count() == 0
        {
            waiters.remove(session_id);
        }
        outcome
    }

    /// Called by the operator surface once a session gets a project.
    pub async fn notify_bound(&self, session_id: &str, project_id: i64) {
        if let Some(tx) = self.waiters.lock().await.get(session_id) {
            let _ = tx.send(project_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_resolves_waiter() {
        let hub = BindingHub::new();
        let cancel = CancellationToken::new();
        let hub2 = hub.clone();
        let waiter = tokio::spawn(async move {
            hub2.wait_for_binding("s1", Duration::from_secs(5), &CancellationToken::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.notify_bound("s1", 7).await;
        assert_eq!(waiter.await.unwrap(), BindingOutcome::Bound(7));
        drop(cancel);
    }

    #[tokio::test]
    async fn timeout_rejects_waiter() {
        let hub = BindingHub::new();
        let outcome = hub
            .wait_for_binding("s1", Duration::from_millis(30), &CancellationToken::new())
            .await;
        assert_eq!(outcome, BindingOutcome::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_wins_over_timeout() {
        let hub = BindingHub::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = hub
            .wait_for_binding("s1", Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(outcome, BindingOutcome::Cancelled);
    }
}
