//! Cloneable, idempotent one-shot stop signal shared between a task that
//! decides to shut down and every task that needs to observe it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Clone)]
pub struct Trigger {
    fired: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Trigger {
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Fires the trigger. Idempotent: firing twice is a no-op the second time.
    pub fn trigger(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already triggered; otherwise waits.
    pub async fn wait_async(&self) {
        if self.is_triggered() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let t = Trigger::new();
        let t2 = t.clone();
        let handle = tokio::spawn(async move {
            t2.wait_async().await;
        });
        assert!(!t.is_triggered());
        t.trigger();
        handle.await.unwrap();
        assert!(t.is_triggered());
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let t = Trigger::new();
        t.trigger();
        t.trigger();
        assert!(t.is_triggered());
    }
}
