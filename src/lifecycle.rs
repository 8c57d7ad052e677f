use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// 空闲自动退出的检查间隔
pub const AUTO_QUIT_INTERVAL: Duration = Duration::from_secs(5);

/// Tracks probes whose reports have not reached the quality store yet, and
/// whether any request arrived since the last idle check.
#[derive(Debug, Default)]
pub struct Lifecycle {
    outstanding: AtomicUsize,
    active: AtomicBool,
    settled: Notify,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before `count` probes are dispatched.
    pub fn dispatched(&self, count: usize) {
        self.outstanding.fetch_add(count, Ordering::SeqCst);
    }

    /// Called by the writer once `count` reports are applied and persisted.
    pub fn settled(&self, count: usize) {
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(count))
            })
            .unwrap_or(0);
        if previous <= count {
            self.settled.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn can_quit(&self) -> bool {
        self.outstanding() == 0
    }

    /// Record client activity; delays the next auto-quit.
    pub fn touch(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    fn take_activity(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Resolves once every dispatched probe has been recorded.
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            if self.can_quit() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves at the first check with no activity during the preceding
    /// interval and no outstanding probes.
    pub async fn wait_idle(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let active = self.take_activity();
            if !active && self.can_quit() {
                return;
            }
            debug!(
                "Auto-quit delayed: active={}, outstanding={}",
                active,
                self.outstanding()
            );
        }
    }
}
