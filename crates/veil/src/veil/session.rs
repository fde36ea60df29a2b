use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::task::JoinSet;

use crate::veil::telemetry;

pub fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("s{n}")
}

/// Counts a session in the active gauge for as long as it is alive.
pub struct ActiveSessionGuard;

impl ActiveSessionGuard {
    pub fn new() -> Self {
        metrics::counter!(telemetry::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(telemetry::ACTIVE_SESSIONS).increment(1.0);
        Self
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::ACTIVE_SESSIONS).decrement(1.0);
    }
}

/// Owns every live session task of one listener.
///
/// Nothing is detached: finished sessions are reaped as the accept loop
/// goes, and whatever is left at shutdown is drained or aborted.
#[derive(Default)]
pub struct SessionSet {
    tasks: JoinSet<()>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(session);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Collects sessions that have already finished, without waiting.
    pub fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            log_join(res);
        }
    }

    /// Waits up to `grace` for the remaining sessions, then aborts the rest.
    /// Returns how many sessions had to be aborted.
    pub async fn drain(&mut self, grace: Duration) -> usize {
        let wait_all = async {
            while let Some(res) = self.tasks.join_next().await {
                log_join(res);
            }
        };
        if tokio::time::timeout(grace, wait_all).await.is_ok() {
            return 0;
        }

        let aborted = self.tasks.len();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        aborted
    }
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            tracing::error!(err = %err, "session: task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
    }

    #[tokio::test]
    async fn reap_collects_finished_sessions() {
        let mut set = SessionSet::new();
        for _ in 0..3 {
            set.spawn(async {});
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        set.reap();
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_quick_sessions() {
        let done = Arc::new(AtomicUsize::new(0));
        let mut set = SessionSet::new();
        for _ in 0..4 {
            let done = done.clone();
            set.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(set.drain(Duration::from_secs(2)).await, 0);
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn drain_aborts_stuck_sessions() {
        let mut set = SessionSet::new();
        set.spawn(std::future::pending());
        set.spawn(async {});
        let aborted = set.drain(Duration::from_millis(100)).await;
        assert_eq!(aborted, 1);
        assert_eq!(set.len(), 0);
    }
}
