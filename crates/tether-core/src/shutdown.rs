//! Server-wide graceful shutdown barrier.
//!
//! Every signal, request and session operation is admitted before it runs
//! and completed when it finishes. Once shutdown begins, new operations are
//! refused and a one-shot "drained" signal fires as soon as the last
//! admitted operation completes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct OpsState {
    shutting_down: bool,
    current_ops: u64,
    drained: bool,
}

/// Tracks in-flight operations and gates new ones during shutdown.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: Mutex<OpsState>,
    drained: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            state: Mutex::new(OpsState::default()),
            drained,
        }
    }

    /// Refuse new operations from now on. Returns `false` if shutdown had
    /// already begun.
    pub fn begin_shutdown(&self) -> bool {
        let fire = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return false;
            }
            state.shutting_down = true;
            tracing::info!(in_flight = state.current_ops, "shutdown started");
            Self::take_drained(&mut state)
        };
        if fire {
            self.fire_drained();
        }
        true
    }

    /// Admit one operation. Returns `false` once shutting down.
    ///
    /// Every `true` must be paired with exactly one [`complete`](Self::complete).
    pub fn admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutting_down {
            return false;
        }
        state.current_ops += 1;
        true
    }

    /// Mark one admitted operation as finished.
    pub fn complete(&self) {
        let fire = {
            let mut state = self.state.lock();
            if state.current_ops == 0 {
                tracing::error!("operation completed without being admitted");
                return;
            }
            state.current_ops -= 1;
            Self::take_drained(&mut state)
        };
        if fire {
            self.fire_drained();
        }
    }

    /// Admit one operation, completing it when the guard drops.
    pub fn try_admit(self: &Arc<Self>) -> Option<OpGuard> {
        self.admit().then(|| OpGuard {
            coordinator: Arc::clone(self),
        })
    }

    fn take_drained(state: &mut OpsState) -> bool {
        if state.shutting_down && state.current_ops == 0 && !state.drained {
            state.drained = true;
            true
        } else {
            false
        }
    }

    fn fire_drained(&self) {
        tracing::info!("all operations drained");
        self.drained.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn current_ops(&self) -> u64 {
        self.state.lock().current_ops
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Wait until shutdown has begun and every admitted operation is done.
    /// Has no timeout of its own.
    pub async fn wait_drained(&self) {
        let mut rx = self.drained.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

/// Completes its admitted operation on drop.
#[derive(Debug)]
#[must_use = "dropping the guard completes the operation"]
pub struct OpGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.coordinator.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_admit_refused_after_begin() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.admit());
        assert!(coordinator.begin_shutdown());
        assert!(!coordinator.begin_shutdown());
        for _ in 0..10 {
            assert!(!coordinator.admit());
        }
        assert_eq!(coordinator.current_ops(), 1);
    }

    #[test]
    fn test_drains_immediately_when_idle() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_drained());
        coordinator.begin_shutdown();
        assert!(coordinator.is_drained());
    }

    #[test]
    fn test_drained_only_after_last_complete() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.admit());
        assert!(coordinator.admit());
        coordinator.begin_shutdown();
        assert!(!coordinator.is_drained());
        coordinator.complete();
        assert!(!coordinator.is_drained());
        coordinator.complete();
        assert!(coordinator.is_drained());
    }

    #[test]
    fn test_unmatched_complete_is_ignored() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.complete();
        assert_eq!(coordinator.current_ops(), 0);
    }

    #[tokio::test]
    async fn test_drained_fires_once_for_all_waiters() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let guards: Vec<_> = (0..8).map(|_| coordinator.try_admit().unwrap()).collect();

        let mut waiters = Vec::new();
        for _ in 0..4 {
            let c = coordinator.clone();
            waiters.push(tokio::spawn(async move { c.wait_drained().await }));
        }

        coordinator.begin_shutdown();
        assert!(coordinator.try_admit().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        let mut rx = coordinator.drained.subscribe();
        drop(guards);
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        coordinator.complete();
        assert!(!rx.has_changed().unwrap(), "drained must fire exactly once");
    }
}
