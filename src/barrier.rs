use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct BarrierState {
    pending_reloads: usize,
    in_flight: usize,
}

/// Two-counter barrier coordinating pool mutation with in-flight requests.
///
/// A reload raises `pending_reloads`, waits for `in_flight` to drain to zero,
/// mutates the pool while holding its write lock, then lowers the counter. A
/// request waits while any reload is pending, then registers itself as
/// in-flight for its whole lifetime. The result: a request observes exactly
/// one pool generation, and a reload never runs while a request holds a pool
/// reference.
pub struct ReloadBarrier {
    state: Mutex<BarrierState>,
    reload_cleared: Notify,
    drained: Notify,
}

impl ReloadBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            reload_cleared: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Gate a request into the current pool generation. Blocks while a reload
    /// is pending. The returned guard keeps the generation pinned until drop.
    pub async fn enter_request(self: &Arc<Self>) -> InFlightGuard {
        loop {
            let cleared = self.reload_cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.pending_reloads == 0 {
                    state.in_flight += 1;
                    return InFlightGuard { barrier: Arc::clone(self) };
                }
            }

            cleared.await;
        }
    }

    /// Wait until no reload is pending, without registering as in-flight.
    /// Used by the health-check driver so it never probes a stale generation.
    pub async fn wait_until_clear(&self) {
        loop {
            let cleared = self.reload_cleared.notified();
            tokio::pin!(cleared);
            cleared.as_mut().enable();

            if self.state.lock().unwrap().pending_reloads == 0 {
                return;
            }

            cleared.await;
        }
    }

    /// Announce a reload and wait for every in-flight request to finish. New
    /// requests queue behind the returned guard until it is dropped.
    pub async fn begin_reload(self: &Arc<Self>) -> ReloadGuard {
        self.state.lock().unwrap().pending_reloads += 1;

        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.state.lock().unwrap().in_flight == 0 {
                return ReloadGuard { barrier: Arc::clone(self) };
            }

            drained.await;
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}

impl Default for ReloadBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the in-flight registration on any exit path.
pub struct InFlightGuard {
    barrier: Arc<ReloadBarrier>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 && state.pending_reloads > 0 {
            self.barrier.drained.notify_waiters();
        }
    }
}

pub struct ReloadGuard {
    barrier: Arc<ReloadBarrier>,
}

impl Drop for ReloadGuard {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock().unwrap();
        state.pending_reloads -= 1;
        if state.pending_reloads == 0 {
            self.barrier.reload_cleared.notify_waiters();
        }
    }
}
