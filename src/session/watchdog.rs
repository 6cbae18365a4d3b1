use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

use crate::lock;
use crate::model::state::WatchdogPhase;

struct Armed {
    generation: u64,
    phase: WatchdogPhase,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatchdogState {
    generation: u64,
    armed: Option<Armed>,
}

/// A single phase timer. Arming replaces whatever was armed before.
#[derive(Default)]
pub(crate) struct Watchdog {
    state: Arc<Mutex<WatchdogState>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` once `limit` elapses, unless disarmed or re-armed first.
    ///
    /// A firing watchdog removes itself before running `on_fire`, so the
    /// callback may disarm or re-arm without cancelling itself.
    pub fn arm<F>(&self, phase: WatchdogPhase, limit: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&*self.state);
        state.generation += 1;
        let generation = state.generation;
        let shared = self.state.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let fired = {
                let mut state = lock(&*shared);
                let current = state.armed.as_ref().map(|a| a.generation) == Some(generation);
                if current {
                    state.armed = None;
                }
                current
            };
            if fired {
                debug!("Watchdog {:?} fired after {:?}", phase, limit);
                on_fire.await;
            }
        });

        if let Some(previous) = state.armed.replace(Armed {
            generation,
            phase,
            task,
        }) {
            previous.task.abort();
        }
    }

    pub fn disarm(&self) {
        if let Some(armed) = lock(&*self.state).armed.take() {
            debug!("Watchdog {:?} disarmed", armed.phase);
            armed.task.abort();
        }
    }

    #[cfg(test)]
    pub fn armed_phase(&self) -> Option<WatchdogPhase> {
        lock(&*self.state).armed.as_ref().map(|a| a.phase)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_limit() {
        let watchdog = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watchdog.arm(WatchdogPhase::Connected, Duration::from_secs(4), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(watchdog.armed_phase(), Some(WatchdogPhase::Connected));

        tokio::time::sleep(Duration::from_millis(3999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.armed_phase(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let watchdog = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = fired.clone();
        watchdog.arm(WatchdogPhase::Connecting, Duration::from_secs(1), async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = fired.clone();
        watchdog.arm(WatchdogPhase::Connected, Duration::from_secs(5), async move {
            second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_fire() {
        let watchdog = Watchdog::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        watchdog.arm(WatchdogPhase::ServiceDiscovery, Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        watchdog.disarm();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
