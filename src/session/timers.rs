//! Live-timers registry
//!
//! Every timer armed during a call is tracked here so teardown can cancel all
//! of them. A timer that fires after being cancelled or re-armed is detected by
//! its generation and reported as stale by [`Timers::settle`].

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notification delivered when a timer elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fired<K> {
    pub key: K,
    generation: u64,
}

/// Registry of armed timers keyed by `K`
pub struct Timers<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    tx: mpsc::UnboundedSender<Fired<K>>,
    live: HashMap<K, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl<K> Timers<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create a registry and the receiver its timers fire into
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Fired<K>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Self {
            tx,
            live: HashMap::new(),
            next_generation: 0,
        };
        (timers, rx)
    }

    /// Arm `key` to fire after `delay`, replacing any timer already armed for it
    pub fn arm(&mut self, key: K, delay: Duration) {
        self.cancel(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let fired_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Fired {
                key: fired_key,
                generation,
            });
        });

        self.live.insert(key, (generation, handle));
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.live.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every armed timer
    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.live.drain() {
            handle.abort();
        }
    }

    /// Retire a fired timer. Returns `false` when the notification is stale
    /// (the timer was cancelled or re-armed after it fired).
    pub fn settle(&mut self, fired: &Fired<K>) -> bool {
        match self.live.get(&fired.key) {
            Some((generation, _)) if *generation == fired.generation => {
                self.live.remove(&fired.key);
                true
            }
            _ => false,
        }
    }

    /// Number of timers still armed
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<K> Drop for Timers<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut timers, mut rx) = Timers::channel();
        timers.arm("warn", Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.key, "warn");
        assert!(timers.settle(&fired));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_prevents_firing() {
        let (mut timers, mut rx) = Timers::channel();
        timers.arm(1u32, Duration::from_millis(10));
        timers.arm(2u32, Duration::from_millis(20));
        assert_eq!(timers.len(), 2);

        timers.cancel_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearmed_timer_reports_old_fire_as_stale() {
        let (mut timers, mut rx) = Timers::channel();
        timers.arm("poll", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(15)).await;
        let old = rx.recv().await.unwrap();

        // Re-armed before the old notification was handled
        timers.arm("poll", Duration::from_millis(10));
        assert!(!timers.settle(&old));
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let new = rx.recv().await.unwrap();
        assert!(timers.settle(&new));
    }
}
