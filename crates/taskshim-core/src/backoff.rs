//! Per-key exponential back-off queue, used to throttle repeated retries of
//! the same failing operation (e.g. redelivering an event whose handler
//! keeps erroring) without starving unrelated keys.
//!
//! Each key gets its own FIFO of pending events. While a key has a pending
//! queue, further incoming events for that key are appended rather than
//! attempted (`is_pending`) — a periodic sweep is the only thing that drains
//! a key's queue, in order, stopping at the first failure and re-queuing
//! whatever's left with the delay doubled (capped at `max_delay`).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct KeyState<T> {
    queue: VecDeque<T>,
    delay: Duration,
    next_attempt_at: Instant,
}

pub struct BackoffQueue<T> {
    initial_delay: Duration,
    max_delay: Duration,
    keys: Mutex<HashMap<String, KeyState<T>>>,
}

impl<T> BackoffQueue<T> {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues `item` under `key`. A key with no prior state becomes
    /// eligible for its first retry only after `initial_delay` elapses; a
    /// key already in back-off just gets the item appended to its existing
    /// queue, at its existing delay.
    pub fn push(&self, key: impl Into<String>, item: T) {
        let mut keys = self.keys.lock().unwrap();
        let entry = keys.entry(key.into()).or_insert_with(|| KeyState {
            queue: VecDeque::new(),
            delay: self.initial_delay,
            next_attempt_at: Instant::now() + self.initial_delay,
        });
        entry.queue.push_back(item);
    }

    /// True while `key` has any event pending retry. Callers use this to
    /// gate freshly observed events: one already in back-off is appended to
    /// the existing queue instead of being attempted inline.
    pub fn is_pending(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|s| !s.queue.is_empty())
    }

    /// Takes every key whose delay has elapsed, removing it (and its whole
    /// queue, in FIFO order) from the map. A caller that fails partway
    /// through the returned queue re-establishes the key via
    /// `requeue_after_failure`; one that drains it completely simply lets it
    /// stay gone — equivalent to a clean `record_success`.
    pub fn take_ready(&self) -> Vec<(String, Duration, VecDeque<T>)> {
        let now = Instant::now();
        let mut keys = self.keys.lock().unwrap();
        let due: Vec<String> = keys
            .iter()
            .filter(|(_, s)| s.next_attempt_at <= now && !s.queue.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .filter_map(|k| keys.remove(&k).map(|s| (k, s.delay, s.queue)))
            .collect()
    }

    /// Re-establishes `key`'s back-off state after a mid-drain failure:
    /// `previous_delay` was the delay in effect for the drain that just
    /// failed, so the key's new delay is double that (capped). A no-op if
    /// `remainder` is empty.
    pub fn requeue_after_failure(
        &self,
        key: impl Into<String>,
        previous_delay: Duration,
        remainder: VecDeque<T>,
    ) {
        if remainder.is_empty() {
            return;
        }
        let delay = (previous_delay * 2).min(self.max_delay);
        self.keys.lock().unwrap().insert(
            key.into(),
            KeyState {
                queue: remainder,
                delay,
                next_attempt_at: Instant::now() + delay,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().unwrap().values().all(|s| s.queue.is_empty())
    }
}

/// Runs `take_ready` on a fixed interval for as long as the returned handle
/// is held, invoking `on_ready` once per key that becomes eligible with that
/// key's whole pending queue and the delay that was in effect for it.
pub fn spawn_sweeper<T, F>(
    queue: std::sync::Arc<BackoffQueue<T>>,
    interval: Duration,
    mut on_ready: F,
) -> tokio::task::JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut(String, Duration, VecDeque<T>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (key, delay, items) in queue.take_ready() {
                on_ready(key, delay, items);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_take_ready_yields_whole_queue_once_due() {
        let q = BackoffQueue::new(Duration::from_millis(0), Duration::from_secs(1));
        q.push("k1", "first");
        q.push("k1", "second");
        let mut ready = q.take_ready();
        assert_eq!(ready.len(), 1);
        let (key, _delay, items) = ready.pop().unwrap();
        assert_eq!(key, "k1");
        assert_eq!(items, VecDeque::from(["first", "second"]));
        assert!(q.take_ready().is_empty());
    }

    #[test]
    fn push_is_not_immediately_ready_before_initial_delay_elapses() {
        let q = BackoffQueue::new(Duration::from_millis(200), Duration::from_secs(1));
        q.push("k1", "x");
        assert!(q.take_ready().is_empty());
    }

    #[test]
    fn is_pending_reflects_queue_occupancy() {
        let q = BackoffQueue::new(Duration::from_secs(5), Duration::from_secs(30));
        assert!(!q.is_pending("k1"));
        q.push("k1", "x");
        assert!(q.is_pending("k1"));
    }

    #[test]
    fn requeue_after_failure_sets_doubled_delay_and_keeps_remainder() {
        let q: BackoffQueue<&str> =
            BackoffQueue::new(Duration::from_millis(0), Duration::from_millis(300));
        q.push("k1", "a");
        q.push("k1", "b");
        let (key, delay, mut remainder) = q.take_ready().pop().unwrap();
        // Simulate "a" succeeding, "b" failing: "a" is dropped, "b" remains.
        remainder.pop_front();
        q.requeue_after_failure(key, delay, remainder);

        assert!(q.is_pending("k1"));
        // Not yet ready: the doubled delay hasn't elapsed.
        assert!(q.take_ready().is_empty());
    }

    #[test]
    fn requeue_after_failure_caps_delay_growth() {
        let q: BackoffQueue<&str> =
            BackoffQueue::new(Duration::from_millis(100), Duration::from_millis(150));
        let mut remainder = VecDeque::new();
        remainder.push_back("x");
        q.requeue_after_failure("k1", Duration::from_millis(100), remainder.clone());
        assert_eq!(
            q.keys.lock().unwrap().get("k1").unwrap().delay,
            Duration::from_millis(150)
        );
        // A second failure at the already-capped delay stays capped.
        q.requeue_after_failure("k1", Duration::from_millis(150), remainder);
        assert_eq!(
            q.keys.lock().unwrap().get("k1").unwrap().delay,
            Duration::from_millis(150)
        );
    }

    #[test]
    fn fully_drained_key_leaves_no_state_behind() {
        let q = BackoffQueue::new(Duration::from_millis(0), Duration::from_secs(1));
        q.push("k1", "x");
        let (_key, _delay, _items) = q.take_ready().pop().unwrap();
        // Nothing requeued: the key is simply gone.
        assert!(!q.is_pending("k1"));
        assert!(q.is_empty());
    }

    #[test]
    fn distinct_keys_drain_independently() {
        let q = BackoffQueue::new(Duration::from_millis(0), Duration::from_secs(1));
        q.push("a", 1);
        q.push("b", 2);
        let mut ready = q.take_ready();
        ready.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].0, "a");
        assert_eq!(ready[1].0, "b");
    }
}
