use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type Sink<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Pending<V> {
    generation: u64,
    value: V,
    timer: JoinHandle<()>,
}

struct Shared<K, V> {
    pending: Mutex<HashMap<K, Pending<V>>>,
    next_generation: Mutex<u64>,
}

/// Keyed trailing-edge debounce.
///
/// Each key fires once its pushes have been quiet for the window, with the
/// most recently pushed value. Keys are independent.
pub struct Debouncer<K, V> {
    window: Duration,
    shared: Arc<Shared<K, V>>,
    sink: Sink<K, V>,
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(window: Duration, sink: impl Fn(K, V) + Send + Sync + 'static) -> Self {
        Self {
            window,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
            }),
            sink: Arc::new(sink),
        }
    }

    pub fn push(&self, key: K, value: V) {
        if self.window.is_zero() {
            (self.sink)(key, value);
            return;
        }

        // Held until the entry is in place so the timer always finds it.
        let mut pending = self.shared.pending.lock();
        let generation = {
            let mut next = self.shared.next_generation.lock();
            *next += 1;
            *next
        };

        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.sink);
        let window = self.window;
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let fired = {
                let mut pending = shared.pending.lock();
                match pending.get(&timer_key) {
                    Some(entry) if entry.generation == generation => pending.remove(&timer_key),
                    _ => None,
                }
            };
            if let Some(entry) = fired {
                sink(timer_key, entry.value);
            }
        });

        if let Some(previous) = pending.insert(key, Pending { generation, value, timer }) {
            previous.timer.abort();
        }
    }

    /// Drops the pending value for `key` without firing it.
    pub fn cancel(&self, key: &K) {
        if let Some(entry) = self.shared.pending.lock().remove(key) {
            entry.timer.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.shared.pending.lock().contains_key(key)
    }
}

impl<K, V> Drop for Debouncer<K, V> {
    fn drop(&mut self) {
        for (_, entry) in self.shared.pending.lock().drain() {
            entry.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<(&'static str, u32)>>>, impl Fn(&'static str, u32) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |key, value| seen.lock().push((key, value))
        };
        (seen, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_to_latest_value() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(150), sink);

        debouncer.push("M1", 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.push("M1", 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.push("M1", 3);
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.lock().as_slice(), [("M1", 3)]);
        assert!(!debouncer.is_pending(&"M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_fire_independently() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push("M1", 1);
        debouncer.push("M2", 7);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut fired = seen.lock().clone();
        fired.sort();
        assert_eq!(fired, vec![("M1", 1), ("M2", 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_value() {
        let (seen, sink) = recorder();
        let debouncer = Debouncer::new(Duration::from_millis(100), sink);

        debouncer.push("M1", 1);
        debouncer.cancel(&"M1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tiny_window_never_loses_a_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let debouncer = Debouncer::new(Duration::from_nanos(1), {
            let seen = Arc::clone(&seen);
            move |key: u32, value: u32| seen.lock().push((key, value))
        });

        for key in 0..200 {
            debouncer.push(key, key * 2);
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < 200 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("every key fired");

        let mut fired = seen.lock().clone();
        fired.sort();
        assert_eq!(fired, (0..200).map(|k| (k, k * 2)).collect::<Vec<_>>());
    }
}
