use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleKind {
    FeedChannel,
    QueueProbe,
    SocketError,
}

impl ThrottleKind {
    fn interval(self) -> Duration {
        match self {
            ThrottleKind::FeedChannel => Duration::from_secs(10),
            ThrottleKind::QueueProbe => Duration::from_secs(30),
            ThrottleKind::SocketError => Duration::from_secs(10),
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: ThrottleKind,
    key: String,
}

static LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// True at most once per kind interval for the same key.
pub fn should_log(kind: ThrottleKind, key: &str) -> bool {
    let mut guard = LOG_MEMORY.lock();
    let key = LogKey {
        kind,
        key: key.to_string(),
    };
    let now = Instant::now();
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_suppressed_per_key() {
        assert!(should_log(ThrottleKind::QueueProbe, "throttle-test-a"));
        assert!(!should_log(ThrottleKind::QueueProbe, "throttle-test-a"));
        assert!(should_log(ThrottleKind::QueueProbe, "throttle-test-b"));
        assert!(should_log(ThrottleKind::FeedChannel, "throttle-test-a"));
    }
}
