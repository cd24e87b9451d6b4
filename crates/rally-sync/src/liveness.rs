use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Generation counter shared by an owner and the handlers it schedules.
///
/// Handlers capture a [`LivenessToken`] when they are created and check it
/// before touching shared state; [`Liveness::retire`] invalidates every
/// outstanding token at once.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    current: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct LivenessToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> LivenessToken {
        LivenessToken {
            generation: self.current.load(Ordering::SeqCst),
            current: Arc::clone(&self.current),
        }
    }

    /// Invalidates all tokens handed out so far.
    pub fn retire(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

impl LivenessToken {
    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_invalidates_earlier_tokens() {
        let liveness = Liveness::new();
        let before = liveness.token();
        assert!(before.is_live());
        liveness.retire();
        assert!(!before.is_live());
        assert!(liveness.token().is_live());
    }

    #[test]
    fn clones_share_one_generation() {
        let liveness = Liveness::new();
        let token = liveness.token();
        let copy = token.clone();
        liveness.clone().retire();
        assert!(!token.is_live());
        assert!(!copy.is_live());
    }
}
