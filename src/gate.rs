//! Advisory spawn gate.

use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot flag nudging callers to enumerate active workers before spawning
/// a fresh instance.
///
/// This is a workflow nudge, not a correctness mechanism: it does not guard
/// against concurrent spawns, and not every spawn path consults it.
#[derive(Debug, Default)]
pub struct SpawnGate {
    checked: AtomicBool,
}

impl SpawnGate {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to pass the gate. The first attempt on a closed gate refuses
    /// and arms it, so the next attempt succeeds.
    pub fn try_pass(&self) -> bool {
        self.checked.swap(true, Ordering::SeqCst)
    }

    /// Arm the gate — enumeration of active workers counts as the check.
    pub fn arm(&self) {
        self.checked.store(true, Ordering::SeqCst);
    }

    /// Close the gate again after a successful spawn.
    pub fn reset(&self) {
        self.checked.store(false, Ordering::SeqCst);
    }

    /// Whether the next `try_pass` would succeed.
    pub fn is_armed(&self) -> bool {
        self.checked.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_refuses_and_arms() {
        let gate = SpawnGate::new();
        assert!(!gate.try_pass());
        assert!(gate.try_pass());
    }

    #[test]
    fn arm_lets_the_first_attempt_through() {
        let gate = SpawnGate::new();
        gate.arm();
        assert!(gate.try_pass());
    }

    #[test]
    fn reset_closes_the_gate() {
        let gate = SpawnGate::new();
        gate.arm();
        assert!(gate.try_pass());
        gate.reset();
        assert!(!gate.is_armed());
        assert!(!gate.try_pass());
    }
}
