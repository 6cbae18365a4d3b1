use std::sync::atomic::{AtomicBool, Ordering};

use crate::model::state::OneShotPhase;

/// A flag that can be tripped exactly once.
#[derive(Debug, Default)]
pub(crate) struct OnceLatch(AtomicBool);

impl OnceLatch {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Trip the latch. Returns `true` only for the first caller.
    pub fn trip(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[cfg(test)]
    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One latch per happy-path phase.
#[derive(Debug, Default)]
pub(crate) struct PhaseLatches([OnceLatch; OneShotPhase::COUNT]);

impl PhaseLatches {
    pub fn trip(&self, phase: OneShotPhase) -> bool {
        self.0[phase.index()].trip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_trips_once() {
        let latch = OnceLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.trip());
        assert!(!latch.trip());
        assert!(latch.is_tripped());
    }

    #[test]
    fn test_phase_latches_are_independent() {
        let latches = PhaseLatches::default();
        assert!(latches.trip(OneShotPhase::Connected));
        assert!(!latches.trip(OneShotPhase::Connected));
        assert!(latches.trip(OneShotPhase::Ready));
    }

    #[test]
    fn test_concurrent_trip_has_single_winner() {
        let latch = std::sync::Arc::new(OnceLatch::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.trip())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
