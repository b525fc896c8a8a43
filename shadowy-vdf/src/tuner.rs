use std::time::Duration;
use tracing::info;

/// Feedback loop keeping solve time near a target. Only future challenges
/// pick up an adjusted T; in-flight jobs are untouched.
#[derive(Debug, Clone)]
pub struct DifficultyTuner {
    target: Duration,
    enabled: bool,
}

impl DifficultyTuner {
    pub fn new(target: Duration, enabled: bool) -> Self {
        Self { target, enabled }
    }

    /// observed > 2x target halves T (floor 1); observed < 0.5x target
    /// doubles it (saturating); otherwise T is unchanged.
    pub fn adjust(&self, current: u64, observed: Duration) -> u64 {
        if !self.enabled || current == 0 {
            return current;
        }
        let next = if observed > self.target * 2 {
            (current / 2).max(1)
        } else if observed * 2 < self.target {
            current.saturating_mul(2)
        } else {
            current
        };
        if next != current {
            info!(
                current,
                next,
                observed_ms = observed.as_millis() as u64,
                target_ms = self.target.as_millis() as u64,
                "vdf time parameter retuned"
            );
        }
        next
    }
}
