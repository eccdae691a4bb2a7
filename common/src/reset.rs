#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetPhase {
    Idle,
    Pressed { since_ms: u64 },
    Triggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    None,
    PressStarted,
    Released { held_ms: u64 },
    Triggered,
}

// `Triggered` is terminal; a restart builds a fresh monitor.
#[derive(Debug, Clone)]
pub struct ResetMonitor {
    phase: ResetPhase,
    hold_threshold_ms: u64,
}

impl ResetMonitor {
    pub fn new(hold_threshold_ms: u64) -> Self {
        Self {
            phase: ResetPhase::Idle,
            hold_threshold_ms,
        }
    }

    pub fn phase(&self) -> ResetPhase {
        self.phase
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.phase, ResetPhase::Pressed { .. })
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.phase, ResetPhase::Triggered)
    }

    pub fn held_ms(&self, now_ms: u64) -> u64 {
        match self.phase {
            ResetPhase::Pressed { since_ms } => now_ms.saturating_sub(since_ms),
            _ => 0,
        }
    }

    pub fn sample(&mut self, active: bool, now_ms: u64) -> ResetEvent {
        match (self.phase, active) {
            (ResetPhase::Triggered, _) => ResetEvent::None,
            (ResetPhase::Idle, true) => {
                self.phase = ResetPhase::Pressed { since_ms: now_ms };
                ResetEvent::PressStarted
            }
            (ResetPhase::Idle, false) => ResetEvent::None,
            (ResetPhase::Pressed { since_ms }, true) => {
                if now_ms.saturating_sub(since_ms) >= self.hold_threshold_ms {
                    self.phase = ResetPhase::Triggered;
                    ResetEvent::Triggered
                } else {
                    ResetEvent::None
                }
            }
            (ResetPhase::Pressed { since_ms }, false) => {
                self.phase = ResetPhase::Idle;
                ResetEvent::Released {
                    held_ms: now_ms.saturating_sub(since_ms),
                }
            }
        }
    }
}
