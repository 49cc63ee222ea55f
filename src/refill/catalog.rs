//! Phase catalog: polling cadence and progress band for every refill phase

use crate::config::PhaseOverride;
use crate::state::RefillPhase;

use std::collections::HashMap;
use std::time::Duration;

/// Polling parameters for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSpec {
    pub phase: RefillPhase,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
    /// Progress checkpoint on entering the phase
    pub progress_start: u8,
    /// Checkpoint reached when the next phase begins
    pub progress_end: u8,
}

impl PhaseSpec {
    const fn new(
        phase: RefillPhase,
        initial_delay_secs: u64,
        interval_secs: u64,
        max_attempts: u32,
        progress_start: u8,
        progress_end: u8,
    ) -> Self {
        Self {
            phase,
            initial_delay: Duration::from_secs(initial_delay_secs),
            interval: Duration::from_secs(interval_secs),
            max_attempts,
            progress_start,
            progress_end,
        }
    }

    /// Progress after `attempts` unsuccessful polls; stays below the band end
    pub fn progress_after(&self, attempts: u32) -> u8 {
        let span = self.progress_end.saturating_sub(self.progress_start);
        if span <= 1 || self.max_attempts == 0 {
            return self.progress_start;
        }
        let attempts = attempts.min(self.max_attempts) as u64;
        let step = (span as u64 - 1) * attempts / self.max_attempts as u64;
        self.progress_start + step as u8
    }

    /// Upper bound on time spent in this phase
    pub fn budget(&self) -> Duration {
        self.initial_delay + self.interval * self.max_attempts
    }
}

const STANDARD: [PhaseSpec; 5] = [
    PhaseSpec::new(RefillPhase::WalletConfirm, 0, 1, 120, 0, 5),
    PhaseSpec::new(RefillPhase::MonadConfirm, 2, 2, 30, 5, 15),
    PhaseSpec::new(RefillPhase::AvalancheConfirm, 10, 10, 60, 15, 70),
    PhaseSpec::new(RefillPhase::CcipResponse, 5, 10, 60, 70, 90),
    PhaseSpec::new(RefillPhase::MonadRefill, 2, 5, 36, 90, 100),
];

/// Ordered phase table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCatalog {
    specs: [PhaseSpec; 5],
}

impl PhaseCatalog {
    pub fn standard() -> Self {
        Self { specs: STANDARD }
    }

    /// Standard catalog with `[phases.*]` overrides applied
    pub fn with_overrides(overrides: &HashMap<String, PhaseOverride>) -> Self {
        let mut catalog = Self::standard();
        for spec in catalog.specs.iter_mut() {
            if let Some(o) = overrides.get(spec.phase.as_str()) {
                if let Some(ms) = o.initial_delay_ms {
                    spec.initial_delay = Duration::from_millis(ms);
                }
                if let Some(ms) = o.interval_ms {
                    spec.interval = Duration::from_millis(ms);
                }
                if let Some(max) = o.max_attempts {
                    spec.max_attempts = max.max(1);
                }
            }
        }
        catalog
    }

    pub fn spec(&self, phase: RefillPhase) -> &PhaseSpec {
        // Table order matches RefillPhase::ALL
        &self.specs[phase as usize]
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.specs.iter()
    }

    /// Checkpoint a restored or synthesized attempt starts from
    pub fn entry_progress(&self, phase: RefillPhase) -> u8 {
        self.spec(phase).progress_start
    }
}

impl Default for PhaseCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
