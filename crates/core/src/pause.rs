//! Turn-boundary detection between consecutive inbound message fragments.

use chrono::{DateTime, Duration, Utc};

use crate::config::BufferConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseVerdict {
    StillComposing,
    TurnComplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseDetector {
    quiet_window: Duration,
    burst_ceiling: usize,
}

impl Default for PauseDetector {
    fn default() -> Self {
        Self::from_config(&BufferConfig::default())
    }
}

impl PauseDetector {
    pub fn new(quiet_window: Duration, burst_ceiling: usize) -> Self {
        Self { quiet_window, burst_ceiling: burst_ceiling.max(1) }
    }

    pub fn from_config(config: &BufferConfig) -> Self {
        let quiet_window_ms = i64::try_from(config.quiet_window_ms).unwrap_or(i64::MAX);
        Self::new(Duration::milliseconds(quiet_window_ms), config.burst_ceiling)
    }

    pub fn quiet_window(&self) -> Duration {
        self.quiet_window
    }

    pub fn burst_ceiling(&self) -> usize {
        self.burst_ceiling
    }

    /// `burst_count` is the number of fragments in the open batch including
    /// the one that arrived at `current`.
    pub fn classify(
        &self,
        previous: Option<DateTime<Utc>>,
        current: DateTime<Utc>,
        burst_count: usize,
    ) -> PauseVerdict {
        if burst_count >= self.burst_ceiling {
            return PauseVerdict::TurnComplete;
        }

        let Some(previous) = previous else {
            return PauseVerdict::StillComposing;
        };

        if self.gap_exceeds_quiet_window(previous, current) {
            PauseVerdict::TurnComplete
        } else {
            PauseVerdict::StillComposing
        }
    }

    /// Clock skew between fragments (a negative gap) also ends the turn.
    pub fn gap_exceeds_quiet_window(
        &self,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    ) -> bool {
        let gap = current - previous;
        gap < Duration::zero() || gap > self.quiet_window
    }
}
