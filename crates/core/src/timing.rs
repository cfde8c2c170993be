//! Human-plausible reading, response and typing delays.
//!
//! Every sampled delay is clamped to `[MIN_DELAY_SECS, profile max]`. The
//! random source is passed in so callers (and tests) control seeding.

use std::f64::consts::{PI, SQRT_2};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{DelayRange, TimingConfig};

pub const MIN_DELAY_SECS: f64 = 1.0;

/// Log-space spread of the natural mode. Keeps ~98% of samples inside
/// `[base, 2 * base]` around the `base * sqrt(2)` median.
const NATURAL_SIGMA: f64 = 0.15;
const VARIABLE_MODE_FACTOR: f64 = 1.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingProfile {
    QuickAck,
    Normal,
    Thoughtful,
    LongRead,
}

impl TimingProfile {
    pub const ALL: [TimingProfile; 4] =
        [Self::QuickAck, Self::Normal, Self::Thoughtful, Self::LongRead];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickAck => "quick_ack",
            Self::Normal => "normal",
            Self::Thoughtful => "thoughtful",
            Self::LongRead => "long_read",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayMode {
    Uniform,
    Natural,
    Variable,
}

impl DelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Natural => "natural",
            Self::Variable => "variable",
        }
    }
}

impl std::str::FromStr for DelayMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "natural" => Ok(Self::Natural),
            "variable" => Ok(Self::Variable),
            other => Err(format!(
                "unsupported delay mode `{other}` (expected uniform|natural|variable)"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NaturalTiming {
    config: TimingConfig,
}

impl Default for NaturalTiming {
    fn default() -> Self {
        Self::new(TimingConfig::default())
    }
}

impl NaturalTiming {
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    pub fn mode(&self) -> DelayMode {
        self.config.mode
    }

    pub fn range(&self, profile: TimingProfile) -> DelayRange {
        match profile {
            TimingProfile::QuickAck => self.config.quick_ack,
            TimingProfile::Normal => self.config.normal,
            TimingProfile::Thoughtful => self.config.thoughtful,
            TimingProfile::LongRead => self.config.long_read,
        }
    }

    pub fn classify(&self, incoming_text: &str, outgoing_text: &str) -> TimingProfile {
        let incoming_chars = incoming_text.chars().count();
        let outgoing_chars = outgoing_text.chars().count();

        if incoming_chars >= self.config.long_read_chars {
            TimingProfile::LongRead
        } else if outgoing_chars <= self.config.quick_ack_chars {
            TimingProfile::QuickAck
        } else if outgoing_chars >= self.config.thoughtful_chars {
            TimingProfile::Thoughtful
        } else {
            TimingProfile::Normal
        }
    }

    pub fn sample_delay<R: Rng + ?Sized>(
        &self,
        profile: TimingProfile,
        mode: DelayMode,
        rng: &mut R,
    ) -> f64 {
        let range = self.range(profile);
        let base = range.base_secs;
        let max = range.max_secs.max(MIN_DELAY_SECS);

        let raw = match mode {
            DelayMode::Uniform => {
                if max > base {
                    rng.gen_range(base..=max)
                } else {
                    base
                }
            }
            DelayMode::Natural => {
                let median = base * SQRT_2;
                (median.ln() + NATURAL_SIGMA * standard_normal(rng)).exp()
            }
            DelayMode::Variable => {
                let mode_point = (base * VARIABLE_MODE_FACTOR).min(max);
                let mut value = triangular(rng, base, mode_point, max);
                if rng.gen_bool(self.config.distraction_probability.clamp(0.0, 1.0)) {
                    value += rng.gen::<f64>() * (max - base).max(0.0);
                }
                value
            }
        };

        if raw.is_finite() {
            raw.clamp(MIN_DELAY_SECS, max)
        } else {
            max
        }
    }

    /// Delay before the incoming message is "read" and a reply is drafted.
    pub fn reading_delay<R: Rng + ?Sized>(
        &self,
        incoming_text: &str,
        mode: DelayMode,
        rng: &mut R,
    ) -> f64 {
        let profile = if incoming_text.chars().count() >= self.config.long_read_chars {
            TimingProfile::LongRead
        } else {
            TimingProfile::QuickAck
        };
        self.sample_delay(profile, mode, rng)
    }

    /// Seconds spent "typing" a message of `message_chars` characters.
    pub fn typing_duration(&self, message_chars: usize) -> f64 {
        let chars_per_second = self.config.typing_chars_per_second.max(f64::EPSILON);
        let raw = MIN_DELAY_SECS + message_chars as f64 / chars_per_second;
        raw.min(self.config.typing_max_secs.max(MIN_DELAY_SECS))
    }
}

pub fn as_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // Box-Muller; `1 - u` keeps the log argument in (0, 1].
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

fn triangular<R: Rng + ?Sized>(rng: &mut R, low: f64, mode: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    let u = rng.gen::<f64>();
    let span = high - low;
    let split = (mode - low) / span;
    if u < split {
        low + (u * span * (mode - low)).sqrt()
    } else {
        high - ((1.0 - u) * span * (high - mode)).sqrt()
    }
}
