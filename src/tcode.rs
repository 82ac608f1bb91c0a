//! TCode line protocol: value conversion, per-channel offsets, dirty
//! suppression, and token formatting.
//!
//! A token is `{letter}{digit}{value:03}I{interval_ms}`, e.g. `L0499I10`.
//! One tick writes all of its tokens as a single space-joined line.

use crate::types::*;

/// Map a 0–100 position through the axis range onto 0–999 (truncating).
pub fn position_to_tcode(position: f64, min: f64, max: f64) -> i32 {
    let normalized = (position / 100.0).clamp(0.0, 1.0);
    normalized_to_tcode(normalized, min, max)
}

/// Map a normalized [0, 1] sample through the axis range onto 0–999.
pub fn normalized_to_tcode(normalized: f64, min: f64, max: f64) -> i32 {
    let scaled = min + normalized * (max - min);
    let value = (scaled / 100.0 * TCODE_MAX).clamp(0.0, TCODE_MAX);
    value as i32
}

/// Round then clamp; used where animation math produces the value.
pub fn round_tcode(value: f64) -> i32 {
    if !value.is_finite() {
        return TCODE_MID as i32;
    }
    value.round().clamp(0.0, TCODE_MAX) as i32
}

/// Excursion gain for an output rate. Above the reference rate motion around
/// the midpoint is amplified, below it is damped.
pub fn rate_excursion_factor(output_rate_hz: f64) -> f64 {
    (output_rate_hz / REFERENCE_RATE_HZ).sqrt()
}

/// Scale a value's distance from the midpoint by the rate factor.
pub fn scale_excursion(value: f64, output_rate_hz: f64) -> f64 {
    let scaled = TCODE_MID + (value - TCODE_MID) * rate_excursion_factor(output_rate_hz);
    scaled.clamp(0.0, TCODE_MAX)
}

/// Apply the axis's position offset.
///
/// Stroke: percent of full scale, hard-clipped at the protocol limits.
/// Twist: degrees, wrapped modulo a full turn (1000 units).
/// Roll and pitch ignore the offset.
pub fn apply_offset(value: i32, config: &AxisConfig) -> i32 {
    match config.axis {
        Axis::Stroke => {
            let shift = (config.position_offset / 100.0 * TCODE_MAX).round() as i32;
            (value + shift).clamp(0, TCODE_MAX as i32)
        }
        Axis::Twist => {
            let shift = (config.position_offset / 360.0 * 1000.0).round() as i32;
            (value + shift).rem_euclid(1000)
        }
        Axis::Roll | Axis::Pitch => value,
    }
}

/// Offset-adjusted midpoint of the axis's configured range.
pub fn midpoint_tcode(config: &AxisConfig) -> i32 {
    apply_offset(position_to_tcode(50.0, config.min, config.max), config)
}

pub fn format_token(axis: Axis, value: i32, interval_ms: u32) -> String {
    let (letter, digit) = axis.channel();
    format!(
        "{}{}{:03}I{}",
        letter,
        digit,
        value.clamp(0, TCODE_MAX as i32),
        interval_ms
    )
}

/// Collects the tokens of one tick.
#[derive(Debug, Default)]
pub struct CommandLine {
    line: String,
    count: usize,
}

impl CommandLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, axis: Axis, value: i32, interval_ms: u32) {
        if self.count > 0 {
            self.line.push(' ');
        }
        self.line.push_str(&format_token(axis, value, interval_ms));
        self.count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Newline-terminated line, or `None` when nothing was pushed.
    pub fn finish(mut self) -> Option<String> {
        if self.count == 0 {
            return None;
        }
        self.line.push('\n');
        Some(self.line)
    }
}

/// Last value sent per axis. Differences under one unit are suppressed.
#[derive(Debug, Default)]
pub struct DirtyCache {
    last_sent: [Option<i32>; 4],
    /// Set when a write failed; the next value goes out even if unchanged.
    stale: [bool; 4],
}

impl DirtyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self, axis: Axis, value: i32) -> bool {
        if self.stale[axis.index()] {
            return true;
        }
        match self.last_sent[axis.index()] {
            None => true,
            Some(last) => (value - last).abs() >= 1,
        }
    }

    pub fn record(&mut self, axis: Axis, value: i32) {
        self.last_sent[axis.index()] = Some(value);
        self.stale[axis.index()] = false;
    }

    /// Force a resend of every recorded axis. The last values are kept as
    /// the starting point for ramps and returns.
    pub fn mark_stale(&mut self) {
        for (stale, last) in self.stale.iter_mut().zip(self.last_sent) {
            *stale = last.is_some();
        }
    }

    /// Record and report whether the value should be sent.
    pub fn update(&mut self, axis: Axis, value: i32) -> bool {
        if self.is_dirty(axis, value) {
            self.record(axis, value);
            true
        } else {
            false
        }
    }

    pub fn last(&self, axis: Axis) -> Option<i32> {
        self.last_sent[axis.index()]
    }

    pub fn clear(&mut self) {
        self.last_sent = [None; 4];
        self.stale = [false; 4];
    }
}
