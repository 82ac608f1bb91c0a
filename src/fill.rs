//! Fill motion: algorithmic output for axes that have no script of their own.
//!
//! Every function here produces protocol-space values (0–999, unrounded).
//! Rate scaling, ramp-up blending, rounding and offsets happen in the ticker.

use crate::pattern;
use crate::random_pattern::RandomPatternGenerator;
use crate::types::*;

/// Exponential weight of the newest stroke direction sample per tick.
const DIRECTION_SMOOTHING: f64 = 0.15;

/// Pitch ceiling in protocol units.
pub const PITCH_CAP_TCODE: f64 = PITCH_SAFETY_CAP * TCODE_MAX;

/// Inputs shared by every axis for one tick.
#[derive(Debug, Clone, Copy)]
pub struct FillContext {
    /// Seconds since the previous tick (clamped by the caller)
    pub dt_s: f64,
    /// Current stroke position (0–100), when a script or override drives it
    pub stroke: Option<f64>,
    /// Absolute stroke travel since the previous tick, in position units
    pub stroke_travel: f64,
}

/// Per-axis accumulator that persists while the fill stays active.
#[derive(Debug, Clone, Default)]
pub struct FillState {
    /// Waveform phase, kept in [0, 1)
    pub phase: f64,
    /// Random-walk progress: stroke distance or scaled time
    pub progress: f64,
    pub direction: DirectionFilter,
}

/// Low-pass filtered stroke direction in [-1, 1]. Suppresses sign flicker
/// at stroke reversals.
#[derive(Debug, Clone, Default)]
pub struct DirectionFilter {
    value: f64,
    prev: Option<f64>,
}

impl DirectionFilter {
    pub fn update(&mut self, stroke: f64) -> f64 {
        let raw = match self.prev {
            Some(prev) if stroke > prev => 1.0,
            Some(prev) if stroke < prev => -1.0,
            _ => 0.0,
        };
        self.prev = Some(stroke);
        self.value += DIRECTION_SMOOTHING * (raw - self.value);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Map a normalized sample through the axis's configured range.
pub fn range_value(normalized: f64, config: &AxisConfig) -> f64 {
    let n = normalized.clamp(0.0, 1.0);
    (config.min + n * (config.max - config.min)) / 100.0 * TCODE_MAX
}

/// Clamp fill-derived pitch to the safety ceiling. Other axes pass through.
pub fn pitch_cap(axis: Axis, value: f64) -> f64 {
    if axis == Axis::Pitch {
        value.min(PITCH_CAP_TCODE)
    } else {
        value
    }
}

/// Grind output for a normalized stroke position.
///
/// On pitch the result is compressed into [0, cap] regardless of the
/// configured range; other axes use their range.
pub fn grind_value(config: &AxisConfig, stroke_norm: f64, inverted: bool) -> f64 {
    let follow = pattern::calculate(FillMode::Grind, stroke_norm);
    let n = if inverted { 1.0 - follow } else { follow };
    if config.axis == Axis::Pitch {
        n * PITCH_CAP_TCODE
    } else {
        range_value(n, config)
    }
}

/// Figure-eight sample for a normalized stroke position and smoothed
/// direction. Treats the stroke as `(1 - cos θ) / 2` and recovers `sin θ`
/// from the direction, so roll traces `sin 2θ` (a figure eight against the
/// stroke) and pitch traces `sin θ` (an ellipse).
pub fn figure8_normalized(axis: Axis, stroke_norm: f64, direction: f64) -> f64 {
    let c = 2.0 * stroke_norm.clamp(0.0, 1.0) - 1.0;
    let sin_mag = (1.0 - c * c).max(0.0).sqrt();
    let d = direction.clamp(-1.0, 1.0);
    let n = match axis {
        Axis::Roll => 0.5 - d * sin_mag * c,
        _ => 0.5 + 0.5 * d * sin_mag,
    };
    n.clamp(0.0, 1.0)
}

/// Synthesize one fill sample. `None` means the axis cannot fill right now
/// (it needs a stroke that is not there) and should return to center.
pub fn synthesize(
    config: &AxisConfig,
    state: &mut FillState,
    random: &mut RandomPatternGenerator,
    ctx: &FillContext,
) -> Option<f64> {
    let value = match config.fill_mode.kind() {
        FillKind::None => return None,

        FillKind::Waveform => {
            let advance = if stroke_synced(config, ctx) {
                ctx.stroke_travel / STROKE_UNITS_PER_PERIOD
            } else {
                ctx.dt_s * config.fill_speed_hz
            };
            state.phase = (state.phase + advance).rem_euclid(1.0);
            range_value(pattern::calculate(config.fill_mode, state.phase), config)
        }

        FillKind::Random => {
            if config.axis != Axis::Stroke && config.sync_with_stroke && ctx.stroke.is_none() {
                return None;
            }
            state.progress += if stroke_synced(config, ctx) {
                ctx.stroke_travel
            } else {
                ctx.dt_s * config.fill_speed_hz * STROKE_UNITS_PER_PERIOD
            };
            random.set_range(config.min, config.max);
            random.get_position(state.progress) / 100.0 * TCODE_MAX
        }

        FillKind::Grind { inverted } => {
            let stroke = ctx.stroke?;
            grind_value(config, stroke / 100.0, inverted)
        }

        FillKind::Figure8 => {
            let stroke = ctx.stroke?;
            let direction = state.direction.update(stroke);
            let n = figure8_normalized(config.axis, stroke / 100.0, direction);
            range_value(n, config)
        }
    };
    Some(pitch_cap(config.axis, value))
}

/// Waveform and random fills on rotary axes follow stroke travel when asked
/// to and a stroke exists. The stroke axis always runs on time.
fn stroke_synced(config: &AxisConfig, ctx: &FillContext) -> bool {
    config.axis != Axis::Stroke && config.sync_with_stroke && ctx.stroke.is_some()
}
