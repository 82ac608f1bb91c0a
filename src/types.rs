use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ─── Axes ───────────────────────────────────────────────────────────────────

/// One of the four motion channels of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Linear up/down stroke (L0)
    Stroke,
    /// Rotation around the stroke axis (R0)
    Twist,
    /// Side-to-side tilt (R1)
    Roll,
    /// Forward/back tilt (R2)
    Pitch,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::Stroke, Axis::Twist, Axis::Roll, Axis::Pitch];

    pub fn index(self) -> usize {
        match self {
            Axis::Stroke => 0,
            Axis::Twist => 1,
            Axis::Roll => 2,
            Axis::Pitch => 3,
        }
    }

    /// TCode channel letter and digit.
    pub fn channel(self) -> (char, u8) {
        match self {
            Axis::Stroke => ('L', 0),
            Axis::Twist => ('R', 0),
            Axis::Roll => ('R', 1),
            Axis::Pitch => ('R', 2),
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Axis::Stroke => "stroke",
            Axis::Twist => "twist",
            Axis::Roll => "roll",
            Axis::Pitch => "pitch",
        }
    }

    /// Accepts either the axis id ("pitch") or the TCode channel ("R2").
    pub fn from_id(id: &str) -> Option<Axis> {
        match id.trim().to_ascii_lowercase().as_str() {
            "stroke" | "l0" => Some(Axis::Stroke),
            "twist" | "r0" => Some(Axis::Twist),
            "roll" | "r1" => Some(Axis::Roll),
            "pitch" | "r2" => Some(Axis::Pitch),
            _ => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (letter, digit) = self.channel();
        write!(f, "{}({}{})", self.id(), letter, digit)
    }
}

/// Fixed-size per-axis storage, indexed by [`Axis`].
#[derive(Debug, Clone)]
pub struct AxisMap<T> {
    slots: [Option<T>; 4],
}

impl<T> Default for AxisMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AxisMap<T> {
    pub fn new() -> Self {
        Self {
            slots: [None, None, None, None],
        }
    }

    pub fn get(&self, axis: Axis) -> Option<&T> {
        self.slots[axis.index()].as_ref()
    }

    pub fn get_mut(&mut self, axis: Axis) -> Option<&mut T> {
        self.slots[axis.index()].as_mut()
    }

    pub fn insert(&mut self, axis: Axis, value: T) -> Option<T> {
        self.slots[axis.index()].replace(value)
    }

    pub fn remove(&mut self, axis: Axis) -> Option<T> {
        self.slots[axis.index()].take()
    }

    pub fn contains(&self, axis: Axis) -> bool {
        self.slots[axis.index()].is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn clear(&mut self) {
        self.slots = [None, None, None, None];
    }

    /// Axes with a value, in channel order.
    pub fn axes(&self) -> Vec<Axis> {
        Axis::ALL.into_iter().filter(|a| self.contains(*a)).collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Axis, &mut T)> {
        Axis::ALL
            .into_iter()
            .zip(self.slots.iter_mut())
            .filter_map(|(axis, slot)| slot.as_mut().map(|v| (axis, v)))
    }
}

// ─── Fill modes ─────────────────────────────────────────────────────────────

/// Algorithmic motion used when no script drives an axis directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillMode {
    /// Passthrough: the axis only follows its script.
    #[default]
    None,
    Triangle,
    Sine,
    Saw,
    SawtoothReverse,
    Square,
    Pulse,
    EaseInOut,
    Random,
    /// Follows the stroke inverted (stroke down → axis up).
    Grind,
    /// Follows the stroke directly.
    ReverseGrind,
    Figure8,
}

/// Behavior family of a [`FillMode`]; drives fill synthesis dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillKind {
    None,
    Waveform,
    Random,
    Grind { inverted: bool },
    Figure8,
}

impl FillMode {
    pub fn kind(self) -> FillKind {
        match self {
            FillMode::None => FillKind::None,
            FillMode::Triangle
            | FillMode::Sine
            | FillMode::Saw
            | FillMode::SawtoothReverse
            | FillMode::Square
            | FillMode::Pulse
            | FillMode::EaseInOut => FillKind::Waveform,
            FillMode::Random => FillKind::Random,
            FillMode::Grind => FillKind::Grind { inverted: true },
            FillMode::ReverseGrind => FillKind::Grind { inverted: false },
            FillMode::Figure8 => FillKind::Figure8,
        }
    }

    pub fn is_active(self) -> bool {
        self != FillMode::None
    }

    /// Static applicability table: which fill behaviors each axis supports.
    ///
    /// | kind     | stroke | twist | roll | pitch |
    /// |----------|--------|-------|------|-------|
    /// | waveform | ✓      | ✓     | ✓    | ✓     |
    /// | random   | ✓      | ✓     | ✓    | ✓     |
    /// | grind    |        | ✓     | ✓    | ✓     |
    /// | figure8  |        |       | ✓    | ✓     |
    pub fn applies_to(self, axis: Axis) -> bool {
        match self.kind() {
            FillKind::None | FillKind::Waveform | FillKind::Random => true,
            FillKind::Grind { .. } => axis != Axis::Stroke,
            FillKind::Figure8 => matches!(axis, Axis::Roll | Axis::Pitch),
        }
    }
}

// ─── Axis configuration ─────────────────────────────────────────────────────

/// Per-axis output configuration. Replaced wholesale by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub axis: Axis,
    pub enabled: bool,
    /// Lower output bound on the 0–100 scale
    pub min: f64,
    /// Upper output bound on the 0–100 scale
    pub max: f64,
    pub fill_mode: FillMode,
    pub fill_speed_hz: f64,
    /// Drive fill phase from stroke travel instead of wall time
    pub sync_with_stroke: bool,
    /// Stroke: percent of range. Twist: degrees. Roll/pitch: unused.
    pub position_offset: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self::for_axis(Axis::Stroke)
    }
}

impl AxisConfig {
    /// Default configuration: stroke enabled, rotary axes disabled.
    pub fn for_axis(axis: Axis) -> Self {
        Self {
            axis,
            enabled: axis == Axis::Stroke,
            min: 0.0,
            max: 100.0,
            fill_mode: FillMode::None,
            fill_speed_hz: 1.0,
            sync_with_stroke: false,
            position_offset: 0.0,
        }
    }

    /// Clamp every field into its valid range. Never fails.
    pub fn sanitized(mut self) -> Self {
        let lo = finite_or(self.min, 0.0).clamp(0.0, 100.0);
        let hi = finite_or(self.max, 100.0).clamp(0.0, 100.0);
        self.min = lo.min(hi);
        self.max = lo.max(hi);
        self.fill_speed_hz =
            finite_or(self.fill_speed_hz, 1.0).clamp(MIN_FILL_SPEED_HZ, MAX_FILL_SPEED_HZ);
        self.position_offset = match self.axis {
            Axis::Stroke => finite_or(self.position_offset, 0.0).clamp(-50.0, 50.0),
            Axis::Twist => finite_or(self.position_offset, 0.0).clamp(-180.0, 180.0),
            Axis::Roll | Axis::Pitch => 0.0,
        };
        if !self.fill_mode.applies_to(self.axis) {
            log::warn!(
                "Fill mode {:?} is not valid on {}; using None",
                self.fill_mode,
                self.axis
            );
            self.fill_mode = FillMode::None;
        }
        self
    }

    /// Enabled with a fill mode that generates motion.
    pub fn fill_active(&self) -> bool {
        self.enabled && self.fill_mode.is_active()
    }
}

fn finite_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

/// The full configuration set, one entry per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisConfigs {
    configs: [AxisConfig; 4],
}

impl Default for AxisConfigs {
    fn default() -> Self {
        Self {
            configs: Axis::ALL.map(AxisConfig::for_axis),
        }
    }
}

impl AxisConfigs {
    /// Build from a caller-supplied list. Axes missing from the list get a
    /// disabled default; later duplicates win.
    pub fn from_list(list: &[AxisConfig]) -> Self {
        let mut configs = Axis::ALL.map(|axis| AxisConfig {
            enabled: false,
            ..AxisConfig::for_axis(axis)
        });
        for cfg in list {
            configs[cfg.axis.index()] = cfg.sanitized();
        }
        Self { configs }
    }

    pub fn get(&self, axis: Axis) -> &AxisConfig {
        &self.configs[axis.index()]
    }
}

// ─── Funscript data ─────────────────────────────────────────────────────────

/// One keyframe: position (0–100) at a media timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunscriptAction {
    /// Media time in milliseconds
    pub at: u64,
    /// Position, 0–100
    pub pos: f64,
}

impl FunscriptAction {
    pub fn new(at: u64, pos: f64) -> Self {
        Self { at, pos }
    }
}

/// A script for one axis. Actions are sorted ascending by `at`; the parser
/// guarantees this and it is not re-checked here.
#[derive(Debug, Clone, PartialEq)]
pub struct FunscriptData {
    pub axis: Axis,
    pub actions: Vec<FunscriptAction>,
}

impl FunscriptData {
    pub fn new(axis: Axis, actions: Vec<FunscriptAction>) -> Self {
        Self { axis, actions }
    }
}

/// Scripts currently loaded, at most one per axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptSet {
    actions: [Option<Vec<FunscriptAction>>; 4],
}

impl ScriptSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an axis-keyed map. Empty action lists count as no script.
    pub fn from_map(map: HashMap<Axis, FunscriptData>) -> Self {
        let mut set = Self::default();
        for (axis, data) in map {
            if !data.actions.is_empty() {
                set.actions[axis.index()] = Some(data.actions);
            }
        }
        set
    }

    pub fn insert(&mut self, data: FunscriptData) {
        let axis = data.axis;
        self.actions[axis.index()] = if data.actions.is_empty() {
            None
        } else {
            Some(data.actions)
        };
    }

    pub fn get(&self, axis: Axis) -> Option<&[FunscriptAction]> {
        self.actions[axis.index()].as_deref()
    }

    pub fn has(&self, axis: Axis) -> bool {
        self.actions[axis.index()].is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(Option::is_none)
    }

    /// Timestamp of the last keyframe across all axes.
    pub fn duration_ms(&self) -> u64 {
        self.actions
            .iter()
            .flatten()
            .filter_map(|a| a.last().map(|last| last.at))
            .max()
            .unwrap_or(0)
    }
}

// ─── Inter-thread messages ──────────────────────────────────────────────────

/// Notifications raised by the engine. Read via `CommandEngine::events()`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A single axis left manual test mode.
    TestStopped(Axis),
    /// `stop_all_test_axes` stopped these axes.
    AllTestsStopped(Vec<Axis>),
}

// ─── Clocks ─────────────────────────────────────────────────────────────────

/// Millisecond time source used for media-time extrapolation and Δt.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> f64;
}

/// Monotonic wall clock for the engine session.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SessionClock {
    fn now_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ms(&self, ms: f64) {
        self.micros
            .store((ms.max(0.0) * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: f64) {
        self.micros
            .fetch_add((ms.max(0.0) * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

/// Largest protocol value.
pub const TCODE_MAX: f64 = 999.0;
/// Protocol midpoint used for return-to-center and blending.
pub const TCODE_MID: f64 = 500.0;

/// Output rate bounds and the rate at which excursions are unscaled.
pub const MIN_OUTPUT_RATE_HZ: f64 = 30.0;
pub const MAX_OUTPUT_RATE_HZ: f64 = 200.0;
pub const REFERENCE_RATE_HZ: f64 = 100.0;
pub const DEFAULT_OUTPUT_RATE_HZ: f64 = 100.0;

pub const MIN_FILL_SPEED_HZ: f64 = 0.1;
pub const MAX_FILL_SPEED_HZ: f64 = 5.0;
pub const MIN_TEST_SPEED_HZ: f64 = 0.1;
pub const MAX_TEST_SPEED_HZ: f64 = 5.0;
pub const MIN_PLAYBACK_SPEED: f64 = 0.1;
pub const MAX_PLAYBACK_SPEED: f64 = 4.0;

/// Pitch ceiling for fill-derived motion, as a fraction of full scale.
pub const PITCH_SAFETY_CAP: f64 = 0.70;

/// Stroke travel (position units) that advances a synced fill by one period.
pub const STROKE_UNITS_PER_PERIOD: f64 = 200.0;

/// One-pole smoothing factor per tick for ramp-up and return-to-center.
pub const BLEND_RATE: f64 = 0.04;

pub const HOME_INTERVAL_MS: u32 = 2000;
pub const TEST_STOP_INTERVAL_MS: u32 = 500;
