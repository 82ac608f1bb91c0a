use crate::fill::{self, FillContext, FillState};
use crate::interpolation::InterpolationService;
use crate::manual_test::{self, TestState};
use crate::random_pattern::RandomPatternGenerator;
use crate::tcode::*;
use crate::types::*;
use log::{debug, trace};
use std::sync::Arc;

/// Ramp-up is complete once the blend reaches this.
const RAMP_DONE: f64 = 0.99;
/// Return-to-center is complete within this many units of the midpoint.
const RETURN_EPSILON: f64 = 1.0;
/// Largest fill Δt, so a stall or pause does not make fills jump.
const MAX_FILL_DT_S: f64 = 0.1;

/// Everything one tick reads from the caller-published state.
pub struct TickInput<'a> {
    pub now_ms: f64,
    /// Wall time since the previous loop iteration
    pub interval_ms: f64,
    /// Extrapolated media time with the user offset already subtracted
    pub media_time_ms: f64,
    pub playing: bool,
    pub output_rate_hz: f64,
    pub configs: &'a Arc<AxisConfigs>,
    pub scripts: &'a Arc<ScriptSet>,
    pub external: Option<[Option<f64>; 4]>,
    pub interpolation: &'a InterpolationService,
    pub tests: &'a mut AxisMap<TestState>,
}

/// Output-thread state: dirty cache and per-axis transient animation.
///
/// Only the output loop (or `tick_now` while the loop is stopped) touches
/// this, so nothing inside needs its own synchronization.
pub struct Ticker {
    dirty: DirtyCache,
    /// Ramp-up blend per axis, 0..1
    ramps: AxisMap<f64>,
    /// Return-to-center current value per axis, protocol units
    returns: AxisMap<f64>,
    fills: AxisMap<FillState>,
    randoms: [RandomPatternGenerator; 4],
    prev_stroke: Option<f64>,
    seen_configs: Arc<AxisConfigs>,
    seen_scripts: Arc<ScriptSet>,
    last_tick_ms: Option<f64>,
    /// Clock time of the previous loop iteration (ticked or not)
    pub last_iteration_ms: Option<f64>,
}

impl Ticker {
    pub fn new(configs: Arc<AxisConfigs>, scripts: Arc<ScriptSet>, seed: Option<u64>) -> Self {
        let randoms = Axis::ALL.map(|axis| match seed {
            Some(s) => {
                RandomPatternGenerator::with_seed(s.wrapping_add(axis.index() as u64), 0.0, 100.0)
            }
            None => RandomPatternGenerator::new(0.0, 100.0),
        });
        Self {
            dirty: DirtyCache::new(),
            ramps: AxisMap::new(),
            returns: AxisMap::new(),
            fills: AxisMap::new(),
            randoms,
            prev_stroke: None,
            seen_configs: configs,
            seen_scripts: scripts,
            last_tick_ms: None,
            last_iteration_ms: None,
        }
    }

    /// Drop all transient animation and the dirty cache.
    pub fn reset(&mut self) {
        self.dirty.clear();
        self.ramps.clear();
        self.returns.clear();
        self.fills.clear();
        self.prev_stroke = None;
        self.last_tick_ms = None;
        self.last_iteration_ms = None;
    }

    /// A ramp-up or return-to-center is still in progress.
    pub fn has_pending_animation(&self) -> bool {
        !self.ramps.is_empty() || !self.returns.is_empty()
    }

    pub fn last_sent(&self, axis: Axis) -> Option<i32> {
        self.dirty.last(axis)
    }

    /// Note a value written outside the tick path (homing, test-stop glide)
    /// so the next tick compares against what the device was actually told.
    pub fn record_sent(&mut self, axis: Axis, value: i32) {
        self.dirty.record(axis, value);
        self.returns.remove(axis);
    }

    /// The last line did not reach the device: send every axis again on
    /// the next tick.
    pub fn mark_unsent(&mut self) {
        self.dirty.mark_stale();
    }

    pub fn is_returning(&self, axis: Axis) -> bool {
        self.returns.contains(axis)
    }

    pub fn is_ramping(&self, axis: Axis) -> bool {
        self.ramps.contains(axis)
    }

    /// Pick up newly published configs and scripts.
    ///
    /// A script swap resets the dirty cache and every stroke/random
    /// accumulator. A config swap is diffed per axis: an axis that stops
    /// moving returns to center from its last sent value, an axis that
    /// starts a fill ramps up from the midpoint.
    pub fn observe(&mut self, configs: &Arc<AxisConfigs>, scripts: &Arc<ScriptSet>) {
        if !Arc::ptr_eq(&self.seen_scripts, scripts) {
            debug!("Scripts replaced; resetting tick caches");
            self.dirty.clear();
            self.fills.clear();
            for random in self.randoms.iter_mut() {
                random.reset();
            }
            self.prev_stroke = None;
            self.seen_scripts = Arc::clone(scripts);
        }

        if !Arc::ptr_eq(&self.seen_configs, configs) {
            let old = Arc::clone(&self.seen_configs);
            for axis in Axis::ALL {
                self.diff_axis(old.get(axis), configs.get(axis));
            }
            self.seen_configs = Arc::clone(configs);
        }
    }

    fn diff_axis(&mut self, old: &AxisConfig, new: &AxisConfig) {
        let axis = new.axis;
        let stopped = old.enabled && !new.enabled;
        let fill_ended = new.enabled && old.fill_active() && !new.fill_mode.is_active();
        if stopped || fill_ended {
            self.ramps.remove(axis);
            if let Some(last) = self.dirty.last(axis) {
                debug!("{}: return to center from {}", axis, last);
                self.returns.insert(axis, last as f64);
            }
        }

        if new.fill_active() && !old.fill_active() {
            debug!("{}: ramping up {:?} fill", axis, new.fill_mode);
            self.returns.remove(axis);
            self.ramps.insert(axis, 0.0);
            self.fills.insert(axis, FillState::default());
        } else if !new.fill_active() {
            self.fills.remove(axis);
        }
    }

    /// Compute one tick. Returns the newline-terminated line to send, or
    /// `None` when every axis was silent or suppressed.
    pub fn tick(&mut self, mut input: TickInput<'_>) -> Option<String> {
        self.observe(input.configs, input.scripts);

        for (axis, state) in input.tests.iter_mut() {
            if state.needs_reset {
                self.randoms[axis.index()].reset();
                state.needs_reset = false;
            }
        }

        let dt_s = match self.last_tick_ms {
            Some(last) => ((input.now_ms - last) / 1000.0).clamp(0.0, MAX_FILL_DT_S),
            None => 0.0,
        };
        self.last_tick_ms = Some(input.now_ms);
        let interval = input.interval_ms.round().max(1.0) as u32;

        let stroke = if input.playing {
            self.scripted_position(Axis::Stroke, &input)
        } else {
            None
        };
        let stroke_travel = match (stroke, self.prev_stroke) {
            (Some(s), Some(p)) => (s - p).abs(),
            _ => 0.0,
        };
        self.prev_stroke = stroke;
        let ctx = FillContext {
            dt_s,
            stroke,
            stroke_travel,
        };

        let configs = Arc::clone(input.configs);
        let mut line = CommandLine::new();
        for axis in Axis::ALL {
            let config = configs.get(axis);
            if let Some(value) = self.axis_value(config, &mut input, &ctx) {
                if self.dirty.update(axis, value) {
                    line.push(axis, value, interval);
                }
            }
        }

        let out = line.finish();
        if let Some(ref l) = out {
            trace!("tick → {}", l.trim_end());
        }
        out
    }

    /// Per-axis decision, first match wins:
    /// disabled → return-to-center; under test → test pattern; scripted and
    /// playing → script; fill and playing → fill; otherwise return-to-center.
    fn axis_value(
        &mut self,
        config: &AxisConfig,
        input: &mut TickInput<'_>,
        ctx: &FillContext,
    ) -> Option<i32> {
        let axis = config.axis;
        let rate = input.output_rate_hz;

        if !config.enabled {
            return self.step_return(axis);
        }

        if manual_test::produces_output(config) {
            if let Some(state) = input.tests.get_mut(axis) {
                self.returns.remove(axis);
                state.advance(input.now_ms, rate);
                let raw = manual_test::synthesize(config, state, &mut self.randoms[axis.index()]);
                let value = round_tcode(fill::pitch_cap(axis, scale_excursion(raw, rate)));
                return Some(apply_offset(value, config));
            }
        }

        if input.playing {
            if let Some(position) = self.scripted_position(axis, input) {
                self.returns.remove(axis);
                let value = position_to_tcode(position, config.min, config.max);
                let value = if rate == REFERENCE_RATE_HZ {
                    value
                } else {
                    round_tcode(scale_excursion(value as f64, rate))
                };
                return Some(apply_offset(value, config));
            }

            if config.fill_mode.is_active() {
                if !self.fills.contains(axis) {
                    self.fills.insert(axis, FillState::default());
                }
                let state = self.fills.get_mut(axis)?;
                match fill::synthesize(config, state, &mut self.randoms[axis.index()], ctx) {
                    Some(raw) => {
                        self.returns.remove(axis);
                        let target = fill::pitch_cap(axis, scale_excursion(raw, rate));
                        let blended = self.apply_ramp(axis, target);
                        return Some(apply_offset(round_tcode(blended), config));
                    }
                    None => {
                        self.begin_return(axis);
                        return self.step_return(axis);
                    }
                }
            }
        }

        self.step_return(axis)
    }

    /// Position from the external override, else the axis's script.
    fn scripted_position(&self, axis: Axis, input: &TickInput<'_>) -> Option<f64> {
        if let Some(pos) = input.external.and_then(|ext| ext[axis.index()]) {
            return Some(pos.clamp(0.0, 100.0));
        }
        input
            .scripts
            .get(axis)
            .map(|actions| input.interpolation.get_position(actions, input.media_time_ms, axis))
    }

    fn apply_ramp(&mut self, axis: Axis, target: f64) -> f64 {
        let Some(blend) = self.ramps.get_mut(axis) else {
            return target;
        };
        *blend += (1.0 - *blend) * BLEND_RATE;
        let out = TCODE_MID + (target - TCODE_MID) * *blend;
        if *blend >= RAMP_DONE {
            debug!("{}: ramp-up complete", axis);
            self.ramps.remove(axis);
        }
        out
    }

    fn begin_return(&mut self, axis: Axis) {
        if self.returns.contains(axis) {
            return;
        }
        if let Some(last) = self.dirty.last(axis) {
            if last != TCODE_MID as i32 {
                self.returns.insert(axis, last as f64);
            }
        }
    }

    fn step_return(&mut self, axis: Axis) -> Option<i32> {
        let value = self.returns.get_mut(axis)?;
        *value += (TCODE_MID - *value) * BLEND_RATE;
        if (*value - TCODE_MID).abs() < RETURN_EPSILON {
            self.returns.remove(axis);
            return Some(TCODE_MID as i32);
        }
        Some(round_tcode(*value))
    }
}
