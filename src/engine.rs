use crate::interpolation::InterpolationService;
use crate::manual_test::{self, TestState};
use crate::tcode::{midpoint_tcode, CommandLine};
use crate::ticker::{TickInput, Ticker};
use crate::transport::{NullTransport, Transport};
use crate::types::*;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const EVENT_CAPACITY: usize = 64;
const JOIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Above this much remaining time the loop sleeps coarsely.
const COARSE_SLEEP_ABOVE: Duration = Duration::from_millis(5);
/// Below this the loop spins instead of sleeping.
const SPIN_BELOW: Duration = Duration::from_millis(2);
/// Loop iterations between stats lines.
const STATS_EVERY: u64 = 10_000;

// ─── Shared state ───────────────────────────────────────────────────────────

/// Last published media position and how to extrapolate from it.
#[derive(Debug, Clone, Copy)]
struct SyncPoint {
    media_ms: f64,
    wall_ms: f64,
    playing: bool,
    speed: f64,
}

impl SyncPoint {
    fn media_at(&self, now_ms: f64) -> f64 {
        if self.playing {
            self.media_ms + (now_ms - self.wall_ms).max(0.0) * self.speed
        } else {
            self.media_ms
        }
    }

    /// Move the anchor to `now_ms` without changing the extrapolated position.
    fn rebase(&mut self, now_ms: f64) {
        self.media_ms = self.media_at(now_ms);
        self.wall_ms = now_ms;
    }
}

/// f64 stored as bits, for scalars the output thread reads every tick.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Stats {
    iterations: u64,
    lines: u64,
    send_errors: u64,
    panics: u64,
}

/// Everything the output path mutates. Locked while a line is built and
/// while its result is recorded, never across a transport write.
struct OutputState {
    ticker: Ticker,
    stats: Stats,
}

struct Shared {
    clock: Arc<dyn Clock>,
    transport: Mutex<Arc<dyn Transport>>,
    configs: Mutex<Arc<AxisConfigs>>,
    scripts: Mutex<Arc<ScriptSet>>,
    external: Mutex<Option<[Option<f64>; 4]>>,
    sync: Mutex<SyncPoint>,
    output_rate: AtomicF64,
    offset_ms: AtomicF64,
    interpolation: InterpolationService,
    tests: Mutex<AxisMap<TestState>>,
    output: Mutex<OutputState>,
    events_tx: Sender<EngineEvent>,
}

/// Lock, recovering the data if a panicked tick poisoned the mutex.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&lock(&self.transport))
    }

    fn emit(&self, event: EngineEvent) {
        if self.events_tx.try_send(event).is_err() {
            trace!("Event channel full; event dropped");
        }
    }

    /// One loop iteration. Returns the line that was built, if any.
    ///
    /// Lock order: output, then tests. Both are released before the write.
    fn iterate(&self) -> Option<String> {
        let now_ms = self.clock.now_ms();
        let rate = self.output_rate.load();
        let configs = Arc::clone(&lock(&self.configs));
        let scripts = Arc::clone(&lock(&self.scripts));
        let external = *lock(&self.external);
        let sync = *lock(&self.sync);
        let transport = self.transport();

        let mut output = lock(&self.output);
        let OutputState { ticker, stats } = &mut *output;

        ticker.observe(&configs, &scripts);
        let interval_ms = match ticker.last_iteration_ms {
            Some(last) => now_ms - last,
            None => 1000.0 / rate,
        };
        ticker.last_iteration_ms = Some(now_ms);

        stats.iterations += 1;
        if stats.iterations % STATS_EVERY == 0 {
            info!(
                "Output: {} iterations, {} lines sent, {} send errors, {} panics",
                stats.iterations, stats.lines, stats.send_errors, stats.panics
            );
        }

        let mut tests = lock(&self.tests);
        let active = transport.is_connected()
            && (sync.playing || ticker.has_pending_animation() || !tests.is_empty());
        if !active {
            return None;
        }

        let line = ticker.tick(TickInput {
            now_ms,
            interval_ms,
            media_time_ms: sync.media_at(now_ms) - self.offset_ms.load(),
            playing: sync.playing,
            output_rate_hz: rate,
            configs: &configs,
            scripts: &scripts,
            external,
            interpolation: &self.interpolation,
            tests: &mut *tests,
        });
        drop(tests);
        drop(output);

        let line = line?;
        let result = transport.send(&line);

        let mut output = lock(&self.output);
        match result {
            Ok(()) => output.stats.lines += 1,
            Err(e) => {
                output.stats.send_errors += 1;
                output.ticker.mark_unsent();
                debug!("Send failed: {}", e);
            }
        }
        Some(line)
    }

    /// Write a line outside the tick path and note the values in the dirty
    /// cache. Not retried on failure.
    fn send_direct(&self, values: &[(Axis, i32)], interval_ms: u32) -> Result<(), String> {
        let mut line = CommandLine::new();
        for &(axis, value) in values {
            line.push(axis, value, interval_ms);
        }
        let Some(text) = line.finish() else {
            return Ok(());
        };

        let transport = self.transport();
        if !transport.is_connected() {
            return Err("transport not connected".into());
        }
        transport.send(&text)?;

        let mut output = lock(&self.output);
        for &(axis, value) in values {
            output.ticker.record_sent(axis, value);
        }
        trace!("direct → {}", text.trim_end());
        Ok(())
    }

    /// Glide the given axes back to their range midpoint.
    fn glide_to_center(&self, axes: &[Axis]) {
        let configs = Arc::clone(&lock(&self.configs));
        let values: Vec<(Axis, i32)> = axes
            .iter()
            .map(|&axis| configs.get(axis))
            .filter(|cfg| manual_test::produces_output(cfg))
            .map(|cfg| (cfg.axis, midpoint_tcode(cfg)))
            .collect();
        if let Err(e) = self.send_direct(&values, TEST_STOP_INTERVAL_MS) {
            debug!("Test stop glide not sent: {}", e);
        }
    }
}

// ─── Output loop ────────────────────────────────────────────────────────────

fn run_loop(shared: Arc<Shared>, running: Arc<AtomicBool>, done_tx: Sender<()>) {
    info!("Output loop running at {:.0} Hz", shared.output_rate.load());
    let mut next = Instant::now();

    while running.load(Ordering::Acquire) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| shared.iterate()));
        if result.is_err() {
            error!("Tick panicked; transient output state reset");
            let mut output = lock(&shared.output);
            output.ticker.reset();
            output.stats.panics += 1;
        }

        next += Duration::from_secs_f64(1.0 / shared.output_rate.load());
        let now = Instant::now();
        if next < now {
            // Fell behind: re-sync instead of bursting to catch up
            next = now;
        }
        sleep_until(next, &running);
    }

    info!("Output loop stopped");
    let _ = done_tx.send(());
}

/// Coarse sleep while far from the deadline, short sleeps when close, and a
/// spin for the last couple of milliseconds.
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::Relaxed) {
            return;
        }
        let remaining = deadline - now;
        if remaining > COARSE_SLEEP_ABOVE {
            thread::sleep(remaining - COARSE_SLEEP_ABOVE);
        } else if remaining > SPIN_BELOW {
            thread::sleep(Duration::from_millis(1));
        } else {
            std::hint::spin_loop();
        }
    }
}

/// One output thread. The stop flag is per thread, so a detached thread
/// that is still inside a write exits on its own after a restart.
struct Worker {
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
    running: Arc<AtomicBool>,
}

// ─── Engine ─────────────────────────────────────────────────────────────────

/// Turns scripts, fills and manual tests into a paced stream of TCode lines.
///
/// Every setter may be called from any thread; each publishes a whole new
/// value that the output thread picks up on its next iteration. The output
/// thread is the only writer of tick state, except for `tick_now`, homing
/// and test-stop glides, which serialize with it on the same lock.
pub struct CommandEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    events_rx: Receiver<EngineEvent>,
}

impl CommandEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(transport, Arc::new(SessionClock::new()))
    }

    /// Engine with no device attached. Idles until `set_transport`.
    pub fn disconnected() -> Self {
        Self::new(Arc::new(NullTransport))
    }

    pub fn with_clock(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let configs = Arc::new(AxisConfigs::default());
        let scripts = Arc::new(ScriptSet::new());
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        let now_ms = clock.now_ms();

        let shared = Shared {
            clock,
            transport: Mutex::new(transport),
            configs: Mutex::new(Arc::clone(&configs)),
            scripts: Mutex::new(Arc::clone(&scripts)),
            external: Mutex::new(None),
            sync: Mutex::new(SyncPoint {
                media_ms: 0.0,
                wall_ms: now_ms,
                playing: false,
                speed: 1.0,
            }),
            output_rate: AtomicF64::new(DEFAULT_OUTPUT_RATE_HZ),
            offset_ms: AtomicF64::new(0.0),
            interpolation: InterpolationService::new(),
            tests: Mutex::new(AxisMap::new()),
            output: Mutex::new(OutputState {
                ticker: Ticker::new(configs, scripts, None),
                stats: Stats::default(),
            }),
            events_tx,
        };

        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
            events_rx,
        }
    }

    /// Seed the random fills so output is reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        {
            let configs = Arc::clone(&lock(&self.shared.configs));
            let scripts = Arc::clone(&lock(&self.shared.scripts));
            let mut output = lock(&self.shared.output);
            output.ticker = Ticker::new(configs, scripts, Some(seed));
        }
        self
    }

    // ─── Published inputs ───────────────────────────────────────────────

    /// Replace every loaded script. Axes absent from the map have none.
    pub fn set_scripts(&self, scripts: HashMap<Axis, FunscriptData>) {
        let set = ScriptSet::from_map(scripts);
        let axes: Vec<&str> = Axis::ALL
            .into_iter()
            .filter(|a| set.has(*a))
            .map(Axis::id)
            .collect();
        info!(
            "Scripts loaded: [{}] ({:.1}s)",
            axes.join(", "),
            set.duration_ms() as f64 / 1000.0
        );
        *lock(&self.shared.scripts) = Arc::new(set);
        self.shared.interpolation.reset_indices();
    }

    pub fn has_scripts(&self) -> bool {
        !lock(&self.shared.scripts).is_empty()
    }

    /// Replace the axis configuration. Values are clamped; axes missing from
    /// the list are disabled.
    pub fn set_axis_configs(&self, configs: &[AxisConfig]) {
        let configs = AxisConfigs::from_list(configs);
        debug!("Axis configs replaced: {:?}", configs);
        *lock(&self.shared.configs) = Arc::new(configs);
    }

    pub fn axis_configs(&self) -> Arc<AxisConfigs> {
        Arc::clone(&lock(&self.shared.configs))
    }

    pub fn set_output_rate(&self, hz: f64) {
        let hz = if hz.is_finite() {
            hz.clamp(MIN_OUTPUT_RATE_HZ, MAX_OUTPUT_RATE_HZ)
        } else {
            DEFAULT_OUTPUT_RATE_HZ
        };
        self.shared.output_rate.store(hz);
        info!("Output rate set to {:.0} Hz", hz);
    }

    pub fn output_rate(&self) -> f64 {
        self.shared.output_rate.load()
    }

    /// Publish the host's current media position.
    pub fn set_time(&self, media_ms: f64) {
        if !media_ms.is_finite() {
            return;
        }
        let now_ms = self.shared.clock.now_ms();
        let mut sync = lock(&self.shared.sync);
        sync.media_ms = media_ms.max(0.0);
        sync.wall_ms = now_ms;
    }

    /// Starting playback with a script loaded ends every manual test.
    pub fn set_playing(&self, playing: bool) {
        let now_ms = self.shared.clock.now_ms();
        let was_playing = {
            let mut sync = lock(&self.shared.sync);
            let was = sync.playing;
            sync.rebase(now_ms);
            sync.playing = playing;
            was
        };
        if was_playing != playing {
            debug!("Playback {}", if playing { "started" } else { "paused" });
        }
        if playing && self.has_scripts() {
            self.stop_all_test_axes();
        }
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.shared.sync).playing
    }

    pub fn set_playback_speed(&self, speed: f64) {
        let speed = if speed.is_finite() {
            speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
        } else {
            1.0
        };
        let now_ms = self.shared.clock.now_ms();
        let mut sync = lock(&self.shared.sync);
        sync.rebase(now_ms);
        sync.speed = speed;
    }

    /// Constant subtracted from the media time before script lookup.
    pub fn set_offset(&self, offset_ms: f64) {
        self.shared
            .offset_ms
            .store(if offset_ms.is_finite() { offset_ms } else { 0.0 });
    }

    /// Drive axes from caller-supplied positions (0–100) instead of their
    /// scripts. `None` returns to script-driven output.
    pub fn set_external_positions(&self, positions: Option<HashMap<Axis, f64>>) {
        let slots = positions.map(|map| {
            let mut slots = [None; 4];
            for (axis, pos) in map {
                if pos.is_finite() {
                    slots[axis.index()] = Some(pos);
                }
            }
            slots
        });
        *lock(&self.shared.external) = slots;
    }

    /// Swap the device link. The dirty cache is cleared so the new device
    /// receives a full state on the next tick.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *lock(&self.shared.transport) = transport;
        lock(&self.shared.output).ticker.reset();
        info!("Transport replaced");
    }

    /// Extrapolated media time, before the offset is applied.
    pub fn current_time_ms(&self) -> f64 {
        let now_ms = self.shared.clock.now_ms();
        lock(&self.shared.sync).media_at(now_ms)
    }

    // ─── Timer ──────────────────────────────────────────────────────────

    /// Start the output thread. No-op if already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return;
        }

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = bounded(1);
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&running);
        match thread::Builder::new()
            .name("tcode-output".into())
            .spawn(move || run_loop(shared, flag, done_tx))
        {
            Ok(handle) => {
                *worker = Some(Worker {
                    handle,
                    done_rx,
                    running,
                })
            }
            Err(e) => error!("Failed to spawn output thread: {}", e),
        }
    }

    /// Stop the output thread, waiting a bounded time for it to exit, and
    /// clear transient tick state. No-op if not running.
    ///
    /// A thread stuck in a device write is detached after the timeout; it
    /// exits once the write returns.
    pub fn stop_timer(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.running.store(false, Ordering::Release);

        match worker.done_rx.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Output thread exited with a panic");
                }
                lock(&self.shared.output).ticker.reset();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Output thread did not stop within {:?}; detaching",
                    JOIN_TIMEOUT
                );
                match self.shared.output.try_lock() {
                    Ok(mut output) => output.ticker.reset(),
                    Err(TryLockError::Poisoned(e)) => e.into_inner().ticker.reset(),
                    Err(TryLockError::WouldBlock) => {
                        debug!("Tick state busy; left to the detached thread")
                    }
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::Acquire))
    }

    /// Run one loop iteration on the calling thread and return what was
    /// sent. Meant for stepping with a manual clock while the timer is off.
    pub fn tick_now(&self) -> Option<String> {
        self.shared.iterate()
    }

    // ─── Manual test ────────────────────────────────────────────────────

    /// Oscillate an axis without a script. Restarting a running test only
    /// changes its target speed.
    pub fn start_test_axis(&self, axis: Axis, speed_hz: f64) {
        let mut tests = lock(&self.shared.tests);
        match tests.get_mut(axis) {
            Some(state) => state.set_target_speed(speed_hz),
            None => {
                tests.insert(axis, TestState::new(speed_hz));
                let config = *self.axis_configs().get(axis);
                if manual_test::produces_output(&config) {
                    info!("Test started on {} at {:.2} Hz", axis, speed_hz);
                } else {
                    info!("Test registered on {} (no fill mode; inert)", axis);
                }
            }
        }
    }

    /// Retarget a running test. The speed eases toward the new value.
    pub fn update_test_speed(&self, axis: Axis, speed_hz: f64) {
        if let Some(state) = lock(&self.shared.tests).get_mut(axis) {
            state.set_target_speed(speed_hz);
        }
    }

    /// End a test and glide the axis to its midpoint. Returns false if the
    /// axis was not under test.
    pub fn stop_test_axis(&self, axis: Axis) -> bool {
        if lock(&self.shared.tests).remove(axis).is_none() {
            return false;
        }
        info!("Test stopped on {}", axis);
        self.shared.glide_to_center(&[axis]);
        self.shared.emit(EngineEvent::TestStopped(axis));
        true
    }

    /// End every test. Returns the axes that were stopped.
    pub fn stop_all_test_axes(&self) -> Vec<Axis> {
        let axes = {
            let mut tests = lock(&self.shared.tests);
            let axes = tests.axes();
            tests.clear();
            axes
        };
        if axes.is_empty() {
            return axes;
        }
        info!("All tests stopped ({} axes)", axes.len());
        self.shared.glide_to_center(&axes);
        self.shared.emit(EngineEvent::AllTestsStopped(axes.clone()));
        axes
    }

    /// Current (smoothed) speed of a test, if the axis is under test.
    pub fn test_speed(&self, axis: Axis) -> Option<f64> {
        lock(&self.shared.tests).get(axis).map(|state| state.speed_hz)
    }

    pub fn is_axis_testing(&self, axis: Axis) -> bool {
        lock(&self.shared.tests).contains(axis)
    }

    // ─── Homing / notifications ─────────────────────────────────────────

    /// Send every axis to its offset-adjusted midpoint over a long interval.
    /// Use right after connecting.
    pub fn home_axes(&self) -> Result<(), String> {
        let configs = self.axis_configs();
        let values: Vec<(Axis, i32)> = Axis::ALL
            .into_iter()
            .map(|axis| (axis, midpoint_tcode(configs.get(axis))))
            .collect();
        self.shared.send_direct(&values, HOME_INTERVAL_MS)?;
        info!("Homing all axes over {} ms", HOME_INTERVAL_MS);
        Ok(())
    }

    /// Engine notifications. Every clone reads from the same queue.
    pub fn events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
