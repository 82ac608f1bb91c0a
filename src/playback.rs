use crate::engine::CommandEngine;
use crate::types::*;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default rate at which a video player reports its position.
pub const DEFAULT_UPDATE_HZ: u32 = 60;

/// Stands in for a host video player: advances a virtual media clock and
/// reports it to the engine with `set_time`, the way a player's time-update
/// callback would.
pub struct PlaybackSimulator {
    engine: Arc<CommandEngine>,
    start_ms: f64,
    end_ms: Option<f64>,
    speed: f64,
    update_hz: u32,
}

impl PlaybackSimulator {
    pub fn new(engine: Arc<CommandEngine>) -> Self {
        Self {
            engine,
            start_ms: 0.0,
            end_ms: None,
            speed: 1.0,
            update_hz: DEFAULT_UPDATE_HZ,
        }
    }

    pub fn with_start(mut self, start_ms: f64) -> Self {
        self.start_ms = start_ms.max(0.0);
        self
    }

    /// Stop when media time reaches `end_ms`. Without one, run until told to stop.
    pub fn with_end(mut self, end_ms: Option<f64>) -> Self {
        self.end_ms = end_ms;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED);
        self
    }

    pub fn with_update_hz(mut self, hz: u32) -> Self {
        self.update_hz = hz.max(1);
        self
    }

    /// Media position after `elapsed_ms` of wall time.
    pub fn media_time_at(&self, elapsed_ms: f64) -> f64 {
        self.start_ms + elapsed_ms.max(0.0) * self.speed
    }

    /// Play from the start position until the end is reached or `stop` is
    /// set, then pause. Blocks the calling thread.
    pub fn run(&self, stop: &AtomicBool) {
        info!(
            "Playback from {:.1}s at {:.2}x{}",
            self.start_ms / 1000.0,
            self.speed,
            match self.end_ms {
                Some(end) => format!(" until {:.1}s", end / 1000.0),
                None => String::new(),
            }
        );

        self.engine.set_playback_speed(self.speed);
        self.engine.set_time(self.start_ms);
        self.engine.set_playing(true);

        let tick = Duration::from_micros(1_000_000 / self.update_hz as u64);
        let started = Instant::now();
        let mut last_report = 0u64;

        while !stop.load(Ordering::Relaxed) {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let media_ms = self.media_time_at(elapsed_ms);
            if let Some(end) = self.end_ms.filter(|&end| media_ms >= end) {
                self.engine.set_time(end);
                break;
            }
            self.engine.set_time(media_ms);

            let second = (media_ms / 1000.0) as u64;
            if second >= last_report + 10 {
                debug!("Playback at {}s", second);
                last_report = second;
            }
            thread::sleep(tick);
        }

        self.engine.set_playing(false);
        info!(
            "Playback stopped at {:.1}s",
            self.engine.current_time_ms() / 1000.0
        );
    }
}
