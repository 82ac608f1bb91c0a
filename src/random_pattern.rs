use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Minimum transition length in progress units, before randomization.
const MIN_TRANSITION: f64 = 50.0;
/// Random spread added on top of the minimum.
const TRANSITION_SPREAD: f64 = 250.0;

/// Smooth random walk between randomly drawn targets.
///
/// Progress is any caller-defined scalar that mostly increases: stroke
/// distance, scaled time, whatever. Each transition eases in and out with a
/// half-cosine, so velocity is zero at both ends. A transition lasts at
/// least as many progress units as the distance it travels, which keeps a
/// stroke-synced axis from moving faster than the stroke itself.
pub struct RandomPatternGenerator {
    rng: StdRng,
    min: f64,
    max: f64,
    start_val: f64,
    target_val: f64,
    transition_start: f64,
    transition_duration: f64,
    initialized: bool,
}

impl RandomPatternGenerator {
    /// Generator seeded from the OS.
    pub fn new(min: f64, max: f64) -> Self {
        Self::with_rng(StdRng::from_os_rng(), min, max)
    }

    /// Fully deterministic generator: same seed and progress sequence give
    /// the same output sequence.
    pub fn with_seed(seed: u64, min: f64, max: f64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), min, max)
    }

    fn with_rng(rng: StdRng, min: f64, max: f64) -> Self {
        let (min, max) = ordered(min, max);
        Self {
            rng,
            min,
            max,
            start_val: min,
            target_val: min,
            transition_start: 0.0,
            transition_duration: 1.0,
            initialized: false,
        }
    }

    /// Bounds for future targets. A transition already in flight keeps
    /// its endpoints.
    pub fn set_range(&mut self, min: f64, max: f64) {
        let (min, max) = ordered(min, max);
        self.min = min;
        self.max = max;
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Forget the current walk; the next call starts fresh at its progress.
    pub fn reset(&mut self) {
        self.initialized = false;
    }

    pub fn get_position(&mut self, progress: f64) -> f64 {
        if !self.initialized {
            let first = self.draw();
            self.start_val = first;
            self.target_val = first;
            self.transition_start = progress;
            // Retarget on the very next unit of progress
            self.transition_duration = 1.0;
            self.initialized = true;
        }

        if progress - self.transition_start >= self.transition_duration {
            self.start_val = self.target_val;
            self.target_val = self.draw();
            self.transition_start = progress;
            let travel = (self.target_val - self.start_val).abs();
            let floor = MIN_TRANSITION + self.rng.random::<f64>() * TRANSITION_SPREAD;
            self.transition_duration = travel.max(floor);
        }

        let t = ((progress - self.transition_start) / self.transition_duration).clamp(0.0, 1.0);
        let eased = (1.0 - (t * PI).cos()) / 2.0;
        self.start_val + (self.target_val - self.start_val) * eased
    }

    fn draw(&mut self) -> f64 {
        self.min + self.rng.random::<f64>() * (self.max - self.min)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_within_range() {
        for seed in 0..20 {
            let mut g = RandomPatternGenerator::with_seed(seed, 20.0, 80.0);
            let mut progress = 0.0;
            for i in 0..5000 {
                progress += (i % 7) as f64 * 0.9;
                let v = g.get_position(progress);
                assert!((20.0..=80.0).contains(&v), "seed {} step {}: {}", seed, i, v);
            }
        }
    }

    #[test]
    fn test_deterministic_with_seed() {
        let mut a = RandomPatternGenerator::with_seed(42, 0.0, 100.0);
        let mut b = RandomPatternGenerator::with_seed(42, 0.0, 100.0);
        for i in 0..2000 {
            let p = i as f64 * 1.7;
            assert_eq!(a.get_position(p), b.get_position(p));
        }
    }

    #[test]
    fn test_small_progress_steps_are_smooth() {
        let mut g = RandomPatternGenerator::with_seed(7, 0.0, 100.0);
        let mut prev = g.get_position(0.0);
        for i in 1..20_000 {
            let v = g.get_position(i as f64 * 0.5);
            // Max slope is (pi / 2) * travel / duration <= pi / 2 per unit
            assert!((v - prev).abs() <= 0.5 * PI / 2.0 + 1e-9, "jump at step {}", i);
            prev = v;
        }
    }

    #[test]
    fn test_first_call_returns_drawn_value() {
        let mut g = RandomPatternGenerator::with_seed(3, 10.0, 20.0);
        let first = g.get_position(100.0);
        assert!((10.0..=20.0).contains(&first));
        // Same progress again: still at the start of the walk
        assert_eq!(g.get_position(100.0), first);
    }

    #[test]
    fn test_backwards_progress_holds() {
        let mut g = RandomPatternGenerator::with_seed(9, 0.0, 100.0);
        g.get_position(0.0);
        g.get_position(5.0);
        let at_start = g.get_position(5.0);
        assert_eq!(g.get_position(2.0), at_start, "t clamps at 0");
    }

    #[test]
    fn test_reset_restarts_walk() {
        let mut g = RandomPatternGenerator::with_seed(11, 0.0, 100.0);
        for i in 0..100 {
            g.get_position(i as f64 * 10.0);
        }
        g.reset();
        // After reset, progress far in the past is accepted as a new origin
        let v = g.get_position(0.0);
        assert!((0.0..=100.0).contains(&v));
        assert_eq!(g.get_position(0.5), v);
    }

    #[test]
    fn test_set_range_applies_to_new_targets() {
        let mut g = RandomPatternGenerator::with_seed(5, 0.0, 100.0);
        g.get_position(0.0);
        g.set_range(40.0, 60.0);
        assert_eq!(g.range(), (40.0, 60.0));
        let mut progress = 1.0;
        // Let the in-flight transition finish, then every new target is
        // inside the new range.
        for i in 0..50 {
            progress += 400.0;
            let v = g.get_position(progress);
            if i > 0 {
                assert!((40.0..=60.0).contains(&v), "{}", v);
            }
        }
    }

    #[test]
    fn test_inverted_range_is_ordered() {
        let g = RandomPatternGenerator::with_seed(1, 90.0, 10.0);
        assert_eq!(g.range(), (10.0, 90.0));
    }

    #[test]
    fn test_degenerate_range() {
        let mut g = RandomPatternGenerator::with_seed(1, 50.0, 50.0);
        for i in 0..100 {
            assert_eq!(g.get_position(i as f64 * 3.0), 50.0);
        }
    }
}
