use crate::types::{Axis, FunscriptAction};
use std::sync::atomic::{AtomicUsize, Ordering};

const NO_INDEX: usize = usize::MAX;

/// Maps a media timestamp onto a position from sorted keyframes.
///
/// Keeps one cached bracket index per axis. Sequential playback walks the
/// cache forward (amortized O(1)); a request behind the cache (a seek back)
/// falls back to binary search. The cache only affects speed, never the
/// result, so it is safe to read and reset from any thread.
pub struct InterpolationService {
    cached: [AtomicUsize; 4],
}

impl Default for InterpolationService {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpolationService {
    pub fn new() -> Self {
        Self {
            cached: [
                AtomicUsize::new(NO_INDEX),
                AtomicUsize::new(NO_INDEX),
                AtomicUsize::new(NO_INDEX),
                AtomicUsize::new(NO_INDEX),
            ],
        }
    }

    /// Position (0–100) of `actions` at `time_ms`.
    ///
    /// Empty → 50. Before the first keyframe → first position; after the
    /// last → last position. Otherwise linear between the bracketing pair.
    pub fn get_position(&self, actions: &[FunscriptAction], time_ms: f64, axis: Axis) -> f64 {
        let (first, last) = match (actions.first(), actions.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return 50.0,
        };
        if actions.len() == 1 || time_ms <= first.at as f64 {
            return first.pos;
        }
        if time_ms >= last.at as f64 {
            return last.pos;
        }

        // Here first.at < time_ms < last.at, so a bracket i with
        // actions[i].at <= time_ms < actions[i + 1].at always exists.
        let slot = &self.cached[axis.index()];
        let cached = slot.load(Ordering::Relaxed);
        let mut i = if cached < actions.len() - 1 && actions[cached].at as f64 <= time_ms {
            cached
        } else {
            actions.partition_point(|a| a.at as f64 <= time_ms) - 1
        };
        while actions[i + 1].at as f64 <= time_ms {
            i += 1;
        }
        slot.store(i, Ordering::Relaxed);

        let a = &actions[i];
        let b = &actions[i + 1];
        let span = b.at as f64 - a.at as f64;
        if span <= 0.0 {
            return a.pos;
        }
        let t = (time_ms - a.at as f64) / span;
        a.pos + (b.pos - a.pos) * t
    }

    /// Forget every cached bracket. Call after a script swap or seek so the
    /// next lookup starts from binary search.
    pub fn reset_indices(&self) {
        for slot in &self.cached {
            slot.store(NO_INDEX, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn cached_index(&self, axis: Axis) -> Option<usize> {
        match self.cached[axis.index()].load(Ordering::Relaxed) {
            NO_INDEX => None,
            i => Some(i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions(points: &[(u64, f64)]) -> Vec<FunscriptAction> {
        points.iter().map(|&(at, pos)| FunscriptAction::new(at, pos)).collect()
    }

    /// Straightforward reference: binary search with no cache.
    fn reference(actions: &[FunscriptAction], t: f64) -> f64 {
        if actions.is_empty() {
            return 50.0;
        }
        if actions.len() == 1 || t <= actions[0].at as f64 {
            return actions[0].pos;
        }
        let last = actions[actions.len() - 1];
        if t >= last.at as f64 {
            return last.pos;
        }
        let i = actions.partition_point(|a| a.at as f64 <= t) - 1;
        let (a, b) = (actions[i], actions[i + 1]);
        a.pos + (b.pos - a.pos) * (t - a.at as f64) / (b.at - a.at) as f64
    }

    #[test]
    fn test_empty_is_center() {
        let svc = InterpolationService::new();
        assert_eq!(svc.get_position(&[], 1234.0, Axis::Stroke), 50.0);
    }

    #[test]
    fn test_single_point() {
        let svc = InterpolationService::new();
        let a = actions(&[(500, 30.0)]);
        for t in [0.0, 500.0, 10_000.0] {
            assert_eq!(svc.get_position(&a, t, Axis::Stroke), 30.0);
        }
    }

    #[test]
    fn test_boundaries_hold() {
        let svc = InterpolationService::new();
        let a = actions(&[(100, 10.0), (200, 90.0)]);
        assert_eq!(svc.get_position(&a, 0.0, Axis::Stroke), 10.0);
        assert_eq!(svc.get_position(&a, 100.0, Axis::Stroke), 10.0);
        assert_eq!(svc.get_position(&a, 200.0, Axis::Stroke), 90.0);
        assert_eq!(svc.get_position(&a, 5000.0, Axis::Stroke), 90.0);
    }

    #[test]
    fn test_linear_midpoints() {
        let svc = InterpolationService::new();
        let a = actions(&[(0, 0.0), (1000, 100.0)]);
        assert!((svc.get_position(&a, 500.0, Axis::Stroke) - 50.0).abs() < 1e-9);
        assert!((svc.get_position(&a, 250.0, Axis::Stroke) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_exact_keyframe() {
        let svc = InterpolationService::new();
        let a = actions(&[(0, 0.0), (100, 80.0), (200, 20.0), (300, 60.0)]);
        assert_eq!(svc.get_position(&a, 100.0, Axis::Stroke), 80.0);
        assert_eq!(svc.get_position(&a, 200.0, Axis::Stroke), 20.0);
    }

    #[test]
    fn test_duplicate_timestamp_uses_earlier() {
        let svc = InterpolationService::new();
        let a = actions(&[(0, 0.0), (100, 40.0), (100, 90.0), (200, 90.0)]);
        // Between 0 and 100 the first of the duplicates is the bracket end
        assert!((svc.get_position(&a, 50.0, Axis::Stroke) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_matches_reference() {
        let svc = InterpolationService::new();
        let a: Vec<FunscriptAction> = (0..200)
            .map(|i| FunscriptAction::new(i * 137, ((i * 37) % 101) as f64))
            .collect();
        // Interleave forward playback with backward and forward seeks
        let mut times = Vec::new();
        let mut t = 0.0;
        for step in 0..3000 {
            t += 16.7;
            if step % 400 == 399 {
                t -= 9000.0;
            }
            if step % 777 == 776 {
                t += 12_000.0;
            }
            times.push(t);
        }
        for &t in &times {
            let got = svc.get_position(&a, t, Axis::Twist);
            let want = reference(&a, t);
            assert!((got - want).abs() < 1e-9, "t={} got={} want={}", t, got, want);
        }
    }

    #[test]
    fn test_axes_cached_independently() {
        let svc = InterpolationService::new();
        let a = actions(&[(0, 0.0), (100, 100.0), (200, 0.0), (300, 100.0)]);
        svc.get_position(&a, 250.0, Axis::Stroke);
        svc.get_position(&a, 50.0, Axis::Roll);
        assert_eq!(svc.cached_index(Axis::Stroke), Some(2));
        assert_eq!(svc.cached_index(Axis::Roll), Some(0));
        assert_eq!(svc.cached_index(Axis::Pitch), None);
    }

    #[test]
    fn test_reset_indices() {
        let svc = InterpolationService::new();
        let a = actions(&[(0, 0.0), (100, 100.0), (200, 0.0)]);
        svc.get_position(&a, 150.0, Axis::Stroke);
        assert!(svc.cached_index(Axis::Stroke).is_some());
        svc.reset_indices();
        assert_eq!(svc.cached_index(Axis::Stroke), None);
        assert!((svc.get_position(&a, 150.0, Axis::Stroke) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_stale_cache_from_longer_script() {
        let svc = InterpolationService::new();
        let long: Vec<FunscriptAction> =
            (0..50).map(|i| FunscriptAction::new(i * 10, i as f64)).collect();
        svc.get_position(&long, 450.0, Axis::Stroke);
        let short = actions(&[(0, 0.0), (100, 100.0)]);
        assert!((svc.get_position(&short, 50.0, Axis::Stroke) - 50.0).abs() < 1e-9);
    }
}
