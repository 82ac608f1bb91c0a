//! Stateless waveform shapes for fill and test motion.
//!
//! Every shape maps a phase to a sample in [0, 1]. Phase wraps modulo 1
//! (negative phases wrap forward). All shapes are continuous across the
//! wrap seam and have bounded slope, so the actuator never has to reverse
//! instantaneously.

use crate::types::FillMode;
use std::f64::consts::PI;

/// Fraction of a Saw period spent on the linear rise.
const SAW_RISE: f64 = 0.85;

/// Sample `shape` at `phase`.
///
/// `Grind` and `ReverseGrind` treat `phase` as a normalized stroke position
/// rather than a cyclic phase: the value is clamped, not wrapped. Shapes
/// without a waveform (`None`, `Random`, `Figure8`) return 0.5.
pub fn calculate(shape: FillMode, phase: f64) -> f64 {
    if !phase.is_finite() {
        return 0.5;
    }
    let value = match shape {
        FillMode::Triangle => triangle(wrap(phase)),
        FillMode::Sine => sine(wrap(phase)),
        FillMode::Saw => saw(wrap(phase)),
        FillMode::SawtoothReverse => saw(1.0 - wrap(phase)),
        FillMode::Square => dwell(wrap(phase), 0.10, 0.50, 0.60),
        FillMode::Pulse => dwell(wrap(phase), 0.15, 0.50, 0.65),
        FillMode::EaseInOut => ease_in_out_cubic(triangle(wrap(phase))),
        FillMode::Grind => phase.clamp(0.0, 1.0),
        FillMode::ReverseGrind => 1.0 - phase.clamp(0.0, 1.0),
        FillMode::None | FillMode::Random | FillMode::Figure8 => 0.5,
    };
    value.clamp(0.0, 1.0)
}

/// Wrap into [0, 1). `rem_euclid` can round up to exactly 1.0 for tiny
/// negative inputs.
fn wrap(phase: f64) -> f64 {
    let p = phase.rem_euclid(1.0);
    if p >= 1.0 {
        0.0
    } else {
        p
    }
}

fn triangle(p: f64) -> f64 {
    if p < 0.5 {
        2.0 * p
    } else {
        2.0 * (1.0 - p)
    }
}

fn sine(p: f64) -> f64 {
    (1.0 - (2.0 * PI * p).cos()) / 2.0
}

/// Linear rise over 85% of the period, cosine-eased fall over the rest.
/// Takes p in [0, 1] inclusive so the reversed form can pass `1 - p`.
fn saw(p: f64) -> f64 {
    if p < SAW_RISE {
        p / SAW_RISE
    } else {
        let t = (p - SAW_RISE) / (1.0 - SAW_RISE);
        (1.0 + (PI * t).cos()) / 2.0
    }
}

/// Cosine rise over [0, rise_end), high until fall_start, cosine fall until
/// fall_end, low for the rest.
fn dwell(p: f64, rise_end: f64, fall_start: f64, fall_end: f64) -> f64 {
    if p < rise_end {
        (1.0 - (PI * p / rise_end).cos()) / 2.0
    } else if p < fall_start {
        1.0
    } else if p < fall_end {
        let t = (p - fall_start) / (fall_end - fall_start);
        (1.0 + (PI * t).cos()) / 2.0
    } else {
        0.0
    }
}

fn ease_in_out_cubic(t: f64) -> f64 {
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPES: [FillMode; 9] = [
        FillMode::Triangle,
        FillMode::Sine,
        FillMode::Saw,
        FillMode::SawtoothReverse,
        FillMode::Square,
        FillMode::Pulse,
        FillMode::EaseInOut,
        FillMode::Grind,
        FillMode::ReverseGrind,
    ];

    #[test]
    fn test_all_shapes_bounded() {
        for shape in SHAPES {
            for i in -3000..3000 {
                let phase = i as f64 / 997.0;
                let v = calculate(shape, phase);
                assert!((0.0..=1.0).contains(&v), "{:?} at {} = {}", shape, phase, v);
            }
        }
    }

    #[test]
    fn test_non_finite_phase() {
        assert_eq!(calculate(FillMode::Sine, f64::NAN), 0.5);
        assert_eq!(calculate(FillMode::Triangle, f64::INFINITY), 0.5);
    }

    #[test]
    fn test_unknown_shapes_are_centered() {
        for shape in [FillMode::None, FillMode::Random, FillMode::Figure8] {
            assert_eq!(calculate(shape, 0.3), 0.5);
        }
    }

    #[test]
    fn test_triangle_and_sine_landmarks() {
        assert_eq!(calculate(FillMode::Triangle, 0.0), 0.0);
        assert!((calculate(FillMode::Triangle, 0.5) - 1.0).abs() < 1e-12);
        assert!((calculate(FillMode::Triangle, 0.25) - 0.5).abs() < 1e-12);
        assert!(calculate(FillMode::Sine, 0.0).abs() < 1e-12);
        assert!((calculate(FillMode::Sine, 0.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_phase_wraps_forward() {
        for shape in SHAPES.iter().take(7) {
            let a = calculate(*shape, -0.25);
            let b = calculate(*shape, 0.75);
            assert!((a - b).abs() < 1e-9, "{:?}: {} vs {}", shape, a, b);
        }
        assert_eq!(calculate(FillMode::Triangle, -1e-20), 0.0);
    }

    #[test]
    fn test_saw_shape() {
        assert!((calculate(FillMode::Saw, 0.425) - 0.5).abs() < 1e-9);
        assert!((calculate(FillMode::Saw, 0.85) - 1.0).abs() < 1e-9);
        assert!((calculate(FillMode::Saw, 0.925) - 0.5).abs() < 1e-9);
        // Mirror: reversed saw at p equals saw at 1 - p
        assert!(
            (calculate(FillMode::SawtoothReverse, 0.1) - calculate(FillMode::Saw, 0.9)).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_square_and_pulse_dwell() {
        assert_eq!(calculate(FillMode::Square, 0.3), 1.0);
        assert_eq!(calculate(FillMode::Square, 0.8), 0.0);
        assert!((calculate(FillMode::Square, 0.05) - 0.5).abs() < 1e-9);
        assert_eq!(calculate(FillMode::Pulse, 0.3), 1.0);
        assert_eq!(calculate(FillMode::Pulse, 0.7), 0.0);
        assert!(calculate(FillMode::Pulse, 0.1) < calculate(FillMode::Square, 0.1));
    }

    #[test]
    fn test_seams_are_continuous() {
        // Step a full cycle finely; no sample-to-sample jump exceeds what a
        // steep but finite slope allows.
        let step = 1e-4;
        for shape in SHAPES.iter().take(7) {
            let mut prev = calculate(*shape, -step);
            for i in 0..=10_000 {
                let v = calculate(*shape, i as f64 * step);
                assert!((v - prev).abs() < 0.01, "{:?} jumps at {}", shape, i as f64 * step);
                prev = v;
            }
        }
    }

    #[test]
    fn test_grind_is_clamped_passthrough() {
        assert_eq!(calculate(FillMode::Grind, 0.3), 0.3);
        assert_eq!(calculate(FillMode::Grind, 1.5), 1.0);
        assert_eq!(calculate(FillMode::Grind, -0.5), 0.0);
        assert!((calculate(FillMode::ReverseGrind, 0.3) - 0.7).abs() < 1e-12);
        assert_eq!(calculate(FillMode::ReverseGrind, 2.0), 0.0);
    }

    #[test]
    fn test_ease_in_out_symmetry() {
        let a = calculate(FillMode::EaseInOut, 0.1);
        let b = calculate(FillMode::EaseInOut, 0.9);
        assert!((a - b).abs() < 1e-9);
        assert!((calculate(FillMode::EaseInOut, 0.125) - 0.0625).abs() < 1e-9);
    }
}
