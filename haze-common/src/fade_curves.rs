//! Fade curves for transitions
//!
//! A curve maps normalized transition progress `t` in `[0, 1]` to a gain.
//! Fade-in gains run from exactly 0.0 at `t = 0` to exactly 1.0 at `t = 1`;
//! fade-out is the mirror image, `fade_out(t) == fade_in(1 - t)`, so a
//! crossfade built from one curve is always complementary.

use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Gain envelope shape used by fade-out and crossfade transitions
///
/// - Linear: constant rate of change
/// - EqualPower: `sin(t * π/2)`, keeps perceived loudness steady across a crossfade
/// - SCurve: `0.5 * (1 - cos(π * t))`, gentle start and finish
/// - Exponential: `t²`, slow start
/// - Logarithmic: `sqrt(t)`, fast start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    Linear,
    #[default]
    EqualPower,
    #[serde(alias = "cosine", alias = "scurve")]
    SCurve,
    Exponential,
    Logarithmic,
}

impl FadeCurve {
    /// Fade-in gain at normalized position `t` (clamped to `[0, 1]`)
    pub fn fade_in(&self, t: f32) -> f32 {
        if t.is_nan() || t <= 0.0 {
            return 0.0;
        }
        if t >= 1.0 {
            return 1.0;
        }

        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
            FadeCurve::SCurve => 0.5 * (1.0 - (PI * t).cos()),
            FadeCurve::Exponential => t * t,
            FadeCurve::Logarithmic => t.sqrt(),
        }
    }

    /// Fade-out gain at normalized position `t` (clamped to `[0, 1]`)
    ///
    /// Starts at exactly 1.0 and ends at exactly 0.0.
    pub fn fade_out(&self, t: f32) -> f32 {
        if t.is_nan() {
            return 1.0;
        }
        self.fade_in(1.0 - t)
    }

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::EqualPower => "equal_power",
            FadeCurve::SCurve => "s_curve",
            FadeCurve::Exponential => "exponential",
            FadeCurve::Logarithmic => "logarithmic",
        }
    }

    /// All curves, in display order
    pub fn all_variants() -> &'static [FadeCurve] {
        &[
            FadeCurve::Linear,
            FadeCurve::EqualPower,
            FadeCurve::SCurve,
            FadeCurve::Exponential,
            FadeCurve::Logarithmic,
        ]
    }
}

impl fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FadeCurve {
    type Err = Error;

    /// Accepts the canonical names plus a few common spellings
    /// (`cosine`, `scurve`, `s-curve`, `equalpower`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "equal_power" | "equalpower" | "equal-power" => Ok(FadeCurve::EqualPower),
            "s_curve" | "scurve" | "s-curve" | "cosine" => Ok(FadeCurve::SCurve),
            "exponential" => Ok(FadeCurve::Exponential),
            "logarithmic" => Ok(FadeCurve::Logarithmic),
            other => Err(Error::Config(format!("unknown fade curve '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_are_exact() {
        for curve in FadeCurve::all_variants() {
            assert_eq!(curve.fade_in(0.0), 0.0, "{curve} fade-in start");
            assert_eq!(curve.fade_in(1.0), 1.0, "{curve} fade-in end");
            assert_eq!(curve.fade_out(0.0), 1.0, "{curve} fade-out start");
            assert_eq!(curve.fade_out(1.0), 0.0, "{curve} fade-out end");
        }
    }

    #[test]
    fn test_out_of_range_positions_clamp() {
        for curve in FadeCurve::all_variants() {
            assert_eq!(curve.fade_in(-0.5), 0.0);
            assert_eq!(curve.fade_in(7.0), 1.0);
            assert_eq!(curve.fade_out(-0.5), 1.0);
            assert_eq!(curve.fade_out(7.0), 0.0);
        }
    }

    #[test]
    fn test_curves_are_monotonic() {
        for curve in FadeCurve::all_variants() {
            let mut prev_in = curve.fade_in(0.0);
            let mut prev_out = curve.fade_out(0.0);
            for step in 1..=1000 {
                let t = step as f32 / 1000.0;
                let gain_in = curve.fade_in(t);
                let gain_out = curve.fade_out(t);
                assert!(gain_in >= prev_in, "{curve} fade-in decreased at t={t}");
                assert!(gain_out <= prev_out, "{curve} fade-out increased at t={t}");
                assert!((0.0..=1.0).contains(&gain_in));
                assert!((0.0..=1.0).contains(&gain_out));
                prev_in = gain_in;
                prev_out = gain_out;
            }
        }
    }

    #[test]
    fn test_fade_out_mirrors_fade_in() {
        for curve in FadeCurve::all_variants() {
            for step in 0..=20 {
                let t = step as f32 / 20.0;
                let diff = (curve.fade_out(t) - curve.fade_in(1.0 - t)).abs();
                assert!(diff < 1e-6, "{curve} at t={t}");
            }
        }
    }

    #[test]
    fn test_equal_power_keeps_energy() {
        let curve = FadeCurve::EqualPower;
        for step in 0..=10 {
            let t = step as f32 / 10.0;
            let power = curve.fade_in(t).powi(2) + curve.fade_out(t).powi(2);
            assert!((power - 1.0).abs() < 1e-5, "power {power} at t={t}");
        }
    }

    #[test]
    fn test_linear_midpoint() {
        assert!((FadeCurve::Linear.fade_in(0.5) - 0.5).abs() < 1e-6);
        assert!((FadeCurve::SCurve.fade_in(0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("linear".parse::<FadeCurve>().unwrap(), FadeCurve::Linear);
        assert_eq!("Equal_Power".parse::<FadeCurve>().unwrap(), FadeCurve::EqualPower);
        assert_eq!("cosine".parse::<FadeCurve>().unwrap(), FadeCurve::SCurve);
        assert!("wobbly".parse::<FadeCurve>().is_err());
        for curve in FadeCurve::all_variants() {
            assert_eq!(curve.as_str().parse::<FadeCurve>().unwrap(), *curve);
        }
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&FadeCurve::EqualPower).unwrap();
        assert_eq!(json, "\"equal_power\"");
        let parsed: FadeCurve = serde_json::from_str("\"s_curve\"").unwrap();
        assert_eq!(parsed, FadeCurve::SCurve);
    }
}
