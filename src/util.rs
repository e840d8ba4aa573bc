//! Math utilities: Gaussian sampling, FTRL sign, sigmoid, `%.6g` formatting
//!
//! The Gaussian sampler is the Marsaglia–Leva ratio-of-uniforms accept/reject
//! method. It is driven by an explicit `rand::Rng` so callers control seeding:
//! the trainer is reproducible for a fixed seed and a single worker.
//!
//! `sgn` is the FTRL shrinkage sign. It returns **+1 or −1, never 0**: values
//! at or below `SGN_PRECISION` (including exact zero and slightly negative
//! inputs) map to −1. The proximal step in the trainer relies on this exact
//! behavior.

#![forbid(unsafe_code)]

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Threshold below which `sgn` treats a value as non-positive.
pub const SGN_PRECISION: f64 = 1e-10;

/// FTRL shrinkage sign: `+1.0` iff `x > SGN_PRECISION`, else `−1.0`.
#[inline]
pub fn sgn(x: f64) -> f64 {
    if x > SGN_PRECISION {
        1.0
    } else {
        -1.0
    }
}

/// Logistic sigmoid `1/(1+exp(−z))`.
#[inline]
pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Standard normal draw via the Marsaglia–Leva ratio-of-uniforms method.
///
/// Rejection constants are the published ones; the quick-accept test
/// (`q < 0.27597`) passes for the vast majority of draws, the log test only
/// runs in the thin boundary band.
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let mut u: f64 = rng.gen();
        while u == 0.0 {
            u = rng.gen();
        }
        let v = 1.7156 * (rng.gen::<f64>() - 0.5);
        let x = u - 0.449871;
        let y = v.abs() + 0.386595;
        let q = x * x + y * (0.19600 * y - 0.25472 * x);
        if q < 0.27597 || (q <= 0.27846 && v * v <= -4.0 * u * u * u.ln()) {
            return v / u;
        }
    }
}

/// Gaussian draw with mean/stdev. Returns `mean` verbatim when `stdev == 0`.
pub fn gaussian_with_params<R: Rng + ?Sized>(rng: &mut R, mean: f64, stdev: f64) -> f64 {
    if stdev == 0.0 {
        mean
    } else {
        mean + stdev * gaussian(rng)
    }
}

/// Build the process RNG: seeded when the caller passed `-seed`, otherwise
/// from OS entropy.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Format with `%.6g` semantics: six significant digits, fixed or scientific
/// notation by magnitude, trailing zeros trimmed.
pub fn fmt_g6(x: f64) -> String {
    if x == 0.0 {
        return "0".to_string();
    }
    if !x.is_finite() {
        return x.to_string();
    }
    let exp = x.abs().log10().floor() as i32;
    if (-4..6).contains(&exp) {
        let prec = (5 - exp).max(0) as usize;
        let s = format!("{x:.prec$}");
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    } else {
        let s = format!("{x:.5e}");
        match s.split_once('e') {
            Some((mant, e)) => {
                let mant = if mant.contains('.') {
                    mant.trim_end_matches('0').trim_end_matches('.')
                } else {
                    mant
                };
                format!("{mant}e{e}")
            }
            None => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgn_is_never_zero_and_threshold_is_strict() {
        assert_eq!(sgn(0.0), -1.0);
        assert_eq!(sgn(1e-10), -1.0);
        assert_eq!(sgn(2e-10), 1.0);
        assert_eq!(sgn(-3.5), -1.0);
        assert_eq!(sgn(3.5), 1.0);
    }

    #[test]
    fn sigmoid_midpoint_and_symmetry() {
        assert_eq!(sigmoid(0.0), 0.5);
        let p = sigmoid(2.0);
        let q = sigmoid(-2.0);
        assert!((p + q - 1.0).abs() < 1e-15);
        assert!(p > 0.5 && q < 0.5);
    }

    #[test]
    fn gaussian_zero_stdev_returns_mean() {
        let mut rng = seeded_rng(Some(7));
        assert_eq!(gaussian_with_params(&mut rng, 0.25, 0.0), 0.25);
    }

    #[test]
    fn gaussian_moments_look_standard_normal() {
        let mut rng = seeded_rng(Some(42));
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| gaussian(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }

    #[test]
    fn fmt_g6_magnitude_styles() {
        assert_eq!(fmt_g6(0.0), "0");
        assert_eq!(fmt_g6(1.0), "1");
        assert_eq!(fmt_g6(-0.5), "-0.5");
        assert_eq!(fmt_g6(0.123456789), "0.123457");
        assert_eq!(fmt_g6(123456.789), "123457");
        assert_eq!(fmt_g6(0.0001), "0.0001");
        // |exp| out of fixed range switches to scientific
        assert!(fmt_g6(1.5e-7).contains('e'));
        assert!(fmt_g6(2.5e12).contains('e'));
    }

    #[test]
    fn fmt_g6_round_trips_within_tolerance() {
        let vals = [3.14159265, -0.000123456, 9.87654e8, 1.0 / 3.0, -42.4242];
        for &v in &vals {
            let parsed: f64 = fmt_g6(v).parse().unwrap();
            assert!(
                ((parsed - v) / v).abs() < 1e-5,
                "{v} -> {} -> {parsed}",
                fmt_g6(v)
            );
        }
    }
}
