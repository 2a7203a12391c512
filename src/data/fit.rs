//! Hyperbolic saturation fit.
//!
//! Fluorescence against excitation power is modelled as
//!
//! ```text
//! I(P) = I_sat * P / (P + P_sat) + slope * P + offset
//! ```
//!
//! For a fixed `P_sat` the model is linear in `I_sat`, `slope` and `offset`,
//! which are then solved by linear least squares. `P_sat` itself is found by
//! a coarse log-spaced grid followed by a golden-section search on the
//! residual.

use crate::error::{AppResult, DaqError};

/// Parameters a saturation fit needs at least.
pub const MIN_FIT_POINTS: usize = 4;

const GRID_POINTS: usize = 61;
const GOLDEN_ITERATIONS: usize = 80;
/// Search range of `P_sat`, relative to the largest power.
const P_SAT_RANGE: (f64, f64) = (1e-3, 1e3);

/// Result of [`fit_saturation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaturationFit {
    /// Saturation count rate (c/s)
    pub i_sat: f64,
    /// Saturation power (W)
    pub p_sat: f64,
    /// Linear background (c/s per W)
    pub slope: f64,
    /// Constant background (c/s)
    pub offset: f64,
    /// Root-mean-square residual (c/s)
    pub rms_residual: f64,
}

impl SaturationFit {
    /// Model value at `power`.
    pub fn eval(&self, power: f64) -> f64 {
        self.i_sat * power / (power + self.p_sat) + self.slope * power + self.offset
    }

    /// Header entries for a data file.
    pub fn metadata(&self) -> Vec<(&'static str, String)> {
        vec![
            ("I_sat (c/s)", format!("{:.6e}", self.i_sat)),
            ("P_sat (W)", format!("{:.6e}", self.p_sat)),
            ("Slope (c/s/W)", format!("{:.6e}", self.slope)),
            ("Offset (c/s)", format!("{:.6e}", self.offset)),
            ("Fit RMS residual (c/s)", format!("{:.3e}", self.rms_residual)),
        ]
    }
}

/// Least-squares fit of the saturation model to `(powers, counts)`.
pub fn fit_saturation(powers: &[f64], counts: &[f64]) -> AppResult<SaturationFit> {
    if powers.len() != counts.len() {
        return Err(DaqError::InvalidArgument(format!(
            "{} powers but {} count rates",
            powers.len(),
            counts.len()
        )));
    }
    if powers.len() < MIN_FIT_POINTS {
        return Err(DaqError::InvalidArgument(format!(
            "{} points are not enough for a saturation fit, need {}",
            powers.len(),
            MIN_FIT_POINTS
        )));
    }
    let scale = powers.iter().fold(0.0_f64, |m, p| m.max(p.abs()));
    if scale <= 0.0 || !scale.is_finite() || counts.iter().any(|c| !c.is_finite()) {
        return Err(DaqError::InvalidArgument("saturation fit needs positive, finite data".into()));
    }

    // Work on powers normalised to the largest one.
    let x: Vec<f64> = powers.iter().map(|p| p / scale).collect();
    let cost = |ln_p_sat: f64| {
        solve_linear(&x, counts, ln_p_sat.exp())
            .map(|(_, sse)| sse)
            .unwrap_or(f64::INFINITY)
    };

    let (lo, hi) = (P_SAT_RANGE.0.ln(), P_SAT_RANGE.1.ln());
    let step = (hi - lo) / (GRID_POINTS - 1) as f64;
    let best = (0..GRID_POINTS)
        .map(|i| (i, cost(lo + step * i as f64)))
        .fold((0, f64::INFINITY), |best, c| if c.1 < best.1 { c } else { best })
        .0;

    let mut a = lo + step * best.saturating_sub(1) as f64;
    let mut b = lo + step * (best + 1).min(GRID_POINTS - 1) as f64;
    let ratio = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let (mut fc, mut fd) = (cost(c), cost(d));
    for _ in 0..GOLDEN_ITERATIONS {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = cost(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = cost(d);
        }
    }

    let p_sat = ((a + b) / 2.0).exp();
    let ([i_sat, slope, offset], sse) = solve_linear(&x, counts, p_sat)
        .ok_or_else(|| DaqError::Instrument("saturation fit is degenerate".into()))?;
    Ok(SaturationFit {
        i_sat,
        p_sat: p_sat * scale,
        slope: slope / scale,
        offset,
        rms_residual: (sse / x.len() as f64).sqrt(),
    })
}

/// Linear parameters `[I_sat, slope, offset]` for a fixed `p_sat`, and the
/// sum of squared residuals.
fn solve_linear(x: &[f64], y: &[f64], p_sat: f64) -> Option<([f64; 3], f64)> {
    let basis = |x: f64| [x / (x + p_sat), x, 1.0];
    let mut m = [[0.0; 4]; 3];
    for (&xi, &yi) in x.iter().zip(y) {
        let f = basis(xi);
        for r in 0..3 {
            for c in 0..3 {
                m[r][c] += f[r] * f[c];
            }
            m[r][3] += f[r] * yi;
        }
    }

    // Gaussian elimination with partial pivoting.
    for col in 0..3 {
        let pivot = (col..3).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
        }
    }
    let mut p = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * p[k]).sum();
        p[row] = (m[row][3] - tail) / m[row][row];
    }

    let sse = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let f = basis(xi);
            (yi - (p[0] * f[0] + p[1] * f[1] + p[2] * f[2])).powi(2)
        })
        .sum();
    Some((p, sse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::linspace;

    fn curve(truth: &SaturationFit, powers: &[f64]) -> Vec<f64> {
        powers.iter().map(|&p| truth.eval(p)).collect()
    }

    #[test]
    fn recovers_synthetic_curve() {
        let truth = SaturationFit {
            i_sat: 400e3,
            p_sat: 5e-3,
            slope: 2e6,
            offset: 5e3,
            rms_residual: 0.0,
        };
        let powers = linspace(1e-3, 22e-3, 17);
        let fit = fit_saturation(&powers, &curve(&truth, &powers)).unwrap();

        assert!((fit.i_sat / truth.i_sat - 1.0).abs() < 1e-3, "{:?}", fit);
        assert!((fit.p_sat / truth.p_sat - 1.0).abs() < 1e-3, "{:?}", fit);
        assert!((fit.slope - truth.slope).abs() < 1e3, "{:?}", fit);
        assert!((fit.offset - truth.offset).abs() < 10.0, "{:?}", fit);
        assert!(fit.rms_residual < 1.0);
    }

    #[test]
    fn tolerates_noise() {
        let truth = SaturationFit {
            i_sat: 250e3,
            p_sat: 2e-3,
            slope: 0.0,
            offset: 3e3,
            rms_residual: 0.0,
        };
        let powers = linspace(0.5e-3, 20e-3, 25);
        // Deterministic +-0.5 % ripple.
        let counts: Vec<f64> = powers
            .iter()
            .enumerate()
            .map(|(i, &p)| truth.eval(p) * if i % 2 == 0 { 1.005 } else { 0.995 })
            .collect();
        let fit = fit_saturation(&powers, &counts).unwrap();
        assert!((fit.p_sat / truth.p_sat - 1.0).abs() < 0.2, "{:?}", fit);
        assert!((fit.i_sat + fit.slope * 20e-3) > 0.0);
    }

    #[test]
    fn rejects_unusable_input() {
        assert!(fit_saturation(&[1e-3, 2e-3, 3e-3], &[1.0, 2.0, 3.0]).is_err());
        assert!(fit_saturation(&[1e-3, 2e-3, 3e-3, 4e-3], &[1.0, 2.0]).is_err());
        assert!(fit_saturation(&[0.0; 5], &[1.0; 5]).is_err());
        let metadata = SaturationFit {
            i_sat: 1.0,
            p_sat: 1.0,
            slope: 0.0,
            offset: 0.0,
            rms_residual: 0.0,
        }
        .metadata();
        assert_eq!(metadata[1].0, "P_sat (W)");
    }
}
