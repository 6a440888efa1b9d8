//! Beta posterior sampling shared by Thompson Sampling and the win-rate engine.
//!
//! Beta(a, b) is drawn as `X / (X + Y)` with `X ~ Gamma(a)` and `Y ~ Gamma(b)`.
//! Shapes are always positive integers here (counts plus a Beta(1, 1) prior).
//! Small shapes use the exact sum of `shape` unit exponentials; large shapes
//! switch to Marsaglia-Tsang so the cost stays constant as counters grow.

use crate::types::BetaParameters;
use rand::Rng;

/// Largest shape sampled as a sum of unit exponentials.
pub const EXACT_SUM_MAX_SHAPE: u64 = 64;

/// One draw from Exp(1), i.e. `-ln(U)` with `U` in (0, 1].
pub fn unit_exponential<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u = 1.0 - rng.gen::<f64>();
    -u.ln()
}

/// One draw from Gamma(shape, 1). Returns 0.0 for a zero shape.
pub fn sample_gamma<R: Rng + ?Sized>(rng: &mut R, shape: u64) -> f64 {
    match shape {
        0 => 0.0,
        1..=EXACT_SUM_MAX_SHAPE => (0..shape).map(|_| unit_exponential(rng)).sum(),
        _ => marsaglia_tsang(rng, shape as f64),
    }
}

/// One draw from Beta(alpha, beta). Falls back to 0.5 when both gamma draws vanish.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: u64, beta: u64) -> f64 {
    let x = sample_gamma(rng, alpha);
    let y = sample_gamma(rng, beta);
    let sum = x + y;
    if sum > f64::MIN_POSITIVE {
        x / sum
    } else {
        0.5
    }
}

pub fn sample_posterior<R: Rng + ?Sized>(rng: &mut R, params: BetaParameters) -> f64 {
    sample_beta(rng, params.alpha, params.beta)
}

/// Marsaglia-Tsang rejection sampler, valid for shape >= 1.
fn marsaglia_tsang<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> f64 {
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        // Box-Muller for a standard normal
        let u1: f64 = rng.gen::<f64>().max(1e-15);
        let u2: f64 = rng.gen();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();

        let v = (1.0 + c * z).powi(3);
        if v <= 0.0 {
            continue;
        }

        let u: f64 = rng.gen();
        if u < 1.0 - 0.0331 * z.powi(4) || u.ln() < 0.5 * z * z + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}
