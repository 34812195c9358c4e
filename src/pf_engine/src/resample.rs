//! Weight normalization, roulette-wheel resampling and the random-walk
//! prediction.

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::codec::Field;
use crate::config::FilterParams;
use crate::particle::{ParticleState, Row, SensorGeometry};

const X: usize = Field::X as usize;
const Y: usize = Field::Y as usize;
const R: usize = Field::R as usize;
const L: usize = Field::L as usize;
const W: usize = Field::W as usize;
const N: usize = Field::N as usize;

/// Population statistics produced by [`normalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalized {
    /// Sum of weights before normalization
    pub total: f32,
    /// Weighted mean `(x, y, r)`
    pub target: Vector3<f32>,
    /// Weighted mean support count
    pub mean_support: f32,
    /// `Σw²` after normalization
    pub sum_sq: f32,
    /// The sum was zero or not finite and weights were reset to uniform
    pub degenerate: bool,
}

/// Divide every weight by the sum and compute the weighted target.
///
/// A zero or non-finite sum replaces all weights by `1 / N`, which keeps the
/// population usable after every particle lost the target.
pub fn normalize(rows: &mut [Row]) -> Normalized {
    let total: f32 = rows.iter().map(|row| row[W]).sum();
    let degenerate = !(total.is_finite() && total > 0.0);

    let uniform = 1.0 / rows.len().max(1) as f32;
    let scale = if degenerate { 0.0 } else { 1.0 / total };

    let mut target = Vector3::zeros();
    let mut mean_support = 0.0;
    let mut sum_sq = 0.0;
    for row in rows.iter_mut() {
        row[W] = if degenerate { uniform } else { row[W] * scale };
        target += Vector3::new(row[X], row[Y], row[R]) * row[W];
        mean_support += row[N] * row[W];
        sum_sq += row[W] * row[W];
    }

    Normalized {
        total,
        target,
        mean_support,
        sum_sq,
        degenerate,
    }
}

/// Roulette-wheel selection for a draw in `[0, 1)` over normalized weights.
///
/// Walks the cumulative sum until it exceeds `draw`; when rounding keeps the
/// sum from ever exceeding it, the last row is selected.
pub fn select_index(rows: &[Row], draw: f32) -> Option<usize> {
    let last = rows.len().checked_sub(1)?;
    let mut cumulative = 0.0;
    for (i, row) in rows.iter().enumerate() {
        cumulative += row[W];
        if cumulative > draw {
            return Some(i);
        }
    }
    Some(last)
}

/// Draw one particle, all six fields copied.
pub fn resample<G: Rng + ?Sized>(rows: &[Row], rng: &mut G) -> Option<ParticleState> {
    let draw: f32 = rng.gen();
    select_index(rows, draw).map(|i| ParticleState::from_row(&rows[i]))
}

/// Bounded random walk: `x` and `y` move uniformly within `±sigma`, the
/// radius within `±radius_sigma`, then the state is clamped to the field.
pub fn predict<G: Rng + ?Sized>(
    state: &mut ParticleState,
    sigma: f32,
    radius_sigma: f32,
    geometry: &SensorGeometry,
    rng: &mut G,
) {
    if let Some(step) = walk(sigma) {
        state.x += step.sample(rng);
        state.y += step.sample(rng);
    }
    if let Some(step) = walk(radius_sigma) {
        state.r += step.sample(rng);
    }
    state.clamp_to(geometry);
}

fn walk(sigma: f32) -> Option<Uniform<f32>> {
    (sigma.is_finite() && sigma > 0.0).then(|| Uniform::new(-sigma, sigma))
}

/// Resample target an aggregator hands to its partner particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartnerTarget {
    /// A freshly drawn particle
    Resampled(ParticleState),
    /// The partner's own row with the likelihood suppressed, so the partner
    /// keeps its hypothesis and only adopts the normalized weight
    PassThrough(ParticleState),
}

impl PartnerTarget {
    pub fn state(&self) -> &ParticleState {
        match self {
            PartnerTarget::Resampled(s) | PartnerTarget::PassThrough(s) => s,
        }
    }
}

/// Decide between resampling and pass-through for the partner row.
///
/// Resampling is skipped while the weights are still diverse
/// (`Σw² · N ≤ diversity_threshold`) or the population's weighted support is
/// below `min_mean_support`.
pub fn partner_target<G: Rng + ?Sized>(
    rows: &[Row],
    partner_row: usize,
    stats: &Normalized,
    params: &FilterParams,
    rng: &mut G,
) -> Option<PartnerTarget> {
    let diversity = stats.sum_sq * rows.len() as f32;
    let pass_through =
        diversity <= params.diversity_threshold || stats.mean_support < params.min_mean_support;

    if pass_through {
        let mut state = ParticleState::from_row(rows.get(partner_row)?);
        state.l = 0.0;
        Some(PartnerTarget::PassThrough(state))
    } else {
        resample(rows, rng).map(PartnerTarget::Resampled)
    }
}
