//! Incremental circle likelihood over a sliding event window.
//!
//! The window keeps the most recent raw event keys in a ring. Each pass
//! resets an angular histogram of [`ANG_BUCKETS`] buckets around the
//! hypothesis centre, walks the newest events first and accumulates the
//! best confidence seen per bucket. The likelihood is the running maximum of
//! the score and the support count is the number of events consumed when
//! that maximum was reached.

use std::f32::consts::PI;

use crate::codec::decode_xy;
use crate::config::FilterParams;
use crate::particle::{ParticleState, R_MAX};

/// Angular resolution of the edge histogram.
pub const ANG_BUCKETS: usize = 64;

/// Entries per unit of squared distance in the square-root table.
const SQRT_TABLE_RESOLUTION: f32 = 4.0;

/// Bucket index scale: maps `atan2 + π` in `[0, 2π]` to `[0, B - 1]`.
const BUCKET_SCALE: f32 = (ANG_BUCKETS as f32 - 1.0) / (2.0 * PI);

/// Ring of the most recent event keys, newest at `start`.
#[derive(Debug, Clone)]
pub struct EventWindow {
    ring: Box<[u32]>,
    start: usize,
    size: usize,
}

impl EventWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0; capacity.max(1)].into_boxed_slice(),
            start: 0,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Events currently considered part of the window.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Append keys oldest-first; the last key becomes the newest event.
    pub fn extend(&mut self, keys: &[u32]) {
        let cap = self.capacity();
        for &key in keys {
            self.start = (self.start + 1) % cap;
            self.ring[self.start] = key;
        }
        self.size = (self.size + keys.len()).min(cap);
    }

    /// Window contents from newest to oldest.
    pub fn iter_newest(&self) -> impl Iterator<Item = u32> + '_ {
        let cap = self.capacity();
        (0..self.size).map(move |k| self.ring[(self.start + cap - k) % cap])
    }

    /// Forget everything beyond the newest `len` events.
    pub fn truncate(&mut self, len: usize) {
        self.size = self.size.min(len);
    }
}

/// Precomputed `sqrt` over squared distances that can still be inliers.
///
/// Anything past the end of the table is farther from the centre than any
/// admissible radius plus the inlier band, so the caller may skip it.
#[derive(Debug, Clone)]
pub struct SqrtTable {
    values: Box<[f32]>,
}

impl SqrtTable {
    pub fn new(inlier_par: f32) -> Self {
        let reach = R_MAX + 1.0 + inlier_par;
        let len = (reach * reach * SQRT_TABLE_RESOLUTION).ceil() as usize + 1;
        let values = (0..len)
            .map(|i| (i as f32 / SQRT_TABLE_RESOLUTION).sqrt())
            .collect();
        Self { values }
    }

    /// Largest squared distance the table covers.
    pub fn max_squared(&self) -> f32 {
        (self.values.len() - 1) as f32 / SQRT_TABLE_RESOLUTION
    }

    #[inline]
    pub fn get(&self, squared: f32) -> Option<f32> {
        let idx = (squared * SQRT_TABLE_RESOLUTION + 0.5) as usize;
        self.values.get(idx).copied()
    }
}

/// Result of one likelihood pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassSummary {
    /// Likelihood (floored at the configured minimum)
    pub l: f32,
    /// Support count (floored at the configured minimum)
    pub n: f32,
    /// Events actually scored
    pub scored: usize,
}

/// Per-particle scoring state.
#[derive(Debug, Clone)]
pub struct LikelihoodEngine {
    window: EventWindow,
    buckets: [f32; ANG_BUCKETS],
    score: f32,
    best: f32,
    best_count: usize,
    negative_scaler: f32,
    sqrt: SqrtTable,
    inlier_par: f32,
    min_like: f32,
    negative_bias: f32,
    batch_scale: f32,
    min_support: f32,
    window_slack: f32,
}

impl LikelihoodEngine {
    pub fn new(params: &FilterParams) -> Self {
        Self {
            window: EventWindow::new(params.window_capacity),
            buckets: [0.0; ANG_BUCKETS],
            score: 0.0,
            best: params.min_like,
            best_count: 0,
            negative_scaler: 0.0,
            sqrt: SqrtTable::new(params.inlier_par),
            inlier_par: params.inlier_par,
            min_like: params.min_like,
            negative_bias: params.negative_bias,
            batch_scale: params.batch_scale,
            min_support: params.min_support,
            window_slack: params.window_slack,
        }
    }

    pub fn window(&self) -> &EventWindow {
        &self.window
    }

    /// Move freshly drained event keys into the window.
    pub fn ingest(&mut self, keys: &[u32]) {
        self.window.extend(keys);
    }

    /// Shrink the window to the population's weighted support when it has
    /// grown well past it.
    pub fn adapt_window(&mut self, mean_support: f32) {
        if !mean_support.is_finite() || mean_support < 0.0 {
            return;
        }
        if self.window.len() as f32 > mean_support + self.window_slack {
            self.window.truncate(mean_support as usize);
        }
    }

    /// Events scored per pass for a hypothesis of radius `r`.
    pub fn batch_len(&self, r: f32) -> usize {
        let budget = (self.batch_scale * PI * r).ceil().max(1.0) as usize;
        budget.min(self.window.len())
    }

    /// Reset the histogram and running score for a hypothesis of radius `r`.
    pub fn begin_pass(&mut self, r: f32) {
        self.buckets = [0.0; ANG_BUCKETS];
        self.score = 0.0;
        self.best = self.min_like;
        self.best_count = self.window.len();
        self.negative_scaler = (ANG_BUCKETS as f32 / (PI * r * r)) * self.negative_bias;
    }

    /// Score one event at offset `(dx, dy)` from the centre. `count` is the
    /// number of events consumed before this one. Returns the confidence.
    #[inline]
    pub fn score_event(&mut self, dx: f32, dy: f32, r: f32, count: usize) -> f32 {
        let Some(dist) = self.sqrt.get(dx * dx + dy * dy) else {
            return 0.0;
        };
        let d = dist - r;
        if d > 1.0 + self.inlier_par {
            return 0.0;
        }

        let fd = d.abs();
        let confidence = if fd < 1.0 {
            1.0
        } else if fd < 1.0 + self.inlier_par {
            (1.0 + self.inlier_par - fd) / self.inlier_par
        } else {
            0.0
        };

        if confidence > 0.0 {
            let bucket = bucket_index(dx, dy);
            let improved = confidence - self.buckets[bucket];
            if improved > 0.0 {
                self.buckets[bucket] = confidence;
                self.score += improved;
                if self.score >= self.best {
                    self.best = self.score;
                    self.best_count = count;
                }
            }
        } else {
            self.score -= self.negative_scaler;
        }
        confidence
    }

    pub fn bucket(&self, i: usize) -> f32 {
        self.buckets[i]
    }

    /// Running score of the current pass.
    pub fn score(&self) -> f32 {
        self.score
    }

    /// Best score so far and the event count at which it was reached.
    pub fn best(&self) -> (f32, usize) {
        (self.best, self.best_count)
    }

    /// Full pass for `state`: score the newest batch, store `l` and `n`, and
    /// scale the weight by the likelihood.
    pub fn evaluate(&mut self, state: &mut ParticleState) -> PassSummary {
        let batch = self.batch_len(state.r);
        self.begin_pass(state.r);

        let (cx, cy, r) = (state.x, state.y, state.r);
        let mut count = 0;
        // indexes the ring directly so scoring can borrow `self` mutably
        let cap = self.window.capacity();
        let start = self.window.start;
        for k in 0..batch {
            let key = self.window.ring[(start + cap - k) % cap];
            let (ex, ey) = decode_xy(key);
            self.score_event(ex as f32 - cx, ey as f32 - cy, r, count);
            count += 1;
        }

        let l = self.best;
        let n = (self.best_count as f32).max(self.min_support);
        state.l = l;
        state.n = n;
        state.w *= l;

        PassSummary {
            l,
            n,
            scored: batch,
        }
    }
}

/// Angular bucket for an offset, rounded to nearest.
#[inline]
pub fn bucket_index(dx: f32, dy: f32) -> usize {
    let b = (0.5 + BUCKET_SCALE * (dy.atan2(dx) + PI)) as usize;
    b.min(ANG_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_event;
    use approx::assert_relative_eq;

    fn engine() -> LikelihoodEngine {
        LikelihoodEngine::new(&FilterParams::default())
    }

    #[test]
    fn test_window_keeps_newest_first() {
        let mut window = EventWindow::new(4);
        window.extend(&[1, 2, 3]);
        assert_eq!(window.iter_newest().collect::<Vec<_>>(), vec![3, 2, 1]);

        window.extend(&[4, 5, 6]);
        assert_eq!(window.len(), 4);
        assert_eq!(window.iter_newest().collect::<Vec<_>>(), vec![6, 5, 4, 3]);

        window.truncate(2);
        assert_eq!(window.iter_newest().collect::<Vec<_>>(), vec![6, 5]);
    }

    #[test]
    fn test_sqrt_table_accuracy() {
        let table = SqrtTable::new(1.0);
        assert_relative_eq!(table.max_squared(), 42.0 * 42.0, epsilon = 0.5);
        for i in 1..400 {
            let d = i as f32 * 0.1;
            let approx = table.get(d * d).unwrap();
            assert!((approx - d).abs() < 0.13 / d.max(1.0) + 0.01, "d={d}");
        }
        assert!(table.get(43.0 * 43.0).is_none());
    }

    #[test]
    fn test_bucket_index_range() {
        assert_eq!(bucket_index(1.0, 0.0), 32);
        assert_eq!(bucket_index(-1.0, -1e-6), 0);
        assert_eq!(bucket_index(-1.0, 0.0), ANG_BUCKETS - 1);
        assert_eq!(bucket_index(0.0, 1.0), 47);
    }

    #[test]
    fn test_bucket_keeps_maximum() {
        let mut engine = engine();
        let r = 20.0;
        engine.begin_pass(r);

        // same angle, confidences ~0.5, 1.0, 0.75
        let c1 = engine.score_event(21.5, 0.0, r, 0);
        let c2 = engine.score_event(20.0, 0.0, r, 1);
        let c3 = engine.score_event(21.25, 0.0, r, 2);
        assert_relative_eq!(c1, 0.5, epsilon = 1e-2);
        assert_relative_eq!(c2, 1.0);
        assert_relative_eq!(c3, 0.75, epsilon = 1e-2);

        let bucket = bucket_index(1.0, 0.0);
        assert_relative_eq!(engine.bucket(bucket), c1.max(c2).max(c3));
        // positive increments were c1 then (c2 - c1); c3 adds nothing
        assert_relative_eq!(engine.score(), 1.0, epsilon = 1e-6);
        assert_eq!(engine.best(), (engine.score(), 1));
    }

    #[test]
    fn test_outside_band_is_ignored() {
        let mut engine = engine();
        engine.begin_pass(20.0);
        assert_eq!(engine.score_event(25.0, 0.0, 20.0, 0), 0.0);
        assert_eq!(engine.score(), 0.0);
        // beyond the table entirely
        assert_eq!(engine.score_event(100.0, 100.0, 20.0, 1), 0.0);
        assert_eq!(engine.score(), 0.0);
    }

    #[test]
    fn test_inside_circle_is_penalized() {
        let mut engine = engine();
        let r = 20.0;
        engine.begin_pass(r);
        engine.score_event(5.0, 0.0, r, 0);
        let expected = (ANG_BUCKETS as f32 / (PI * r * r)) * 0.2;
        assert_relative_eq!(engine.score(), -expected, epsilon = 1e-6);
        // the likelihood never drops below the floor
        assert_relative_eq!(engine.best().0, 0.2);
    }

    #[test]
    fn test_evaluate_on_circle_edge() {
        let mut engine = engine();
        let (cx, cy, r) = (100.0f32, 80.0f32, 20.0f32);
        let keys: Vec<u32> = (0..128)
            .map(|i| {
                let a = i as f32 * 2.0 * PI / 128.0;
                encode_event(0, (cx + r * a.cos()).round() as u32, (cy + r * a.sin()).round() as u32)
            })
            .collect();
        engine.ingest(&keys);

        let mut state = ParticleState::new(cx, cy, r);
        let summary = engine.evaluate(&mut state);

        assert_eq!(summary.scored, (PI * r).ceil() as usize);
        // scored events cover about half the circle, one bucket each
        assert!(summary.l > 20.0, "l = {}", summary.l);
        assert_eq!(state.l, summary.l);
        assert_relative_eq!(state.w, summary.l);
        assert!(state.n >= 100.0);
    }

    #[test]
    fn test_empty_window_gives_floor() {
        let mut engine = engine();
        let mut state = ParticleState::new(50.0, 50.0, 15.0);
        let summary = engine.evaluate(&mut state);
        assert_eq!(summary.scored, 0);
        assert_relative_eq!(summary.l, 0.2);
        assert_eq!(summary.n, 100.0);
        assert_relative_eq!(state.w, 0.2);
    }

    #[test]
    fn test_adapt_window() {
        let mut engine = engine();
        engine.ingest(&vec![0; 400]);
        engine.adapt_window(380.0);
        assert_eq!(engine.window().len(), 400);
        engine.adapt_window(300.0);
        assert_eq!(engine.window().len(), 300);
        engine.adapt_window(f32::NAN);
        assert_eq!(engine.window().len(), 300);
    }
}
