//! Synthetic event streams with known ground truth.
//!
//! Generators for circle-edge events, background noise and a moving circle,
//! used by the scenario tests and by the tracker's synthetic input source.

use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::particle::SensorGeometry;

/// Events on the edge of a circle.
///
/// Angles are spread evenly over the full turn, starting at `phase`, and
/// rounded to the nearest pixel. Pixels outside the sensor are skipped, so
/// the result may hold fewer than `count` events.
///
/// # Arguments
/// * `cx`, `cy` - Circle centre
/// * `r` - Radius
/// * `count` - Events to generate
/// * `phase` - Angle of the first event (radians)
pub fn circle_edge_events(
    cx: f32,
    cy: f32,
    r: f32,
    count: usize,
    phase: f32,
    geometry: &SensorGeometry,
) -> Vec<(u32, u32)> {
    let step = std::f32::consts::TAU / count.max(1) as f32;
    (0..count)
        .filter_map(|i| {
            let a = phase + step * i as f32;
            pixel(cx + r * a.cos(), cy + r * a.sin(), geometry)
        })
        .collect()
}

/// Circle-edge events at random angles with uniform radial jitter.
pub fn noisy_circle_events<R: Rng + ?Sized>(
    cx: f32,
    cy: f32,
    r: f32,
    count: usize,
    jitter: f32,
    geometry: &SensorGeometry,
    rng: &mut R,
) -> Vec<(u32, u32)> {
    let angle = Uniform::new(0.0, std::f32::consts::TAU);
    let radial = (jitter > 0.0).then(|| Uniform::new_inclusive(-jitter, jitter));
    (0..count)
        .filter_map(|_| {
            let a = angle.sample(rng);
            let d = r + radial.map_or(0.0, |u| u.sample(rng));
            pixel(cx + d * a.cos(), cy + d * a.sin(), geometry)
        })
        .collect()
}

/// Uniform background events over the whole sensor.
pub fn background_events<R: Rng + ?Sized>(
    count: usize,
    geometry: &SensorGeometry,
    rng: &mut R,
) -> Vec<(u32, u32)> {
    let xs = Uniform::new(0, geometry.width);
    let ys = Uniform::new(0, geometry.height);
    (0..count)
        .map(|_| (xs.sample(rng), ys.sample(rng)))
        .collect()
}

fn pixel(x: f32, y: f32, geometry: &SensorGeometry) -> Option<(u32, u32)> {
    let (x, y) = (x.round(), y.round());
    let inside = x >= 0.0 && y >= 0.0 && x < geometry.width as f32 && y < geometry.height as f32;
    inside.then_some((x as u32, y as u32))
}

/// A circle moving at constant velocity, bouncing off the sensor edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovingCircle {
    pub x: f32,
    pub y: f32,
    pub r: f32,
    /// Pixels per step
    pub vx: f32,
    /// Pixels per step
    pub vy: f32,
}

impl MovingCircle {
    pub fn new(x: f32, y: f32, r: f32, vx: f32, vy: f32) -> Self {
        Self { x, y, r, vx, vy }
    }

    /// Advance one step. The circle stays fully inside the sensor.
    pub fn step(&mut self, geometry: &SensorGeometry) {
        self.x += self.vx;
        self.y += self.vy;
        let (w, h) = (geometry.width as f32, geometry.height as f32);
        if self.x - self.r < 0.0 || self.x + self.r > w - 1.0 {
            self.vx = -self.vx;
            self.x = self.x.clamp(self.r, w - 1.0 - self.r);
        }
        if self.y - self.r < 0.0 || self.y + self.r > h - 1.0 {
            self.vy = -self.vy;
            self.y = self.y.clamp(self.r, h - 1.0 - self.r);
        }
    }

    /// Events for the current position.
    pub fn events<R: Rng + ?Sized>(
        &self,
        count: usize,
        geometry: &SensorGeometry,
        rng: &mut R,
    ) -> Vec<(u32, u32)> {
        noisy_circle_events(self.x, self.y, self.r, count, 0.5, geometry, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_circle_edge_events_on_radius() {
        let geometry = SensorGeometry::default();
        let events = circle_edge_events(150.0, 120.0, 20.0, 64, 0.0, &geometry);
        assert_eq!(events.len(), 64);
        for (x, y) in events {
            let d = ((x as f32 - 150.0).powi(2) + (y as f32 - 120.0).powi(2)).sqrt();
            assert!((d - 20.0).abs() <= 0.75, "distance {d}");
        }
    }

    #[test]
    fn test_events_outside_sensor_are_skipped() {
        let geometry = SensorGeometry::default();
        let events = circle_edge_events(0.0, 0.0, 20.0, 64, 0.0, &geometry);
        assert!(events.len() < 64);
        assert!(events.iter().all(|&(x, y)| x < 304 && y < 240));
    }

    #[test]
    fn test_moving_circle_bounces() {
        let geometry = SensorGeometry::default();
        let mut circle = MovingCircle::new(290.0, 120.0, 10.0, 5.0, 0.0);
        circle.step(&geometry);
        assert!(circle.vx < 0.0);
        assert!(circle.x + circle.r <= 303.0);

        let mut rng = StdRng::seed_from_u64(3);
        let events = circle.events(32, &geometry, &mut rng);
        assert!(!events.is_empty());
    }

    #[test]
    fn test_background_within_sensor() {
        let geometry = SensorGeometry::default();
        let mut rng = StdRng::seed_from_u64(5);
        let events = background_events(500, &geometry, &mut rng);
        assert_eq!(events.len(), 500);
        assert!(events.iter().all(|&(x, y)| x < 304 && y < 240));
    }
}
