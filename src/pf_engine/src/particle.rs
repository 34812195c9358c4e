//! Particle hypothesis: a circle in sensor coordinates with a weight.

use serde::{Deserialize, Serialize};

use crate::codec::Field;

/// Smallest radius a hypothesis may take (pixels).
pub const R_MIN: f32 = 10.0;
/// Largest radius a hypothesis may take (pixels).
pub const R_MAX: f32 = 40.0;

/// Numeric fields per state row, in wire order.
pub const FIELDS_PER_ROW: usize = 6;

/// One row of the state table.
pub type Row = [f32; FIELDS_PER_ROW];

/// Sensor resolution. Hypothesis centres may leave the field by one radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorGeometry {
    pub width: u32,
    pub height: u32,
}

impl Default for SensorGeometry {
    fn default() -> Self {
        Self {
            width: 304,
            height: 240,
        }
    }
}

/// A weighted circle hypothesis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleState {
    /// Centre column
    pub x: f32,
    /// Centre row
    pub y: f32,
    /// Radius
    pub r: f32,
    /// Likelihood of the last scoring pass
    pub l: f32,
    /// Weight (unnormalized between generations)
    pub w: f32,
    /// Support count: events consumed when the likelihood peaked
    pub n: f32,
}

impl ParticleState {
    pub fn new(x: f32, y: f32, r: f32) -> Self {
        Self {
            x,
            y,
            r,
            l: 0.0,
            w: 1.0,
            n: 0.0,
        }
    }

    /// Value of a single field.
    pub fn get(&self, field: Field) -> f32 {
        match field {
            Field::X => self.x,
            Field::Y => self.y,
            Field::R => self.r,
            Field::L => self.l,
            Field::W => self.w,
            Field::N => self.n,
        }
    }

    pub fn set(&mut self, field: Field, value: f32) {
        match field {
            Field::X => self.x = value,
            Field::Y => self.y = value,
            Field::R => self.r = value,
            Field::L => self.l = value,
            Field::W => self.w = value,
            Field::N => self.n = value,
        }
    }

    pub fn to_row(&self) -> Row {
        [self.x, self.y, self.r, self.l, self.w, self.n]
    }

    pub fn from_row(row: &Row) -> Self {
        Self {
            x: row[Field::X.index()],
            y: row[Field::Y.index()],
            r: row[Field::R.index()],
            l: row[Field::L.index()],
            w: row[Field::W.index()],
            n: row[Field::N.index()],
        }
    }

    /// Clamp radius to `[R_MIN, R_MAX]`, then the centre so the circle stays
    /// within the sensor field extended by one radius. Negative weights are
    /// raised to zero.
    pub fn clamp_to(&mut self, geometry: &SensorGeometry) {
        self.r = self.r.clamp(R_MIN, R_MAX);
        self.x = self.x.clamp(-self.r, geometry.width as f32 + self.r);
        self.y = self.y.clamp(-self.r, geometry.height as f32 + self.r);
        if !(self.w >= 0.0) {
            self.w = 0.0;
        }
    }
}

impl Default for ParticleState {
    fn default() -> Self {
        Self::new(64.0, 64.0, 30.0)
    }
}

/// Index of the highest-weight row. `None` for an empty slice.
pub fn select_best_row(rows: &[Row]) -> Option<usize> {
    rows.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a[Field::W.index()]
                .partial_cmp(&b[Field::W.index()])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_roundtrip() {
        let state = ParticleState {
            x: 1.0,
            y: 2.0,
            r: 15.0,
            l: 3.5,
            w: 0.25,
            n: 120.0,
        };
        assert_eq!(ParticleState::from_row(&state.to_row()), state);
        for field in Field::ALL {
            assert_eq!(state.to_row()[field.index()], state.get(field));
        }
    }

    #[test]
    fn test_clamp_radius_then_position() {
        let geometry = SensorGeometry::default();

        let mut state = ParticleState::new(-100.0, 500.0, 55.0);
        state.clamp_to(&geometry);
        assert_eq!(state.r, R_MAX);
        assert_eq!(state.x, -R_MAX);
        assert_eq!(state.y, 240.0 + R_MAX);

        let mut small = ParticleState::new(400.0, -3.0, 2.0);
        small.clamp_to(&geometry);
        assert_eq!(small.r, R_MIN);
        assert_eq!(small.x, 304.0 + R_MIN);
        assert_eq!(small.y, -3.0);
    }

    #[test]
    fn test_clamp_repairs_weight() {
        let mut state = ParticleState::default();
        state.w = -0.5;
        state.clamp_to(&SensorGeometry::default());
        assert_eq!(state.w, 0.0);

        state.w = f32::NAN;
        state.clamp_to(&SensorGeometry::default());
        assert_eq!(state.w, 0.0);
    }

    #[test]
    fn test_select_best_row() {
        let rows = vec![
            ParticleState { w: 0.2, ..ParticleState::default() }.to_row(),
            ParticleState { w: 0.7, ..ParticleState::default() }.to_row(),
            ParticleState { w: 0.1, ..ParticleState::default() }.to_row(),
        ];
        assert_eq!(select_best_row(&rows), Some(1));
        assert_eq!(select_best_row(&[]), None);
    }
}
