//! Double-buffered table of every particle's state.
//!
//! Two slots of `n_particles` rows. One is settled ("proc") and owned by the
//! filter update; the other is being filled ("work") by the packet handler.
//! A completed generation flips the active index, so the rows are handed over
//! without copying and the proc slot is never written by the receiver.

use crate::codec::Field;
use crate::error::EngineError;
use crate::particle::{ParticleState, Row, FIELDS_PER_ROW};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A = 0,
    B = 1,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Generation-counted pair of row buffers.
#[derive(Debug)]
pub struct StateTable {
    slots: [Vec<Row>; 2],
    /// Slot currently readable by the algorithm
    proc: Slot,
    generation: u64,
}

impl StateTable {
    /// Allocate both slots for `rows` particles.
    ///
    /// Allocation failure is fatal for the node; it cannot run any part of the
    /// algorithm without a full table.
    pub fn new(rows: usize) -> Result<Self, EngineError> {
        Ok(Self {
            slots: [Self::alloc_slot(rows)?, Self::alloc_slot(rows)?],
            proc: Slot::A,
            generation: 0,
        })
    }

    fn alloc_slot(rows: usize) -> Result<Vec<Row>, EngineError> {
        let mut slot: Vec<Row> = Vec::new();
        slot.try_reserve_exact(rows)
            .map_err(|e| EngineError::Allocation {
                rows,
                reason: e.to_string(),
            })?;
        slot.resize(rows, [0.0; FIELDS_PER_ROW]);
        Ok(slot)
    }

    /// Number of rows in each slot.
    pub fn rows(&self) -> usize {
        self.slots[0].len()
    }

    /// Completed generations since start-up.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Settled rows of the last complete generation.
    pub fn proc(&self) -> &[Row] {
        &self.slots[self.proc as usize]
    }

    /// Settled rows, mutable for the update step (normalization is in place).
    pub fn proc_mut(&mut self) -> &mut [Row] {
        &mut self.slots[self.proc as usize]
    }

    /// Rows being filled for the next generation.
    pub fn work(&self) -> &[Row] {
        &self.slots[self.proc.other() as usize]
    }

    /// Write one field of one row in the filling slot. Out-of-range rows are
    /// ignored and reported with `false`.
    #[inline]
    pub fn write_work(&mut self, row: usize, field: Field, value: f32) -> bool {
        match self.slots[self.proc.other() as usize].get_mut(row) {
            Some(r) => {
                r[field.index()] = value;
                true
            }
            None => false,
        }
    }

    /// Store a whole particle into the filling slot.
    pub fn load_work_row(&mut self, row: usize, state: &ParticleState) {
        if let Some(r) = self.slots[self.proc.other() as usize].get_mut(row) {
            *r = state.to_row();
        }
    }

    /// Hand the filled slot to the algorithm. Returns the new generation.
    pub fn swap(&mut self) -> u64 {
        self.proc = self.proc.other();
        self.generation += 1;
        self.generation
    }

    /// Zero the filling slot (used by the reset-on-resume policy).
    pub fn clear_work(&mut self) {
        for row in self.slots[self.proc.other() as usize].iter_mut() {
            *row = [0.0; FIELDS_PER_ROW];
        }
    }
}
