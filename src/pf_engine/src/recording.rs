//! Recording collaborator: receives the tracked target once per tick.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub time: u32,
    pub x: f32,
    pub y: f32,
    pub r: f32,
}

/// Sink for the per-tick `[x, y, r]` vector.
pub trait Recorder: Send {
    fn record(&mut self, time: u32, target: [f32; 3]);

    /// Flush everything recorded so far. Called when the simulation pauses.
    fn finalise(&mut self) {}
}

/// In-memory recorder. Clones share the same buffer, so a handle kept by the
/// host sees what the node recorded.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Arc<Mutex<Vec<Record>>>,
    finalised: Arc<Mutex<usize>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times the recorder was finalised.
    pub fn finalised(&self) -> usize {
        *self.finalised.lock()
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, time: u32, target: [f32; 3]) {
        self.records.lock().push(Record {
            time,
            x: target[0],
            y: target[1],
            r: target[2],
        });
    }

    fn finalise(&mut self) {
        *self.finalised.lock() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_buffer() {
        let handle = MemoryRecorder::new();
        let mut boxed: Box<dyn Recorder> = Box::new(handle.clone());
        boxed.record(0, [1.0, 2.0, 3.0]);
        boxed.record(1, [4.0, 5.0, 6.0]);
        boxed.finalise();

        assert_eq!(handle.len(), 2);
        assert_eq!(
            handle.records()[1],
            Record {
                time: 1,
                x: 4.0,
                y: 5.0,
                r: 6.0
            }
        );
        assert_eq!(handle.finalised(), 1);
    }
}
