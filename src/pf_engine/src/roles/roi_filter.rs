//! Row filter: gates raw sensor events by the main particle's region of
//! interest.
//!
//! Each filter owns one sensor row. A region update `(x, y, radius)` turns
//! into a visibility mask over that row's columns: the chord of the circle at
//! this row is visible, everything else is masked. Visible events are
//! forwarded with [`RAW_EVENT_FLAG`] cleared so they reach the particles.

use tracing::{debug, warn};

use super::NodeServices;
use crate::codec::{
    decode_roi, decode_xy, Packet, Roi, RAW_EVENT_FLAG, XY_CODE_MASK, X_MASK, Y_MASK,
};
use crate::config::{FilterParams, NodeConfig, RetryPolicy};
use crate::error::{ConfigError, EngineError};
use crate::event_queue::EventQueue;
use crate::particle::SensorGeometry;
use crate::scheduler::Task;
use crate::transport::Transport;

pub struct RoiFilterRole {
    node: usize,
    row: u32,
    width: u32,
    height: u32,
    filter_update_key: u32,
    mask: Vec<bool>,
    roi: Option<Roi>,
    pending: EventQueue,
    scratch: Vec<u32>,
    retry: RetryPolicy,
}

impl RoiFilterRole {
    pub fn new(config: &NodeConfig, params: &FilterParams) -> Result<Self, EngineError> {
        let filter_update_key = config
            .keys
            .filter_update
            .ok_or(ConfigError::MissingKey("filter update"))?;
        let width = params.geometry.width;
        Ok(Self {
            node: config.ordinal,
            row: config.filter_row,
            width,
            height: params.geometry.height,
            filter_update_key,
            // everything passes until the first region arrives
            mask: vec![true; width as usize],
            roi: None,
            pending: EventQueue::new(params.queue_capacity),
            scratch: Vec::with_capacity(params.queue_capacity),
            retry: params.retry,
        })
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    /// Last region applied, in sensor coordinates.
    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    pub fn is_visible(&self, column: u32) -> bool {
        self.mask.get(column as usize).copied().unwrap_or(false)
    }

    pub fn visible_columns(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    pub fn on_packet(&mut self, packet: &Packet, svc: &mut NodeServices<'_>) {
        if packet.has_payload() {
            if packet.key & !XY_CODE_MASK != self.filter_update_key {
                svc.counters.protocol_errors += 1;
                warn!(
                    node = self.node,
                    key = %format_args!("{:#010x}", packet.key),
                    "unexpected payload packet at row filter"
                );
                return;
            }
            match decode_roi(self.filter_update_key, packet) {
                Ok(roi) => self.apply(roi),
                Err(e) => {
                    svc.counters.protocol_errors += 1;
                    warn!(node = self.node, error = %e, "bad region update");
                }
            }
            return;
        }

        let (column, _) = decode_xy(packet.key);
        if !self.is_visible(column) {
            svc.counters.filtered += 1;
            return;
        }
        svc.counters.events_received += 1;
        if self.pending.push(packet.key & !RAW_EVENT_FLAG) {
            svc.schedule_once(Task::Forward);
        } else {
            svc.counters.dropped += 1;
        }
    }

    /// Rebuild the mask for a region given in wire coordinates.
    pub fn apply(&mut self, roi: Roi) {
        let roi = Roi {
            x: unwrap_coord(roi.x, X_MASK + 1, self.width),
            y: unwrap_coord(roi.y, Y_MASK + 1, self.height),
            radius: roi.radius,
        };
        self.mask.fill(false);

        let dy = (self.row as i32 - roi.y) as f32;
        let r = roi.radius as f32;
        if r >= 0.0 && dy.abs() <= r {
            let half = (r * r - dy * dy).sqrt() as i32;
            let last = self.width as i32 - 1;
            let lo = (roi.x - half).max(0);
            let hi = (roi.x + half).min(last);
            for column in lo..=hi {
                self.mask[column as usize] = true;
            }
        }
        debug!(
            node = self.node,
            row = self.row,
            x = roi.x,
            y = roi.y,
            radius = roi.radius,
            visible = self.visible_columns(),
            "region of interest updated"
        );
        self.roi = Some(roi);
    }

    pub fn run(&mut self, task: Task, svc: &mut NodeServices<'_>, out: &mut dyn Transport) {
        match task {
            Task::Forward => {
                self.scratch.clear();
                let n = self.pending.drain_into(&mut self.scratch);
                let packets = self.scratch.iter().map(|&key| Packet::no_payload(key));
                if svc.send(out, packets, &self.retry) {
                    svc.counters.forwarded += n as u64;
                }
            }
            other => debug!(node = self.node, task = ?other, "task not handled by row filter"),
        }
    }
}

/// Map a masked coordinate back to a signed one. Codes in the unused gap
/// past the sensor edge are read as negative, the nearer interpretation.
///
/// Only `unwrap_range(modulus, extent)` survives the trip: with 240 rows in
/// an 8-bit code, a centre at row 280 arrives as 24. Senders clamp with
/// [`clamp_roi_centre`] first.
fn unwrap_coord(code: i32, modulus: u32, extent: u32) -> i32 {
    let (_, hi) = unwrap_range(modulus, extent);
    if code > hi {
        code - modulus as i32
    } else {
        code
    }
}

/// Inclusive range of coordinates that decode back to themselves.
fn unwrap_range(modulus: u32, extent: u32) -> (i32, i32) {
    let split = (extent + modulus.saturating_sub(extent) / 2) as i32;
    (split - modulus as i32, split - 1)
}

/// Clamp a region centre into the range a row filter decodes unambiguously.
/// A centre far past one edge is pulled back to just past that edge instead
/// of aliasing to the opposite one.
pub fn clamp_roi_centre(x: f32, y: f32, geometry: &SensorGeometry) -> (f32, f32) {
    let (x_lo, x_hi) = unwrap_range(X_MASK + 1, geometry.width);
    let (y_lo, y_hi) = unwrap_range(Y_MASK + 1, geometry.height);
    (
        x.clamp(x_lo as f32, x_hi as f32),
        y.clamp(y_lo as f32, y_hi as f32),
    )
}
