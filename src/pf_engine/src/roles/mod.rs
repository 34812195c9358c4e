//! Node roles.
//!
//! Every role exposes the same three entry points, matching the firmware's
//! callback priorities: a bounded packet handler, a timer hook, and deferred
//! tasks that may send.

pub mod aggregator;
pub mod particle;
pub mod roi_filter;

pub use aggregator::AggregatorRole;
pub use particle::ParticleRole;
pub use roi_filter::RoiFilterRole;

use tracing::error;

use crate::codec::Packet;
use crate::config::RetryPolicy;
use crate::diagnostics::RateCounters;
use crate::scheduler::{Task, TaskQueue};
use crate::transport::{send_all, Burst, Transport};

/// Node-level services a role handler may use.
pub struct NodeServices<'a> {
    pub node: usize,
    pub tasks: &'a mut TaskQueue,
    pub counters: &'a mut RateCounters,
}

impl NodeServices<'_> {
    /// Queue a deferred task; a refusal is logged and counted.
    pub fn schedule(&mut self, task: Task) -> bool {
        let queued = self.tasks.schedule(task);
        if !queued {
            self.counters.schedule_failures += 1;
            error!(node = self.node, ?task, "could not schedule deferred task");
        }
        queued
    }

    /// Queue a task unless an identical one is already pending.
    pub fn schedule_once(&mut self, task: Task) -> bool {
        self.tasks.contains(task) || self.schedule(task)
    }

    /// Send independent packets with bounded retries; exhaustion is logged and
    /// counted and the rest are dropped. Field bursts go through [`Self::flush`].
    pub fn send(
        &mut self,
        out: &mut dyn Transport,
        packets: impl IntoIterator<Item = Packet>,
        retry: &RetryPolicy,
    ) -> bool {
        match send_all(out, packets, retry) {
            Ok(_) => true,
            Err(e) => {
                self.counters.send_failures += 1;
                error!(node = self.node, error = %e, "send failed");
                false
            }
        }
    }

    /// Flush a pending burst. On exhaustion the rest of the burst is kept and
    /// a [`Task::Flush`] is queued to resume it.
    pub fn flush(
        &mut self,
        out: &mut dyn Transport,
        burst: &mut Burst,
        retry: &RetryPolicy,
    ) -> bool {
        match burst.flush(out, retry) {
            Ok(_) => true,
            Err(e) => {
                self.counters.send_failures += 1;
                error!(
                    node = self.node,
                    error = %e,
                    remaining = burst.len(),
                    "send failed, burst kept for retry"
                );
                self.schedule_once(Task::Flush);
                false
            }
        }
    }
}
