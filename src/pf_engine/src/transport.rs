//! Outbound packet path.
//!
//! The fabric only offers a non-blocking `try_send`. Delivery with
//! "blocking" semantics is a bounded retry loop that backs off between
//! attempts and reports exhaustion to the caller.

use std::collections::VecDeque;
use std::time::Duration;

use crate::codec::Packet;
use crate::config::RetryPolicy;
use crate::error::SendError;

/// Non-blocking send primitive.
pub trait Transport {
    /// Offer a packet to the outbound queue. `false` if it is full.
    fn try_send(&mut self, packet: Packet) -> bool;

    /// Pause between attempts. Links that can make progress on the caller's
    /// thread override this to drain instead of sleeping.
    fn wait(&mut self, delay: Duration) {
        if delay.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(delay);
        }
    }
}

/// Send with bounded retries.
pub fn send_with_backoff<T: Transport + ?Sized>(
    transport: &mut T,
    packet: Packet,
    policy: &RetryPolicy,
) -> Result<(), SendError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if transport.try_send(packet) {
            return Ok(());
        }
        if attempt < attempts {
            transport.wait(policy.backoff());
        }
    }
    Err(SendError {
        key: packet.key,
        attempts,
    })
}

/// Send a burst in order, stopping at the first packet that cannot be
/// delivered. Returns the number of packets sent.
pub fn send_all<T: Transport + ?Sized>(
    transport: &mut T,
    packets: impl IntoIterator<Item = Packet>,
    policy: &RetryPolicy,
) -> Result<usize, SendError> {
    let mut sent = 0;
    for packet in packets {
        send_with_backoff(transport, packet, policy)?;
        sent += 1;
    }
    Ok(sent)
}

/// Packets that must reach the wire complete and in order.
///
/// Receivers count field packets, so a burst cut short would shift every
/// later count. When the retry budget runs out the undelivered tail stays
/// queued here and the next [`Burst::flush`] resumes from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Burst {
    packets: VecDeque<Packet>,
}

impl Burst {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append packets after anything still pending.
    pub fn extend(&mut self, packets: impl IntoIterator<Item = Packet>) {
        self.packets.extend(packets);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    /// Send pending packets in order. On exhaustion the failed packet and
    /// everything after it remain pending. Returns the packets sent.
    pub fn flush<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        policy: &RetryPolicy,
    ) -> Result<usize, SendError> {
        let mut sent = 0;
        while let Some(&packet) = self.packets.front() {
            send_with_backoff(transport, packet, policy)?;
            self.packets.pop_front();
            sent += 1;
        }
        Ok(sent)
    }
}
