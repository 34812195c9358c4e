//! Turn-ordered state exchange.
//!
//! A [`Collector`] reassembles field packets into the work slot of a
//! [`StateTable`] and hands the slot over once every expected packet of the
//! generation has arrived. [`TurnExchange`] adds the peer-to-peer rules on
//! top: a node broadcasts its own row only after both its local update has
//! finished and `ordinal × fields` peer packets have been seen.
//!
//! ```text
//! AwaitingTurn ──(both flags)──▶ Sending ──▶ AwaitingPeers
//!      ▲                                          │ full buffer
//!      └──────────────── Computing ◀──────────────┘
//! ```

use tracing::warn;

use crate::codec::{encode_field, FieldSet, Packet};
use crate::config::ResumePolicy;
use crate::error::{CodecError, EngineError};
use crate::particle::{ParticleState, Row};
use crate::peers::{Resolved, SenderIndex};
use crate::state_table::StateTable;

/// Monotonic protocol counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Field packets stored in the work slot
    pub accepted: u64,
    /// Packets whose base key matched no sender
    pub unknown_sender: u64,
    /// Packets from a known sender that failed to decode
    pub malformed: u64,
    /// Packets carrying the node's own key
    pub loopback: u64,
    /// Completed generations
    pub generations: u64,
}

impl ExchangeStats {
    /// All packets rejected as protocol errors.
    pub fn protocol_errors(&self) -> u64 {
        self.unknown_sender + self.malformed + self.loopback
    }
}

/// What a received packet did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// Stored; `received` packets so far this generation
    Stored { received: usize },
    /// Stored, and it completed the generation; the slots were swapped
    Complete { generation: u64 },
    UnknownSender,
    Loopback,
    Malformed(CodecError),
}

/// Work-slot filler shared by particles and aggregators.
#[derive(Debug)]
pub struct Collector {
    table: StateTable,
    senders: SenderIndex,
    received: usize,
    expected: usize,
    stats: ExchangeStats,
}

impl Collector {
    /// One row per sender. If the index has an own row, that row is filled
    /// locally and excluded from the expected packet count.
    pub fn new(senders: SenderIndex) -> Result<Self, EngineError> {
        let table = StateTable::new(senders.len())?;
        let remote = senders.len() - usize::from(senders.own_row().is_some());
        let expected = remote * senders.fields().len();
        Ok(Self {
            table,
            senders,
            received: 0,
            expected,
            stats: ExchangeStats::default(),
        })
    }

    /// Packets needed to complete a generation.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Packets accepted so far this generation.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn stats(&self) -> ExchangeStats {
        self.stats
    }

    pub fn senders(&self) -> &SenderIndex {
        &self.senders
    }

    pub fn table(&self) -> &StateTable {
        &self.table
    }

    pub fn proc(&self) -> &[Row] {
        self.table.proc()
    }

    pub fn proc_mut(&mut self) -> &mut [Row] {
        self.table.proc_mut()
    }

    /// Store a field packet into the work slot.
    ///
    /// Bounded work only: one lookup and one write. Unknown or malformed
    /// packets are logged and dropped without touching the counter.
    pub fn on_packet(&mut self, packet: &Packet) -> Reception {
        match self.senders.resolve(packet, self.received) {
            Resolved::Hit { row, field, value } => {
                self.table.write_work(row, field, value);
                self.received += 1;
                self.stats.accepted += 1;
                if self.received == self.expected {
                    Reception::Complete {
                        generation: self.complete(),
                    }
                } else {
                    Reception::Stored {
                        received: self.received,
                    }
                }
            }
            Resolved::UnknownSender => {
                self.stats.unknown_sender += 1;
                warn!(key = %format_args!("{:#010x}", packet.key), "packet from unknown sender ignored");
                Reception::UnknownSender
            }
            Resolved::Loopback => {
                self.stats.loopback += 1;
                warn!(key = %format_args!("{:#010x}", packet.key), "own key received, ignored");
                Reception::Loopback
            }
            Resolved::Malformed(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "undecodable field packet ignored");
                Reception::Malformed(e)
            }
        }
    }

    /// Swap slots and restart the count. Returns the new generation.
    pub fn complete(&mut self) -> u64 {
        self.received = 0;
        self.stats.generations += 1;
        self.table.swap()
    }

    /// Place the node's own state in the work slot.
    pub fn load_own(&mut self, state: &ParticleState) {
        if let Some(row) = self.senders.own_row() {
            self.table.load_work_row(row, state);
        }
    }

    /// Drop the partially filled generation.
    pub fn reset(&mut self) {
        self.received = 0;
        self.table.clear_work();
    }
}

/// Two-flag rendezvous: fires once when both inputs have been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendezvous {
    proc_done: bool,
    turn: bool,
}

impl Rendezvous {
    /// A fresh node has nothing to compute before its first send.
    pub fn new() -> Self {
        Self {
            proc_done: true,
            turn: false,
        }
    }

    /// Record inputs. Returns `true` exactly when the send should happen;
    /// both flags are cleared at that point.
    pub fn signal(&mut self, proc_done: bool, turn: bool) -> bool {
        self.proc_done |= proc_done;
        self.turn |= turn;
        if self.proc_done && self.turn {
            self.proc_done = false;
            self.turn = false;
            true
        } else {
            false
        }
    }

    pub fn flags(&self) -> (bool, bool) {
        (self.proc_done, self.turn)
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingTurn,
    Sending,
    AwaitingPeers,
    Computing,
}

/// What the caller must do after feeding the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Actions {
    /// Schedule `ReadyToSend { turn: true }`
    pub turn_reached: bool,
    /// Schedule the filter update on the swapped table
    pub update: bool,
    /// The packet was ignored as a protocol error
    pub rejected: bool,
}

/// Peer-to-peer exchange for one particle.
#[derive(Debug)]
pub struct TurnExchange {
    collector: Collector,
    own_key: u32,
    ordinal: usize,
    my_turn: usize,
    rendezvous: Rendezvous,
    phase: Phase,
    sends: u64,
}

impl TurnExchange {
    /// `peers` are every particle's base key by ordinal, own key included.
    pub fn new(ordinal: usize, own_key: u32, peers: Vec<u32>) -> Result<Self, EngineError> {
        let fields = FieldSet::Full;
        let senders = SenderIndex::new(peers, fields).with_own_row(ordinal);
        if senders.key(ordinal) != Some(own_key) {
            return Err(EngineError::Desync(format!(
                "own key {own_key:#010x} is not at ordinal {ordinal} of the peer table"
            )));
        }
        Ok(Self {
            collector: Collector::new(senders)?,
            own_key,
            ordinal,
            my_turn: ordinal * fields.len(),
            rendezvous: Rendezvous::new(),
            phase: Phase::AwaitingTurn,
            sends: 0,
        })
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Peer packets that must arrive before this node may send.
    pub fn my_turn(&self) -> usize {
        self.my_turn
    }

    /// Peer packets that complete a generation.
    pub fn full_buffer(&self) -> usize {
        self.collector.expected()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sends(&self) -> u64 {
        self.sends
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn collector_mut(&mut self) -> &mut Collector {
        &mut self.collector
    }

    /// Whether this node opens every generation itself.
    pub fn leads(&self) -> bool {
        self.ordinal == 0
    }

    /// Packet-received handler.
    pub fn on_packet(&mut self, packet: &Packet) -> Actions {
        let mut actions = Actions::default();
        match self.collector.on_packet(packet) {
            Reception::Stored { received } => {
                actions.turn_reached = received == self.my_turn;
            }
            Reception::Complete { .. } => {
                // the last ordinal's turn and the full buffer coincide
                actions.turn_reached = self.full_buffer() == self.my_turn;
                actions.update = true;
                self.phase = Phase::Computing;
            }
            _ => actions.rejected = true,
        }
        actions
    }

    /// Deferred `ReadyToSend` handler. Returns the packets to broadcast when
    /// the rendezvous fires.
    pub fn ready_to_send(
        &mut self,
        proc_done: bool,
        turn: bool,
        state: &ParticleState,
    ) -> Option<[Packet; 6]> {
        if !self.rendezvous.signal(proc_done, turn) {
            if proc_done {
                self.phase = Phase::AwaitingTurn;
            }
            return None;
        }
        self.phase = Phase::Sending;
        Some(state_packets(self.own_key, state))
    }

    /// Called after the state packets went out. Returns `true` when the
    /// generation completed locally (a single particle has no peers to wait
    /// for) and the update must be scheduled.
    pub fn sent(&mut self) -> bool {
        self.sends += 1;
        if self.full_buffer() == 0 {
            self.collector.complete();
            self.phase = Phase::Computing;
            true
        } else {
            if self.phase == Phase::Sending {
                self.phase = Phase::AwaitingPeers;
            }
            false
        }
    }

    /// Publish the freshly computed own row for the next generation.
    pub fn load_own(&mut self, state: &ParticleState) {
        self.collector.load_own(state);
    }

    /// Apply the resume policy after a pause.
    pub fn resume(&mut self, policy: ResumePolicy, state: &ParticleState) {
        if policy == ResumePolicy::Reset {
            self.collector.reset();
            self.collector.load_own(state);
            self.rendezvous = Rendezvous::new();
            self.phase = Phase::AwaitingTurn;
        }
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }
}

/// Six field packets for a particle, in wire order.
pub fn state_packets(base_key: u32, state: &ParticleState) -> [Packet; 6] {
    let fields = FieldSet::Full.fields();
    std::array::from_fn(|i| encode_field(base_key, fields[i], state.get(fields[i])))
}

/// Five-field resample target (no support count).
pub fn target_packets(base_key: u32, state: &ParticleState) -> [Packet; 5] {
    let fields = FieldSet::NoSupport.fields();
    std::array::from_fn(|i| encode_field(base_key, fields[i], state.get(fields[i])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Field;

    const KEYS: [u32; 3] = [0x100, 0x108, 0x110];

    fn exchange(ordinal: usize) -> TurnExchange {
        TurnExchange::new(ordinal, KEYS[ordinal], KEYS.to_vec()).unwrap()
    }

    fn peer_state(i: usize) -> ParticleState {
        let mut s = ParticleState::new(10.0 * i as f32, 5.0, 20.0);
        s.w = 0.1 * (i + 1) as f32;
        s
    }

    fn feed(ex: &mut TurnExchange, ordinal: usize) -> Vec<Actions> {
        state_packets(KEYS[ordinal], &peer_state(ordinal))
            .iter()
            .map(|p| ex.on_packet(p))
            .collect()
    }

    #[test]
    fn test_thresholds() {
        let ex = exchange(2);
        assert_eq!(ex.my_turn(), 12);
        assert_eq!(ex.full_buffer(), 12);
        assert_eq!(exchange(0).my_turn(), 0);
    }

    #[test]
    fn test_own_key_mismatch_is_desync() {
        let result = TurnExchange::new(1, 0x100, KEYS.to_vec());
        assert!(matches!(result, Err(EngineError::Desync(_))));
    }

    #[test]
    fn test_rendezvous_any_order_fires_once() {
        for order in [[true, false], [false, true]] {
            let mut r = Rendezvous {
                proc_done: false,
                turn: false,
            };
            let first = r.signal(order[0], order[1]);
            let second = r.signal(order[1], order[0]);
            assert!(!first);
            assert!(second);
            // both flags consumed
            assert!(!r.signal(false, false));
            assert_eq!(r.flags(), (false, false));
        }
    }

    #[test]
    fn test_rendezvous_exhaustive_interleavings() {
        // sequences of signals over two generations; every prefix of length
        // k must have fired at most min(#proc, #turn) times
        let events = [(true, false), (false, true)];
        for mask in 0u32..16 {
            let mut r = Rendezvous {
                proc_done: false,
                turn: false,
            };
            let (mut procs, mut turns, mut fires) = (0, 0, 0);
            for bit in 0..4 {
                let (p, t) = events[((mask >> bit) & 1) as usize];
                procs += usize::from(p);
                turns += usize::from(t);
                if r.signal(p, t) {
                    fires += 1;
                }
                assert!(fires <= procs.min(turns));
            }
            if procs >= 1 && turns >= 1 {
                assert!(fires >= 1);
            }
        }
    }

    #[test]
    fn test_turn_reached_after_lower_ordinals() {
        let mut ex = exchange(1);
        let actions = feed(&mut ex, 0);
        assert!(actions[..5].iter().all(|a| !a.turn_reached));
        assert!(actions[5].turn_reached);
        assert!(!actions[5].update);
    }

    #[test]
    fn test_full_buffer_swaps_rows_by_ordinal() {
        let mut ex = exchange(1);
        ex.load_own(&peer_state(1));
        feed(&mut ex, 0);
        let actions = feed(&mut ex, 2);
        assert!(actions[5].update);
        assert_eq!(ex.phase(), Phase::Computing);
        assert_eq!(ex.collector().received(), 0);

        let proc = ex.collector().proc();
        for i in 0..3 {
            assert_eq!(proc[i], peer_state(i).to_row());
        }
    }

    #[test]
    fn test_last_ordinal_turn_coincides_with_full_buffer() {
        let mut ex = exchange(2);
        feed(&mut ex, 0);
        let actions = feed(&mut ex, 1);
        assert!(actions[5].turn_reached);
        assert!(actions[5].update);
    }

    #[test]
    fn test_send_requires_both_flags() {
        let mut ex = exchange(1);
        let state = peer_state(1);
        // a fresh node starts with its computation finished
        assert_eq!(ex.rendezvous().flags(), (true, false));
        let packets = ex.ready_to_send(false, true, &state).unwrap();
        assert_eq!(packets[Field::W.index()].key, 0x108 + 4);
        assert!(!ex.sent());
        assert_eq!(ex.phase(), Phase::AwaitingPeers);

        assert!(ex.ready_to_send(true, false, &state).is_none());
        assert!(ex.ready_to_send(false, true, &state).is_some());
    }

    #[test]
    fn test_single_particle_completes_locally() {
        let mut ex = TurnExchange::new(0, 0x100, vec![0x100]).unwrap();
        assert_eq!(ex.full_buffer(), 0);
        ex.load_own(&peer_state(0));
        assert!(ex.ready_to_send(false, true, &peer_state(0)).is_some());
        assert!(ex.sent());
        assert_eq!(ex.collector().proc()[0], peer_state(0).to_row());
        assert_eq!(ex.collector().table().generation(), 1);
    }

    #[test]
    fn test_unknown_and_loopback_do_not_count() {
        let mut ex = exchange(1);
        let unknown = encode_field(0x200, Field::X, 1.0);
        let actions = ex.on_packet(&unknown);
        assert!(actions.rejected && !actions.turn_reached && !actions.update);
        let own = encode_field(0x108, Field::X, 1.0);
        assert!(ex.on_packet(&own).rejected);
        assert_eq!(ex.collector().received(), 0);

        let stats = ex.collector().stats();
        assert_eq!(stats.unknown_sender, 1);
        assert_eq!(stats.loopback, 1);
        assert_eq!(stats.protocol_errors(), 2);
    }

    #[test]
    fn test_resume_retain_keeps_partial_generation() {
        let mut ex = exchange(2);
        feed(&mut ex, 0);
        ex.ready_to_send(false, false, &peer_state(2));
        ex.resume(ResumePolicy::Retain, &peer_state(2));
        assert_eq!(ex.collector().received(), 6);

        // the interrupted generation completes with the retained rows
        let actions = feed(&mut ex, 1);
        assert!(actions[5].update);
        assert_eq!(ex.collector().proc()[0], peer_state(0).to_row());
    }

    #[test]
    fn test_resume_reset_clears_partial_generation() {
        let mut ex = exchange(2);
        ex.load_own(&peer_state(2));
        feed(&mut ex, 0);
        ex.ready_to_send(true, false, &peer_state(2));
        ex.resume(ResumePolicy::Reset, &peer_state(2));

        assert_eq!(ex.collector().received(), 0);
        assert_eq!(ex.rendezvous().flags(), (true, false));
        assert_eq!(ex.phase(), Phase::AwaitingTurn);

        // a full fresh generation is needed now
        let first = feed(&mut ex, 0);
        assert!(!first[5].update);
        let second = feed(&mut ex, 1);
        assert!(second[5].update);
        assert_eq!(ex.collector().proc()[2], peer_state(2).to_row());
    }
}
