//! Sender lookup: which state-table row a field packet belongs to.
//!
//! Senders transmit their fields in order, so the number of packets already
//! seen this generation predicts the sender (`received / fields`, skipping
//! the node's own row). The hint is confirmed by comparing the key's base
//! against that sender's base key; on a mismatch every sender is searched.

use crate::codec::{Field, FieldSet, Packet, FIELD_MASK};
use crate::error::CodecError;

/// Outcome of resolving a field packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved {
    /// Row, field and decoded value
    Hit { row: usize, field: Field, value: f32 },
    /// No known sender owns this key
    UnknownSender,
    /// The key is the receiving node's own
    Loopback,
    /// Sender is known but the packet is not a valid field packet
    Malformed(CodecError),
}

/// Base keys of every expected sender, indexed by row.
#[derive(Debug, Clone)]
pub struct SenderIndex {
    keys: Vec<u32>,
    fields: FieldSet,
    /// Row filled locally rather than from the network
    own_row: Option<usize>,
    fallbacks: u64,
}

impl SenderIndex {
    pub fn new(keys: Vec<u32>, fields: FieldSet) -> Self {
        Self {
            keys,
            fields,
            own_row: None,
            fallbacks: 0,
        }
    }

    /// Mark `row` as the receiving node's own row. It is skipped by the
    /// arrival-order hint and packets carrying its key are not accepted.
    pub fn with_own_row(mut self, row: usize) -> Self {
        self.own_row = Some(row);
        self
    }

    pub fn own_row(&self) -> Option<usize> {
        self.own_row
    }

    pub fn fields(&self) -> FieldSet {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, row: usize) -> Option<u32> {
        self.keys.get(row).copied()
    }

    pub fn row_of(&self, base_key: u32) -> Option<usize> {
        self.keys.iter().position(|&k| k == base_key)
    }

    /// Lookups that missed the hint and needed a search.
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks
    }

    /// Resolve a packet. `received` is the number of packets already accepted
    /// this generation and only steers the fast path.
    pub fn resolve(&mut self, packet: &Packet, received: usize) -> Resolved {
        let base = packet.key & !FIELD_MASK;

        let mut hint = received / self.fields.len();
        if self.own_row.is_some_and(|own| hint >= own) {
            hint += 1;
        }
        let row = match self.keys.get(hint) {
            Some(&k) if k == base => Some(hint),
            _ => {
                self.fallbacks += 1;
                self.row_of(base)
            }
        };

        let Some(row) = row else {
            return Resolved::UnknownSender;
        };
        if Some(row) == self.own_row {
            return Resolved::Loopback;
        }

        let Some(payload) = packet.payload else {
            return Resolved::Malformed(CodecError::MissingPayload(packet.key));
        };
        match Field::from_offset(packet.key & FIELD_MASK) {
            Ok(field) if self.fields.fields().contains(&field) => Resolved::Hit {
                row,
                field,
                value: f32::from_bits(payload),
            },
            Ok(field) => Resolved::Malformed(CodecError::BadFieldOffset(field.offset())),
            Err(e) => Resolved::Malformed(e),
        }
    }
}
