//! Wire codec for the broadcast packet space.
//!
//! Every packet is a 32-bit key with an optional 32-bit payload. The low bits
//! of a key double as a type discriminator:
//!
//! - field packets: `base_key + field_offset`, payload = raw `f32` bits
//! - position packets: `base_key + (encode_xy(x, y) << 1)`, no payload
//! - region-of-interest packets: `filter_update_key + encode_xy(x, y)`,
//!   payload = integer radius
//! - sensor events: `event_base + encode_xy(x, y)`, no payload

use crate::error::CodecError;

/// Mask for the 9-bit x coordinate.
pub const X_MASK: u32 = 0x1FF;
/// Mask for the 8-bit y coordinate (after shifting).
pub const Y_MASK: u32 = 0xFF;
/// Bit offset of the y coordinate inside a coordinate code.
pub const Y_SHIFT: u32 = 9;
/// Mask covering a full coordinate code.
pub const XY_CODE_MASK: u32 = (Y_MASK << Y_SHIFT) | X_MASK;

/// Raw sensor events carry this flag; filters strip it when forwarding.
pub const RAW_EVENT_FLAG: u32 = 0x0010_0000;

/// Number of keys reserved per sender for field packets (low 3 bits).
pub const FIELD_BLOCK: u32 = 8;
/// Mask selecting the field offset within a sender's block.
pub const FIELD_MASK: u32 = FIELD_BLOCK - 1;

/// Radius scale applied to the region-of-interest payload.
pub const ROI_RADIUS_SCALE: f32 = 1.4;

/// Pack a coordinate into a 17-bit code.
///
/// `encode_xy(100, 50) == 25700`.
#[inline]
pub fn encode_xy(x: u32, y: u32) -> u32 {
    (x & X_MASK) | ((y & Y_MASK) << Y_SHIFT)
}

/// Exact inverse masking of [`encode_xy`]. Bits above the code are ignored,
/// so this also decodes an event key directly.
#[inline]
pub fn decode_xy(code: u32) -> (u32, u32) {
    (code & X_MASK, (code >> Y_SHIFT) & Y_MASK)
}

/// Truncate a real coordinate the way the firmware does (`(int)x`) before
/// packing. Negative coordinates wrap through the mask like the C cast.
#[inline]
pub fn encode_xy_f32(x: f32, y: f32) -> u32 {
    encode_xy(x as i32 as u32, y as i32 as u32)
}

/// Reinterpret an `f32` as its payload bit pattern.
#[inline]
pub fn f32_to_payload(value: f32) -> u32 {
    value.to_bits()
}

/// Reinterpret a payload bit pattern as an `f32`.
#[inline]
pub fn payload_to_f32(payload: u32) -> f32 {
    f32::from_bits(payload)
}

/// One of the six per-particle fields, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Field {
    X = 0,
    Y = 1,
    R = 2,
    L = 3,
    W = 4,
    N = 5,
}

impl Field {
    /// All fields in wire order.
    pub const ALL: [Field; 6] = [Field::X, Field::Y, Field::R, Field::L, Field::W, Field::N];

    /// Field at a given key offset.
    pub fn from_offset(offset: u32) -> Result<Self, CodecError> {
        match offset {
            0 => Ok(Field::X),
            1 => Ok(Field::Y),
            2 => Ok(Field::R),
            3 => Ok(Field::L),
            4 => Ok(Field::W),
            5 => Ok(Field::N),
            other => Err(CodecError::BadFieldOffset(other)),
        }
    }

    /// Key offset of this field.
    #[inline]
    pub fn offset(self) -> u32 {
        self as u32
    }

    /// Column of this field inside a state row.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Which fields a sender carries.
///
/// Offsets never move: a five-field sender still uses `x..w` = `0..4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSet {
    /// x, y, r, l, w, n (particle state exchange)
    Full,
    /// x, y, r, l, w (aggregator resample target)
    NoSupport,
}

impl FieldSet {
    pub fn fields(self) -> &'static [Field] {
        match self {
            FieldSet::Full => &Field::ALL,
            FieldSet::NoSupport => &Field::ALL[..5],
        }
    }

    /// Packets per particle for this set.
    pub fn len(self) -> usize {
        self.fields().len()
    }

    pub fn is_empty(self) -> bool {
        false
    }
}

/// A broadcast packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub key: u32,
    pub payload: Option<u32>,
}

impl Packet {
    pub fn with_payload(key: u32, payload: u32) -> Self {
        Self {
            key,
            payload: Some(payload),
        }
    }

    pub fn no_payload(key: u32) -> Self {
        Self { key, payload: None }
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

/// Field packet for `field` from a sender with `base_key`.
#[inline]
pub fn encode_field(base_key: u32, field: Field, value: f32) -> Packet {
    Packet::with_payload(base_key.wrapping_add(field.offset()), f32_to_payload(value))
}

/// Recover `(field, value)` from a field packet sent by `base_key`.
pub fn decode_field(base_key: u32, packet: &Packet) -> Result<(Field, f32), CodecError> {
    let payload = packet
        .payload
        .ok_or(CodecError::MissingPayload(packet.key))?;
    let delta = packet
        .key
        .checked_sub(base_key)
        .ok_or(CodecError::KeyBelowBase {
            key: packet.key,
            base: base_key,
        })?;
    let field = Field::from_offset(delta & FIELD_MASK)?;
    Ok((field, payload_to_f32(payload)))
}

/// "I am here" position packet, no payload.
#[inline]
pub fn encode_position(base_key: u32, x: f32, y: f32) -> Packet {
    Packet::no_payload(base_key.wrapping_add(encode_xy_f32(x, y) << 1))
}

/// Inverse of [`encode_position`].
#[inline]
pub fn decode_position(base_key: u32, key: u32) -> (u32, u32) {
    decode_xy(key.wrapping_sub(base_key) >> 1)
}

/// Region-of-interest update for the event filters.
#[inline]
pub fn encode_roi(filter_update_key: u32, x: f32, y: f32, r: f32) -> Packet {
    Packet::with_payload(
        filter_update_key.wrapping_add(encode_xy_f32(x, y)),
        (r * ROI_RADIUS_SCALE) as i32 as u32,
    )
}

/// Region of interest decoded by a filter: centre column/row and radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub radius: i32,
}

/// Inverse of [`encode_roi`].
pub fn decode_roi(filter_update_key: u32, packet: &Packet) -> Result<Roi, CodecError> {
    let payload = packet
        .payload
        .ok_or(CodecError::MissingPayload(packet.key))?;
    let (x, y) = decode_xy(packet.key.wrapping_sub(filter_update_key));
    Ok(Roi {
        x: x as i32,
        y: y as i32,
        radius: payload as i32,
    })
}

/// Sensor event key for a pixel.
#[inline]
pub fn encode_event(event_base: u32, x: u32, y: u32) -> u32 {
    event_base | encode_xy(x, y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_xy_scenario() {
        assert_eq!(encode_xy(100, 50), 25700);
        assert_eq!(decode_xy(25700), (100, 50));
    }

    #[test]
    fn test_xy_roundtrip_full_range() {
        for y in 0..=Y_MASK {
            for x in (0..=X_MASK).step_by(7) {
                assert_eq!(decode_xy(encode_xy(x, y)), (x, y));
            }
            assert_eq!(decode_xy(encode_xy(X_MASK, y)), (X_MASK, y));
        }
    }

    #[test]
    fn test_decode_xy_ignores_tag_bits() {
        let key = 0x0030_0000 | encode_xy(303, 239);
        assert_eq!(decode_xy(key), (303, 239));
    }

    #[test]
    fn test_payload_is_bit_exact() {
        for value in [0.0f32, -0.0, 1.0e-38, 3.25, f32::MAX, f32::MIN_POSITIVE, -17.5] {
            let payload = f32_to_payload(value);
            assert_eq!(payload_to_f32(payload).to_bits(), value.to_bits());
        }
        let nan = f32::from_bits(0x7FC0_1234);
        assert_eq!(payload_to_f32(f32_to_payload(nan)).to_bits(), 0x7FC0_1234);
    }

    #[test]
    fn test_field_packet_roundtrip() {
        let base = 0x0000_1000;
        for field in Field::ALL {
            let packet = encode_field(base, field, 12.5 + field.index() as f32);
            assert_eq!(packet.key, base + field.offset());
            let (decoded, value) = decode_field(base, &packet).unwrap();
            assert_eq!(decoded, field);
            assert_eq!(value, 12.5 + field.index() as f32);
        }
    }

    #[test]
    fn test_decode_field_rejects_bad_offsets() {
        let base = 0x0000_1000;
        let packet = Packet::with_payload(base + 6, 0);
        assert_eq!(
            decode_field(base, &packet),
            Err(CodecError::BadFieldOffset(6))
        );

        let below = Packet::with_payload(base - 1, 0);
        assert!(matches!(
            decode_field(base, &below),
            Err(CodecError::KeyBelowBase { .. })
        ));

        let bare = Packet::no_payload(base);
        assert_eq!(
            decode_field(base, &bare),
            Err(CodecError::MissingPayload(base))
        );
    }

    #[test]
    fn test_position_packet_has_no_payload() {
        let base = 0x0100_0000;
        let packet = encode_position(base, 152.7, 120.2);
        assert!(!packet.has_payload());
        assert_eq!(packet.key, base + (encode_xy(152, 120) << 1));
        assert_eq!(decode_position(base, packet.key), (152, 120));
    }

    #[test]
    fn test_roi_packet() {
        let key = 0x0040_0000;
        let packet = encode_roi(key, 100.0, 50.0, 30.0);
        assert_eq!(packet.key, key + 25700);
        assert_eq!(packet.payload, Some(42));

        let roi = decode_roi(key, &packet).unwrap();
        assert_eq!(
            roi,
            Roi {
                x: 100,
                y: 50,
                radius: 42
            }
        );
    }

    #[test]
    fn test_field_sets() {
        assert_eq!(FieldSet::Full.len(), 6);
        assert_eq!(FieldSet::NoSupport.len(), 5);
        assert!(!FieldSet::NoSupport.fields().contains(&Field::N));
    }
}
