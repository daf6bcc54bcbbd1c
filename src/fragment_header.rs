//! Every datagram starts with a small header describing which part of which message it carries:
//!
//! ```ascii
//! 0:  selector (8 bits):
//!     * bit 6-7: fragment type (00 non-fragmented, 01 fragmented, other values unknown)
//!     * bit 4-5: width class of `packet_length`
//!     * bit 2-3: width class of `message_id`
//!     * bit 0-1: width class of `fragment_index` (00 for non-fragmented datagrams)
//! 1:  filter byte (fragmented only): filter tag XOR the low byte of `message_id`
//! *:  packet_length (1/2/4 bytes BE): length of the entire (un-fragmented) message
//! *:  message_id (1/2/4 bytes BE)
//! *:  fragment_index (1/2/4 bytes BE, fragmented only)
//! ```
//!
//! Width classes are 00 for one byte, 01 for two bytes and 11 for four bytes - 10 is reserved.

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FragmentKind {
    NonFragmented = 0,
    Fragmented = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("fragment header truncated: {needed} bytes needed, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("reserved width class {0} in fragment header")]
    ReservedWidth(u8),
    #[error("unknown fragment type {0}")]
    UnknownType(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WidthClass {
    One,
    Two,
    Four,
}
impl WidthClass {
    const RESERVED_BITS: u8 = 0b10;

    /// the narrowest width class that can hold the value - this is the only place where widths
    ///  are chosen
    fn for_value(value: u32) -> WidthClass {
        if value <= u8::MAX as u32 {
            WidthClass::One
        }
        else if value <= u16::MAX as u32 {
            WidthClass::Two
        }
        else {
            WidthClass::Four
        }
    }

    fn from_bits(bits: u8) -> Result<WidthClass, HeaderError> {
        match bits & 0b11 {
            0b00 => Ok(WidthClass::One),
            0b01 => Ok(WidthClass::Two),
            0b11 => Ok(WidthClass::Four),
            _ => Err(HeaderError::ReservedWidth(Self::RESERVED_BITS)),
        }
    }

    fn bits(self) -> u8 {
        match self {
            WidthClass::One => 0b00,
            WidthClass::Two => 0b01,
            WidthClass::Four => 0b11,
        }
    }

    fn len(self) -> usize {
        match self {
            WidthClass::One => 1,
            WidthClass::Two => 2,
            WidthClass::Four => 4,
        }
    }

    fn put(self, buf: &mut impl BufMut, value: u32) {
        match self {
            WidthClass::One => buf.put_u8(value as u8),
            WidthClass::Two => buf.put_u16(value as u16),
            WidthClass::Four => buf.put_u32(value),
        }
    }

    fn try_get(self, buf: &mut impl Buf) -> Result<u32, HeaderError> {
        ensure_remaining(buf, self.len())?;
        Ok(match self {
            WidthClass::One => buf.get_u8() as u32,
            WidthClass::Two => buf.get_u16() as u32,
            WidthClass::Four => buf.get_u32(),
        })
    }
}

fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), HeaderError> {
    if buf.remaining() < needed {
        return Err(HeaderError::Truncated { needed, remaining: buf.remaining() });
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub kind: FragmentKind,
    pub packet_length: u32,
    pub message_id: u32,
    /// always 0 for non-fragmented datagrams
    pub fragment_index: u32,
    /// always 0 (i.e. wildcard) for non-fragmented datagrams
    pub filter_tag: u8,
}

impl FragmentHeader {
    pub const MAX_SERIALIZED_LEN: usize = 2 + 3 * std::mem::size_of::<u32>();

    pub fn fragmented(packet_length: u32, message_id: u32, fragment_index: u32, filter_tag: u8) -> FragmentHeader {
        FragmentHeader {
            kind: FragmentKind::Fragmented,
            packet_length,
            message_id,
            fragment_index,
            filter_tag,
        }
    }

    pub fn non_fragmented(packet_length: u32, message_id: u32) -> FragmentHeader {
        FragmentHeader {
            kind: FragmentKind::NonFragmented,
            packet_length,
            message_id,
            fragment_index: 0,
            filter_tag: 0,
        }
    }

    pub fn serialized_len(&self) -> usize {
        let mut result = 1
            + WidthClass::for_value(self.packet_length).len()
            + WidthClass::for_value(self.message_id).len();
        if self.kind == FragmentKind::Fragmented {
            result += 1 + WidthClass::for_value(self.fragment_index).len();
        }
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let len_width = WidthClass::for_value(self.packet_length);
        let id_width = WidthClass::for_value(self.message_id);
        let frag_width = match self.kind {
            FragmentKind::Fragmented => WidthClass::for_value(self.fragment_index),
            FragmentKind::NonFragmented => WidthClass::One,
        };

        let kind: u8 = self.kind.into();
        buf.put_u8((kind << 6) | (len_width.bits() << 4) | (id_width.bits() << 2) | frag_width.bits());

        if self.kind == FragmentKind::Fragmented {
            // the low byte of the message id changes with every message, so consecutive
            //  datagrams do not start with identical bytes
            buf.put_u8(self.filter_tag ^ (self.message_id as u8));
        }

        len_width.put(buf, self.packet_length);
        id_width.put(buf, self.message_id);
        if self.kind == FragmentKind::Fragmented {
            frag_width.put(buf, self.fragment_index);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FragmentHeader, HeaderError> {
        ensure_remaining(buf, 1)?;
        let selector = buf.get_u8();

        let raw_kind = selector >> 6;
        let kind = FragmentKind::try_from(raw_kind)
            .map_err(|_| HeaderError::UnknownType(raw_kind))?;

        let len_width = WidthClass::from_bits(selector >> 4)?;
        let id_width = WidthClass::from_bits(selector >> 2)?;

        match kind {
            FragmentKind::NonFragmented => {
                let packet_length = len_width.try_get(buf)?;
                let message_id = id_width.try_get(buf)?;
                Ok(FragmentHeader::non_fragmented(packet_length, message_id))
            }
            FragmentKind::Fragmented => {
                let frag_width = WidthClass::from_bits(selector)?;
                ensure_remaining(buf, 1)?;
                let filter_byte = buf.get_u8();
                let packet_length = len_width.try_get(buf)?;
                let message_id = id_width.try_get(buf)?;
                let fragment_index = frag_width.try_get(buf)?;
                Ok(FragmentHeader::fragmented(packet_length, message_id, fragment_index, filter_byte ^ (message_id as u8)))
            }
        }
    }
}
