//! Fathom data-plane wire format — the sonar data packet.
//!
//! These types ARE the protocol. Every field offset and size is part of the
//! wire format and must stay bit-exact with deployed sonar firmware. All
//! multi-byte fields are little-endian on the wire; the header struct stores
//! values already converted with `to_le`, so `as_bytes` is the wire image on
//! every platform.
//!
//! A packet carries at most [`MAX_PART`] bytes of one message. Messages
//! larger than that are split by the sender and reassembled at the receiver.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::DataMessage;

/// Protocol identifier, first field of every data packet.
pub const MAGIC: u32 = 0x4E53534B;

/// Wire format revision. A receiver seeing any other value drops the packet.
pub const WIRE_VERSION: u32 = 20160100;

/// Maximum message payload bytes carried by one packet.
pub const MAX_PART: usize = 32_000;

/// Fixed packet header size in bytes.
pub const HEADER_SIZE: usize = 48;

/// Largest possible datagram on the data plane: header plus a full part.
pub const PACKET_MAX_SIZE: usize = HEADER_SIZE + MAX_PART;

/// Data packet header.
///
/// Fields hold little-endian representations; use the accessor methods to
/// read native values. Layout:
///
/// | off | size | field     |
/// |-----|------|-----------|
/// | 0   | 4    | magic     |
/// | 4   | 4    | version   |
/// | 8   | 4    | index     |
/// | 12  | 4    | crc32     |
/// | 16  | 8    | time (µs) |
/// | 24  | 4    | id        |
/// | 28  | 4    | type      |
/// | 32  | 4    | rate (f32 bits) |
/// | 36  | 4    | size      |
/// | 40  | 4    | part_size |
/// | 44  | 4    | offset    |
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub index: u32,
    /// CRC-32 of the whole packet (header + payload) with this field zeroed.
    pub crc32: u32,
    pub time: i64,
    pub id: u32,
    pub type_tag: u32,
    /// IEEE-754 bits of the sampling rate in Hz.
    pub rate_bits: u32,
    pub size: u32,
    pub part_size: u32,
    pub offset: u32,
}

// Compile-time guard: the header is exactly 48 bytes on the wire.
assert_eq_size!(PacketHeader, [u8; 48]);

impl PacketHeader {
    pub fn index(&self) -> u32 {
        u32::from_le(self.index)
    }

    pub fn time(&self) -> i64 {
        i64::from_le(self.time)
    }

    pub fn id(&self) -> u32 {
        u32::from_le(self.id)
    }

    pub fn type_tag(&self) -> u32 {
        u32::from_le(self.type_tag)
    }

    pub fn rate(&self) -> f32 {
        f32::from_bits(u32::from_le(self.rate_bits))
    }

    pub fn size(&self) -> u32 {
        u32::from_le(self.size)
    }

    pub fn part_size(&self) -> u32 {
        u32::from_le(self.part_size)
    }

    pub fn offset(&self) -> u32 {
        u32::from_le(self.offset)
    }
}

/// Errors raised while interpreting data-plane datagrams.
///
/// Every variant is a log-and-drop condition at the receiver; none of them
/// terminates a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported wire version: {0}")]
    BadVersion(u32),

    #[error("part size {part_size} exceeds maximum {max}")]
    PartTooLarge { part_size: u32, max: u32 },

    #[error("part [{offset}, {offset}+{part_size}) outside message of {size} bytes")]
    PartOutOfBounds { offset: u32, part_size: u32, size: u32 },

    #[error("datagram length {actual} does not match header + part_size = {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("crc mismatch: packet 0x{got:08x}, computed 0x{want:08x}")]
    Crc { got: u32, want: u32 },
}

/// A structurally validated view over one received datagram.
///
/// Construction checks everything except the CRC, which the receive path
/// defers to the reassembly worker; call [`PacketView::verify_crc`] there.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub index: u32,
    pub time: i64,
    pub id: u32,
    pub type_tag: u32,
    pub rate: f32,
    pub size: u32,
    pub part_size: u32,
    pub offset: u32,
    pub data: &'a [u8],
    raw: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Parse and structurally validate a datagram.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, WireError> {
        if datagram.len() <= HEADER_SIZE {
            return Err(WireError::Truncated(datagram.len()));
        }

        let header = PacketHeader::read_from_prefix(&datagram[..HEADER_SIZE])
            .ok_or(WireError::Truncated(datagram.len()))?;

        if u32::from_le(header.magic) != MAGIC {
            return Err(WireError::BadMagic(u32::from_le(header.magic)));
        }
        if u32::from_le(header.version) != WIRE_VERSION {
            return Err(WireError::BadVersion(u32::from_le(header.version)));
        }

        let part_size = header.part_size();
        let offset = header.offset();
        let size = header.size();

        if part_size as usize > MAX_PART {
            return Err(WireError::PartTooLarge { part_size, max: MAX_PART as u32 });
        }
        if offset.checked_add(part_size).map_or(true, |end| end > size) {
            return Err(WireError::PartOutOfBounds { offset, part_size, size });
        }
        if datagram.len() != HEADER_SIZE + part_size as usize {
            return Err(WireError::LengthMismatch {
                expected: HEADER_SIZE + part_size as usize,
                actual: datagram.len(),
            });
        }

        Ok(Self {
            index: header.index(),
            time: header.time(),
            id: header.id(),
            type_tag: header.type_tag(),
            rate: header.rate(),
            size,
            part_size,
            offset,
            data: &datagram[HEADER_SIZE..],
            raw: datagram,
        })
    }

    /// Verify the packet CRC: CRC-32 over the full datagram with the crc32
    /// field treated as zero.
    pub fn verify_crc(&self) -> Result<(), WireError> {
        let got = u32::from_le_bytes(self.raw[12..16].try_into().unwrap());
        let want = crc_of(self.raw);
        if got != want {
            return Err(WireError::Crc { got, want });
        }
        Ok(())
    }
}

/// CRC-32 of a serialized packet, with the crc32 field taken as zero.
fn crc_of(packet: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&packet[..12]);
    hasher.update(&[0u8; 4]);
    hasher.update(&packet[16..]);
    hasher.finalize()
}

/// Serialize one part of a message into `buf`.
///
/// `buf` must hold at least `HEADER_SIZE + part_size` bytes and
/// `offset + part_size` must lie within the message payload. Returns the
/// datagram length.
pub fn encode_packet(
    buf: &mut [u8],
    index: u32,
    msg: &DataMessage,
    offset: u32,
    part_size: u32,
) -> usize {
    let total = HEADER_SIZE + part_size as usize;
    assert!(buf.len() >= total, "packet buffer too small");

    let header = PacketHeader {
        magic: MAGIC.to_le(),
        version: WIRE_VERSION.to_le(),
        index: index.to_le(),
        crc32: 0,
        time: msg.time.to_le(),
        id: msg.id.to_le(),
        type_tag: msg.type_tag.to_le(),
        rate_bits: msg.rate.to_bits().to_le(),
        size: (msg.data.len() as u32).to_le(),
        part_size: part_size.to_le(),
        offset: offset.to_le(),
    };

    buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    let start = offset as usize;
    let end = start + part_size as usize;
    buf[HEADER_SIZE..total].copy_from_slice(&msg.data[start..end]);

    let crc = crc_of(&buf[..total]);
    buf[12..16].copy_from_slice(&crc.to_le_bytes());

    total
}

/// Split a message payload of `size` bytes into `(offset, part_size)` slices
/// of at most [`MAX_PART`] bytes. An empty message yields no parts and no
/// packets are sent for it.
pub fn message_parts(size: usize) -> impl Iterator<Item = (u32, u32)> {
    (0..size).step_by(MAX_PART).map(move |offset| {
        let part = (size - offset).min(MAX_PART);
        (offset as u32, part as u32)
    })
}
