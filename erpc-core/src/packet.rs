//! Packet header and packet types for erpc-core.
//!
//! Every data packet starts with a 24-byte header carrying everything needed
//! for request/response correlation and reassembly. The header is encoded
//! little-endian field by field, so the wire format does not depend on the
//! host's struct layout.

use crate::error::{Error, Result};

/// Packet header size in bytes.
pub const PKT_HDR_SIZE: usize = 24;

/// Magic number for valid packets.
pub const ERPC_MAGIC: u8 = 0xEC;

/// Maximum number of packets in one message.
pub const MAX_PKTS_PER_MSG: usize = u16::MAX as usize;

/// Packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Request packet.
    Req = 0,
    /// Response packet.
    Resp = 1,
}

impl TryFrom<u8> for PktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PktType::Req),
            1 => Ok(PktType::Resp),
            _ => Err(Error::InvalidPacketType(value)),
        }
    }
}

/// Packet header (24 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     magic
/// 1       1     pkt_type
/// 2       1     req_type
/// 3       1     reserved
/// 4       2     dest_session_num
/// 6       2     pkt_num
/// 8       2     num_pkts
/// 10      2     dest_session_gen
/// 12      4     msg_size
/// 16      8     req_num
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHdr {
    pub pkt_type: PktType,
    /// Request type (application-defined).
    pub req_type: u8,
    /// Session number at the receiving endpoint.
    pub dest_session_num: u16,
    /// Low 16 bits of the receiving session's generation. Packets of a closed
    /// session never match a later session that reused its number.
    pub dest_session_gen: u16,
    /// 0-based packet index within the message.
    pub pkt_num: u16,
    /// Total number of packets in the message.
    pub num_pkts: u16,
    /// Message size in bytes.
    pub msg_size: u32,
    /// Request number, shared by a request and its response.
    pub req_num: u64,
}

impl PktHdr {
    /// Create a new packet header.
    pub fn new(
        pkt_type: PktType,
        req_type: u8,
        dest_session_num: u16,
        pkt_num: u16,
        num_pkts: u16,
        msg_size: usize,
        req_num: u64,
    ) -> Self {
        debug_assert!(msg_size <= u32::MAX as usize);
        debug_assert!(pkt_num < num_pkts);
        Self {
            pkt_type,
            req_type,
            dest_session_num,
            dest_session_gen: 0,
            pkt_num,
            num_pkts,
            msg_size: msg_size as u32,
            req_num,
        }
    }

    /// Set the destination session generation.
    #[inline]
    pub fn with_dest_session_gen(mut self, generation: u16) -> Self {
        self.dest_session_gen = generation;
        self
    }

    /// Check if this is a request packet.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.pkt_type == PktType::Req
    }

    /// Check if this is a response packet.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.pkt_type == PktType::Resp
    }

    /// Get the message size.
    #[inline]
    pub fn msg_size(&self) -> usize {
        self.msg_size as usize
    }

    /// Serialize the header into the first `PKT_HDR_SIZE` bytes of `dst`.
    ///
    /// # Panics
    /// Panics if `dst` is shorter than `PKT_HDR_SIZE`.
    #[inline]
    pub fn write_to(&self, dst: &mut [u8]) {
        let dst = &mut dst[..PKT_HDR_SIZE];
        dst[0] = ERPC_MAGIC;
        dst[1] = self.pkt_type as u8;
        dst[2] = self.req_type;
        dst[3] = 0;
        dst[4..6].copy_from_slice(&self.dest_session_num.to_le_bytes());
        dst[6..8].copy_from_slice(&self.pkt_num.to_le_bytes());
        dst[8..10].copy_from_slice(&self.num_pkts.to_le_bytes());
        dst[10..12].copy_from_slice(&self.dest_session_gen.to_le_bytes());
        dst[12..16].copy_from_slice(&self.msg_size.to_le_bytes());
        dst[16..24].copy_from_slice(&self.req_num.to_le_bytes());
    }

    /// Parse and validate a header from the front of a packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PKT_HDR_SIZE {
            return Err(Error::BufferTooSmall {
                required: PKT_HDR_SIZE,
                available: bytes.len(),
            });
        }
        if bytes[0] != ERPC_MAGIC {
            return Err(Error::InvalidMagic {
                expected: ERPC_MAGIC,
                got: bytes[0],
            });
        }
        let pkt_type = PktType::try_from(bytes[1])?;
        let le16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let mut msg_size = [0u8; 4];
        msg_size.copy_from_slice(&bytes[12..16]);
        let mut req_num = [0u8; 8];
        req_num.copy_from_slice(&bytes[16..24]);

        Ok(Self {
            pkt_type,
            req_type: bytes[2],
            dest_session_num: le16(4),
            dest_session_gen: le16(10),
            pkt_num: le16(6),
            num_pkts: le16(8),
            msg_size: u32::from_le_bytes(msg_size),
            req_num: u64::from_le_bytes(req_num),
        })
    }

    /// Check that the header is self-consistent for the given packet payload.
    ///
    /// `num_pkts` must match the message size and the payload must be exactly
    /// the slice of the message this packet index covers.
    pub fn check_payload(&self, payload_len: usize, max_data_per_pkt: usize) -> bool {
        let msg_size = self.msg_size();
        if self.num_pkts != calc_num_pkts(msg_size, max_data_per_pkt) {
            return false;
        }
        if self.pkt_num >= self.num_pkts {
            return false;
        }
        payload_len == pkt_data_len(msg_size, self.pkt_num, max_data_per_pkt)
    }
}

/// Calculate the number of packets needed for a message of given size.
///
/// A zero-length message still travels as one header-only packet.
#[inline]
pub fn calc_num_pkts(msg_size: usize, max_data_per_pkt: usize) -> u16 {
    if msg_size == 0 {
        1
    } else {
        msg_size.div_ceil(max_data_per_pkt).min(MAX_PKTS_PER_MSG) as u16
    }
}

/// Number of message bytes carried by packet `pkt_num`.
#[inline]
pub fn pkt_data_len(msg_size: usize, pkt_num: u16, max_data_per_pkt: usize) -> usize {
    let offset = pkt_num as usize * max_data_per_pkt;
    msg_size.saturating_sub(offset).min(max_data_per_pkt)
}

/// Largest message that fits in `MAX_PKTS_PER_MSG` packets.
#[inline]
pub fn max_msg_size_for(max_data_per_pkt: usize) -> usize {
    max_data_per_pkt * MAX_PKTS_PER_MSG
}
