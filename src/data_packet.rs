use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::SEGMENT_SIZE;

pub const HEADER_SIZE: usize = 9;

const CHECKSUM_OFFSET: usize = 4;

const FIRST_PACKET_FLAG: u8 = 0x01;
const LAST_PACKET_FLAG: u8 = 0x02;

/// Reasons for rejecting a received datagram. The receive loop only ever
///  logs and drops, but tests (and curious operators) get the actual cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CorruptPacket {
    #[error("datagram is shorter than the packet header")]
    Truncated,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("stated packet length does not fit the received datagram")]
    LengthMismatch,
    #[error("init packet payload is too short to hold the ACK port")]
    InitTooShort,
    #[error("init packet announces an ACK port outside the valid port range")]
    InitBadPort,
    #[error("sequence number 0 is reserved for the init packet")]
    ReservedSequenceNumber,
}

/// What a packet carries, derived from its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// The FIRST packet: announces where ACKs should go and what the file is
    ///  called. The payload is the ACK port (4 bytes) followed by the raw
    ///  file name with no length prefix.
    Init { ack_port: u16, filename: String },
    /// A regular packet carrying one segment of file bytes.
    Data(Bytes),
    /// The LAST packet: empty payload, ends the transfer.
    Last,
}

impl PacketBody {
    fn flags(&self) -> u8 {
        match self {
            PacketBody::Init { .. } => FIRST_PACKET_FLAG,
            PacketBody::Data(_) => 0,
            PacketBody::Last => LAST_PACKET_FLAG,
        }
    }

    /// Length of the payload as it appears on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            PacketBody::Init { filename, .. } => 4 + filename.len(),
            PacketBody::Data(data) => data.len(),
            PacketBody::Last => 0,
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self, PacketBody::Init { .. })
    }

    pub fn is_last(&self) -> bool {
        matches!(self, PacketBody::Last)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence_number: u32,
    pub body: PacketBody,
}

impl DataPacket {
    /// The position marker used by the wire log lines on both peers: `start`
    ///  for the init packet, `end` for the terminal packet, and the byte
    ///  offset within the file for everything in between.
    pub fn position_label(&self) -> String {
        match &self.body {
            PacketBody::Init { .. } => "start".to_string(),
            PacketBody::Last => "end".to_string(),
            PacketBody::Data(_) => {
                ((self.sequence_number as usize).saturating_sub(1) * SEGMENT_SIZE).to_string()
            }
        }
    }

    pub fn ser(&self) -> Bytes {
        let packet_len = HEADER_SIZE + self.body.payload_len();

        let mut buf = BytesMut::with_capacity(packet_len);
        buf.put_u32(self.sequence_number);
        buf.put_u16(0); // checksum placeholder, patched below
        buf.put_u16(packet_len as u16);
        buf.put_u8(self.body.flags());
        match &self.body {
            PacketBody::Init { ack_port, filename } => {
                buf.put_u32(*ack_port as u32);
                buf.put_slice(filename.as_bytes());
            }
            PacketBody::Data(data) => buf.put_slice(data),
            PacketBody::Last => {}
        }

        let checksum = internet_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
        buf.freeze()
    }

    pub fn deser(raw: &[u8]) -> Result<DataPacket, CorruptPacket> {
        if raw.len() < HEADER_SIZE {
            return Err(CorruptPacket::Truncated);
        }

        // A valid frame sums to all-ones, so re-running the checksum over the
        //  received bytes (checksum field included) must yield zero.
        if internet_checksum(raw) != 0 {
            return Err(CorruptPacket::ChecksumMismatch);
        }

        let mut header = &raw[..HEADER_SIZE];
        let sequence_number = header.get_u32();
        let _checksum = header.get_u16();
        let packet_len = header.get_u16() as usize;
        let flags = header.get_u8();

        if packet_len < HEADER_SIZE || packet_len > raw.len() {
            return Err(CorruptPacket::LengthMismatch);
        }

        // sequence number 0 belongs to the init packet; a data or terminal
        //  frame claiming it has no valid file position
        if sequence_number == 0 && flags & FIRST_PACKET_FLAG == 0 {
            return Err(CorruptPacket::ReservedSequenceNumber);
        }

        // Anything past the stated packet length is padding and ignored.
        let mut payload = &raw[HEADER_SIZE..packet_len];

        let body = if flags & FIRST_PACKET_FLAG != 0 {
            if payload.len() < 4 {
                return Err(CorruptPacket::InitTooShort);
            }
            let raw_port = payload.get_u32();
            let ack_port = u16::try_from(raw_port).map_err(|_| CorruptPacket::InitBadPort)?;
            let filename = String::from_utf8_lossy(payload).into_owned();
            PacketBody::Init { ack_port, filename }
        } else if flags & LAST_PACKET_FLAG != 0 {
            PacketBody::Last
        } else {
            PacketBody::Data(Bytes::copy_from_slice(payload))
        };

        Ok(DataPacket {
            sequence_number,
            body,
        })
    }
}

/// The Internet checksum (RFC 1071): one's-complement sum of the data taken
///  as 16-bit big-endian words with end-around carry, bitwise inverted. An
///  odd trailing byte counts as the high byte of a final word.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
