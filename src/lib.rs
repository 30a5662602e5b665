//! A reliable, ordered, unidirectional bulk file transfer over plain UDP.
//!
//! One sender streams a single file to one receiver; both sides terminate once
//!  every byte is delivered and acknowledged. There is no TCP, no TLS and no
//!  session multiplexing - reliability is built from scratch on top of
//!  datagrams, with acknowledgements flowing on a separate datagram path that
//!  the receiver learns from the very first packet.
//!
//! ## Design goals
//!
//! * The abstraction is a one-shot transfer: open, stream, acknowledge, exit
//!   * no connection handshake beyond the FIRST packet, no teardown handshake
//!     beyond the LAST packet and a trailing ACK burst
//! * Survive loss, reordering, duplication and bit corruption on the wire
//!   * every data packet carries an Internet checksum; corrupt datagrams are
//!     dropped silently (well - with a log line) and recovered by
//!     retransmission
//!   * ACK records carry the same 32-bit value three times as a cheap
//!     integrity check, since they have no checksum of their own
//! * Acknowledgement is cumulative: an ACK of n promises that everything up
//!   to and including n arrived, so a single lost ACK is repaired by any
//!   later one
//! * The sender keeps every unacknowledged packet pre-serialized in a send
//!   buffer, bounded by an adaptive inflight window, and prefers fresh
//!   packets over retransmissions when picking what to put on the wire next
//! * Two consecutive ACKs with the same value are treated as the receiver
//!   asking for the packet right after that value - the classic fast
//!   retransmit, without waiting for a timeout
//!
//! ## Data packet header
//!
//! Inside a UDP datagram - all numbers in network byte order (BE):
//! ```ascii
//! 0:  sequence number (u32). 0 is the init packet, data packets count from
//!      1, and the terminal packet takes the next number after the last data
//!      packet
//! 4:  checksum (u16): Internet checksum over the whole framed datagram with
//!      this field zeroed
//! 6:  packet length including this header (u16)
//! 8:  flags (u8):
//!     * bit 0: FIRST - payload is the ACK port (4 bytes) followed by the
//!        file name (raw bytes, no length prefix)
//!     * bit 1: LAST - empty payload, ends the transfer
//! 9:  payload (up to one 1000-byte segment)
//! ```
//!
//! ## ACK record
//!
//! Sent to the port announced in the FIRST packet's payload:
//! ```ascii
//! 0:  cumulative ACK value (u32)
//! 4:  the same value again
//! 8:  and once more - all three copies must agree, otherwise the record is
//!      dropped as corrupt
//! ```
//!
//! The cumulative value is signed on the wire: a receiver that has not yet
//!  seen packet 0 acknowledges -1.

pub mod ack_frame;
pub mod ack_receiver;
pub mod ack_sender;
pub mod config;
pub mod data_packet;
pub mod receive_buffer;
pub mod receiver;
pub mod send_buffer;
pub mod send_socket;
pub mod sender;
