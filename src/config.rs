use std::time::Duration;

use anyhow::bail;

/// Size of one file segment, i.e. the payload of a regular data packet. The
///  implied datagram size (segment plus header) stays well below any sane
///  path MTU minus UDP/IP overhead, so fragmentation is not a concern.
pub const SEGMENT_SIZE: usize = 1000;

/// Upper bound for a received datagram. Generously above header plus segment
///  so a malformed oversized frame is still read in full and then rejected by
///  the length check rather than silently truncated.
pub const MAX_DATAGRAM_SIZE: usize = 2000;

/// How many duplicate ACKs of the final value the receiver fires on exit to
///  compensate for loss of the last ACK.
pub const TRAILING_ACK_COUNT: u32 = 10;

pub struct Config {
    /// Initial capacity of the inflight window, in packets. The window starts
    ///  small and only ever grows: every time the sender runs out of fresh
    ///  packets but an awaited ACK arrives in time, the window widens by
    ///  `inflight_window_step` up to `max_inflight_window`.
    ///
    /// NB: There is deliberately no multiplicative decrease - this transport
    ///      is tuned for short transfers on networks where loss is random
    ///      rather than congestion-induced.
    pub min_inflight_window: u32,

    /// Hard cap for the inflight window, in packets.
    pub max_inflight_window: u32,

    /// Additive window increment applied on each successful ACK wait.
    pub inflight_window_step: u32,

    /// How long the send loop waits for the cumulative ACK of an
    ///  already-sent packet before retransmitting it. This doubles as the
    ///  implicit RTT estimate: retransmission only happens when the window is
    ///  fully in flight *and* no ACK showed up within one interval.
    pub retransmit_ack_wait: Duration,

    /// How long the sender waits for the ACK of the terminal packet before
    ///  tearing down regardless.
    pub final_ack_timeout: Duration,

    /// Size of the receiver's reorder window, in packets, counted from the
    ///  next sequence number to be delivered. Anything at or beyond the far
    ///  edge is dropped.
    pub receive_buffer_size: u32,

    /// Upper bound for joining the sender's background loops on teardown.
    pub sender_join_timeout: Duration,

    /// Upper bound for joining the receiver's background loop on teardown.
    pub receiver_join_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            min_inflight_window: 2,
            max_inflight_window: 100,
            inflight_window_step: 2,
            retransmit_ack_wait: Duration::from_millis(100),
            final_ack_timeout: Duration::from_secs(30),
            receive_buffer_size: 1000,
            sender_join_timeout: Duration::from_secs(1),
            receiver_join_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_inflight_window == 0 {
            bail!("the inflight window must hold at least one packet");
        }
        if self.max_inflight_window < self.min_inflight_window {
            bail!("the maximum inflight window is smaller than the initial window");
        }
        if self.receive_buffer_size == 0 {
            bail!("the receive buffer must hold at least one packet");
        }
        Ok(())
    }
}
