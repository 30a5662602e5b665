use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::{debug, info};

use crate::ack_frame::AckFrame;
use crate::send_socket::{bind_send_socket, SendSocket};

/// Emits cumulative ACK records to the endpoint the peer announced in its
///  init packet.
///
/// Emitted values are clamped to be non-decreasing: the receive loop can
///  observe transiently stale cumulative values while packets are being
///  reordered, and a regressing ACK would confuse the sender's
///  duplicate-ACK detection.
pub struct AckSender {
    socket: Arc<dyn SendSocket>,
    peer_addr: SocketAddr,
    latest_sent: Mutex<i64>,
}

impl AckSender {
    pub async fn connect(peer_addr: SocketAddr) -> std::io::Result<AckSender> {
        let socket = bind_send_socket(peer_addr).await?;
        info!("sending ACKs to {:?}", peer_addr);
        Ok(AckSender::new(Arc::new(socket), peer_addr))
    }

    pub fn new(socket: Arc<dyn SendSocket>, peer_addr: SocketAddr) -> AckSender {
        AckSender {
            socket,
            peer_addr,
            latest_sent: Mutex::new(i64::MIN),
        }
    }

    pub async fn send(&self, value: i64) {
        let value = {
            let mut latest = self.latest_sent.lock().expect("latest-ack lock poisoned");
            let clamped = value.max(*latest);
            *latest = clamped;
            clamped
        };

        let mut buf = BytesMut::with_capacity(AckFrame::SERIALIZED_LEN);
        AckFrame { value }.ser(&mut buf);

        if let Err(e) = self.socket.do_send_packet(self.peer_addr, &buf).await {
            debug!("transient send error for ACK {}: {}", value, e);
            return;
        }
        eprintln!("[send ack] {}", value);
    }
}
