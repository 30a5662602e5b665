use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace};

use crate::ack_frame::AckFrame;
use crate::send_buffer::SendBuffer;

/// Listens on a freshly bound, OS-assigned port for cumulative ACK records
///  and feeds them to the send buffer. The port is announced to the peer in
///  the init packet's payload.
///
/// The cumulative high-water mark lives in a watch channel: updates are
///  totally ordered with wakeups, so a task waiting for value v is woken by
///  any update at or above v.
pub struct AckReceiver {
    socket: UdpSocket,
    ack_tx: watch::Sender<i64>,
    loop_handle: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl AckReceiver {
    /// Binds to an ephemeral port on the address family of the peer.
    pub async fn bind(peer_addr: SocketAddr) -> anyhow::Result<AckReceiver> {
        let bind_addr = if peer_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("listening for ACKs on {:?}", socket.local_addr()?);

        let (ack_tx, _) = watch::channel(-1i64);
        Ok(AckReceiver {
            socket,
            ack_tx,
            loop_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
            .port()
    }

    /// The cumulative ACK high-water mark, for anyone who needs to await it.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.ack_tx.subscribe()
    }

    pub fn spawn_listen_loop(self: &Arc<Self>, send_buffer: Arc<SendBuffer>) -> JoinHandle<()> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.listen_loop(send_buffer).await });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle.abort_handle());
        handle
    }

    /// Blocks until the cumulative ACK reaches `expected` or the timeout
    ///  elapses; says whether the ACK made it in time.
    pub async fn wait_for_ack(&self, expected: i64, timeout: Duration) -> bool {
        let mut ack_rx = self.ack_tx.subscribe();
        time::timeout(timeout, ack_rx.wait_for(|ack| *ack >= expected))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Unblocks the listen loop and stops it.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().expect("loop handle lock poisoned").take() {
            handle.abort();
        }
    }

    async fn listen_loop(&self, send_buffer: Arc<SendBuffer>) {
        let mut previous_ack = -1i64;
        let mut buf = [0u8; 64];

        loop {
            let len = match self.socket.recv(&mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    debug!("transient receive error on the ACK socket: {}", e);
                    continue;
                }
            };

            let frame = match AckFrame::deser(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    eprintln!("[recv corrupt ack]");
                    debug!("dropping corrupt ACK record: {}", e);
                    continue;
                }
            };

            eprintln!("[recv ack] {}", frame.value);
            self.process_ack(frame.value, &mut previous_ack, &send_buffer)
                .await;
        }
    }

    async fn process_ack(&self, value: i64, previous_ack: &mut i64, send_buffer: &SendBuffer) {
        self.register_ack(value);
        send_buffer.note_cumulative_ack(value).await;

        // the same cumulative value twice in a row means the packet right
        //  after it probably went missing - ask for it without waiting for
        //  the retransmission timeout
        if value == *previous_ack {
            trace!("duplicate ACK {} - triggering fast retransmit", value);
            send_buffer.force_resend(value + 1).await;
        }
        *previous_ack = value;
    }

    /// Advances the high-water mark; a stale (lower) value never regresses it.
    fn register_ack(&self, value: i64) {
        self.ack_tx.send_if_modified(|current| {
            if value > *current {
                *current = value;
                true
            } else {
                false
            }
        });
    }
}
