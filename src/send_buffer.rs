use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

use crate::config::{Config, SEGMENT_SIZE};
use crate::data_packet::{DataPacket, PacketBody, HEADER_SIZE};
use crate::send_socket::SendSocket;

/// A packet that has been assigned its place in the stream. The serialized
///  form is retained so a retransmit does not have to re-encode.
struct SentPacket {
    sequence_number: u32,
    data: Bytes,
    /// 0 = never put on the wire, 1 = sent at least once. Deliberately not a
    ///  real counter: selection only distinguishes fresh from already-sent,
    ///  and a retransmit must not sink below other retransmit candidates.
    send_count: u32,
    is_init: bool,
    is_last: bool,
}

struct SendBufferInner {
    buffer: Vec<SentPacket>,
    next_sequence_number: u32,
    /// current semaphore capacity; grows from `min_inflight_window` towards
    ///  `max_inflight_window`, never shrinks
    inflight_window: u32,
    /// link-level accounting: every byte handed to the socket, headers and
    ///  retransmits included
    total_bytes_sent: u64,
}

impl SendBufferInner {
    /// Selection policy: fewest sends first, then lowest sequence number,
    ///  then insertion order.
    fn select_next(&self) -> Option<(u32, u32)> {
        let mut best: Option<&SentPacket> = None;
        for entry in &self.buffer {
            match best {
                None => best = Some(entry),
                Some(current) => {
                    if entry.send_count < current.send_count
                        || (entry.send_count == current.send_count
                            && entry.sequence_number < current.sequence_number)
                    {
                        best = Some(entry);
                    }
                }
            }
        }
        best.map(|entry| (entry.sequence_number, entry.send_count))
    }
}

/// The sliding window of in-flight packets. Owns sequence number assignment,
///  drives (re)transmission, and blocks producers while the window is full.
pub struct SendBuffer {
    config: Arc<Config>,
    socket: Arc<dyn SendSocket>,
    peer_addr: SocketAddr,
    inner: Mutex<SendBufferInner>,
    /// one permit per free window slot; `enqueue` takes one, an
    ///  acknowledgement gives one back per retired packet
    inflight_permits: Semaphore,
    packets_available: Notify,
    ack_rx: watch::Receiver<i64>,
    loop_handle: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl SendBuffer {
    pub fn new(
        config: Arc<Config>,
        socket: Arc<dyn SendSocket>,
        peer_addr: SocketAddr,
        ack_rx: watch::Receiver<i64>,
    ) -> SendBuffer {
        let inflight_window = config.min_inflight_window;
        SendBuffer {
            config,
            socket,
            peer_addr,
            inner: Mutex::new(SendBufferInner {
                buffer: Vec::new(),
                next_sequence_number: 0,
                inflight_window,
                total_bytes_sent: 0,
            }),
            inflight_permits: Semaphore::new(inflight_window as usize),
            packets_available: Notify::new(),
            ack_rx,
            loop_handle: std::sync::Mutex::new(None),
        }
    }

    /// Assigns the next sequence number, serializes the packet and appends it
    ///  to the buffer, returning the assigned number. Suspends while the
    ///  inflight window is exhausted.
    pub async fn enqueue(&self, body: PacketBody) -> u32 {
        let permit = self
            .inflight_permits
            .acquire()
            .await
            .expect("inflight semaphore is never closed");
        // the permit travels with the buffered packet and comes back through
        //  note_cumulative_ack
        permit.forget();

        let mut inner = self.inner.lock().await;
        let sequence_number = inner.next_sequence_number;
        inner.next_sequence_number += 1;

        let packet = DataPacket {
            sequence_number,
            body,
        };
        trace!(
            "enqueueing packet #{} ({} payload bytes)",
            sequence_number,
            packet.body.payload_len()
        );
        inner.buffer.push(SentPacket {
            sequence_number,
            data: packet.ser(),
            send_count: 0,
            is_init: packet.body.is_init(),
            is_last: packet.body.is_last(),
        });
        drop(inner);

        self.packets_available.notify_one();
        sequence_number
    }

    /// Retires every packet with a sequence number at or below the cumulative
    ///  ACK and frees their window slots. Idempotent.
    pub async fn note_cumulative_ack(&self, ack_value: i64) {
        let mut inner = self.inner.lock().await;
        let before = inner.buffer.len();
        inner
            .buffer
            .retain(|entry| entry.sequence_number as i64 > ack_value);
        let retired = before - inner.buffer.len();
        drop(inner);

        if retired > 0 {
            trace!("cumulative ACK {} retired {} packets", ack_value, retired);
            self.inflight_permits.add_permits(retired);
        }
    }

    /// Re-elevates the packets `sequence_number` and `sequence_number + 1` to
    ///  fresh-send priority. This is the fast-retransmit path, driven by
    ///  duplicate ACKs.
    pub async fn force_resend(&self, sequence_number: i64) {
        let mut inner = self.inner.lock().await;
        for entry in inner.buffer.iter_mut() {
            let seq = entry.sequence_number as i64;
            if seq == sequence_number || seq == sequence_number + 1 {
                if entry.send_count > 0 {
                    debug!("fast retransmit: re-prioritizing packet #{}", seq);
                }
                entry.send_count = 0;
            }
        }
    }

    pub async fn total_bytes_sent(&self) -> u64 {
        self.inner.lock().await.total_bytes_sent
    }

    #[cfg(test)]
    pub(crate) async fn snapshot_send_counts(&self) -> Vec<(u32, u32)> {
        self.inner
            .lock()
            .await
            .buffer
            .iter()
            .map(|entry| (entry.sequence_number, entry.send_count))
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn mark_all_sent(&self) {
        for entry in self.inner.lock().await.buffer.iter_mut() {
            entry.send_count = 1;
        }
    }

    pub fn spawn_send_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.send_loop().await });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle.abort_handle());
        handle
    }

    /// Signals the send loop to terminate. A transmission in progress is
    ///  cancelled at its suspension point, which is how closing the socket
    ///  would unblock a blocking sender.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().expect("loop handle lock poisoned").take() {
            handle.abort();
        }
    }

    async fn send_loop(&self) {
        loop {
            let selected = self.inner.lock().await.select_next();

            let (sequence_number, send_count) = match selected {
                Some(selected) => selected,
                None => {
                    // nothing buffered - wait for the next enqueue
                    self.packets_available.notified().await;
                    continue;
                }
            };

            if send_count > 0 {
                // every buffered packet is already in flight: give the
                //  selected one's ACK a full interval to arrive before
                //  falling back to retransmission
                if self.ack_arrived_in_time(sequence_number).await {
                    self.grow_window().await;
                    // the ACK listener may still be retiring the packet
                    tokio::task::yield_now().await;
                    continue;
                }
                trace!("no ACK for packet #{} in time - retransmitting", sequence_number);
            }

            self.transmit(sequence_number).await;
        }
    }

    async fn ack_arrived_in_time(&self, sequence_number: u32) -> bool {
        let mut ack_rx = self.ack_rx.clone();
        let wait = ack_rx.wait_for(|ack| *ack >= sequence_number as i64);
        let result = match time::timeout(self.config.retransmit_ack_wait, wait).await {
            Ok(Ok(_)) => true,
            // the ACK listener is gone; treated like a timeout
            Ok(Err(_)) => false,
            Err(_elapsed) => false,
        };
        result
    }

    async fn grow_window(&self) {
        let mut inner = self.inner.lock().await;
        if inner.inflight_window < self.config.max_inflight_window {
            let step = self
                .config
                .inflight_window_step
                .min(self.config.max_inflight_window - inner.inflight_window);
            inner.inflight_window += step;
            self.inflight_permits.add_permits(step as usize);
            debug!("inflight window expanded to {}", inner.inflight_window);
        }
    }

    async fn transmit(&self, sequence_number: u32) {
        let frame = {
            let inner = self.inner.lock().await;
            inner
                .buffer
                .iter()
                .find(|entry| entry.sequence_number == sequence_number)
                .map(|entry| (entry.data.clone(), entry.is_init, entry.is_last))
        };
        let Some((data, is_init, is_last)) = frame else {
            // acknowledged between selection and transmit
            return;
        };

        if let Err(e) = self.socket.do_send_packet(self.peer_addr, &data).await {
            debug!("transient send error for packet #{}: {}", sequence_number, e);
            return;
        }

        let position = if is_init {
            "start".to_string()
        } else if is_last {
            "end".to_string()
        } else {
            ((sequence_number as usize).saturating_sub(1) * SEGMENT_SIZE).to_string()
        };
        eprintln!("[send data] {} ({})", position, data.len() - HEADER_SIZE);

        let mut inner = self.inner.lock().await;
        inner.total_bytes_sent += data.len() as u64;
        if let Some(entry) = inner
            .buffer
            .iter_mut()
            .find(|entry| entry.sequence_number == sequence_number)
        {
            entry.send_count = 1;
        }
    }
}
