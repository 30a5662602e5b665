use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::ack_sender::AckSender;
use crate::config::{Config, MAX_DATAGRAM_SIZE};
use crate::data_packet::{DataPacket, PacketBody};

struct ReceiveBufferInner {
    /// received but not yet delivered packets, keyed by sequence number
    buffer: BTreeMap<u32, DataPacket>,
    /// the sequence number the consumer gets next
    next_sequence_to_deliver: u32,
    /// highest sequence number up to which everything has arrived
    ///  contiguously; -1 until packet 0 shows up. This is the value that goes
    ///  out in ACKs.
    last_consecutive_sequence_number: i64,
    /// constructed lazily from the first init packet, which announces where
    ///  ACKs are expected
    ack_sender: Option<Arc<AckSender>>,
}

/// Ingests datagrams from the sender, drops corrupt and out-of-window ones,
///  reorders the rest, and acknowledges every arrival with the cumulative
///  high-water mark.
pub struct ReceiveBuffer {
    config: Arc<Config>,
    socket: UdpSocket,
    inner: Mutex<ReceiveBufferInner>,
    next_available: Notify,
    loop_handle: std::sync::Mutex<Option<tokio::task::AbortHandle>>,
}

impl ReceiveBuffer {
    pub async fn bind(port: u16, config: Arc<Config>) -> anyhow::Result<ReceiveBuffer> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("listening for data packets on {:?}", socket.local_addr()?);

        Ok(ReceiveBuffer {
            config,
            socket,
            inner: Mutex::new(ReceiveBufferInner {
                buffer: BTreeMap::new(),
                next_sequence_to_deliver: 0,
                last_consecutive_sequence_number: -1,
                ack_sender: None,
            }),
            next_available: Notify::new(),
            loop_handle: std::sync::Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn spawn_receive_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.receive_loop().await });
        *self.loop_handle.lock().expect("loop handle lock poisoned") = Some(handle.abort_handle());
        handle
    }

    /// Unblocks the receive loop and stops it.
    pub fn stop(&self) {
        if let Some(handle) = self.loop_handle.lock().expect("loop handle lock poisoned").take() {
            handle.abort();
        }
    }

    /// Removes and returns the packet with the next sequence number to be
    ///  delivered, suspending until it has arrived.
    pub async fn next_in_order(&self) -> DataPacket {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let next = inner.next_sequence_to_deliver;
                if let Some(packet) = inner.buffer.remove(&next) {
                    inner.next_sequence_to_deliver += 1;
                    return packet;
                }
            }
            self.next_available.notified().await;
        }
    }

    pub async fn last_consecutive_sequence_number(&self) -> i64 {
        self.inner.lock().await.last_consecutive_sequence_number
    }

    /// Fires `count` duplicate ACKs of the final cumulative value, in case
    ///  the regular final ACK got lost.
    pub async fn send_trailing_acks(&self, count: u32) {
        let Some((ack_sender, value)) = ({
            let inner = self.inner.lock().await;
            inner
                .ack_sender
                .clone()
                .map(|sender| (sender, inner.last_consecutive_sequence_number))
        }) else {
            debug!("no ACK channel was ever established - skipping the trailing ACK burst");
            return;
        };

        for _ in 0..count {
            ack_sender.send(value).await;
        }
    }

    async fn receive_loop(&self) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("transient receive error on the data socket: {}", e);
                    continue;
                }
            };

            match DataPacket::deser(&buf[..len]) {
                Ok(packet) => {
                    trace!("received packet #{} from {:?}", packet.sequence_number, from);

                    // the first init packet tells us where ACKs go: the
                    //  datagram's source address, on the announced port
                    if self.inner.lock().await.ack_sender.is_none() {
                        if let PacketBody::Init { ack_port, .. } = &packet.body {
                            match AckSender::connect(SocketAddr::new(from.ip(), *ack_port)).await {
                                Ok(ack_sender) => {
                                    self.inner.lock().await.ack_sender = Some(Arc::new(ack_sender));
                                }
                                Err(e) => {
                                    debug!("could not set up the ACK channel: {}", e);
                                    continue;
                                }
                            }
                        }
                    }

                    self.update_buffer(packet).await;
                }
                Err(e) => {
                    eprintln!("[recv corrupt packet]");
                    debug!("dropping corrupt datagram from {:?}: {}", from, e);
                }
            }

            // one ACK per datagram once the channel is known - re-emitting
            //  the cumulative value even for dropped frames lets the sender
            //  notice a gap one duplicate earlier
            let established = {
                let inner = self.inner.lock().await;
                inner
                    .ack_sender
                    .clone()
                    .map(|sender| (sender, inner.last_consecutive_sequence_number))
            };
            if let Some((ack_sender, value)) = established {
                ack_sender.send(value).await;
            }
        }
    }

    pub(crate) async fn update_buffer(&self, packet: DataPacket) {
        let position = packet.position_label();
        let length = packet.body.payload_len();
        let sequence_number = packet.sequence_number;

        let mut inner = self.inner.lock().await;

        let below_window = sequence_number < inner.next_sequence_to_deliver;
        let beyond_window = sequence_number as u64
            >= inner.next_sequence_to_deliver as u64 + self.config.receive_buffer_size as u64;
        if below_window || beyond_window || inner.buffer.contains_key(&sequence_number) {
            eprintln!("[recv data] {} ({}) IGNORED", position, length);
            return;
        }

        if sequence_number == inner.next_sequence_to_deliver {
            eprintln!("[recv data] {} ({}) ACCEPTED(in-order)", position, length);
        } else {
            eprintln!("[recv data] {} ({}) ACCEPTED(out-of-order)", position, length);
        }
        inner.buffer.insert(sequence_number, packet);

        if sequence_number == inner.next_sequence_to_deliver {
            self.next_available.notify_one();
        }

        if sequence_number as i64 == inner.last_consecutive_sequence_number + 1 {
            // the gap just closed - advance as far as the contiguous run goes
            while inner
                .buffer
                .contains_key(&((inner.last_consecutive_sequence_number + 1) as u32))
            {
                inner.last_consecutive_sequence_number += 1;
            }
            trace!(
                "contiguous up to #{}",
                inner.last_consecutive_sequence_number
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time;

    fn data_packet(sequence_number: u32) -> DataPacket {
        DataPacket {
            sequence_number,
            body: PacketBody::Data(Bytes::from(vec![sequence_number as u8])),
        }
    }

    async fn receive_buffer(window: u32) -> Arc<ReceiveBuffer> {
        let config = Arc::new(Config {
            receive_buffer_size: window,
            ..Config::default()
        });
        Arc::new(ReceiveBuffer::bind(0, config).await.unwrap())
    }

    #[rstest]
    #[case::in_order_run(vec![0, 1, 2], vec![0, 1, 2], 2)]
    #[case::gap_stalls_the_counter(vec![0, 2, 3], vec![0, 2, 3], 0)]
    #[case::reorder_then_close_the_gap(vec![2, 1, 3, 0], vec![0, 1, 2, 3], 3)]
    #[case::duplicate_is_dropped(vec![0, 1, 1], vec![0, 1], 1)]
    fn test_update_buffer(
        #[case] arrivals: Vec<u32>,
        #[case] expected_buffered: Vec<u32>,
        #[case] expected_last_consecutive: i64,
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receive_buffer = receive_buffer(1000).await;
            for sequence_number in arrivals {
                receive_buffer.update_buffer(data_packet(sequence_number)).await;
            }

            let inner = receive_buffer.inner.lock().await;
            assert_eq!(
                inner.buffer.keys().cloned().collect::<Vec<_>>(),
                expected_buffered
            );
            assert_eq!(
                inner.last_consecutive_sequence_number,
                expected_last_consecutive
            );
        });
    }

    #[test]
    fn test_update_buffer_window_edges() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receive_buffer = receive_buffer(4).await;

            // the far edge is exclusive: next + window is out, next + window - 1 is in
            receive_buffer.update_buffer(data_packet(4)).await;
            receive_buffer.update_buffer(data_packet(3)).await;

            let inner = receive_buffer.inner.lock().await;
            assert_eq!(inner.buffer.keys().cloned().collect::<Vec<_>>(), vec![3]);
        });
    }

    #[test]
    fn test_update_buffer_ignores_already_delivered_sequence_numbers() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receive_buffer = receive_buffer(1000).await;
            receive_buffer.update_buffer(data_packet(0)).await;
            assert_eq!(receive_buffer.next_in_order().await, data_packet(0));

            // a straggling duplicate of the delivered packet is ignored
            receive_buffer.update_buffer(data_packet(0)).await;
            let inner = receive_buffer.inner.lock().await;
            assert!(inner.buffer.is_empty());
        });
    }

    #[test]
    fn test_next_in_order_delivers_across_delivered_gap() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receive_buffer = receive_buffer(1000).await;
            for sequence_number in [2, 1, 3, 0] {
                receive_buffer.update_buffer(data_packet(sequence_number)).await;
            }

            for expected in 0..4u32 {
                assert_eq!(receive_buffer.next_in_order().await, data_packet(expected));
            }

            // the counter keeps advancing once the next packet arrives after
            //  its predecessors were already consumed
            receive_buffer.update_buffer(data_packet(4)).await;
            assert_eq!(
                receive_buffer.last_consecutive_sequence_number().await,
                4
            );
        });
    }

    #[test]
    fn test_next_in_order_blocks_until_the_gap_closes() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let receive_buffer = receive_buffer(1000).await;
            receive_buffer.update_buffer(data_packet(1)).await;

            let consumer = {
                let receive_buffer = receive_buffer.clone();
                tokio::spawn(async move {
                    vec![
                        receive_buffer.next_in_order().await,
                        receive_buffer.next_in_order().await,
                    ]
                })
            };

            // the consumer cannot make progress while packet 0 is missing
            time::sleep(Duration::from_millis(50)).await;
            assert!(!consumer.is_finished());

            receive_buffer.update_buffer(data_packet(0)).await;
            assert_eq!(
                consumer.await.unwrap(),
                vec![data_packet(0), data_packet(1)]
            );
        });
    }
}
