use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time;
use tracing::{debug, warn};

use crate::ack_receiver::AckReceiver;
use crate::config::{Config, SEGMENT_SIZE};
use crate::data_packet::PacketBody;
use crate::send_buffer::SendBuffer;
use crate::send_socket::bind_send_socket;

pub struct TransferStats {
    pub running_time: Duration,
    pub file_size: u64,
    pub total_bytes_sent: u64,
}

impl TransferStats {
    /// File bytes as a percentage of everything put on the wire. Above ~99
    ///  on a clean link (header overhead), sinking with every retransmit.
    pub fn efficiency_percent(&self) -> f64 {
        if self.total_bytes_sent == 0 {
            return 0.0;
        }
        self.file_size as f64 / self.total_bytes_sent as f64 * 100.0
    }

    pub fn print(&self) {
        println!("[stats] running time: {} ms", self.running_time.as_millis());
        println!("[stats] file size: {} bytes", self.file_size);
        println!("[stats] total data sent: {} bytes", self.total_bytes_sent);
        println!("[stats] efficiency: {:.2} percent", self.efficiency_percent());
    }
}

/// The sender driver: streams the file at `file_path` to the receiver at
///  `peer_addr`, blocks until everything is acknowledged (or the final
///  timeout expires), and tears the transfer down.
pub async fn send_file(
    file_path: &Path,
    peer_addr: SocketAddr,
    config: Arc<Config>,
) -> anyhow::Result<TransferStats> {
    let started = Instant::now();
    config.validate()?;

    let file = File::open(file_path)
        .await
        .context("could not open the specified file")?;
    let file_size = file
        .metadata()
        .await
        .context("could not read the file metadata")?
        .len();
    let mut reader = BufReader::new(file);

    let ack_receiver = Arc::new(
        AckReceiver::bind(peer_addr)
            .await
            .context("could not create the ack receiver")?,
    );
    let socket = bind_send_socket(peer_addr)
        .await
        .context("could not create a socket")?;
    let send_buffer = Arc::new(SendBuffer::new(
        config.clone(),
        Arc::new(socket),
        peer_addr,
        ack_receiver.subscribe(),
    ));

    let ack_handle = ack_receiver.spawn_listen_loop(send_buffer.clone());
    let send_handle = send_buffer.spawn_send_loop();

    // the init packet announces the ACK port and the file name the receiver
    //  should store under
    let basename = file_path
        .file_name()
        .context("the path to send has no file name")?
        .to_string_lossy();
    send_buffer
        .enqueue(PacketBody::Init {
            ack_port: ack_receiver.port(),
            filename: format!("{}.recv", basename),
        })
        .await;

    let mut segment = vec![0u8; SEGMENT_SIZE];
    loop {
        let read = read_segment(&mut reader, &mut segment)
            .await
            .context("file read error")?;
        if read == 0 {
            break;
        }
        send_buffer
            .enqueue(PacketBody::Data(Bytes::copy_from_slice(&segment[..read])))
            .await;
    }

    let last_sequence_number = send_buffer.enqueue(PacketBody::Last).await;
    debug!("whole file enqueued, terminal packet is #{}", last_sequence_number);

    if !ack_receiver
        .wait_for_ack(last_sequence_number as i64, config.final_ack_timeout)
        .await
    {
        warn!("the terminal packet was never acknowledged - tearing down anyway");
    }

    ack_receiver.stop();
    send_buffer.stop();
    for handle in [ack_handle, send_handle] {
        match time::timeout(config.sender_join_timeout, handle).await {
            Ok(_) => {}
            Err(_elapsed) => eprintln!(
                "[error] interrupted while closing threads. transfer may not have finished normally."
            ),
        }
    }

    eprintln!("[completed]");

    Ok(TransferStats {
        running_time: started.elapsed(),
        file_size,
        total_bytes_sent: send_buffer.total_bytes_sent().await,
    })
}

/// Reads one full segment, only coming up short at end of file. Plain
///  `read()` may return less than a segment mid-file, and packet payloads
///  should be deterministic.
async fn read_segment(
    reader: &mut (impl AsyncRead + Unpin),
    segment: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < segment.len() {
        let read = reader.read(&mut segment[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;

    #[rstest]
    #[case::empty(0, vec![])]
    #[case::partial_segment(999, vec![999])]
    #[case::exact_segment(1000, vec![1000])]
    #[case::two_and_a_half_segments(2500, vec![1000, 1000, 500])]
    #[case::two_exact(2000, vec![1000, 1000])]
    fn test_read_segment(#[case] file_len: usize, #[case] expected_chunks: Vec<usize>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let content = vec![7u8; file_len];
            let mut reader = BufReader::new(content.as_slice());
            let mut segment = vec![0u8; SEGMENT_SIZE];

            let mut chunks = Vec::new();
            loop {
                let read = read_segment(&mut reader, &mut segment).await.unwrap();
                if read == 0 {
                    break;
                }
                chunks.push(read);
            }
            assert_eq!(chunks, expected_chunks);
        });
    }

    #[rstest]
    #[case::nothing_sent(100, 0, 0.0)]
    #[case::perfect(1000, 1000, 100.0)]
    #[case::half(1000, 2000, 50.0)]
    fn test_efficiency_percent(
        #[case] file_size: u64,
        #[case] total_bytes_sent: u64,
        #[case] expected: f64,
    ) {
        let stats = TransferStats {
            running_time: Duration::from_millis(1),
            file_size,
            total_bytes_sent,
        };
        assert!((stats.efficiency_percent() - expected).abs() < 1e-9);
    }
}
