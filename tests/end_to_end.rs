//! Whole-transfer tests: a real sender and receiver on loopback sockets,
//! optionally with a misbehaving relay in the data path. ACKs always travel
//! directly to the sender's announced port, so only the data direction is
//! degraded - which is where all the interesting recovery lives.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use filetransfer::config::Config;
use filetransfer::receiver::Receiver;
use filetransfer::sender::{send_file, TransferStats};

fn scratch_input(test_name: &str, content: &[u8]) -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "filetransfer-e2e-{}-{}",
        std::process::id(),
        test_name
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let input = dir.join("input.bin");
    std::fs::write(&input, content).unwrap();
    (dir, input)
}

fn random_content(len: usize) -> Vec<u8> {
    let mut content = vec![0u8; len];
    StdRng::seed_from_u64(1).fill(&mut content[..]);
    content
}

/// Sits between sender and receiver; the policy decides, per incoming
/// datagram, which frames actually go out (none = drop, several = duplicate).
async fn spawn_relay<F>(to: SocketAddr, mut policy: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((len, _)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            for frame in policy(&buf[..len]) {
                let _ = socket.send_to(&frame, to).await;
            }
        }
    });
    (addr, handle)
}

/// Runs one complete transfer of `content`, optionally through a relay
/// policy, and returns the sender's stats plus the bytes that landed on disk.
async fn run_transfer<F>(
    test_name: &str,
    content: &[u8],
    relay_policy: Option<F>,
) -> (TransferStats, PathBuf, Vec<u8>)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let (dir, input) = scratch_input(test_name, content);

    let receiver = Receiver::bind(0, &dir, Arc::new(Config::default()))
        .await
        .unwrap();
    let receiver_addr = SocketAddr::from(([127, 0, 0, 1], receiver.local_addr().unwrap().port()));
    let receiver_task = tokio::spawn(receiver.run());

    let (target, relay_task) = match relay_policy {
        Some(policy) => {
            let (relay_addr, handle) = spawn_relay(receiver_addr, policy).await;
            (relay_addr, Some(handle))
        }
        None => (receiver_addr, None),
    };

    let stats = send_file(&input, target, Arc::new(Config::default()))
        .await
        .unwrap();
    let written = receiver_task.await.unwrap().unwrap();

    if let Some(handle) = relay_task {
        handle.abort();
    }

    let on_disk = std::fs::read(&written).unwrap();
    (stats, written, on_disk)
}

fn no_relay() -> Option<fn(&[u8]) -> Vec<Vec<u8>>> {
    None
}

/// Bytes a loss-free transfer of `file_len` bytes puts on the wire: the init
/// packet announcing `input.bin.recv`, full and trailing data segments, and
/// the empty terminal packet. Header is 9 bytes, segments are 1000.
fn clean_wire_bytes(file_len: usize) -> u64 {
    let init = 9 + 4 + "input.bin.recv".len();
    let full_segments = file_len / 1000;
    let tail = file_len % 1000;
    let data = full_segments * (9 + 1000) + if tail > 0 { 9 + tail } else { 0 };
    let last = 9;
    (init + data + last) as u64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_channel_single_byte() {
    let (stats, written, on_disk) = run_transfer("single-byte", b"A", no_relay()).await;

    assert_eq!(on_disk, b"A");
    assert!(written.ends_with("input.bin.recv.xml"));
    assert_eq!(stats.file_size, 1);
    assert!(stats.total_bytes_sent >= clean_wire_bytes(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_channel_empty_file() {
    let (stats, _, on_disk) = run_transfer("empty", b"", no_relay()).await;

    assert!(on_disk.is_empty());
    assert_eq!(stats.file_size, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clean_channel_multi_segment_file() {
    let content = random_content(2500);
    let (stats, _, on_disk) = run_transfer("multi-segment", &content, no_relay()).await;

    assert_eq!(on_disk, content);
    assert_eq!(stats.file_size, 2500);
    assert!(stats.total_bytes_sent >= clean_wire_bytes(2500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thirty_percent_random_loss() {
    let content = random_content(2500);

    // the very first frame is always lost, the rest with 30% probability -
    // so at least one retransmission is certain
    let mut rng = StdRng::seed_from_u64(42);
    let mut first = true;
    let policy = move |frame: &[u8]| {
        if std::mem::take(&mut first) || rng.gen_bool(0.3) {
            vec![]
        } else {
            vec![frame.to_vec()]
        }
    };
    let (stats, _, on_disk) = run_transfer("lossy", &content, Some(policy)).await;

    assert_eq!(on_disk, content);
    // recovery costs retransmissions, so more bytes than a clean run
    assert!(stats.total_bytes_sent > clean_wire_bytes(2500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pairwise_reordered_delivery() {
    let content = random_content(2500);

    // holds every other datagram back so consecutive pairs swap places
    let mut held: Option<Vec<u8>> = None;
    let policy = move |frame: &[u8]| match held.take() {
        None => {
            held = Some(frame.to_vec());
            vec![]
        }
        Some(first) => vec![frame.to_vec(), first],
    };
    let (_, _, on_disk) = run_transfer("reordered", &content, Some(policy)).await;

    assert_eq!(on_disk, content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicated_datagrams_do_not_duplicate_bytes() {
    let content = random_content(2500);

    let policy = |frame: &[u8]| vec![frame.to_vec(), frame.to_vec()];
    let (_, _, on_disk) = run_transfer("duplicated", &content, Some(policy)).await;

    assert_eq!(on_disk, content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupted_first_copies_are_dropped_and_recovered() {
    let content = random_content(2500);

    // the first copy of every distinct packet arrives with a flipped bit;
    // only a retransmission gets through intact
    let mut seen = HashSet::new();
    let policy = move |frame: &[u8]| {
        let sequence_number = u32::from_be_bytes(frame[..4].try_into().unwrap());
        if seen.insert(sequence_number) {
            let mut corrupted = frame.to_vec();
            *corrupted.last_mut().unwrap() ^= 0x40;
            vec![corrupted]
        } else {
            vec![frame.to_vec()]
        }
    };
    let (stats, _, on_disk) = run_transfer("corrupted", &content, Some(policy)).await;

    assert_eq!(on_disk, content);
    assert!(stats.total_bytes_sent > clean_wire_bytes(2500));
}
