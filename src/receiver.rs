use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time;
use tracing::{debug, info};

use crate::config::{Config, TRAILING_ACK_COUNT};
use crate::data_packet::PacketBody;
use crate::receive_buffer::ReceiveBuffer;

/// The receiver driver: accepts one transfer on the given port and writes it
///  to a file in `output_dir` under the name the init packet announces.
pub struct Receiver {
    config: Arc<Config>,
    receive_buffer: Arc<ReceiveBuffer>,
    output_dir: PathBuf,
}

impl Receiver {
    pub async fn bind(
        port: u16,
        output_dir: impl Into<PathBuf>,
        config: Arc<Config>,
    ) -> anyhow::Result<Receiver> {
        config.validate()?;
        let receive_buffer = Arc::new(
            ReceiveBuffer::bind(port, config.clone())
                .await
                .context("could not open socket")?,
        );

        Ok(Receiver {
            config,
            receive_buffer,
            output_dir: output_dir.into(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.receive_buffer.local_addr()
    }

    /// Runs the transfer to completion and returns the path of the written
    ///  file.
    pub async fn run(self) -> anyhow::Result<PathBuf> {
        let receive_handle = self.receive_buffer.spawn_receive_loop();

        let mut sink: Option<BufWriter<File>> = None;
        let mut written_path: Option<PathBuf> = None;

        loop {
            let packet = self.receive_buffer.next_in_order().await;

            match packet.body {
                PacketBody::Init { filename, .. } => {
                    if sink.is_some() {
                        // a retransmitted init that slipped through - the
                        //  sink is already open
                        continue;
                    }
                    // peers expect the stored file to carry an .xml suffix on
                    //  top of the announced name
                    let path = self.output_dir.join(format!("{}.xml", filename));
                    info!("writing transfer to {:?}", path);
                    let file = File::create(&path)
                        .await
                        .context("could not create new file")?;
                    sink = Some(BufWriter::new(file));
                    written_path = Some(path);
                }
                PacketBody::Data(data) => {
                    let Some(writer) = sink.as_mut() else {
                        // nothing is written before the init packet arrives
                        debug!(
                            "dropping data packet #{} - transfer not initialized yet",
                            packet.sequence_number
                        );
                        continue;
                    };
                    if let Err(e) = writer.write_all(&data).await {
                        eprintln!("[error] could not write to file. message: {}", e);
                        break;
                    }
                }
                PacketBody::Last => {
                    if sink.is_none() {
                        continue;
                    }
                    debug!("terminal packet #{} delivered", packet.sequence_number);
                    break;
                }
            }
        }

        self.receive_buffer.stop();
        self.receive_buffer.send_trailing_acks(TRAILING_ACK_COUNT).await;

        if let Some(mut writer) = sink {
            if let Err(e) = writer.flush().await {
                eprintln!("[error] file writer failed to close: {}", e);
            }
        }

        if time::timeout(self.config.receiver_join_timeout, receive_handle)
            .await
            .is_err()
        {
            eprintln!(
                "[error] interrupted while closing threads. transfer may not have finished normally."
            );
        }

        eprintln!("[completed]");

        Ok(written_path.expect("the loop only ends after the init packet opened the sink"))
    }
}
