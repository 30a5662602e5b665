use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::lookup_host;
use tracing::Level;

use filetransfer::config::Config;
use filetransfer::sender::send_file;

/// Sends a file to a listening receiver over the custom UDP transport.
#[derive(Parser)]
#[clap(name = "sendfile")]
struct Args {
    /// destination as <recv_host>:<recv_port>
    #[clap(short = 'r')]
    receiver: String,

    /// the file to transfer
    #[clap(short = 'f')]
    filename: PathBuf,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // argument errors exit with 1, not clap's default of 2
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let peer_addr = match resolve_receiver(&args.receiver).await {
        Ok(peer_addr) => peer_addr,
        Err(e) => {
            eprintln!("[error] {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // fail before touching the network if the file cannot possibly be sent
    match std::fs::metadata(&args.filename) {
        Ok(metadata) if metadata.is_file() => {}
        _ => {
            eprintln!("[error] file does not exist");
            return ExitCode::FAILURE;
        }
    }

    match send_file(&args.filename, peer_addr, Arc::new(Config::default())).await {
        Ok(stats) => {
            stats.print();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("[error] {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn resolve_receiver(receiver: &str) -> anyhow::Result<SocketAddr> {
    let (host, port) = receiver
        .split_once(':')
        .context("destination must be in <recv_host>:<recv_port> format")?;
    let port: u16 = port.parse().context("<recv_port> must be an integer")?;

    lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .context("<recv_host> could not be resolved")
}
