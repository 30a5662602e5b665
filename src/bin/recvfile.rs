use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;

use filetransfer::config::Config;
use filetransfer::receiver::Receiver;

/// Receives one file over the custom UDP transport and stores it in the
/// current directory.
#[derive(Parser)]
#[clap(name = "recvfile")]
struct Args {
    /// port to listen on
    #[clap(short = 'p')]
    port: u16,

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

    let receiver = match Receiver::bind(args.port, ".", Arc::new(Config::default())).await {
        Ok(receiver) => receiver,
        Err(e) => {
            eprintln!("[error] {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match receiver.run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[error] {:#}", e);
            ExitCode::FAILURE
        }
    }
}
