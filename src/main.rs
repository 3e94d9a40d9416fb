//! Purpose: `atomstock` server entry point; parses flags and runs the reactor.
//! Role: Binary crate root; argument parsing and error rendering only.
//! Invariants: Process exit code is derived from `core::error::to_exit_code`.
//! Invariants: All serving logic lives in `serve`; all socket state in `endpoint`.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

mod endpoint;
mod serve;

use atomstock::core::error::{Error, to_exit_code};
use atomstock::core::store::Inventory;
use serve::ServeConfig;

#[derive(Parser)]
#[command(
    name = "atomstock",
    version,
    about = "Persistent atom warehouse serving molecule requests over sockets",
    after_help = r#"EXAMPLES
  $ atomstock -T 5555 -f atoms.bin -c 100 -o 100 -H 200
  $ atomstock -U 5556 -s /tmp/atoms.stream -f atoms.bin
  $ atomstock -T 5555 -U 5556 -f atoms.bin -t 60

NOTES
  - At least one endpoint flag is required.
  - The save file is created on first run and reused afterwards; initial
    counters only apply when the file is new."#
)]
struct Cli {
    #[arg(
        short = 'T',
        long = "tcp-port",
        value_name = "PORT",
        help = "Serve stream clients on this TCP port",
        help_heading = "Endpoints"
    )]
    tcp_port: Option<u16>,
    #[arg(
        short = 'U',
        long = "udp-port",
        value_name = "PORT",
        help = "Serve datagram clients on this UDP port",
        help_heading = "Endpoints"
    )]
    udp_port: Option<u16>,
    #[arg(
        short = 's',
        long = "stream-path",
        value_name = "PATH",
        help = "Serve stream clients on this Unix socket path",
        help_heading = "Endpoints"
    )]
    stream_path: Option<PathBuf>,
    #[arg(
        short = 'd',
        long = "datagram-path",
        value_name = "PATH",
        help = "Serve datagram clients on this Unix socket path",
        help_heading = "Endpoints"
    )]
    datagram_path: Option<PathBuf>,
    #[arg(
        short = 'f',
        long = "save-file",
        value_name = "PATH",
        help = "Backing file for the atom counters (created if missing)",
        help_heading = "Inventory"
    )]
    save_file: PathBuf,
    #[arg(
        short = 'c',
        long,
        value_name = "N",
        default_value_t = 0,
        help = "Initial carbon atoms for a new save file",
        help_heading = "Inventory"
    )]
    carbon: u64,
    #[arg(
        short = 'o',
        long,
        value_name = "N",
        default_value_t = 0,
        help = "Initial oxygen atoms for a new save file",
        help_heading = "Inventory"
    )]
    oxygen: u64,
    #[arg(
        short = 'H',
        long,
        value_name = "N",
        default_value_t = 0,
        help = "Initial hydrogen atoms for a new save file",
        help_heading = "Inventory"
    )]
    hydrogen: u64,
    #[arg(
        short = 't',
        long = "timeout",
        value_name = "SECONDS",
        help = "Shut down after this many seconds without client activity",
        help_heading = "Lifetime"
    )]
    timeout: Option<u64>,
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = ServeConfig {
        tcp_port: cli.tcp_port,
        udp_port: cli.udp_port,
        stream_path: cli.stream_path,
        datagram_path: cli.datagram_path,
        save_file: cli.save_file,
        initial: Inventory::new(cli.carbon, cli.oxygen, cli.hydrogen),
        idle_timeout: cli.timeout.map(Duration::from_secs),
    };
    serve::run(config)
}

fn emit_error(err: &Error) {
    eprintln!("atomstock: {err}");
    if let Some(hint) = err.hint() {
        eprintln!("hint: {hint}");
    }
}
