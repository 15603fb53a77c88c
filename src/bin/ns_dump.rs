use std::{
    error::Error,
    fs,
    io::{self, Read},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, Subcommand};
use hera_client::{
    config::ClientConfig,
    netstring::{self, ConnectionError, Frame, NetstringConnection, Protocol},
};

#[derive(Debug, Parser)]
#[command(version, about = "Inspect netstring traffic", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Parse netstrings from a file, or stdin when no path is given
    Parse { path: Option<PathBuf> },
    /// Send one frame to a server and print the replies until it goes quiet
    Request {
        address: SocketAddr,
        code: u32,
        payload: Option<String>,
        /// Seconds to wait for each reply, overriding the config file
        #[arg(long)]
        timeout: Option<u64>,
        /// `key = value` config file supplying `netstring_read_timeout_secs`
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn print_frame(frame: &Frame) {
    match &frame.payload {
        Some(payload) => println!("({}, {:?})", frame.code, String::from_utf8_lossy(payload)),
        None => println!("({}, None)", frame.code),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    match Cli::parse().command {
        Cmd::Parse { path } => {
            let bytes = match path {
                Some(path) => fs::read(path)?,
                None => {
                    let mut buf = Vec::new();
                    io::stdin().lock().read_to_end(&mut buf)?;
                    buf
                }
            };
            let input = bytes.trim_ascii_end();
            for frame in netstring::codec::parse(input)? {
                print_frame(&frame);
            }
        }
        Cmd::Request {
            address,
            code,
            payload,
            timeout,
            config,
        } => {
            let config = match config {
                Some(path) => ClientConfig::from_file(path)?,
                None => ClientConfig::default(),
            };
            let conn = NetstringConnection::connect(address, Protocol::Occ)?;
            conn.set_timeout(timeout.map_or(config.read_timeout, Duration::from_secs));
            conn.write(code, payload.as_deref().map(str::as_bytes))?;
            conn.flush()?;

            loop {
                match conn.read() {
                    Ok(frame) => print_frame(&frame),
                    Err(ConnectionError::Timeout(_)) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}
