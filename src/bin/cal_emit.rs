use std::{
    error::Error,
    path::PathBuf,
    process,
    sync::mpsc::{self, RecvTimeoutError},
    time::Duration,
};

use clap::Parser;
use hera_client::{cal::CalClient, config::ClientConfig};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about = "Emit sample CAL records", long_about = None)]
struct Cli {
    /// `key = value` config file; defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Daemon host, overriding the config file
    #[arg(long)]
    host: Option<String>,
    /// Daemon port, overriding the config file
    #[arg(long)]
    port: Option<u16>,
    /// Pool name, overriding the config file
    #[arg(long)]
    pool: Option<String>,
    /// Seconds between heartbeats while waiting for Ctrl-C
    #[arg(long, default_value_t = 5)]
    every: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(pool) = cli.pool {
        config.pool = pool;
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    info!("sending to {}", config.address());
    let client = CalClient::new(config)?;
    client.event("CAL_EMIT", "start", "0", &format!("pid={}", process::id()));
    {
        let mut t = client.trans("CAL_EMIT", "sample");
        t.add_data("step", "sql");
        client.sql("select 1 from dual");
    }
    client.metric("sample_value", 42);

    let mut beats = 0_u64;
    loop {
        match stop_rx.recv_timeout(Duration::from_secs(cli.every)) {
            Err(RecvTimeoutError::Timeout) => {
                beats += 1;
                client.heartbeat("CAL_EMIT", "alive", "0", &format!("beat={beats}"));
            }
            _ => break,
        }
    }

    info!("stopping after {beats} heartbeats");
    client.close();
    Ok(())
}
