// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Serlink protocol implementation
mod frame;
mod payload;
mod protocol;
mod sender;
mod receiver;
mod serial;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use tracing::{error, info, warn};
use protocol::ConnectionParams;
use serial::{RealSerialPort, SerialPort};

/// Pause before reopening a port that failed
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "serlink")]
#[command(about = "Reliable file transfer over a raw serial line", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,

        /// Seconds to wait for each reply
        #[arg(long, default_value = "2.0", value_name = "SECS")]
        timeout: f64,

        /// Attempts per packet before giving up
        #[arg(long, default_value = "5")]
        retries: u32,

        /// Bytes of file content per packet
        #[arg(long, default_value = "64", value_name = "BYTES")]
        chunk_size: u32,

        /// Connection attempts before giving up (default: keep trying)
        #[arg(long, value_name = "N")]
        max_attempts: Option<u32>,
    },
    /// Receive files, one transfer after another, until interrupted
    Receive {
        /// File to write received data to
        #[arg(short, long, default_value = "received_file.dat")]
        output: PathBuf,

        /// Consecutive silent reads tolerated before abandoning a transfer
        #[arg(long, default_value = "10", value_name = "READS",
              value_parser = clap::value_parser!(u32).range(1..))]
        inactivity_budget: u32,
    },
}

/// How to open the port, kept so the link can be reopened after a failure
struct PortSettings {
    name: String,
    baud: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
}

impl PortSettings {
    fn open(&self) -> Result<RealSerialPort, serialport::Error> {
        RealSerialPort::open(&self.name, self.baud, self.data_bits, self.parity, self.stop_bits)
    }
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let fallback = if debug { "serlink=debug" } else { "serlink=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = PortSettings {
        data_bits: parse_data_bits(cli.data_bits).map_err(anyhow::Error::msg)?,
        parity: parse_parity(&cli.parity).map_err(anyhow::Error::msg)?,
        stop_bits: parse_stop_bits(cli.stop_bits).map_err(anyhow::Error::msg)?,
        name: cli.port,
        baud: cli.baud,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("interrupt received, shutting down");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    info!(
        port = %settings.name,
        baud = settings.baud,
        data_bits = ?settings.data_bits,
        parity = ?settings.parity,
        stop_bits = ?settings.stop_bits,
        "serial settings"
    );

    match cli.command {
        Commands::Send { file, timeout, retries, chunk_size, max_attempts } => {
            let params = ConnectionParams::new(timeout, retries, chunk_size)
                .context("invalid connection parameters")?;
            send_file(&settings, file, params, max_attempts, &shutdown)
        }
        Commands::Receive { output, inactivity_budget } => {
            receive_files(&settings, output, inactivity_budget, &shutdown)
        }
    }
}

fn send_file(
    settings: &PortSettings,
    file: PathBuf,
    params: ConnectionParams,
    max_attempts: Option<u32>,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    use sender::{ReconnectPolicy, SenderConfig};

    if !file.is_file() {
        bail!("File not found: {}", file.display());
    }

    let config = SenderConfig {
        params,
        reconnect: ReconnectPolicy { max_attempts, ..ReconnectPolicy::default() },
        ..SenderConfig::default()
    };

    info!(file = %file.display(), "sending file");
    let connect = || -> std::io::Result<Box<dyn SerialPort>> {
        info!(port = %settings.name, "opening serial port");
        Ok(Box::new(settings.open()?))
    };

    send_outcome(sender::run_sender(connect, &file, &config, shutdown))
}

/// Interrupting a send is an orderly exit, like stopping the receiver
fn send_outcome(result: Result<(), sender::SenderError>) -> anyhow::Result<()> {
    use sender::SenderError;

    match result {
        Ok(()) => {
            info!("file sent successfully");
            Ok(())
        }
        Err(SenderError::Interrupted) => {
            warn!("send cancelled by user");
            Ok(())
        }
        Err(e) => Err(e).context("send failed"),
    }
}

fn receive_files(
    settings: &PortSettings,
    output: PathBuf,
    inactivity_budget: u32,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    use receiver::ReceiverFsm;

    let mut port = settings
        .open()
        .with_context(|| format!("failed to open serial port {}", settings.name))?;

    info!(port = %settings.name, output = %output.display(), "waiting for transfers");

    loop {
        let fsm = ReceiverFsm::new(Box::new(port), output.clone(), ConnectionParams::default(), inactivity_budget);
        match receiver::run_receiver(fsm, shutdown) {
            Ok(()) => {
                info!("receiver stopped");
                return Ok(());
            }
            Err(e) => warn!(error = %e, "link lost, reopening port"),
        }

        port = loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("receiver stopped");
                return Ok(());
            }
            std::thread::sleep(REOPEN_BACKOFF);
            match settings.open() {
                Ok(port) => break port,
                Err(e) => warn!(error = %e, "failed to reopen serial port"),
            }
        };
    }
}

#[cfg(test)]
pub(crate) fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}
