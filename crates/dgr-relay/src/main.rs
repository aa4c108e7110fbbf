//! `dgr-relay`: forwards DGR datagrams to hosts the master cannot reach
//! directly, then exits once the master goes quiet.
//!
//! ```text
//! dgr-relay <port-in> <ip-out> <port-out> [port2-out ...]
//! ```

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use dgr::logging::{LoggingConfig, init_logging};

mod relay;

use relay::{Relay, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "dgr-relay")]
#[command(about = "Forward DGR datagrams from one UDP port to one or more destinations")]
struct Cli {
    /// Port to receive datagrams on
    port_in: u16,

    /// Destination host or broadcast address for every outbound port
    ip_out: String,

    /// Destination ports; one outbound socket is opened per port
    #[arg(required = true, num_args = 1..)]
    ports_out: Vec<u16>,

    /// Seconds to wait for the very first datagram before exiting
    #[arg(long, value_name = "SECS", default_value = "15", value_parser = parse_secs)]
    first_packet_timeout: Duration,

    /// Seconds without traffic, once active, before exiting
    #[arg(long, value_name = "SECS", default_value = "5", value_parser = parse_secs)]
    idle_timeout: Duration,
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("{s:?} is not a number of seconds"))?;
    if secs.is_nan() || secs <= 0.0 {
        return Err("timeout must be positive".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let cli = Cli::parse();

    let mut config = RelayConfig::new(cli.port_in, cli.ip_out, cli.ports_out);
    config.first_packet_timeout = cli.first_packet_timeout;
    config.idle_timeout = cli.idle_timeout;

    let relay = Relay::bind(&config)?;
    log::info!("relay listening on {}", relay.local_addr()?);

    let summary = relay.run()?;
    log::info!(
        "relay exiting after {} datagrams: {}",
        summary.forwarded,
        summary.reason
    );
    Ok(())
}
