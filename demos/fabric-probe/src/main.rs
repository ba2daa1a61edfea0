//! Probes a fabric agent's health endpoint from the command line.
//!
//! ```text
//! fabric-probe --address 127.0.0.1:5571           # ping
//! fabric-probe --address 127.0.0.1:5571 --full    # full snapshot
//! fabric-probe --address 127.0.0.1:5571 --stop    # graceful stop
//! ```

use std::time::Duration;

use agent_fabric::net::wire;
use agent_fabric::net::{EndpointKind, EndpointOptions, EndpointPool};
use agent_fabric::primitives::{EndpointAddress, HealthSnapshot};
use agent_fabric::runtime::protocol::{ControlRequest, PingReply, ProbeRequest};
use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "fabric-probe", about = "Probe a fabric agent's health endpoint")]
struct Args {
    /// Health endpoint to probe, e.g. 127.0.0.1:5571.
    #[arg(long)]
    address: String,

    /// Request the full health snapshot instead of a ping.
    #[arg(long, conflicts_with = "stop")]
    full: bool,

    /// Send a control stop instead of a probe.
    #[arg(long)]
    stop: bool,

    /// Probe timeout in seconds.
    #[arg(long, default_value_t = 2)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let address: EndpointAddress = args.address.parse().context("health endpoint address")?;

    let pool = EndpointPool::new();
    let options =
        EndpointOptions::default().with_timeouts(Duration::from_secs(args.timeout.max(1)));
    let handle = pool
        .acquire(EndpointKind::Request, &address, options)
        .await
        .context("connect")?;

    let request = if args.stop {
        wire::encode(&ControlRequest::Stop {})?
    } else if args.full {
        wire::encode(&ProbeRequest::Full {})?
    } else {
        wire::encode(&ProbeRequest::Ping {})?
    };
    let reply = handle.request(&request).await.context("probe")?;

    if args.full {
        let snapshot: HealthSnapshot = wire::decode(&reply).context("decode snapshot")?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if args.stop {
        println!("stop acknowledged");
    } else {
        let ping: PingReply = wire::decode(&reply).context("decode ping reply")?;
        println!("status={} uptime={}s", ping.status, ping.uptime_seconds);
    }

    pool.release(handle).await.ok();
    pool.close_all().await;
    Ok(())
}
