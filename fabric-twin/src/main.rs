//! Error bus and digital twin process entry point.

use anyhow::{Context, Result, bail};
use clap::Parser;
use fabric_config::{ConfigLoader, FabricPaths};
use fabric_discovery::{DiscoveryClient, DiscoveryConfig};
use fabric_net::EndpointPool;
use fabric_primitives::{EndpointAddress, MachineId};
use fabric_twin::{DigitalTwin, ErrorBus, ErrorBusConfig, TwinConfig, TwinServiceConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fabric-twin", about = "AgentFabric error bus and digital twin")]
struct Args {
    /// Which roles to run: `all`, `bus`, or `twin`.
    #[arg(long, default_value = "all")]
    role: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    fabric_telemetry::init("info", None).context("telemetry init")?;
    let args = Args::parse();

    let paths = FabricPaths::resolve().context("path resolution")?;
    let config = ConfigLoader::new(paths).load("digital-twin")?;

    let machine = MachineId::new(
        config
            .as_string("machine_id")
            .unwrap_or_else(|| "local".into()),
    )
    .context("machine id")?;
    let frontend: EndpointAddress = config
        .as_string("error_bus.frontend")
        .unwrap_or_else(|| "127.0.0.1:7300".into())
        .parse()
        .context("bus frontend address")?;
    let backend: EndpointAddress = config
        .as_string("error_bus.backend")
        .unwrap_or_else(|| "127.0.0.1:7301".into())
        .parse()
        .context("bus backend address")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("termination signal received");
        signal.cancel();
    });

    let run_bus = matches!(args.role.as_str(), "all" | "bus");
    let run_twin = matches!(args.role.as_str(), "all" | "twin");
    if !run_bus && !run_twin {
        bail!("unknown role `{}`; expected all, bus, or twin", args.role);
    }

    let bus_worker = if run_bus {
        let bus = ErrorBus::new(ErrorBusConfig {
            frontend,
            backend: backend.clone(),
            high_water_mark: config
                .as_int("error_bus.high_water_mark")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(1000),
            machine,
        });
        let token = shutdown.clone();
        Some(tokio::spawn(async move { bus.run(token).await }))
    } else {
        None
    };

    let twin_worker = if run_twin {
        let mut view = TwinConfig::default();
        if let Some(n) = config
            .as_int("twin.recent_errors")
            .and_then(|v| usize::try_from(v).ok())
        {
            view.recent_errors = n;
        }
        if let Some(grace) = config.as_duration("twin.grace") {
            view.grace = grace;
        }
        if let Some(retention) = config.as_duration("twin.retention") {
            view.retention = retention;
        }
        if let Some(interval) = config.as_duration("twin.probe_interval") {
            view.probe_interval = interval;
        }

        let query_bind: EndpointAddress = config
            .as_string("twin.query_bind")
            .unwrap_or_else(|| "127.0.0.1:7310".into())
            .parse()
            .context("twin query address")?;
        let transitions_bind = config
            .as_string("twin.transitions_bind")
            .map(|raw| raw.parse::<EndpointAddress>())
            .transpose()
            .context("twin transitions address")?;

        let discovery = config
            .as_string("registry.endpoint")
            .map(|raw| raw.parse::<EndpointAddress>())
            .transpose()
            .context("registry address")?
            .map(|registry| {
                DiscoveryClient::new(EndpointPool::new(), DiscoveryConfig::new(registry))
            });

        let twin = DigitalTwin::new(
            TwinServiceConfig {
                bus_backend: backend,
                query_bind,
                transitions_bind,
                view,
            },
            discovery,
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { twin.run(token).await }))
    } else {
        None
    };

    if let Some(worker) = bus_worker {
        worker.await.context("bus join")??;
    }
    if let Some(worker) = twin_worker {
        worker.await.context("twin join")??;
    }
    Ok(())
}
