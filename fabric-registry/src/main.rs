//! Registry process entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fabric_config::{ConfigLoader, FabricPaths};
use fabric_primitives::{EndpointAddress, MachineId};
use fabric_registry::{
    InMemoryBackend, RedisBackend, RegistryBackend, RegistryService, RegistryServiceConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fabric-registry", about = "AgentFabric service registry")]
struct Args {
    /// Address to bind, e.g. 0.0.0.0:7100. Overrides `registry.endpoint`.
    #[arg(long)]
    bind: Option<String>,

    /// Backend engine: `memory` or `redis`. Overrides `registry.backend`.
    #[arg(long)]
    backend: Option<String>,

    /// Redis URL for the external store, e.g. redis://10.0.0.1:6379.
    #[arg(long)]
    redis_url: Option<String>,

    /// Entry TTL in seconds for the external store.
    #[arg(long, default_value_t = 30)]
    ttl: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    fabric_telemetry::init("info", None).context("telemetry init")?;
    let args = Args::parse();

    let paths = FabricPaths::resolve().context("path resolution")?;
    let config = ConfigLoader::new(paths).load("service-registry")?;

    let bind: EndpointAddress = args
        .bind
        .or_else(|| config.as_string("registry.endpoint"))
        .unwrap_or_else(|| {
            let host = config
                .as_string("bind_host")
                .unwrap_or_else(|| "127.0.0.1".into());
            format!("{host}:7100")
        })
        .parse()
        .context("registry bind address")?;

    let machine = MachineId::new(
        config
            .as_string("machine_id")
            .unwrap_or_else(|| "local".into()),
    )
    .context("machine id")?;

    let error_bus = config
        .as_string("error_bus.frontend")
        .map(|raw| raw.parse::<EndpointAddress>())
        .transpose()
        .context("error bus address")?;

    let engine = args
        .backend
        .or_else(|| config.as_string("registry.backend"))
        .unwrap_or_else(|| "memory".into());

    let backend: Arc<dyn RegistryBackend> = match engine.as_str() {
        "memory" => Arc::new(InMemoryBackend::new()),
        "redis" => {
            let url = args
                .redis_url
                .or_else(|| config.as_string("registry.redis_url"))
                .context("`redis` backend requires --redis-url or registry.redis_url")?;
            let ttl = config
                .as_duration("registry.ttl")
                .unwrap_or(Duration::from_secs(args.ttl));
            Arc::new(
                RedisBackend::connect(&url, "fabric", ttl)
                    .await
                    .context("redis connect")?,
            )
        }
        other => bail!("unknown registry backend `{other}`"),
    };

    info!(backend = %engine, bind = %bind, "starting registry");
    let service = RegistryService::new(
        backend,
        RegistryServiceConfig {
            bind,
            machine,
            error_bus,
        },
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("termination signal received");
        signal.cancel();
    });

    service.run(shutdown).await?;
    Ok(())
}
