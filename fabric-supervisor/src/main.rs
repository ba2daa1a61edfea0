//! Supervisor process entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fabric_config::{ConfigLoader, FabricPaths, parse_duration};
use fabric_net::EndpointPool;
use fabric_primitives::{AgentName, EndpointAddress, MachineId};
use fabric_runtime::{EXIT_CONFIG, ErrorReporter};
use fabric_supervisor::{GroupManifest, SpawnContext, Supervisor, SupervisorPolicies};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fabric-supervisor", about = "AgentFabric group supervisor")]
struct Args {
    /// Path to the group manifest. Defaults to `config/agents.toml`.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Group within the manifest to supervise.
    #[arg(long)]
    group: String,

    /// Address for the operator query endpoint, e.g. 127.0.0.1:7200.
    #[arg(long)]
    query_bind: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let Ok(paths) = FabricPaths::resolve() else {
        eprintln!("error: cannot resolve fabric directories");
        return ExitCode::from(EXIT_CONFIG as u8);
    };
    let supervisor_log = paths.logs_dir().join("_supervisor.log");
    if let Err(err) = fabric_telemetry::init("info", Some(&supervisor_log)) {
        eprintln!("error: {err}");
        return ExitCode::from(EXIT_CONFIG as u8);
    }

    let config = match ConfigLoader::new(paths.clone()).load("supervisor") {
        Ok(config) => config,
        Err(err) => {
            emit_config_error(&err.to_string());
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let manifest_path = args
        .manifest
        .unwrap_or_else(|| paths.config_dir().join("agents.toml"));
    let manifest = match GroupManifest::load(&manifest_path, &args.group) {
        Ok(manifest) => manifest,
        Err(err) => {
            emit_config_error(&err.to_string());
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let machine = match MachineId::new(
        config
            .as_string("machine_id")
            .unwrap_or_else(|| "local".into()),
    ) {
        Ok(machine) => machine,
        Err(err) => {
            emit_config_error(&err.to_string());
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let registry = config
        .as_string("registry.endpoint")
        .and_then(|raw| raw.parse::<EndpointAddress>().ok());
    let error_bus = config
        .as_string("error_bus.frontend")
        .and_then(|raw| raw.parse::<EndpointAddress>().ok());
    let bind_host = config
        .as_string("bind_host")
        .unwrap_or_else(|| "127.0.0.1".into());

    let mut policies = SupervisorPolicies {
        shutdown_grace: config
            .as_duration("shutdown_grace")
            .unwrap_or_else(|| parse_duration("10s").expect("static duration")),
        ..SupervisorPolicies::default()
    };
    if let Some(interval) = config.as_duration("supervisor.probe_interval") {
        policies.health_probe_interval = interval;
    }
    policies.query_bind = args
        .query_bind
        .or_else(|| config.as_string("supervisor.query_bind"))
        .and_then(|raw| raw.parse::<EndpointAddress>().ok());

    let spawn_ctx = SpawnContext {
        logs_dir: paths.logs_dir().to_path_buf(),
        machine: machine.clone(),
        group: args.group.clone(),
        bind_host,
        registry,
        error_bus: error_bus.clone(),
    };

    let pool = EndpointPool::new();
    let supervisor_name = AgentName::new("supervisor").expect("static name is valid");
    let (reporter, reporter_worker) =
        ErrorReporter::spawn(pool.clone(), error_bus, supervisor_name, machine, 1000);

    let supervisor = Supervisor::new(manifest, policies, spawn_ctx, pool.clone(), reporter);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("termination signal received");
        signal.cancel();
    });

    info!(group = %args.group, manifest = %manifest_path.display(), "supervisor starting");
    let code = supervisor.run(shutdown).await;
    reporter_worker.abort();
    pool.close_all().await;

    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

/// Invalid manifests produce a single structured error on standard error.
fn emit_config_error(detail: &str) {
    error!(detail, "invalid configuration");
    eprintln!("{{\"error\": \"invalid_configuration\", \"detail\": {detail:?}}}");
}
