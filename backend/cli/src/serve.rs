//! `relgate serve`: wire the clients, rules and HTTP server together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relgate_config::{validate, RelgateConfig};
use relgate_gateway::{start_server, Dispatcher, GatewayState, RuleReloader};
use relgate_graph::{spawn_snapshot_printer, PermissionChecker};
use relgate_rules::{collect_rule_specs, RuleStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub async fn run(config: RelgateConfig) -> Result<()> {
    for warning in validate(&config).warnings {
        warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;

    let graph = relgate_graph::connect(&config.graph)?;
    let checker = PermissionChecker::from_config(graph, &config.graph);
    let backend = relgate_store::connect(&config.backend)?;

    let specs = collect_rule_specs(&config.rules).await?;
    let rules = RuleStore::compile(&specs, config.object_fields.clone())
        .context("Rules failed to compile")?;
    let reloader = RuleReloader::new(rules.clone(), config.rules.clone());

    let (stop, shutdown) = watch::channel(false);
    let mut tasks = Vec::new();
    if config.rules.watch {
        tasks.extend(reloader.watch(shutdown.clone())?);
    }
    if config.diagnostics.snapshot_interval_secs > 0 {
        tasks.push(spawn_snapshot_printer(
            checker.clone(),
            Duration::from_secs(config.diagnostics.snapshot_interval_secs),
            config.diagnostics.snapshot_limit,
            shutdown.clone(),
        ));
    }

    info!(
        graph = checker.graph().name(),
        backend = backend.name(),
        rules = specs.len(),
        "Starting relgate"
    );
    let state = GatewayState {
        dispatcher: Arc::new(Dispatcher::new(rules, checker, backend, &config.policy)),
        reloader,
        admin_groups: Arc::new(config.policy.admin_groups.clone()),
        shutdown,
    };

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = stop.send(true);
    });

    start_server(addr, state).await?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    for task in tasks {
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Background task did not stop in time");
        }
    }
    info!("relgate stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
