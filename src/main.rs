use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mysql_operator::actions::{ActionState, create_actions_router};
use mysql_operator::health::{HealthState, create_router, run_health_server};
use mysql_operator::leadership::{Leadership, LeadershipState, run_lease};
use mysql_operator::{
    Context, EVENT_QUEUE_CAPACITY, OperatorConfig, UnitEvent, build_kube_collaborators,
    is_scaled_away, run_status_ticker, run_unit, watch_peers, watch_relations,
};

/// Grace period for in-flight events to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(
            "Failed to install rustls crypto provider and no provider is available".into(),
        );
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mysql_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let config = OperatorConfig::from_env()?;
    info!(
        unit = %config.unit_name,
        cluster = %config.cluster_name,
        namespace = %config.namespace,
        "Starting mysql-operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());
    let leadership = LeadershipState::new(Leadership::Follower);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    // Probes and actions are served whether or not this unit leads
    let health_handle = {
        let router = create_router(health_state.clone())
            .merge(create_actions_router(Arc::new(ActionState::new(events_tx.clone()))));
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(addr, router).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let ctx = Context::new(
        config.clone(),
        build_kube_collaborators(client.clone(), &config),
        leadership.clone(),
        Some(health_state.clone()),
    );

    let unit_handle = tokio::spawn(run_unit(ctx, events_tx.clone(), events_rx));
    let lease_handle = tokio::spawn(run_lease(
        client.clone(),
        config.clone(),
        leadership,
        events_tx.clone(),
    ));
    let peers_handle = tokio::spawn(watch_peers(client.clone(), config.clone(), events_tx.clone()));
    let relations_handle = tokio::spawn(watch_relations(
        client.clone(),
        config.clone(),
        events_tx.clone(),
    ));
    let ticker_handle = tokio::spawn(run_status_ticker(config.status_interval, events_tx.clone()));

    tokio::select! {
        result = unit_handle => {
            if let Err(e) = result {
                error!("Unit event loop panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = lease_handle => {
            if let Err(e) = result {
                error!("Lease task panicked: {}", e);
            }
        }
        result = peers_handle => {
            if let Err(e) = result {
                error!("Peer watch task panicked: {}", e);
            }
        }
        result = relations_handle => {
            if let Err(e) = result {
                error!("Relation watch task panicked: {}", e);
            }
        }
        result = ticker_handle => {
            if let Err(e) = result {
                error!("Status ticker panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked unit as not ready");

            if is_scaled_away(client.clone(), &config).await {
                info!("Unit is being scaled away, leaving the cluster");
                if events_tx.send(UnitEvent::Departing).await.is_err() {
                    warn!("Event loop closed before departure could be recorded");
                }
            }

            info!(
                "Waiting {}s for in-flight events to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Unit stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
