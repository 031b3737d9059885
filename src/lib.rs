pub mod actions;
pub mod admin;
pub mod backup;
pub mod config;
pub mod constants;
pub mod controller;
pub mod credentials;
pub mod events;
pub mod health;
pub mod leadership;
pub mod peer;
pub mod relations;
pub mod resources;
pub mod store;
pub mod tls;

pub use actions::{ActionState, create_actions_router};
pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Collaborators, Context, Error, ErrorContext, ErrorKind, Result, handle_event,
};
pub use events::UnitEvent;
pub use health::{HealthState, Metrics};
pub use leadership::{Leadership, LeadershipState, run_lease};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::admin::MysqlShellAdmin;
use crate::backup::S3StoreProvider;
use crate::credentials::CredentialStore;
use crate::resources::common::{all_relations_selector, relation_identity};
use crate::store::kube::{KubePeerStore, KubeRelationStore, KubeSecretStore};
use crate::store::RelationEndpoint;

/// Capacity of the unit event queue
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Production collaborators backed by the Kubernetes API
pub fn build_kube_collaborators(client: Client, config: &OperatorConfig) -> Collaborators {
    let secrets = Arc::new(KubeSecretStore::new(client.clone(), config));
    let admin = MysqlShellAdmin::new(
        client.clone(),
        &config.namespace,
        &config.pod_name(),
        &config.unit_address,
        CredentialStore::new(secrets.clone()),
    );
    Collaborators {
        peer_store: Arc::new(KubePeerStore::new(client.clone(), config)),
        relations: Arc::new(KubeRelationStore::new(client, config)),
        secrets,
        admin: Arc::new(admin),
        object_stores: Arc::new(S3StoreProvider),
    }
}

/// Handle unit events one at a time until every sender is gone.
///
/// Failed events that carry no reply channel are requeued after a delay
/// chosen from the error kind. Queued peer changes are folded into the pass
/// being run, since every pass reads the latest peer record.
pub async fn run_unit(
    ctx: Context,
    requeue: mpsc::Sender<UnitEvent>,
    mut events: mpsc::Receiver<UnitEvent>,
) {
    info!(unit = %ctx.config.unit_name, "Starting unit event loop");

    let mut pending = VecDeque::new();
    let mut failures: HashMap<&'static str, ErrorContext> = HashMap::new();
    let mut ready = false;

    loop {
        let event = match pending.pop_front() {
            Some(event) => event,
            None => match events.recv().await {
                Some(event) => event,
                None => break,
            },
        };
        while let Ok(next) = events.try_recv() {
            pending.push_back(next);
        }
        coalesce(&event, &mut pending);

        let name = event.name();
        let retry = event.requeue_copy();
        match handle_event(&ctx, event).await {
            Ok(()) => {
                if let Some(failure) = failures.get_mut(name) {
                    failure.reset();
                }
                if !ready {
                    ready = true;
                    if let Some(health) = &ctx.health {
                        health.set_ready(true).await;
                    }
                }
            }
            Err(e) => {
                let failure = failures.entry(name).or_default();
                let delay = ctx.backoff.delay_for_error(&e, failure.consecutive_errors);
                failure.record_error(&e);
                match retry {
                    Some(retry) => {
                        warn!(
                            event = name,
                            error = %e,
                            consecutive_errors = failure.consecutive_errors,
                            delay_secs = delay.as_secs(),
                            "Event failed, requeueing"
                        );
                        schedule(requeue.clone(), retry, delay);
                    }
                    None => warn!(event = name, error = %e, "Event failed"),
                }
            }
        }
    }

    info!("Unit event loop stopped");
}

/// Drop queued events made redundant by `current`
fn coalesce(current: &UnitEvent, pending: &mut VecDeque<UnitEvent>) {
    if matches!(current, UnitEvent::PeerChanged | UnitEvent::UpdateStatus) {
        pending.retain(|event| !matches!(event, UnitEvent::PeerChanged));
    }
}

fn schedule(events: mpsc::Sender<UnitEvent>, event: UnitEvent, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if events.send(event).await.is_err() {
            debug!("Event loop closed before requeue");
        }
    });
}

/// Emit `UpdateStatus` every `interval`
pub async fn run_status_ticker(interval: Duration, events: mpsc::Sender<UnitEvent>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if events.send(UnitEvent::UpdateStatus).await.is_err() {
            return;
        }
    }
}

/// Turn changes of the peer ConfigMap into `PeerChanged` events
pub async fn watch_peers(client: Client, config: OperatorConfig, events: mpsc::Sender<UnitEvent>) {
    let api: Api<ConfigMap> = Api::namespaced(client, &config.namespace);
    let watcher_config = watcher::Config::default()
        .fields(&format!("metadata.name={}", config.peer_configmap_name()));

    let mut stream = watcher::watcher(api, watcher_config).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(_)) | Ok(Event::InitDone) => {
                if events.send(UnitEvent::PeerChanged).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Peer watch error"),
        }
    }
    error!("Peer watch ended");
}

/// Event for a change of a relation data bag
pub fn relation_event(cm: &ConfigMap, deleted: bool) -> Option<UnitEvent> {
    let (endpoint, relation_id) = relation_identity(cm)?;
    if deleted {
        return Some(UnitEvent::RelationBroken {
            endpoint,
            relation_id,
        });
    }
    let issued = endpoint == RelationEndpoint::Certificates
        && cm
            .data
            .as_ref()
            .is_some_and(|data| data.contains_key(tls::CERTIFICATES_KEY));
    Some(if issued {
        UnitEvent::CertIssued { relation_id }
    } else {
        UnitEvent::RelationChanged {
            endpoint,
            relation_id,
        }
    })
}

/// Turn changes of relation data bags into relation events
pub async fn watch_relations(
    client: Client,
    config: OperatorConfig,
    events: mpsc::Sender<UnitEvent>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &config.namespace);
    let watcher_config =
        watcher::Config::default().labels(&all_relations_selector(&config.app_name));

    let mut stream = watcher::watcher(api, watcher_config).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(Event::Apply(cm)) | Ok(Event::InitApply(cm)) => relation_event(&cm, false),
            Ok(Event::Delete(cm)) => relation_event(&cm, true),
            Ok(Event::Init) | Ok(Event::InitDone) => None,
            Err(e) => {
                warn!(error = %e, "Relation watch error");
                None
            }
        };
        if let Some(event) = event
            && events.send(event).await.is_err()
        {
            return;
        }
    }
    error!("Relation watch ended");
}

/// Whether this unit's pod is beyond the StatefulSet's desired replicas
pub async fn is_scaled_away(client: Client, config: &OperatorConfig) -> bool {
    let Some(ordinal) = config
        .pod_name()
        .rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse::<i32>().ok())
    else {
        return false;
    };
    let api: Api<StatefulSet> = Api::namespaced(client, &config.namespace);
    match api.get_opt(&config.app_name).await {
        Ok(Some(sts)) => {
            let replicas = sts.spec.and_then(|s| s.replicas).unwrap_or(1);
            ordinal >= replicas
        }
        Ok(None) => true,
        Err(e) => {
            warn!(error = %e, "Could not read StatefulSet, assuming restart");
            false
        }
    }
}
