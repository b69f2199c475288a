use chrono::Utc;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::common::{is_controlled_by, Data};
use crate::drain::{drain_complete, drain_started, DRAIN_STARTED_ANNOTATION};
use crate::gameserver_types::{
    GameServer, GameServerState, GameServerStatus, GAME_SERVER_NAME_LABEL,
};
use crate::gameserverinstance_types::GameServerInstance;
use crate::instance::instance_build;
use crate::pod::pod_build;
use crate::role::role_build;
use crate::role_binding::role_binding_build;
use crate::service_account::service_account_build;

const RESYNC_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get Pod: {0}")]
    PodGetFailed(#[source] kube::Error),
    #[error("Failed to delete Pod: {0}")]
    PodDeleteFailed(#[source] kube::Error),
    #[error("Failed to create Role: {0}")]
    RoleCreationFailed(#[source] kube::Error),
    #[error("Failed to create ServiceAccount: {0}")]
    ServiceAccountCreationFailed(#[source] kube::Error),
    #[error("Failed to create RoleBinding: {0}")]
    RoleBindingCreationFailed(#[source] kube::Error),
    #[error("Failed to create Pod: {0}")]
    PodCreationFailed(#[source] kube::Error),
    #[error("Failed to update GameServer status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to update GameServer: {0}")]
    GameServerUpdateFailed(#[source] kube::Error),
    #[error("Failed to delete GameServer: {0}")]
    GameServerDeleteFailed(#[source] kube::Error),
    #[error("Failed to get GameServerInstance: {0}")]
    InstanceGetFailed(#[source] kube::Error),
    #[error("Failed to list GameServerInstances: {0}")]
    InstanceListFailed(#[source] kube::Error),
    #[error("Failed to create GameServerInstance: {0}")]
    InstanceCreationFailed(#[source] kube::Error),
    #[error("Failed to serialize status: {0}")]
    StatusSerializeFailed(#[from] serde_json::Error),
}

pub async fn reconcile(gs: Arc<GameServer>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;
    let recorder = Recorder::new(client.clone(), ctx.reporter.clone(), gs.object_ref(&()));

    reconcile_deletion(&gs, client, &recorder).await?;

    match gs.state() {
        None => {
            // First observation; enter the state machine.
            update_state(&gs, GameServerState::Creating, client).await?;
        }
        Some(GameServerState::Creating) => {
            if gs.metadata.deletion_timestamp.is_none() {
                reconcile_creating(&gs, client, &recorder).await?;
            }
        }
        Some(GameServerState::RequestReady) => {
            update_state(&gs, GameServerState::Ready, client).await?;
        }
        Some(GameServerState::Drain) => {
            reconcile_drain(&gs, client, &recorder).await?;
        }
        Some(GameServerState::Shutdown) => {
            reconcile_shutdown(&gs, client, &recorder).await?;
        }
        // Starting, Scheduled, Ready and Allocated are advanced by the pod
        // sidecar and the allocator; Error and Unhealthy wait for the
        // population controller.
        Some(_) => {}
    }

    reconcile_instances(&gs, client).await?;

    Ok(Action::requeue(RESYNC_PERIOD))
}

pub fn error_policy(_gs: Arc<GameServer>, _error: &Error, _ctx: Arc<Data>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Once the GameServer is terminating, delete its pod exactly once; the
/// owner references cascade everything else.
async fn reconcile_deletion(
    gs: &GameServer,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    if gs.metadata.deletion_timestamp.is_none() {
        return Ok(());
    }

    info!("reconcile: deletion timestamp set");

    if let Some(pod) = get_game_server_pod(gs, client).await? {
        if pod.metadata.deletion_timestamp.is_none() {
            let pod_name = pod.metadata.name.clone().unwrap();
            let api = Api::<corev1::Pod>::namespaced(client.clone(), &gs.namespace().unwrap());
            api.delete(&pod_name, &DeleteParams::default())
                .await
                .map_err(Error::PodDeleteFailed)?;

            publish(
                recorder,
                &state_reason(gs),
                "Delete",
                format!("Deleting Pod {}", pod_name),
            )
            .await;
        }
    }

    Ok(())
}

async fn reconcile_creating(
    gs: &GameServer,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    // Only create resources if the backing Pod doesn't exist.
    if get_game_server_pod(gs, client).await?.is_none() {
        create_game_server_resources(gs, client, recorder).await?;
    }

    update_state(gs, GameServerState::Starting, client).await
}

/// Materializes the identity objects and the pod, in dependency order.
/// Every create treats AlreadyExists as success, which makes retries after
/// partial failure safe.
async fn create_game_server_resources(
    gs: &GameServer,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    let namespace = gs.namespace().unwrap();
    let reason = state_reason(gs);
    let pp = PostParams::default();

    let role_api = Api::<rbacv1::Role>::namespaced(client.clone(), &namespace);
    let role = role_build(gs);
    info!("reconcile: creating role");
    match role_api.create(&pp, &role).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason.clone() == "AlreadyExists" => {}
            _ => return Err(Error::RoleCreationFailed(e)),
        },
        Ok(_) => {
            publish(
                recorder,
                &reason,
                "Create",
                format!("Role {} created", role.metadata.name.as_ref().unwrap()),
            )
            .await;
        }
    }

    let sa_api = Api::<corev1::ServiceAccount>::namespaced(client.clone(), &namespace);
    let service_account = service_account_build(gs);
    info!("reconcile: creating serviceaccount");
    match sa_api.create(&pp, &service_account).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason.clone() == "AlreadyExists" => {}
            _ => return Err(Error::ServiceAccountCreationFailed(e)),
        },
        Ok(_) => {
            publish(
                recorder,
                &reason,
                "Create",
                format!(
                    "ServiceAccount {} created",
                    service_account.metadata.name.as_ref().unwrap()
                ),
            )
            .await;
        }
    }

    let rb_api = Api::<rbacv1::RoleBinding>::namespaced(client.clone(), &namespace);
    let role_binding = role_binding_build(gs);
    info!("reconcile: creating rolebinding");
    match rb_api.create(&pp, &role_binding).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason.clone() == "AlreadyExists" => {}
            _ => return Err(Error::RoleBindingCreationFailed(e)),
        },
        Ok(_) => {
            publish(
                recorder,
                &reason,
                "Create",
                format!(
                    "RoleBinding {} created",
                    role_binding.metadata.name.as_ref().unwrap()
                ),
            )
            .await;
        }
    }

    let pod_api = Api::<corev1::Pod>::namespaced(client.clone(), &namespace);
    let pod = pod_build(gs);
    info!("reconcile: creating pod");
    match pod_api.create(&pp, &pod).await {
        Err(e) => match e {
            kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                if reason.clone() == "AlreadyExists" => {}
            _ => return Err(Error::PodCreationFailed(e)),
        },
        Ok(_) => {
            publish(
                recorder,
                &reason,
                "Create",
                format!("Pod {} created", pod.metadata.name.as_ref().unwrap()),
            )
            .await;
        }
    }

    Ok(())
}

/// Waits out the drain: stamps the start time on first observation, then
/// asks the drain subsystem whether the server may shut down.
async fn reconcile_drain(gs: &GameServer, client: &Client, recorder: &Recorder) -> Result<(), Error> {
    let api = Api::<GameServer>::namespaced(client.clone(), &gs.namespace().unwrap());

    if drain_started(gs).is_none() {
        let mut gs_copy = gs.clone();
        gs_copy
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(DRAIN_STARTED_ANNOTATION.to_string(), Utc::now().to_rfc3339());
        api.replace(
            gs.metadata.name.as_ref().unwrap(),
            &PostParams::default(),
            &gs_copy,
        )
        .await
        .map_err(Error::GameServerUpdateFailed)?;
        return Ok(());
    }

    let instances = list_game_server_instances(gs, client).await?;
    if drain_complete(gs, &instances, Utc::now()) {
        update_state(gs, GameServerState::Shutdown, client).await?;
        publish(
            recorder,
            &state_reason(gs),
            "Drain",
            "Drain complete, shutting down".to_string(),
        )
        .await;
    }

    Ok(())
}

/// Shutdown deletes the GameServer itself; ownership cascades take the
/// pod, the identity objects and the instances with it.
async fn reconcile_shutdown(
    gs: &GameServer,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    let api = Api::<GameServer>::namespaced(client.clone(), &gs.namespace().unwrap());
    api.delete(
        gs.metadata.name.as_ref().unwrap(),
        &DeleteParams::background(),
    )
    .await
    .map_err(Error::GameServerDeleteFailed)?;

    publish(recorder, &state_reason(gs), "Delete", "Deletion started".to_string()).await;

    Ok(())
}

async fn update_state(
    gs: &GameServer,
    state: GameServerState,
    client: &Client,
) -> Result<(), Error> {
    let mut gs_copy = gs.clone();
    gs_copy.status = Some(GameServerStatus { state });

    let api = Api::<GameServer>::namespaced(client.clone(), &gs.namespace().unwrap());
    api.replace_status(
        gs.metadata.name.as_ref().unwrap(),
        &PostParams::default(),
        serde_json::to_vec(&gs_copy)?,
    )
    .await
    .map_err(Error::StatusUpdateFailed)?;

    Ok(())
}

/// Returns the Pod backing the GameServer, if it exists and is actually
/// controlled by it.
async fn get_game_server_pod(gs: &GameServer, client: &Client) -> Result<Option<corev1::Pod>, Error> {
    let api = Api::<corev1::Pod>::namespaced(client.clone(), &gs.namespace().unwrap());
    let pod = api
        .get_opt(gs.metadata.name.as_ref().unwrap())
        .await
        .map_err(Error::PodGetFailed)?;
    Ok(pod.filter(|p| is_controlled_by(&p.metadata, gs)))
}

async fn list_game_server_instances(
    gs: &GameServer,
    client: &Client,
) -> Result<Vec<GameServerInstance>, Error> {
    let api = Api::<GameServerInstance>::namespaced(client.clone(), &gs.namespace().unwrap());
    let lp = ListParams::default().labels(&format!(
        "{}={}",
        GAME_SERVER_NAME_LABEL,
        gs.metadata.name.as_ref().unwrap()
    ));
    let list = api.list(&lp).await.map_err(Error::InstanceListFailed)?;
    Ok(list
        .items
        .into_iter()
        .filter(|i| is_controlled_by(&i.metadata, gs))
        .collect())
}

/// Ensures one GameServerInstance per session slot exists.
async fn reconcile_instances(gs: &GameServer, client: &Client) -> Result<(), Error> {
    let api = Api::<GameServerInstance>::namespaced(client.clone(), &gs.namespace().unwrap());
    let gs_name = gs.metadata.name.as_ref().unwrap();

    for i in 0..gs.spec.instances {
        let instance_name = format!("{}-{}", gs_name, i);
        let existing = api
            .get_opt(&instance_name)
            .await
            .map_err(Error::InstanceGetFailed)?
            .filter(|instance| is_controlled_by(&instance.metadata, gs));

        if existing.is_none() {
            info!(id = i, "reconcile: creating gameserverinstance");
            let instance = instance_build(gs, i);
            match api.create(&PostParams::default(), &instance).await {
                Err(e) => match e {
                    kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
                        if reason.clone() == "AlreadyExists" => {}
                    _ => return Err(Error::InstanceCreationFailed(e)),
                },
                Ok(_) => {}
            }
        }
    }

    Ok(())
}

fn state_reason(gs: &GameServer) -> String {
    gs.state().map(|s| s.to_string()).unwrap_or_default()
}

async fn publish(recorder: &Recorder, reason: &str, action: &str, note: String) {
    let event = Event {
        type_: EventType::Normal,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        warn!("failed to publish event: {}", e);
    }
}
