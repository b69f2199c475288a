use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::common::{is_controlled_by, Data};
use crate::gameserver_types::{sort_newest_first, GameServer, GameServerState, GameServerStatus};
use crate::gameserverset_types::{
    GameServerSet, GameServerSetStatus, GAME_SERVER_SET_NAME_LABEL,
};
use crate::parallelism::{list_channel, new_game_servers_channel, parallelize};

/// Creation/deletion bounds per reconcile, sized to preserve API server
/// throughput headroom.
pub const MAX_CREATION_PARALLELISM: usize = 16;
pub const MAX_CREATIONS_PER_BATCH: i32 = 64;
pub const MAX_DELETION_PARALLELISM: usize = 64;
pub const MAX_DELETIONS_PER_BATCH: i32 = 64;

/// Maximum number of not-yet-running pods per GameServerSet.
pub const MAX_PENDING_PODS: i32 = 5000;

const RESYNC_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to list GameServers: {0}")]
    GameServerListFailed(#[source] kube::Error),
    #[error("Failed to create GameServer: {0}")]
    GameServerCreationFailed(#[source] kube::Error),
    #[error("Failed to request GameServer shutdown: {0}")]
    GameServerShutdownFailed(#[source] kube::Error),
    #[error("Failed to update GameServerSet status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to serialize status: {0}")]
    StatusSerializeFailed(#[from] serde_json::Error),
}

/// What one reconcile decided to do about the population.
#[derive(Debug)]
pub struct ReconciliationAction {
    pub create_count: usize,
    pub to_delete: Vec<GameServer>,
    /// A batch bound was hit; the caller must requeue to finish the job.
    pub partial: bool,
}

pub async fn reconcile(gs_set: Arc<GameServerSet>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;
    let name = gs_set.metadata.name.clone().unwrap();

    let list = list_game_servers(&gs_set, client).await?;
    let action = compute_reconciliation_action(&list, gs_set.spec.replicas);
    info!(
        gs_set = %name,
        create = action.create_count,
        delete = action.to_delete.len(),
        partial = action.partial,
        "reconcile action"
    );

    // If the GameServerSet is marked for deletion, don't do anything.
    if gs_set.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(RESYNC_PERIOD));
    }

    let recorder = Recorder::new(client.clone(), ctx.reporter.clone(), gs_set.object_ref(&()));

    if action.create_count > 0 {
        create_game_servers(&gs_set, action.create_count, client, &recorder).await?;
    }

    if !action.to_delete.is_empty() {
        delete_game_servers(&gs_set, action.to_delete, client, &recorder).await?;
    }

    update_status(&gs_set, &list, client).await?;

    if action.partial {
        // We have more work to do; reschedule immediately.
        return Ok(Action::requeue(Duration::ZERO));
    }

    Ok(Action::requeue(RESYNC_PERIOD))
}

pub fn error_policy(_gs_set: Arc<GameServerSet>, _error: &Error, _ctx: Arc<Data>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Lists the GameServers this set actually owns: label-selected, then
/// filtered on the controller reference.
async fn list_game_servers(
    gs_set: &GameServerSet,
    client: &Client,
) -> Result<Vec<GameServer>, Error> {
    let api = Api::<GameServer>::namespaced(client.clone(), &gs_set.namespace().unwrap());
    let lp = ListParams::default().labels(&format!(
        "{}={}",
        GAME_SERVER_SET_NAME_LABEL,
        gs_set.metadata.name.as_ref().unwrap()
    ));
    let list = api.list(&lp).await.map_err(Error::GameServerListFailed)?;
    Ok(list
        .items
        .into_iter()
        .filter(|gs| is_controlled_by(&gs.metadata, gs_set))
        .collect())
}

/// Decides, from the observed population only, how many servers to create
/// and which to cull. Allocated servers counted in the first pass are
/// untouchable; Error/Unhealthy servers go first in the deletion list
/// regardless of age; overshoot is reclaimed newest-first.
pub fn compute_reconciliation_action(list: &[GameServer], target: i32) -> ReconciliationAction {
    let mut up_count: i32 = 0;
    let mut delete_count: i32 = 0;

    // Pods being spun up at this moment; kept below a ceiling so the API
    // server is never asked for more than it can absorb.
    let mut pod_pending: i32 = 0;

    let mut potential_deletions: Vec<&GameServer> = Vec::new();
    let mut to_delete: Vec<&GameServer> = Vec::new();

    fn handle_up<'a>(
        gs: &'a GameServer,
        target: i32,
        up_count: &mut i32,
        delete_count: &mut i32,
        potential_deletions: &mut Vec<&'a GameServer>,
    ) {
        if *up_count >= target {
            *delete_count += 1;
        } else {
            *up_count += 1;
        }
        potential_deletions.push(gs);
    }

    // Pass 1: count allocated servers only, since those can't be touched.
    for gs in list {
        if !gs.is_deletable() {
            up_count += 1;
        }
    }

    // Pass 2: handle all other states.
    for gs in list {
        if !gs.is_deletable() {
            // Already counted above.
            continue;
        }
        if gs.is_being_deleted() {
            continue;
        }

        match gs.state() {
            Some(GameServerState::Creating)
            | Some(GameServerState::Starting)
            | Some(GameServerState::Scheduled) => {
                pod_pending += 1;
                handle_up(gs, target, &mut up_count, &mut delete_count, &mut potential_deletions);
            }
            Some(GameServerState::Error) | Some(GameServerState::Unhealthy) => {
                to_delete.push(gs);
                delete_count -= 1;
            }
            // Ready, transitional and unrecognized states count as up.
            _ => handle_up(gs, target, &mut up_count, &mut delete_count, &mut potential_deletions),
        }
    }

    let mut partial = false;
    let mut add: i32 = 0;

    if up_count < target {
        add = target - up_count;
        let requested = add;

        if add > MAX_CREATIONS_PER_BATCH {
            add = MAX_CREATIONS_PER_BATCH;
        }
        if add + pod_pending > MAX_PENDING_PODS {
            add = (MAX_PENDING_PODS - pod_pending).max(0);
        }
        if requested != add {
            partial = true;
        }
    }

    if delete_count > 0 {
        sort_newest_first(&mut potential_deletions);
        to_delete.extend(potential_deletions.into_iter().take(delete_count as usize));
    }

    if to_delete.len() > MAX_DELETIONS_PER_BATCH as usize {
        to_delete.truncate(MAX_DELETIONS_PER_BATCH as usize);
        partial = true;
    }

    ReconciliationAction {
        create_count: add as usize,
        to_delete: to_delete.into_iter().cloned().collect(),
        partial,
    }
}

async fn create_game_servers(
    gs_set: &GameServerSet,
    count: usize,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    info!(count, "reconcile: creating GameServers");

    let api = Api::<GameServer>::namespaced(client.clone(), &gs_set.namespace().unwrap());
    let producer = new_game_servers_channel(count, gs_set);

    parallelize(producer, MAX_CREATION_PARALLELISM, |gs| {
        let api = api.clone();
        async move {
            let created = api
                .create(&PostParams::default(), &gs)
                .await
                .map_err(Error::GameServerCreationFailed)?;

            publish(
                recorder,
                "SuccessfulCreate",
                "Create",
                format!("Created GameServer: {}", created.metadata.name.unwrap_or_default()),
            )
            .await;
            Ok(())
        }
    })
    .await
}

/// Requests shutdown for each culled server. The set never deletes
/// GameServers itself; flipping the state hands the job to the GameServer
/// controller so drain and companion cleanup cannot be bypassed.
async fn delete_game_servers(
    gs_set: &GameServerSet,
    to_delete: Vec<GameServer>,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    info!(count = to_delete.len(), "reconcile: requesting GameServer shutdown");

    let api = Api::<GameServer>::namespaced(client.clone(), &gs_set.namespace().unwrap());
    let producer = list_channel(to_delete);

    parallelize(producer, MAX_DELETION_PARALLELISM, |gs| {
        let api = api.clone();
        async move {
            let previous = gs
                .state()
                .map(|s| s.to_string())
                .unwrap_or_default();

            let mut gs_copy = gs.clone();
            gs_copy.status = Some(GameServerStatus {
                state: GameServerState::Shutdown,
            });
            let name = gs_copy.metadata.name.clone().unwrap();
            api.replace_status(
                &name,
                &PostParams::default(),
                serde_json::to_vec(&gs_copy)?,
            )
            .await
            .map_err(Error::GameServerShutdownFailed)?;

            publish(
                recorder,
                "SuccessfulDelete",
                "Delete",
                format!("Deleted GameServer in state {}: {}", previous, name),
            )
            .await;
            Ok(())
        }
    })
    .await
}

/// Re-derives the status from the observed list. The action taken this
/// cycle is deliberately not folded in; the changed world is picked up on
/// the next cycle.
pub fn aggregate_status(list: &[GameServer]) -> GameServerSetStatus {
    let mut status = GameServerSetStatus::default();

    for gs in list {
        if gs.is_being_deleted() {
            status.shutdown_replicas += 1;
            // Don't count replicas that are on their way out.
            continue;
        }

        status.replicas += 1;
        match gs.state() {
            Some(GameServerState::Ready) => status.ready_replicas += 1,
            Some(GameServerState::Allocated) => status.allocated_replicas += 1,
            _ => {}
        }
    }

    status
}

async fn update_status(
    gs_set: &GameServerSet,
    list: &[GameServer],
    client: &Client,
) -> Result<(), Error> {
    let status = aggregate_status(list);

    // Only write if the status actually changed.
    if gs_set.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let mut gs_set_copy = gs_set.clone();
    gs_set_copy.status = Some(status);

    let api = Api::<GameServerSet>::namespaced(client.clone(), &gs_set.namespace().unwrap());
    api.replace_status(
        gs_set.metadata.name.as_ref().unwrap(),
        &PostParams::default(),
        serde_json::to_vec(&gs_set_copy)?,
    )
    .await
    .map_err(Error::StatusUpdateFailed)?;

    Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver_types::tests_support::{game_server, game_server_in};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn aged(mut gs: GameServer, date: &str) -> GameServer {
        gs.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::parse_from_rfc3339(date)
                .unwrap()
                .with_timezone(&chrono::Utc),
        ));
        gs
    }

    #[test]
    fn scales_up_to_the_target() {
        let action = compute_reconciliation_action(&[], 5);
        assert_eq!(action.create_count, 5);
        assert!(action.to_delete.is_empty());
        assert!(!action.partial);
    }

    #[test]
    fn large_scale_up_is_clamped_to_the_batch_bound() {
        // First reconcile of a 10000-replica set creates exactly one batch.
        let action = compute_reconciliation_action(&[], 10_000);
        assert_eq!(action.create_count, MAX_CREATIONS_PER_BATCH as usize);
        assert!(action.partial);
    }

    #[test]
    fn pending_pods_throttle_creation() {
        let list: Vec<GameServer> = (0..4990)
            .map(|i| game_server_in(&format!("gs-{}", i), GameServerState::Creating))
            .collect();

        let action = compute_reconciliation_action(&list, 6000);
        // 4990 already pending; only 10 more fit under the ceiling.
        assert_eq!(action.create_count, 10);
        assert!(action.partial);

        let saturated: Vec<GameServer> = (0..5000)
            .map(|i| game_server_in(&format!("gs-{}", i), GameServerState::Creating))
            .collect();
        let action = compute_reconciliation_action(&saturated, 6000);
        assert_eq!(action.create_count, 0);
        assert!(action.partial);
    }

    #[test]
    fn allocated_servers_are_never_culled() {
        let mut list = vec![
            aged(game_server_in("alloc-1", GameServerState::Allocated), "2022-01-01T00:00:00Z"),
            aged(game_server_in("alloc-2", GameServerState::Allocated), "2022-06-01T00:00:00Z"),
            aged(game_server_in("alloc-3", GameServerState::Allocated), "2022-09-01T00:00:00Z"),
        ];
        list.push(aged(game_server_in("ready-1", GameServerState::Ready), "2022-02-01T00:00:00Z"));
        list.push(aged(game_server_in("ready-2", GameServerState::Ready), "2022-03-01T00:00:00Z"));

        let action = compute_reconciliation_action(&list, 2);
        assert_eq!(action.create_count, 0);
        assert_eq!(action.to_delete.len(), 2);
        for gs in &action.to_delete {
            assert_ne!(gs.state(), Some(GameServerState::Allocated));
        }
    }

    #[test]
    fn overshoot_is_reclaimed_newest_first() {
        let list = vec![
            aged(game_server_in("oldest", GameServerState::Ready), "2022-01-01T00:00:00Z"),
            aged(game_server_in("middle", GameServerState::Ready), "2022-02-01T00:00:00Z"),
            aged(game_server_in("newest", GameServerState::Ready), "2022-03-01T00:00:00Z"),
        ];

        let action = compute_reconciliation_action(&list, 1);
        let names: Vec<_> = action
            .to_delete
            .iter()
            .map(|gs| gs.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["newest", "middle"]);
    }

    #[test]
    fn unhealthy_servers_go_first_regardless_of_age() {
        let list = vec![
            aged(game_server_in("unhealthy-old", GameServerState::Unhealthy), "2021-01-01T00:00:00Z"),
            aged(game_server_in("ready-new", GameServerState::Ready), "2022-06-01T00:00:00Z"),
        ];

        let action = compute_reconciliation_action(&list, 2);
        assert_eq!(
            action.to_delete[0].metadata.name.as_deref(),
            Some("unhealthy-old")
        );
        // The unhealthy server is replaced, not just removed.
        assert_eq!(action.create_count, 1);
    }

    #[test]
    fn servers_already_leaving_are_ignored() {
        let mut terminating = game_server_in("leaving", GameServerState::Ready);
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let shutdown = game_server_in("shutdown", GameServerState::Shutdown);

        let action = compute_reconciliation_action(&[terminating, shutdown], 2);
        assert_eq!(action.create_count, 2);
        assert!(action.to_delete.is_empty());
    }

    #[test]
    fn deletions_are_clamped_to_the_batch_bound() {
        let list: Vec<GameServer> = (0..200)
            .map(|i| {
                aged(
                    game_server_in(&format!("gs-{}", i), GameServerState::Ready),
                    &format!("2022-01-01T00:{:02}:{:02}Z", i / 60, i % 60),
                )
            })
            .collect();

        let action = compute_reconciliation_action(&list, 0);
        assert_eq!(action.to_delete.len(), MAX_DELETIONS_PER_BATCH as usize);
        assert!(action.partial);
    }

    #[test]
    fn unset_state_counts_as_up() {
        let list = vec![game_server("fresh")];
        let action = compute_reconciliation_action(&list, 1);
        assert_eq!(action.create_count, 0);
        assert!(action.to_delete.is_empty());
    }

    #[test]
    fn status_reflects_the_observed_population() {
        let mut terminating = game_server_in("leaving", GameServerState::Ready);
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let list = vec![
            game_server_in("ready", GameServerState::Ready),
            game_server_in("allocated", GameServerState::Allocated),
            game_server_in("starting", GameServerState::Starting),
            game_server_in("shutdown", GameServerState::Shutdown),
            terminating,
        ];

        let status = aggregate_status(&list);
        assert_eq!(status.replicas, 3);
        assert_eq!(status.ready_replicas, 1);
        assert_eq!(status.allocated_replicas, 1);
        assert_eq!(status.shutdown_replicas, 2);
    }

    #[test]
    fn idempotent_on_a_settled_population() {
        let list = vec![
            game_server_in("a", GameServerState::Ready),
            game_server_in("b", GameServerState::Ready),
        ];

        let action = compute_reconciliation_action(&list, 2);
        assert_eq!(action.create_count, 0);
        assert!(action.to_delete.is_empty());
        assert!(!action.partial);

        // A second pass over the same observation decides the same nothing.
        let again = compute_reconciliation_action(&list, 2);
        assert_eq!(again.create_count, 0);
        assert!(again.to_delete.is_empty());
    }
}
