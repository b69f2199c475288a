use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::common::{is_controlled_by, Data};
use crate::fleet_types::{Fleet, FleetStatus, FLEET_NAME_LABEL, ROLLING_UPDATE_STRATEGY};
use crate::gameserverset_types::{GameServerSet, GameServerSetStatus};
use crate::rolling::{
    plan_scale_down, rolling_update_active, scale_down_budget, RollingUpdateError,
};

const RESYNC_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to list GameServerSets: {0}")]
    GameServerSetListFailed(#[source] kube::Error),
    #[error("Failed to create GameServerSet: {0}")]
    GameServerSetCreationFailed(#[source] kube::Error),
    #[error("Failed to update GameServerSet: {0}")]
    GameServerSetUpdateFailed(#[source] kube::Error),
    #[error("Failed to delete GameServerSet: {0}")]
    GameServerSetDeleteFailed(#[source] kube::Error),
    #[error("Failed to update status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to serialize status: {0}")]
    StatusSerializeFailed(#[from] serde_json::Error),
    #[error("unexpected deployment strategy type: {0}")]
    UnknownStrategy(String),
    #[error(transparent)]
    RollingUpdateFailed(#[from] RollingUpdateError),
}

pub async fn reconcile(fleet: Arc<Fleet>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;
    let name = fleet.metadata.name.clone().unwrap();
    info!(fleet = %name, "reconcile");

    // If the Fleet is marked for deletion, don't do anything; ownership
    // cascades take the GameServerSets with it.
    if fleet.metadata.deletion_timestamp.is_some() {
        return Ok(Action::requeue(RESYNC_PERIOD));
    }

    let recorder = Recorder::new(client.clone(), ctx.reporter.clone(), fleet.object_ref(&()));

    let list = list_game_server_sets(&fleet, client).await?;
    let (active, rest) = partition_active(&fleet, list);

    // If there isn't an active generation, synthesize one; it is only
    // applied to the cluster in the upsert step below.
    let active = match active {
        Some(active) => active,
        None => {
            info!(fleet = %name, "reconcile: new generation required");
            fleet.game_server_set()
        }
    };

    let replicas = handle_deployment(&fleet, &active, &rest, client, &recorder).await?;

    delete_empty_game_server_sets(&fleet, &rest, client, &recorder).await?;

    upsert_game_server_set(&fleet, &active, replicas, client, &recorder).await?;

    update_status(&fleet, client).await?;

    Ok(Action::requeue(RESYNC_PERIOD))
}

pub fn error_policy(_fleet: Arc<Fleet>, _error: &Error, _ctx: Arc<Data>) -> Action {
    Action::requeue(Duration::from_secs(5))
}

/// Lists the GameServerSets this fleet actually owns.
async fn list_game_server_sets(fleet: &Fleet, client: &Client) -> Result<Vec<GameServerSet>, Error> {
    let api = Api::<GameServerSet>::namespaced(client.clone(), &fleet.namespace().unwrap());
    let lp = ListParams::default().labels(&format!(
        "{}={}",
        FLEET_NAME_LABEL,
        fleet.metadata.name.as_ref().unwrap()
    ));
    let list = api
        .list(&lp)
        .await
        .map_err(Error::GameServerSetListFailed)?;
    Ok(list
        .items
        .into_iter()
        .filter(|set| is_controlled_by(&set.metadata, fleet))
        .collect())
}

/// Splits the owned sets into the active generation (template semantically
/// equal to the fleet's) and the rest. When several match, the oldest wins
/// and the younger duplicates drain away with the rest.
pub fn partition_active(
    fleet: &Fleet,
    mut list: Vec<GameServerSet>,
) -> (Option<GameServerSet>, Vec<GameServerSet>) {
    list.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
    });

    let mut active = None;
    let mut rest = Vec::new();

    for set in list {
        if active.is_none() && set.spec.template.semantically_equals(&fleet.spec.template) {
            active = Some(set);
        } else {
            rest.push(set);
        }
    }

    (active, rest)
}

/// Performs the configured deployment strategy and returns the replica
/// target for the active generation.
async fn handle_deployment(
    fleet: &Fleet,
    active: &GameServerSet,
    rest: &[GameServerSet],
    client: &Client,
    recorder: &Recorder,
) -> Result<i32, Error> {
    if rest.is_empty() {
        // Only one generation matches the desired state; nothing to roll.
        return Ok(fleet.spec.replicas);
    }

    match fleet.spec.strategy.type_.as_str() {
        ROLLING_UPDATE_STRATEGY => {
            let replicas = rolling_update_active(fleet, active, rest)?;
            handle_rolling_update_rest(fleet, active, rest, client, recorder).await?;
            Ok(replicas)
        }
        other => Err(Error::UnknownStrategy(other.to_string())),
    }
}

/// Scales down old generations within the availability budget. Update
/// failures here are not propagated; the sets may have been touched
/// elsewhere and the next cycle starts from a fresh read anyway.
async fn handle_rolling_update_rest(
    fleet: &Fleet,
    active: &GameServerSet,
    rest: &[GameServerSet],
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    let budget = scale_down_budget(fleet, active, rest)?;
    if budget <= 0 {
        // We don't have the room to scale down.
        return Ok(());
    }

    let api = Api::<GameServerSet>::namespaced(client.clone(), &fleet.namespace().unwrap());
    for step in plan_scale_down(rest, budget) {
        let set = match rest.iter().find(|s| s.metadata.name.as_deref() == Some(step.name.as_str())) {
            Some(set) => set,
            None => continue,
        };

        let mut set_copy = set.clone();
        set_copy.spec.replicas = step.to;
        if let Err(e) = api.replace(&step.name, &PostParams::default(), &set_copy).await {
            warn!(gs_set = %step.name, "reconcile: error scaling down inactive GameServerSet: {}", e);
            return Ok(());
        }

        publish(
            recorder,
            "ScalingGameServerSet",
            "Scale",
            format!(
                "Scaling inactive GameServerSet {} from {} to {}",
                step.name, step.from, step.to
            ),
        )
        .await;
    }

    Ok(())
}

/// Deletes all inactive GameServerSets whose population has fully drained.
async fn delete_empty_game_server_sets(
    fleet: &Fleet,
    rest: &[GameServerSet],
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    let api = Api::<GameServerSet>::namespaced(client.clone(), &fleet.namespace().unwrap());

    for set in rest {
        let status = set.status.clone().unwrap_or_default();
        if status.replicas == 0 && status.shutdown_replicas == 0 {
            let name = set.metadata.name.clone().unwrap();
            api.delete(&name, &DeleteParams::background())
                .await
                .map_err(Error::GameServerSetDeleteFailed)?;

            publish(
                recorder,
                "DeletingGameServerSet",
                "Delete",
                format!("Deleting inactive GameServerSet {}", name),
            )
            .await;
        }
    }

    Ok(())
}

/// Inserts the new active generation if it has not been saved yet, or
/// brings the live one to the computed replica target.
async fn upsert_game_server_set(
    fleet: &Fleet,
    active: &GameServerSet,
    replicas: i32,
    client: &Client,
    recorder: &Recorder,
) -> Result<(), Error> {
    let api = Api::<GameServerSet>::namespaced(client.clone(), &fleet.namespace().unwrap());

    if active.metadata.uid.is_none() {
        let mut fresh = active.clone();
        fresh.spec.replicas = replicas;

        let created = api
            .create(&PostParams::default(), &fresh)
            .await
            .map_err(Error::GameServerSetCreationFailed)?;

        let mut created_copy = created.clone();
        created_copy.status = Some(GameServerSetStatus::default());
        let name = created_copy.metadata.name.clone().unwrap();
        api.replace_status(
            &name,
            &PostParams::default(),
            serde_json::to_vec(&created_copy)?,
        )
        .await
        .map_err(Error::StatusUpdateFailed)?;

        publish(
            recorder,
            "CreatingGameServerSet",
            "Create",
            format!("Created GameServerSet {}", name),
        )
        .await;

        return Ok(());
    }

    if replicas != active.spec.replicas || active.spec.scheduling != fleet.spec.scheduling {
        let mut active_copy = active.clone();
        active_copy.spec.replicas = replicas;
        active_copy.spec.scheduling = fleet.spec.scheduling.clone();

        let name = active_copy.metadata.name.clone().unwrap();
        api.replace(&name, &PostParams::default(), &active_copy)
            .await
            .map_err(Error::GameServerSetUpdateFailed)?;

        publish(
            recorder,
            "ScalingGameServerSet",
            "Scale",
            format!(
                "Scaling active GameServerSet {} from {} to {}",
                name, active.spec.replicas, replicas
            ),
        )
        .await;
    }

    Ok(())
}

/// Aggregates the owned sets' statuses into the fleet status.
pub fn aggregate_status(list: &[GameServerSet]) -> FleetStatus {
    let mut status = FleetStatus::default();

    for set in list {
        let set_status = set.status.clone().unwrap_or_default();
        status.replicas += set_status.replicas;
        status.ready_replicas += set_status.ready_replicas;
        status.allocated_replicas += set_status.allocated_replicas;
        status.instances += set_status.instances;
        status.ready_instances += set_status.ready_instances;
        status.allocated_instances += set_status.allocated_instances;
    }

    status
}

async fn update_status(fleet: &Fleet, client: &Client) -> Result<(), Error> {
    let list = list_game_server_sets(fleet, client).await?;
    let status = aggregate_status(&list);

    // Only write if the status actually changed.
    if fleet.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let mut fleet_copy = fleet.clone();
    fleet_copy.status = Some(status);

    let api = Api::<Fleet>::namespaced(client.clone(), &fleet.namespace().unwrap());
    api.replace_status(
        fleet.metadata.name.as_ref().unwrap(),
        &PostParams::default(),
        serde_json::to_vec(&fleet_copy)?,
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
    use crate::fleet_types::tests_support::fleet;
    use crate::gameserver_types::tests_support::template;
    use crate::gameserverset_types::tests_support::set;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn aged(mut gs_set: GameServerSet, date: &str) -> GameServerSet {
        gs_set.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::parse_from_rfc3339(date)
                .unwrap()
                .with_timezone(&chrono::Utc),
        ));
        gs_set
    }

    #[test]
    fn the_matching_generation_is_active() {
        let f = fleet("lobby", 3, template("game:2"));
        let old = set("lobby-old", "lobby", template("game:1").spec);
        let new = set("lobby-new", "lobby", template("game:2").spec);

        let (active, rest) = partition_active(&f, vec![old, new]);
        assert_eq!(active.unwrap().metadata.name.as_deref(), Some("lobby-new"));
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].metadata.name.as_deref(), Some("lobby-old"));
    }

    #[test]
    fn no_match_means_no_active() {
        let f = fleet("lobby", 3, template("game:3"));
        let old = set("lobby-old", "lobby", template("game:1").spec);

        let (active, rest) = partition_active(&f, vec![old]);
        assert!(active.is_none());
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn oldest_duplicate_wins() {
        let f = fleet("lobby", 3, template("game:2"));
        let younger = aged(
            set("lobby-young", "lobby", template("game:2").spec),
            "2022-06-01T00:00:00Z",
        );
        let older = aged(
            set("lobby-old", "lobby", template("game:2").spec),
            "2022-01-01T00:00:00Z",
        );

        let (active, rest) = partition_active(&f, vec![younger, older]);
        assert_eq!(active.unwrap().metadata.name.as_deref(), Some("lobby-old"));
        assert_eq!(rest[0].metadata.name.as_deref(), Some("lobby-young"));
    }

    #[test]
    fn statuses_sum_across_generations() {
        let mut a = set("lobby-a", "lobby", template("game:1").spec);
        a.status = Some(GameServerSetStatus {
            replicas: 2,
            ready_replicas: 1,
            allocated_replicas: 1,
            ..Default::default()
        });
        let mut b = set("lobby-b", "lobby", template("game:2").spec);
        b.status = Some(GameServerSetStatus {
            replicas: 3,
            ready_replicas: 3,
            ..Default::default()
        });

        let status = aggregate_status(&[a, b]);
        assert_eq!(status.replicas, 5);
        assert_eq!(status.ready_replicas, 4);
        assert_eq!(status.allocated_replicas, 1);
    }

    #[test]
    fn unsaved_generation_carries_no_status() {
        let f = fleet("lobby", 3, template("game:2"));
        let (active, _) = partition_active(&f, Vec::new());
        assert!(active.is_none());

        let synthesized = f.game_server_set();
        assert!(synthesized.metadata.uid.is_none());
        assert!(synthesized.status.is_none());
    }
}
