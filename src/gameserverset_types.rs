use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::SchedulingStrategy;
use crate::fleet_types::FLEET_NAME_LABEL;
use crate::gameserver_types::{GameServer, GameServerTemplate};

/// Label key carrying the name of the GameServerSet which owns a
/// GameServer; the canonical index for listing a generation's population.
pub const GAME_SERVER_SET_NAME_LABEL: &str = "singularity.innit.gg/gameserverset";

/// GameServerSet owns the population of one template generation of a
/// Fleet: how many GameServers exist, which to create, which to cull.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "singularity.innit.gg", version = "v1", kind = "GameServerSet")]
#[kube(namespaced, status = "GameServerSetStatus", shortname = "gss")]
#[kube(scale = r#"{"specReplicasPath": ".spec.replicas", "statusReplicasPath": ".status.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Scheduling", "type":"string", "jsonPath":".spec.scheduling"}"#)]
#[kube(printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#)]
#[kube(printcolumn = r#"{"name":"Allocated", "type":"integer", "jsonPath":".status.allocatedReplicas"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    pub template: GameServerTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub allocated_replicas: i32,
    pub shutdown_replicas: i32,
    pub instances: i32,
    pub ready_instances: i32,
    pub allocated_instances: i32,
    pub shutdown_instances: i32,
}

impl GameServerSet {
    /// Builds one GameServer from this set's template. The name is left to
    /// the API server (`generateName`), the controller reference and the
    /// fleet/set labels make the new server discoverable and owned.
    pub fn game_server(&self) -> GameServer {
        let mut gs = GameServer {
            metadata: self.spec.template.metadata.clone(),
            spec: self.spec.template.spec.clone(),
            status: None,
        };
        gs.spec.scheduling = self.spec.scheduling.clone();

        let name = self.metadata.name.clone().unwrap();
        gs.metadata.generate_name = Some(format!("{}-", name));
        gs.metadata.name = None;
        gs.metadata.namespace = self.metadata.namespace.clone();
        gs.metadata.resource_version = None;
        gs.metadata.uid = None;

        let labels = gs.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(
            FLEET_NAME_LABEL.to_string(),
            self.labels().get(FLEET_NAME_LABEL).cloned().unwrap_or_default(),
        );
        labels.insert(GAME_SERVER_SET_NAME_LABEL.to_string(), name);

        gs.metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(self.controller_owner_ref(&()).unwrap());

        gs
    }
}

pub fn count_status_replicas(list: &[GameServerSet]) -> i32 {
    list.iter()
        .map(|set| set.status.as_ref().map_or(0, |s| s.replicas))
        .sum()
}

pub fn count_status_ready_replicas(list: &[GameServerSet]) -> i32 {
    list.iter()
        .map(|set| set.status.as_ref().map_or(0, |s| s.ready_replicas))
        .sum()
}

pub fn count_status_allocated_replicas(list: &[GameServerSet]) -> i32 {
    list.iter()
        .map(|set| set.status.as_ref().map_or(0, |s| s.allocated_replicas))
        .sum()
}

pub fn count_spec_replicas(list: &[GameServerSet]) -> i32 {
    list.iter().map(|set| set.spec.replicas).sum()
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::gameserver_types::GameServerSpec;

    pub(crate) fn set(name: &str, fleet: &str, spec: GameServerSpec) -> GameServerSet {
        let mut gs_set = GameServerSet::new(
            name,
            GameServerSetSpec {
                replicas: 0,
                scheduling: SchedulingStrategy::Packed,
                template: GameServerTemplate {
                    metadata: metav1::ObjectMeta::default(),
                    spec,
                },
            },
        );
        gs_set.metadata.namespace = Some("default".to_string());
        gs_set.metadata.uid = Some(format!("uid-{}", name));
        gs_set.metadata.labels = Some(BTreeMap::from([(
            FLEET_NAME_LABEL.to_string(),
            fleet.to_string(),
        )]));
        gs_set
    }
}
