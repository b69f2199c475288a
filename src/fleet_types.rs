use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::SchedulingStrategy;
use crate::gameserver_types::GameServerTemplate;
use crate::gameserverset_types::{GameServerSet, GameServerSetSpec};

/// Label key carrying the name of the Fleet which owns resources like
/// GameServerSet and GameServer.
pub const FLEET_NAME_LABEL: &str = "singularity.innit.gg/fleet";

/// The only deployment strategy currently understood by the fleet
/// controller. Anything else halts the fleet until the user fixes it.
pub const ROLLING_UPDATE_STRATEGY: &str = "RollingUpdate";

/// Fleet is an operator-authored desired population of GameServers of one
/// logical role, versioned by its template.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "singularity.innit.gg", version = "v1", kind = "Fleet")]
#[kube(namespaced, status = "FleetStatus", shortname = "flt")]
#[kube(scale = r#"{"specReplicasPath": ".spec.replicas", "statusReplicasPath": ".status.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Scheduling", "type":"string", "jsonPath":".spec.scheduling"}"#)]
#[kube(printcolumn = r#"{"name":"Desired", "type":"string", "jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Current", "type":"string", "jsonPath":".status.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub strategy: FleetStrategy,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    pub template: GameServerTemplate,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStrategy {
    /// Strategy kind; kept as a free-form string so an unknown kind is a
    /// reconcile-time error rather than a rejected manifest.
    #[serde(rename = "type", default = "default_strategy_type")]
    pub type_: String,
    #[serde(default)]
    pub rolling_update: FleetStrategyRollingUpdate,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStrategyRollingUpdate {
    #[serde(default = "default_rolling_update_tolerance")]
    pub max_surge: IntOrString,
    #[serde(default = "default_rolling_update_tolerance")]
    pub max_unavailable: IntOrString,
}

fn default_strategy_type() -> String {
    ROLLING_UPDATE_STRATEGY.to_string()
}

fn default_rolling_update_tolerance() -> IntOrString {
    IntOrString::String("25%".to_string())
}

impl Default for FleetStrategy {
    fn default() -> Self {
        FleetStrategy {
            type_: default_strategy_type(),
            rolling_update: FleetStrategyRollingUpdate::default(),
        }
    }
}

impl Default for FleetStrategyRollingUpdate {
    fn default() -> Self {
        FleetStrategyRollingUpdate {
            max_surge: default_rolling_update_tolerance(),
            max_unavailable: default_rolling_update_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub allocated_replicas: i32,
    pub instances: i32,
    pub ready_instances: i32,
    pub allocated_instances: i32,
}

impl Fleet {
    /// Builds a new generation for this fleet: an unsaved GameServerSet
    /// carrying a frozen copy of the fleet's template. The API server
    /// assigns the name (`generateName`).
    pub fn game_server_set(&self) -> GameServerSet {
        let mut gs_set = GameServerSet {
            metadata: self.spec.template.metadata.clone(),
            spec: GameServerSetSpec {
                replicas: 0,
                scheduling: self.spec.scheduling.clone(),
                template: self.spec.template.clone(),
            },
            status: None,
        };

        let name = self.metadata.name.clone().unwrap();
        gs_set.metadata.generate_name = Some(format!("{}-", name));
        gs_set.metadata.name = None;
        gs_set.metadata.namespace = self.metadata.namespace.clone();
        gs_set.metadata.resource_version = None;
        gs_set.metadata.uid = None;

        gs_set
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(self.controller_owner_ref(&()).unwrap());

        gs_set
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(FLEET_NAME_LABEL.to_string(), name);

        gs_set
    }

    /// Whichever is smaller, `i` or the fleet's desired replicas.
    pub fn upper_bound_replicas(&self, i: i32) -> i32 {
        i.min(self.spec.replicas)
    }

    /// `i` floored at zero.
    pub fn lower_bound_replicas(&self, i: i32) -> i32 {
        i.max(0)
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::fleet;
    use super::*;

    #[test]
    fn new_generation_is_unsaved_and_owned() {
        let f = fleet("lobby", 3, crate::gameserver_types::tests_support::template("game:1"));
        let gs_set = f.game_server_set();

        assert_eq!(gs_set.metadata.name, None);
        assert_eq!(gs_set.metadata.uid, None);
        assert_eq!(gs_set.metadata.generate_name.as_deref(), Some("lobby-"));
        assert_eq!(gs_set.spec.replicas, 0);
        assert!(gs_set.spec.template.semantically_equals(&f.spec.template));

        let labels = gs_set.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(FLEET_NAME_LABEL).map(String::as_str), Some("lobby"));

        let owner = crate::common::controller_of(&gs_set.metadata).unwrap();
        assert_eq!(owner.kind, "Fleet");
        assert_eq!(owner.name, "lobby");
    }

    #[test]
    fn replica_bounds() {
        let f = fleet("lobby", 5, crate::gameserver_types::tests_support::template("game:1"));
        assert_eq!(f.upper_bound_replicas(9), 5);
        assert_eq!(f.upper_bound_replicas(2), 2);
        assert_eq!(f.lower_bound_replicas(-3), 0);
        assert_eq!(f.lower_bound_replicas(3), 3);
    }

    #[test]
    fn strategy_defaults_to_rolling_update() {
        let strategy = FleetStrategy::default();
        assert_eq!(strategy.type_, ROLLING_UPDATE_STRATEGY);
        assert_eq!(
            strategy.rolling_update.max_surge,
            IntOrString::String("25%".to_string())
        );
    }
}
