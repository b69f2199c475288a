use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// GameServerInstance represents a single game session hosted by one
/// GameServer. Its internal lifecycle is driven from inside the pod; the
/// operator only materializes one instance per index.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "singularity.innit.gg", version = "v1", kind = "GameServerInstance")]
#[kube(namespaced, status = "GameServerInstanceStatus", shortname = "gsi")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GameServerInstanceSpec {
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GameServerInstanceState {
    /// The instance is starting up.
    Starting,
    /// The instance is ready to accept players.
    Ready,
    /// The instance is currently running a game.
    Allocated,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerInstanceStatus {
    pub state: GameServerInstanceState,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct GameServerInstanceTemplate {
    #[serde(default)]
    pub metadata: metav1::ObjectMeta,
    #[serde(default)]
    pub spec: GameServerInstanceSpec,
}
