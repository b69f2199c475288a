use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{PortPolicy, SchedulingStrategy};
use crate::gameserverinstance_types::GameServerInstanceTemplate;

/// The `singularity.innit.gg/role` label value carried by pods backing a
/// game server.
pub const GAME_SERVER_ROLE: &str = "gameserver";

/// Label key carrying the name of the GameServer that owns a companion
/// object (Pod, Role, ServiceAccount, RoleBinding, GameServerInstance).
pub const GAME_SERVER_NAME_LABEL: &str = "singularity.innit.gg/fleet";

/// Environment variable telling the in-pod process its own GameServer name.
pub const GAME_SERVER_ENV_NAME: &str = "SINGULARITY_GAMESERVER_NAME";
/// Environment variable telling the in-pod process its own namespace.
pub const GAME_SERVER_ENV_NAMESPACE: &str = "SINGULARITY_GAMESERVER_NAMESPACE";

/// GameServer is a single long-lived server process: a Pod, its identity
/// objects and a lifecycle state.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "singularity.innit.gg", version = "v1", kind = "GameServer")]
#[kube(namespaced, status = "GameServerStatus", shortname = "gs")]
#[kube(printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Desired", "type":"string", "jsonPath":".spec.instances"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    #[serde(rename = "type")]
    pub type_: GameServerType,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    #[serde(default)]
    pub drain_strategy: GameServerDrainStrategy,
    #[serde(default)]
    pub ports: Vec<GameServerPort>,
    #[serde(default)]
    pub instances: i32,
    #[serde(default)]
    pub instance_template: GameServerInstanceTemplate,
    pub template: corev1::PodTemplateSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GameServerType {
    /// A server which utilizes the allocation system.
    Game,
    /// A stateless server.
    Ephemeral,
    /// A server which is manually controlled by the user.
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum GameServerState {
    /// The backing Pod is not yet created.
    Creating,
    /// The Pod is created, but not yet scheduled.
    Starting,
    /// The Pod is scheduled in the cluster, basically belonging to a Node.
    Scheduled,
    /// The server is requesting to be Ready.
    RequestReady,
    /// The server is ready to accept players (and optionally Allocated).
    Ready,
    /// The server has been allocated and shall not be removed.
    Allocated,
    /// The server is no longer accepting new players, and is waiting for
    /// existing instances to be shut down.
    Drain,
    /// The server has shut down and everything has to be removed from the
    /// cluster.
    Shutdown,
    /// Something irrecoverable occurred.
    Error,
    /// The server failed its health checks.
    Unhealthy,
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GameServerState::Creating => "Creating",
            GameServerState::Starting => "Starting",
            GameServerState::Scheduled => "Scheduled",
            GameServerState::RequestReady => "RequestReady",
            GameServerState::Ready => "Ready",
            GameServerState::Allocated => "Allocated",
            GameServerState::Drain => "Drain",
            GameServerState::Shutdown => "Shutdown",
            GameServerState::Error => "Error",
            GameServerState::Unhealthy => "Unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerStatus {
    pub state: GameServerState,
}

/// Thresholds under which a draining server is considered finished, plus an
/// upper bound on how long the drain may take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerDrainStrategy {
    /// Seconds after which a draining server is shut down regardless of
    /// remaining sessions. Zero disables the timeout.
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub instances: i32,
    #[serde(default)]
    pub ready_instances: i32,
    #[serde(default)]
    pub allocated_instances: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    pub name: String,
    #[serde(default)]
    pub port_policy: PortPolicy,
    pub container_port: String,
}

/// The template a ServerSet stamps out GameServers from. Generation
/// identity is defined by semantic equality on this value.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GameServerTemplate {
    #[serde(default)]
    pub metadata: metav1::ObjectMeta,
    pub spec: GameServerSpec,
}

impl GameServerTemplate {
    /// Semantic equality: only the operator-authored parts of the template
    /// participate. Server-assigned metadata (name, uid, resourceVersion,
    /// timestamps) never does.
    pub fn semantically_equals(&self, other: &GameServerTemplate) -> bool {
        canonical_template(self) == canonical_template(other)
    }
}

fn canonical_template(template: &GameServerTemplate) -> serde_json::Value {
    serde_json::json!({
        "labels": template.metadata.labels,
        "annotations": template.metadata.annotations,
        "spec": template.spec,
    })
}

impl GameServer {
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().map(|s| s.state)
    }

    /// Whether the population controller may remove this server. An
    /// Allocated server that is not already terminating is untouchable.
    pub fn is_deletable(&self) -> bool {
        if self.state() == Some(GameServerState::Allocated) {
            return self.metadata.deletion_timestamp.is_some();
        }
        true
    }

    /// Whether the server is already on its way out, either through the
    /// API (deletion timestamp) or through the state machine (Shutdown).
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some() || self.state() == Some(GameServerState::Shutdown)
    }
}

/// Orders servers newest-created first, so culling prefers the youngest
/// and leaves long-lived servers (which may become Allocated) alone.
pub fn sort_newest_first(list: &mut [&GameServer]) {
    list.sort_by(|a, b| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
    });
}
