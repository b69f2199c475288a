use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::Reporter;
use kube::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API group served by the operator.
pub const GROUP_NAME: &str = "singularity.innit.gg";

/// Label carrying the role of an owned object. Pods backing a game server
/// are labelled `singularity.innit.gg/role=gameserver`.
pub const ROLE_LABEL: &str = "singularity.innit.gg/role";

/// How the cluster should spread game server pods across nodes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SchedulingStrategy {
    Packed,
    Distributed,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        SchedulingStrategy::Packed
    }
}

/// How a game server port is exposed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PortPolicy {
    Internal,
    Dynamic,
}

impl Default for PortPolicy {
    fn default() -> Self {
        PortPolicy::Internal
    }
}

/// Context shared by all reconcilers.
pub struct Data {
    pub client: Client,
    pub reporter: Reporter,
}

#[derive(Debug, Error)]
#[error("invalid scale value: {0}")]
pub struct InvalidScaleValue(pub String);

/// Resolves an int-or-percent value against a total, the way rolling-update
/// tolerances are declared. Percent strings must carry a `%` suffix;
/// anything else is a user error surfaced to the caller.
pub fn scaled_value_from_int_or_percent(
    value: &IntOrString,
    total: i32,
    round_up: bool,
) -> Result<i32, InvalidScaleValue> {
    match value {
        IntOrString::Int(i) => Ok(*i),
        IntOrString::String(s) => {
            let percent = s
                .strip_suffix('%')
                .and_then(|p| p.trim().parse::<i64>().ok())
                .ok_or_else(|| InvalidScaleValue(s.clone()))?;
            let scaled = percent * total as i64;
            let value = if round_up {
                (scaled + 99) / 100
            } else {
                scaled / 100
            };
            Ok(value as i32)
        }
    }
}

/// Returns the controller owner reference of an object, if any.
pub fn controller_of(meta: &metav1::ObjectMeta) -> Option<&metav1::OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether `meta` names `owner` as its controller. Matches on UID, so an
/// object adopted under a recreated owner of the same name does not count.
pub fn is_controlled_by<K: kube::Resource>(meta: &metav1::ObjectMeta, owner: &K) -> bool {
    match (controller_of(meta), owner.meta().uid.as_ref()) {
        (Some(r), Some(uid)) => &r.uid == uid,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_values_pass_through() {
        assert_eq!(
            scaled_value_from_int_or_percent(&IntOrString::Int(3), 10, true).unwrap(),
            3
        );
        assert_eq!(
            scaled_value_from_int_or_percent(&IntOrString::Int(0), 10, false).unwrap(),
            0
        );
    }

    #[test]
    fn percent_rounds_up_and_down() {
        let quarter = IntOrString::String("25%".to_string());
        assert_eq!(scaled_value_from_int_or_percent(&quarter, 4, true).unwrap(), 1);
        assert_eq!(scaled_value_from_int_or_percent(&quarter, 4, false).unwrap(), 1);

        let tenth = IntOrString::String("10%".to_string());
        assert_eq!(scaled_value_from_int_or_percent(&tenth, 15, true).unwrap(), 2);
        assert_eq!(scaled_value_from_int_or_percent(&tenth, 15, false).unwrap(), 1);
    }

    #[test]
    fn malformed_percent_is_an_error() {
        assert!(scaled_value_from_int_or_percent(&IntOrString::String("50".into()), 10, true).is_err());
        assert!(scaled_value_from_int_or_percent(&IntOrString::String("abc%".into()), 10, true).is_err());
    }

    #[test]
    fn controller_matching_requires_uid() {
        let mut meta = metav1::ObjectMeta::default();
        assert!(controller_of(&meta).is_none());

        meta.owner_references = Some(vec![metav1::OwnerReference {
            api_version: "singularity.innit.gg/v1".to_string(),
            kind: "GameServerSet".to_string(),
            name: "lobby-abcde".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..metav1::OwnerReference::default()
        }]);
        assert_eq!(controller_of(&meta).unwrap().uid, "uid-1");
    }
}
