use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use std::collections::BTreeMap;

use crate::common::GROUP_NAME;
use crate::gameserver_types::{GameServer, GAME_SERVER_NAME_LABEL};

/// The scoped Role for a game server pod: it may only touch its own
/// GameServer and Pod objects, nothing else in the namespace.
pub fn role_build(gs: &GameServer) -> rbacv1::Role {
    let name = gs.metadata.name.clone().unwrap();
    let verbs = vec![
        "get".to_string(),
        "update".to_string(),
        "patch".to_string(),
        "list".to_string(),
        "watch".to_string(),
    ];

    rbacv1::Role {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: gs.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                GAME_SERVER_NAME_LABEL.to_string(),
                name.clone(),
            )])),
            owner_references: Some(vec![gs.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        rules: Some(vec![
            rbacv1::PolicyRule {
                api_groups: Some(vec![GROUP_NAME.to_string()]),
                resources: Some(vec![
                    "gameservers".to_string(),
                    "gameservers/status".to_string(),
                ]),
                resource_names: Some(vec![name.clone()]),
                verbs: verbs.clone(),
                ..rbacv1::PolicyRule::default()
            },
            rbacv1::PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["pods".to_string(), "pods/status".to_string()]),
                resource_names: Some(vec![name]),
                verbs,
                ..rbacv1::PolicyRule::default()
            },
        ]),
        ..rbacv1::Role::default()
    }
}
