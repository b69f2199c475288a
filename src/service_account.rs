use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use std::collections::BTreeMap;

use crate::gameserver_types::{GameServer, GAME_SERVER_NAME_LABEL};

/// The ServiceAccount a game server pod runs as, named after the server so
/// the scoped Role can bind to it.
pub fn service_account_build(gs: &GameServer) -> corev1::ServiceAccount {
    let name = gs.metadata.name.clone().unwrap();
    corev1::ServiceAccount {
        metadata: metav1::ObjectMeta {
            name: Some(name.clone()),
            namespace: gs.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                GAME_SERVER_NAME_LABEL.to_string(),
                name,
            )])),
            owner_references: Some(vec![gs.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        ..corev1::ServiceAccount::default()
    }
}
