use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use std::collections::BTreeMap;

use crate::gameserver_types::{GameServer, GAME_SERVER_NAME_LABEL};

/// Binds the server's scoped Role to its ServiceAccount. All three share
/// the server's name.
pub fn role_binding_build(gs: &GameServer) -> rbacv1::RoleBinding {
    let name = gs.metadata.name.clone().unwrap();

    rbacv1::RoleBinding {
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
        subjects: Some(vec![rbacv1::Subject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            ..rbacv1::Subject::default()
        }]),
        role_ref: rbacv1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver_types::tests_support::game_server;

    #[test]
    fn binds_the_role_to_the_service_account() {
        let gs = game_server("lobby-abcde-xyz");
        let binding = role_binding_build(&gs);

        assert_eq!(binding.metadata.name.as_deref(), Some("lobby-abcde-xyz"));
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, "lobby-abcde-xyz");

        let subjects = binding.subjects.as_ref().unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, "lobby-abcde-xyz");
    }
}
