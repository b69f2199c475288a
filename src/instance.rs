use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;
use std::collections::BTreeMap;

use crate::gameserver_types::{GameServer, GAME_SERVER_NAME_LABEL};
use crate::gameserverinstance_types::GameServerInstance;

/// One session slot of a game server, named `<server>-<index>`.
pub fn instance_build(gs: &GameServer, id: i32) -> GameServerInstance {
    let gs_name = gs.metadata.name.clone().unwrap();

    GameServerInstance {
        metadata: metav1::ObjectMeta {
            name: Some(format!("{}-{}", gs_name, id)),
            namespace: gs.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                GAME_SERVER_NAME_LABEL.to_string(),
                gs_name,
            )])),
            owner_references: Some(vec![gs.controller_owner_ref(&()).unwrap()]),
            ..metav1::ObjectMeta::default()
        },
        spec: gs.spec.instance_template.spec.clone(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver_types::tests_support::game_server;

    #[test]
    fn indexed_name_and_template_spec() {
        let mut gs = game_server("lobby-abcde-xyz");
        gs.spec.instance_template.spec.capacity = 16;
        gs.spec.instance_template.spec.map = "dust2".to_string();

        let instance = instance_build(&gs, 0);
        assert_eq!(instance.metadata.name.as_deref(), Some("lobby-abcde-xyz-0"));
        assert_eq!(instance.spec.capacity, 16);
        assert_eq!(instance.spec.map, "dust2");

        let owner = crate::common::controller_of(&instance.metadata).unwrap();
        assert_eq!(owner.kind, "GameServer");
        assert_eq!(owner.name, "lobby-abcde-xyz");

        assert_eq!(
            instance_build(&gs, 3).metadata.name.as_deref(),
            Some("lobby-abcde-xyz-3")
        );
    }
}
