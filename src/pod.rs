use k8s_openapi::api::core::v1 as corev1;
use kube::Resource;
use std::collections::BTreeMap;

use crate::common::ROLE_LABEL;
use crate::gameserver_types::{
    GameServer, GAME_SERVER_ENV_NAME, GAME_SERVER_ENV_NAMESPACE, GAME_SERVER_NAME_LABEL,
    GAME_SERVER_ROLE,
};

/// Materializes the backing Pod from the server's pod template. The
/// derivation is a pure function of the GameServer, so repeated creates
/// are safe to collapse into AlreadyExists.
pub fn pod_build(gs: &GameServer) -> corev1::Pod {
    let mut pod = corev1::Pod {
        metadata: gs
            .spec
            .template
            .metadata
            .clone()
            .unwrap_or_default(),
        spec: gs.spec.template.spec.clone(),
        ..corev1::Pod::default()
    };

    configure_pod_meta(gs, &mut pod);

    if let Some(spec) = pod.spec.as_mut() {
        // The pod patches its own GameServer status through this account.
        spec.service_account_name = gs.metadata.name.clone();

        let env_name = corev1::EnvVar {
            name: GAME_SERVER_ENV_NAME.to_string(),
            value: gs.metadata.name.clone(),
            ..corev1::EnvVar::default()
        };
        let env_namespace = corev1::EnvVar {
            name: GAME_SERVER_ENV_NAMESPACE.to_string(),
            value: gs.metadata.namespace.clone(),
            ..corev1::EnvVar::default()
        };
        for container in &mut spec.containers {
            container
                .env
                .get_or_insert_with(Vec::new)
                .extend([env_name.clone(), env_namespace.clone()]);
        }
    }

    pod
}

fn configure_pod_meta(gs: &GameServer, pod: &mut corev1::Pod) {
    // Name and namespace need to match the GameServer.
    pod.metadata.generate_name = None;
    pod.metadata.name = gs.metadata.name.clone();
    pod.metadata.namespace = gs.metadata.namespace.clone();

    // Reset these, in case the template carried stale copies.
    pod.metadata.resource_version = None;
    pod.metadata.uid = None;

    let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(ROLE_LABEL.to_string(), GAME_SERVER_ROLE.to_string());
    labels.insert(
        GAME_SERVER_NAME_LABEL.to_string(),
        gs.metadata.name.clone().unwrap(),
    );

    pod.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(gs.controller_owner_ref(&()).unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver_types::tests_support::game_server;

    #[test]
    fn pod_takes_the_server_identity() {
        let gs = game_server("lobby-abcde-xyz");
        let pod = pod_build(&gs);

        assert_eq!(pod.metadata.name.as_deref(), Some("lobby-abcde-xyz"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(pod.metadata.generate_name, None);
        assert_eq!(pod.metadata.resource_version, None);
        assert_eq!(pod.metadata.uid, None);

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(ROLE_LABEL).map(String::as_str), Some(GAME_SERVER_ROLE));
        assert_eq!(
            labels.get(GAME_SERVER_NAME_LABEL).map(String::as_str),
            Some("lobby-abcde-xyz")
        );

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("lobby-abcde-xyz"));
    }

    #[test]
    fn every_container_learns_its_identity() {
        let mut gs = game_server("lobby-abcde-xyz");
        let pod_spec = gs.spec.template.spec.as_mut().unwrap();
        pod_spec.containers.push(corev1::Container {
            name: "sidecar".to_string(),
            ..corev1::Container::default()
        });

        let pod = pod_build(&gs);
        for container in &pod.spec.as_ref().unwrap().containers {
            let env = container.env.as_ref().unwrap();
            let name = env.iter().find(|e| e.name == GAME_SERVER_ENV_NAME).unwrap();
            assert_eq!(name.value.as_deref(), Some("lobby-abcde-xyz"));
            let ns = env
                .iter()
                .find(|e| e.name == GAME_SERVER_ENV_NAMESPACE)
                .unwrap();
            assert_eq!(ns.value.as_deref(), Some("default"));
        }
    }

    #[test]
    fn builder_is_deterministic() {
        let gs = game_server("lobby-abcde-xyz");
        let a = serde_json::to_value(pod_build(&gs)).unwrap();
        let b = serde_json::to_value(pod_build(&gs)).unwrap();
        assert_eq!(a, b);
    }
}
