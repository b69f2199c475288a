use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1 as corev1;
use kube::{
    api::{Api, ListParams},
    runtime::controller::Controller,
    runtime::events::Reporter,
    Client, CustomResourceExt,
};
use std::{env, sync::Arc};
use tracing::*;

use singularity_operator::common::Data;
use singularity_operator::fleet_controller;
use singularity_operator::fleet_types::Fleet;
use singularity_operator::gameserver_controller;
use singularity_operator::gameserver_types::GameServer;
use singularity_operator::gameserverinstance_types::GameServerInstance;
use singularity_operator::gameserverset_controller;
use singularity_operator::gameserverset_types::GameServerSet;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).cloned().unwrap_or_default();

    if cmd == "export" {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&Fleet::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&GameServerSet::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&GameServer::crd())?);
        println!("---");
        println!("{}", serde_yaml::to_string(&GameServerInstance::crd())?);
        Ok(())
    } else if cmd == "run" {
        info!("running singularity-operator");
        let client = Client::try_default().await?;
        let data = Arc::new(Data {
            client: client.clone(),
            reporter: Reporter {
                controller: "singularity-operator".into(),
                instance: None,
            },
        });

        let fleets = Controller::new(Api::<Fleet>::all(client.clone()), ListParams::default())
            .owns(Api::<GameServerSet>::all(client.clone()), ListParams::default())
            .shutdown_on_signal()
            .run(
                fleet_controller::reconcile,
                fleet_controller::error_policy,
                data.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            });

        let game_server_sets =
            Controller::new(Api::<GameServerSet>::all(client.clone()), ListParams::default())
                .owns(Api::<GameServer>::all(client.clone()), ListParams::default())
                .shutdown_on_signal()
                .run(
                    gameserverset_controller::reconcile,
                    gameserverset_controller::error_policy,
                    data.clone(),
                )
                .for_each(|res| async move {
                    match res {
                        Ok(o) => info!("reconciled {:?}", o),
                        Err(e) => warn!("reconcile failed: {}", e),
                    }
                });

        let game_servers =
            Controller::new(Api::<GameServer>::all(client.clone()), ListParams::default())
                .owns(Api::<corev1::Pod>::all(client.clone()), ListParams::default())
                .owns(
                    Api::<GameServerInstance>::all(client.clone()),
                    ListParams::default(),
                )
                .shutdown_on_signal()
                .run(
                    gameserver_controller::reconcile,
                    gameserver_controller::error_policy,
                    data,
                )
                .for_each(|res| async move {
                    match res {
                        Ok(o) => info!("reconciled {:?}", o),
                        Err(e) => warn!("reconcile failed: {}", e),
                    }
                });

        futures::join!(fleets, game_server_sets, game_servers);
        info!("controllers terminated");
        Ok(())
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
        Ok(())
    }
}
