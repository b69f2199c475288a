use async_channel::Receiver;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

use crate::gameserver_types::GameServer;
use crate::gameserverset_types::GameServerSet;

/// Processes a channel of items with `parallelism` logical workers. The
/// first worker to fail records its error and stops; the remaining workers
/// keep draining until the channel closes, and any leftovers are discarded
/// afterwards so a blocked producer cannot leak. Returns the first
/// recorded error, if any.
pub async fn parallelize<T, E, F, Fut>(
    items: Receiver<T>,
    parallelism: usize,
    work: F,
) -> Result<(), E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let (err_tx, err_rx) = async_channel::bounded::<E>(parallelism.max(1));

    let mut workers = FuturesUnordered::new();
    for _ in 0..parallelism.max(1) {
        let rx = items.clone();
        let err_tx = err_tx.clone();
        let work = &work;
        workers.push(async move {
            while let Ok(item) = rx.recv().await {
                if let Err(e) = work(item).await {
                    let _ = err_tx.try_send(e);
                    break;
                }
            }
        });
    }
    while workers.next().await.is_some() {}
    drop(err_tx);

    // Drain whatever the early-exiting workers left behind.
    while items.try_recv().is_ok() {}

    match err_rx.try_recv() {
        Ok(e) => Err(e),
        Err(_) => Ok(()),
    }
}

/// Produces `count` fresh GameServers stamped from the set's template. The
/// channel closes once the producer is done; dropping the receiver stops
/// the producer early.
pub fn new_game_servers_channel(count: usize, gs_set: &GameServerSet) -> Receiver<GameServer> {
    let (tx, rx) = async_channel::bounded(1);
    let gs_set = gs_set.clone();
    tokio::spawn(async move {
        for _ in 0..count {
            if tx.send(gs_set.game_server()).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Feeds an existing list through a channel, closing it on completion.
pub fn list_channel<T: Send + 'static>(list: Vec<T>) -> Receiver<T> {
    let (tx, rx) = async_channel::bounded(1);
    tokio::spawn(async move {
        for item in list {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}
