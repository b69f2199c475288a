use chrono::{DateTime, Duration, Utc};

use crate::gameserver_types::GameServer;
use crate::gameserverinstance_types::{GameServerInstance, GameServerInstanceState};

/// Annotation stamped on a GameServer the first time it is observed in the
/// Drain state, so the drain timeout survives controller restarts.
pub const DRAIN_STARTED_ANNOTATION: &str = "singularity.innit.gg/drain-started";

/// When the drain began, if it has been recorded.
pub fn drain_started(gs: &GameServer) -> Option<DateTime<Utc>> {
    let value = gs
        .metadata
        .annotations
        .as_ref()?
        .get(DRAIN_STARTED_ANNOTATION)?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Whether a draining server may proceed to Shutdown: its remaining
/// sessions have fallen to the drain strategy's thresholds, or the drain
/// timeout has elapsed. The decision is made purely from observed state;
/// the caller owns the status write.
pub fn drain_complete(gs: &GameServer, instances: &[GameServerInstance], now: DateTime<Utc>) -> bool {
    let strategy = &gs.spec.drain_strategy;

    if strategy.timeout > 0 {
        if let Some(started) = drain_started(gs) {
            if now >= started + Duration::seconds(strategy.timeout as i64) {
                return true;
            }
        }
    }

    let mut ready = 0;
    let mut allocated = 0;
    for instance in instances {
        match instance.status.as_ref().map(|s| s.state) {
            Some(GameServerInstanceState::Ready) => ready += 1,
            Some(GameServerInstanceState::Allocated) => allocated += 1,
            _ => {}
        }
    }

    allocated <= strategy.allocated_instances
        && ready <= strategy.ready_instances
        && (instances.len() as i32) <= strategy.instances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gameserver_types::tests_support::game_server;
    use crate::gameserverinstance_types::{
        GameServerInstanceSpec, GameServerInstanceStatus,
    };
    use std::collections::BTreeMap;

    fn instance(name: &str, state: GameServerInstanceState) -> GameServerInstance {
        let mut i = GameServerInstance::new(name, GameServerInstanceSpec::default());
        i.status = Some(GameServerInstanceStatus { state });
        i
    }

    fn with_drain_started(mut gs: GameServer, at: &str) -> GameServer {
        gs.metadata.annotations = Some(BTreeMap::from([(
            DRAIN_STARTED_ANNOTATION.to_string(),
            at.to_string(),
        )]));
        gs
    }

    #[test]
    fn no_sessions_left_means_complete() {
        let gs = game_server("gs");
        assert!(drain_complete(&gs, &[], Utc::now()));
    }

    #[test]
    fn allocated_sessions_hold_the_drain_open() {
        let gs = game_server("gs");
        let instances = vec![instance("gs-0", GameServerInstanceState::Allocated)];
        assert!(!drain_complete(&gs, &instances, Utc::now()));
    }

    #[test]
    fn thresholds_allow_leftover_sessions() {
        let mut gs = game_server("gs");
        gs.spec.drain_strategy.instances = 2;
        gs.spec.drain_strategy.ready_instances = 1;
        gs.spec.drain_strategy.allocated_instances = 1;

        let instances = vec![
            instance("gs-0", GameServerInstanceState::Allocated),
            instance("gs-1", GameServerInstanceState::Ready),
        ];
        assert!(drain_complete(&gs, &instances, Utc::now()));
    }

    #[test]
    fn timeout_overrides_remaining_sessions() {
        let mut gs = game_server("gs");
        gs.spec.drain_strategy.timeout = 60;
        let gs = with_drain_started(gs, "2022-01-01T00:00:00Z");

        let instances = vec![instance("gs-0", GameServerInstanceState::Allocated)];
        let now = DateTime::parse_from_rfc3339("2022-01-01T00:02:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(drain_complete(&gs, &instances, now));

        let too_soon = DateTime::parse_from_rfc3339("2022-01-01T00:00:30Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!drain_complete(&gs, &instances, too_soon));
    }

    #[test]
    fn unstamped_drain_never_times_out() {
        let mut gs = game_server("gs");
        gs.spec.drain_strategy.timeout = 60;

        let instances = vec![instance("gs-0", GameServerInstanceState::Allocated)];
        assert!(!drain_complete(&gs, &instances, Utc::now()));
        assert!(drain_started(&gs).is_none());
    }

    #[test]
    fn annotation_round_trip() {
        let gs = with_drain_started(game_server("gs"), "2022-01-01T00:00:00Z");
        let started = drain_started(&gs).unwrap();
        assert_eq!(started.timestamp(), 1640995200);
    }
}
