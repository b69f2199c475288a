use thiserror::Error;

use crate::common::{scaled_value_from_int_or_percent, InvalidScaleValue};
use crate::fleet_types::Fleet;
use crate::gameserverset_types::{
    count_spec_replicas, count_status_allocated_replicas, count_status_replicas, GameServerSet,
};

#[derive(Debug, Error)]
pub enum RollingUpdateError {
    #[error("failed to parse maxSurge value: {0}")]
    MaxSurgeParse(#[source] InvalidScaleValue),
    #[error("failed to parse maxUnavailable value: {0}")]
    MaxUnavailableParse(#[source] InvalidScaleValue),
}

/// Computes the replica target for the active generation during a rolling
/// update, leaving room for Allocated servers stranded in old generations
/// and never exceeding desired + surge across all generations.
pub fn rolling_update_active(
    fleet: &Fleet,
    active: &GameServerSet,
    rest: &[GameServerSet],
) -> Result<i32, RollingUpdateError> {
    let mut desired = active.spec.replicas;

    // Leave room for Allocated GameServers in old GameServerSets.
    let allocated = count_status_allocated_replicas(rest);

    // The previous step has not converged yet; wait for it.
    let observed = active.status.as_ref().map_or(0, |s| s.replicas);
    if active.spec.replicas != observed {
        return Ok(desired);
    }

    // The dangling GameServerSets will be removed at a later stage.
    if fleet.spec.replicas == 0 {
        return Ok(0);
    }

    // The active generation already covers everything the old ones don't.
    if active.spec.replicas >= fleet.spec.replicas - allocated {
        return Ok(fleet.lower_bound_replicas(fleet.spec.replicas - allocated));
    }

    let surge = scaled_value_from_int_or_percent(
        &fleet.spec.strategy.rolling_update.max_surge,
        fleet.spec.replicas,
        true,
    )
    .map_err(RollingUpdateError::MaxSurgeParse)?;

    desired = fleet.upper_bound_replicas(active.spec.replicas + surge);
    let total = count_status_replicas(rest) + desired;

    // Make sure that we don't exceed the max surge.
    let max_surge = fleet.spec.replicas + surge;
    if total > max_surge {
        desired = fleet.lower_bound_replicas(desired - (total - max_surge));
    }

    // Ensure the total active GameServers will not exceed the desired amount.
    if desired + allocated > fleet.spec.replicas {
        desired = fleet.lower_bound_replicas(fleet.spec.replicas - allocated);
    }

    Ok(desired)
}

/// How many replicas may be taken away from the old generations right now
/// without dipping below the fleet's availability floor.
pub fn scale_down_budget(
    fleet: &Fleet,
    active: &GameServerSet,
    rest: &[GameServerSet],
) -> Result<i32, RollingUpdateError> {
    let mut unavailable = scaled_value_from_int_or_percent(
        &fleet.spec.strategy.rolling_update.max_unavailable,
        fleet.spec.replicas,
        false,
    )
    .map_err(RollingUpdateError::MaxUnavailableParse)?;

    if unavailable == 0 {
        unavailable = 1;
    }
    if unavailable > fleet.spec.replicas {
        unavailable = fleet.spec.replicas;
    }

    let min_available = fleet.spec.replicas - unavailable;
    let live = count_spec_replicas(rest) + active.spec.replicas;

    let active_status = active.status.clone().unwrap_or_default();
    let unready =
        active.spec.replicas - active_status.ready_replicas - active_status.allocated_replicas;

    Ok(live - min_available - unready)
}

/// A planned spec update for one old-generation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDown {
    pub name: String,
    pub from: i32,
    pub to: i32,
}

/// Plans the old-generation scale-down within `max` removals, oldest set
/// first. Sets that are fully healthy keep their replicas; only the gap
/// between spec and ready is reclaimed.
pub fn plan_scale_down(rest: &[GameServerSet], max: i32) -> Vec<ScaleDown> {
    let mut ordered: Vec<&GameServerSet> = rest.iter().collect();
    ordered.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
    });

    let mut total = 0;
    let mut plan = Vec::new();
    for set in ordered {
        if total >= max {
            break;
        }
        if set.spec.replicas == 0 {
            // Cannot scale down this set.
            continue;
        }
        let ready = set.status.as_ref().map_or(0, |s| s.ready_replicas);
        if set.spec.replicas == ready {
            // No unhealthy replicas found, no scaling required.
            continue;
        }

        let count = (max - total).min(set.spec.replicas - ready);
        plan.push(ScaleDown {
            name: set.metadata.name.clone().unwrap(),
            from: set.spec.replicas,
            to: set.spec.replicas - count,
        });
        total += count;
    }

    plan
}
