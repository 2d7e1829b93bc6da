//! Swap executor
//!
//! Replaces one on-demand group member with a ready spot instance while
//! keeping `minSize <= desiredCapacity <= maxSize` observable at every
//! step. The cloud offers no multi-resource transaction, so each step has
//! an explicit compensation: an orphaned candidate is terminated, a donor
//! detached for a failed attach is re-attached, and a temporarily bumped
//! max size is always restored.
//!
//! Ordering rules:
//! - group at its ceiling (`desired == max`): bump max by one first, restore
//!   it after the swap regardless of outcome;
//! - group at its floor (`desired == min`): attach before detaching, since
//!   detaching first would transiently drop below the floor;
//! - otherwise detach first, which keeps the group from running over
//!   capacity during the swap.

use crate::aws::client::CloudApi;
use crate::error::{Result, SpotctlError};
use crate::group::{GroupView, MemberInstance};
use crate::instance::{Instance, LAUNCHED_FOR_REPLACING_TAG};
use std::sync::Arc;
use tracing::{info, warn};

/// Swaps `spot_instance_id` into the group in place of a donor member.
pub async fn swap(api: &dyn CloudApi, view: &GroupView, spot_instance_id: &str) -> Result<()> {
    let group = &view.group;

    let spot = view
        .request_instances
        .get(spot_instance_id)
        .ok_or_else(|| SpotctlError::SwapAborted {
            group: group.name.clone(),
            reason: format!("spot instance {spot_instance_id} is not visible"),
        })?;

    // Never attach an instance to a group it was not launched for.
    if spot.launched_for_group() != Some(group.name.as_str()) {
        return Err(SpotctlError::SwapAborted {
            group: group.name.clone(),
            reason: format!(
                "spot instance {spot_instance_id} is not tagged for this group"
            ),
        });
    }

    // No donor means the instance can never attach; later cycles would keep
    // hitting the same wall while it bills.
    let Some(donor) = find_swap_donor(view, spot) else {
        warn!(
            group = %group.name,
            instance = %spot.instance_id,
            "no donor for a ready replacement, terminating it"
        );
        terminate_orphan(api, group, spot).await;
        return Err(SpotctlError::NoDonor {
            group: group.name.clone(),
        });
    };
    let donor = &donor.instance;

    info!(
        group = %group.name,
        donor = %donor.instance_id,
        replacement = %spot.instance_id,
        "swapping on-demand member for spot replacement"
    );

    let bumped_max = group.desired_capacity == group.max_size;
    if bumped_max {
        info!(group = %group.name, max_size = group.max_size + 1, "raising max size for the swap");
        api.set_group_max_size(&group.name, group.max_size + 1).await?;
    }

    let result = execute_swap(api, view, donor, spot).await;

    if bumped_max {
        if let Err(e) = api.set_group_max_size(&group.name, group.max_size).await {
            warn!(group = %group.name, error = %e, "failed to restore max size");
            if result.is_ok() {
                return Err(e);
            }
        }
    }
    result
}

/// Donor preference: the member the replacement was launched for, if still
/// eligible, then any eligible member in the replacement's zone, then any
/// eligible member at all.
fn find_swap_donor<'a>(view: &'a GroupView, spot: &Instance) -> Option<&'a MemberInstance> {
    if let Some(intended) = spot.tag_value(LAUNCHED_FOR_REPLACING_TAG) {
        let found = view.members.iter().find(|m| {
            m.instance.instance_id == intended
                && m.instance.is_running()
                && !m.instance.is_spot()
                && !m.is_protected()
        });
        if found.is_some() {
            return found;
        }
    }
    view.find_donor(Some(&spot.zone))
        .or_else(|| view.find_donor(None))
}

async fn execute_swap(
    api: &dyn CloudApi,
    view: &GroupView,
    donor: &Arc<Instance>,
    spot: &Arc<Instance>,
) -> Result<()> {
    let group = &view.group;

    // Continuity tags before membership changes; losing them is harmless.
    let tags = donor.propagatable_tags();
    if let Err(e) = api.create_tags(&spot.instance_id, &tags).await {
        warn!(group = %group.name, error = %e, "failed to copy donor tags to replacement");
    }

    if group.desired_capacity == group.min_size {
        attach_then_detach(api, view, donor, spot).await
    } else {
        detach_then_attach(api, view, donor, spot).await
    }
}

/// Floor path: the group cannot afford to lose a member even transiently.
async fn attach_then_detach(
    api: &dyn CloudApi,
    view: &GroupView,
    donor: &Arc<Instance>,
    spot: &Arc<Instance>,
) -> Result<()> {
    let group = &view.group;

    if let Err(e) = api.attach_instance(&group.name, &spot.instance_id).await {
        terminate_orphan(api, group, spot).await;
        return Err(SpotctlError::SwapAborted {
            group: group.name.clone(),
            reason: format!("attach failed: {e}"),
        });
    }

    api.detach_instance(&group.name, &donor.instance_id).await?;
    api.terminate_instance(&donor.instance_id).await?;
    Ok(())
}

/// Default path: detach first so the group never runs one over capacity.
/// A failed attach re-attaches the donor before giving up, so capacity is
/// restored within the same invocation.
async fn detach_then_attach(
    api: &dyn CloudApi,
    view: &GroupView,
    donor: &Arc<Instance>,
    spot: &Arc<Instance>,
) -> Result<()> {
    let group = &view.group;

    api.detach_instance(&group.name, &donor.instance_id).await?;

    if let Err(e) = api.attach_instance(&group.name, &spot.instance_id).await {
        terminate_orphan(api, group, spot).await;
        if let Err(re) = api.attach_instance(&group.name, &donor.instance_id).await {
            warn!(group = %group.name, donor = %donor.instance_id, error = %re,
                "failed to re-attach donor after aborted swap");
        }
        return Err(SpotctlError::SwapAborted {
            group: group.name.clone(),
            reason: format!("attach failed: {e}"),
        });
    }

    api.terminate_instance(&donor.instance_id).await?;
    Ok(())
}

/// A candidate that cannot join the group is never left running.
async fn terminate_orphan(api: &dyn CloudApi, group: &crate::group::Group, spot: &Arc<Instance>) {
    if !spot.can_terminate() {
        return;
    }
    if let Err(e) = api.terminate_instance(&spot.instance_id).await {
        warn!(group = %group.name, instance = %spot.instance_id, error = %e,
            "failed to terminate orphaned replacement");
    }
}
