//! Replacement decision state machine
//!
//! One pure decision per group per cycle, computed from the scanned
//! [`GroupView`] and the read-only region catalog. All in-flight work is
//! rediscovered from resource tags during scanning, so running the decision
//! twice against the same view yields the same intent; there is no local
//! continuation to lose when an invocation dies mid-swap.

use crate::group::GroupView;
use crate::catalog::TypeCatalog;
use crate::matcher;
use crate::pricing::price_to_bid;
use tracing::{debug, info, warn};

/// What the engine intends to do for one group this cycle. Ephemeral;
/// nothing here outlives the cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplacementIntent {
    /// Nothing to do: minimum on-demand capacity already reached, or no
    /// viable replacement exists.
    NoAction,
    /// A launch we own is still provisioning or inside its grace period;
    /// re-enter the fulfillment wait.
    WaitForPending { request_id: String },
    /// A launched spot instance is running and aged past the grace period;
    /// hand it to the swap executor.
    AttachReady { instance_id: String },
    /// On-demand capacity fell below the minimum; terminate a running spot
    /// member so the group backfills the slot with on-demand.
    TerminateExcessSpot { instance_id: String },
    /// No outstanding work: launch a replacement for the donor.
    LaunchNew {
        donor_instance_id: String,
        instance_type: String,
        zone: String,
        bid_price: f64,
    },
}

/// Decides the group's next step. Quiet outcomes (minimum satisfied, no
/// compatible type, no donor) all collapse to [`ReplacementIntent::NoAction`]
/// rather than errors.
pub fn decide(view: &GroupView, catalog: &TypeCatalog) -> ReplacementIntent {
    let on_demand = view.on_demand_running();
    if on_demand <= view.config.min_on_demand {
        if on_demand < view.config.min_on_demand {
            if let Some(intent) = terminate_excess_intent(view) {
                return intent;
            }
        }
        debug!(
            group = %view.group.name,
            on_demand,
            min_on_demand = view.config.min_on_demand,
            "minimum on-demand capacity reached"
        );
        return ReplacementIntent::NoAction;
    }

    // Outstanding work first: tags, not memory, say what is in flight.
    if let Some(intent) = pending_intent(view) {
        return intent;
    }

    launch_intent(view, catalog)
}

/// The group is short of its on-demand minimum: hand a slot back by
/// terminating a spot member, never the last running instance.
fn terminate_excess_intent(view: &GroupView) -> Option<ReplacementIntent> {
    let (_, total) = view.running_count(false, None);
    if total <= 1 {
        return None;
    }
    let member = view.any_running_spot()?;
    info!(
        group = %view.group.name,
        instance = %member.instance.instance_id,
        "terminating a spot member to restore the on-demand minimum"
    );
    Some(ReplacementIntent::TerminateExcessSpot {
        instance_id: member.instance.instance_id.clone(),
    })
}

/// Inspects the group's tagged spot requests for in-flight work.
fn pending_intent(view: &GroupView) -> Option<ReplacementIntent> {
    for request in &view.spot_requests {
        if request.is_open() {
            debug!(
                group = %view.group.name,
                request_id = %request.request_id,
                "spot request still provisioning"
            );
            return Some(ReplacementIntent::WaitForPending {
                request_id: request.request_id.clone(),
            });
        }

        if request.is_fulfilled() {
            let Some(instance_id) = request.instance_id.as_deref() else {
                continue;
            };
            if view.group.has_member(instance_id) {
                continue;
            }
            let Some(instance) = view.request_instances.get(instance_id) else {
                // Fulfilled but the instance is not visible yet; eventual
                // consistency, re-check next cycle.
                debug!(
                    group = %view.group.name,
                    request_id = %request.request_id,
                    instance_id,
                    "fulfilled request's instance not visible yet"
                );
                return Some(ReplacementIntent::WaitForPending {
                    request_id: request.request_id.clone(),
                });
            };
            if instance.is_ready_to_attach(view.group.health_check_grace_period, view.now) {
                return Some(ReplacementIntent::AttachReady {
                    instance_id: instance_id.to_string(),
                });
            }
            debug!(
                group = %view.group.name,
                instance_id,
                uptime = instance.uptime_seconds(view.now),
                grace_period = view.group.health_check_grace_period,
                "spot instance still inside grace period"
            );
            return Some(ReplacementIntent::WaitForPending {
                request_id: request.request_id.clone(),
            });
        }
    }
    None
}

/// No outstanding work: pick a donor and a compatible cheaper type.
fn launch_intent(view: &GroupView, catalog: &TypeCatalog) -> ReplacementIntent {
    let Some(donor) = view.find_donor(None) else {
        debug!(group = %view.group.name, "no eligible donor instance");
        return ReplacementIntent::NoAction;
    };
    let reference = &donor.instance;

    let Some(ref_info) = catalog.get(&reference.instance_type) else {
        warn!(
            group = %view.group.name,
            instance_type = %reference.instance_type,
            "donor's instance type missing from the catalog"
        );
        return ReplacementIntent::NoAction;
    };

    let allowed = view.config.allowed_types_for(&reference.instance_type);
    let candidates = match matcher::find_candidates(
        reference,
        ref_info,
        catalog,
        view,
        &allowed,
        &view.config.disallowed_types,
        view.config.allocation_bias,
    ) {
        Ok(candidates) => candidates,
        Err(e) => {
            debug!(group = %view.group.name, outcome = %e, "no replacement this cycle");
            return ReplacementIntent::NoAction;
        }
    };

    // Candidates are ranked; the first is the choice.
    let chosen = &candidates[0];
    let bid_price = price_to_bid(
        matcher::effective_on_demand_price(ref_info),
        chosen.price,
        chosen.info.pricing.premium,
        view.config.spot_price_buffer_percentage,
        view.config.bidding_policy,
    );

    info!(
        group = %view.group.name,
        donor = %reference.instance_id,
        instance_type = %chosen.info.instance_type,
        zone = %reference.zone,
        bid_price,
        "launching spot replacement"
    );
    ReplacementIntent::LaunchNew {
        donor_instance_id: reference.instance_id.clone(),
        instance_type: chosen.info.instance_type.clone(),
        zone: reference.zone.clone(),
        bid_price,
    }
}
