//! Per-region processing
//!
//! One region per cycle task: scan, then fan out across the enabled groups
//! concurrently. Group tasks share only the read-only catalog and the
//! region's API client; each one operates on the view it was handed, so no
//! locking surrounds the decision or swap logic.

use crate::aws::client::CloudApi;
use crate::aws::launch;
use crate::aws::scanner;
use crate::aws::AwsCloud;
use crate::catalog::{RawDataset, TypeCatalog};
use crate::config::Config;
use crate::decision::{self, ReplacementIntent};
use crate::error::{Result, SpotctlError};
use crate::group::GroupView;
use crate::schedule;
use crate::swap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn process_region(
    region: String,
    config: Arc<Config>,
    dataset: Arc<RawDataset>,
) -> Result<()> {
    let api: Arc<dyn CloudApi> = Arc::new(AwsCloud::new(&region).await);
    process_region_with(api, region, config, dataset).await
}

pub async fn process_region_with(
    api: Arc<dyn CloudApi>,
    region: String,
    config: Arc<Config>,
    dataset: Arc<RawDataset>,
) -> Result<()> {
    let scan = scanner::scan_region(api.as_ref(), &region, &config, &dataset).await?;
    if scan.views.is_empty() {
        return Ok(());
    }

    let catalog = scan.catalog;
    let tasks = scan.views.into_iter().map(|view| {
        let api = api.clone();
        let catalog = catalog.clone();
        async move {
            let group = view.group.name.clone();
            (group, process_group(api.as_ref(), &catalog, &view).await)
        }
    });

    for (group, result) in join_all(tasks).await {
        match result {
            Ok(()) => {}
            Err(e) if e.is_quiet_outcome() => debug!(region, group, outcome = %e, "nothing to do"),
            Err(e) => warn!(region, group, error = %e, "group processing failed"),
        }
    }
    Ok(())
}

/// Runs one group through the schedule gate, the decision state machine and
/// whichever action it picked.
pub async fn process_group(
    api: &dyn CloudApi,
    catalog: &TypeCatalog,
    view: &GroupView,
) -> Result<()> {
    let group = &view.group;

    match schedule::is_active(
        view.now,
        &view.config.cron_schedule,
        &view.config.cron_timezone,
        &view.config.cron_schedule_state,
    ) {
        Ok(true) => {}
        Ok(false) => {
            debug!(group = %group.name, schedule = %view.config.cron_schedule, "outside schedule window");
            return Ok(());
        }
        // A broken schedule gates the group off instead of acting at an
        // unintended time.
        Err(e) => {
            warn!(group = %group.name, error = %e, "unusable schedule, skipping group");
            return Ok(());
        }
    }

    match decision::decide(view, catalog) {
        ReplacementIntent::NoAction => Ok(()),
        ReplacementIntent::WaitForPending { request_id } => {
            let instance_id = api.wait_for_fulfillment(&request_id).await?;
            info!(
                group = %group.name,
                request_id = %request_id,
                instance_id = %instance_id,
                "spot request fulfilled; attach follows once the grace period passes"
            );
            Ok(())
        }
        ReplacementIntent::AttachReady { instance_id } => {
            swap::swap(api, view, &instance_id).await
        }
        ReplacementIntent::TerminateExcessSpot { instance_id } => {
            api.terminate_instance(&instance_id).await?;
            info!(
                group = %group.name,
                instance_id = %instance_id,
                "terminated spot member; the group backfills with on-demand"
            );
            Ok(())
        }
        ReplacementIntent::LaunchNew {
            donor_instance_id,
            instance_type,
            zone,
            bid_price,
        } => {
            let donor = view
                .members
                .iter()
                .find(|m| m.instance.instance_id == donor_instance_id)
                .ok_or_else(|| SpotctlError::NoDonor {
                    group: group.name.clone(),
                })?;
            let request_id = launch::launch_replacement(
                api,
                view,
                &donor.instance,
                &instance_type,
                &zone,
                bid_price,
            )
            .await?;
            let instance_id = api.wait_for_fulfillment(&request_id).await?;
            info!(
                group = %group.name,
                request_id = %request_id,
                instance_id = %instance_id,
                "replacement launched and fulfilled"
            );
            Ok(())
        }
    }
}
