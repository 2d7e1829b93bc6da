//! Cycle coordinator
//!
//! Fans one replacement cycle out across regions, one task per region, and
//! joins them before the cycle is considered complete. Regions share only
//! the immutable config and dataset; a failed region is logged and never
//! blocks the others. Only dataset loading and region enumeration are
//! fatal, since without either no consistent pass is possible.

use crate::aws;
use crate::catalog::RawDataset;
use crate::config::Config;
use crate::error::Result;
use crate::region::process_region;
use futures::future::join_all;
use globset::Glob;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs one full replacement cycle across all selected regions.
pub async fn run_cycle(config: Config) -> Result<()> {
    let dataset = Arc::new(RawDataset::load(&config.dataset_path)?);
    let enabled = aws::enumerate_regions().await?;
    let regions = select_regions(&enabled, &config.regions);
    if regions.is_empty() {
        warn!("no regions selected, nothing to do");
        return Ok(());
    }
    info!(regions = regions.len(), "starting replacement cycle");

    let config = Arc::new(config);
    let handles: Vec<_> = regions
        .into_iter()
        .map(|region| {
            let config = config.clone();
            let dataset = dataset.clone();
            tokio::spawn(async move {
                let result = process_region(region.clone(), config, dataset).await;
                (region, result)
            })
        })
        .collect();

    for handle in join_all(handles).await {
        match handle {
            Ok((region, Ok(()))) => debug!(region, "region cycle complete"),
            Ok((region, Err(e))) => warn!(region, error = %e, "region cycle failed"),
            Err(e) => warn!(error = %e, "region task panicked"),
        }
    }
    Ok(())
}

/// Matches the account's enabled regions against the configured globs.
/// No patterns selects everything; unknown patterns select nothing and are
/// logged, not fatal.
pub fn select_regions(enabled: &[String], patterns: &[String]) -> Vec<String> {
    if patterns.is_empty() {
        return enabled.to_vec();
    }
    enabled
        .iter()
        .filter(|region| {
            patterns.iter().any(|pattern| match Glob::new(pattern) {
                Ok(glob) => glob.compile_matcher().is_match(region.as_str()),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid region pattern");
                    false
                }
            })
        })
        .cloned()
        .collect()
}
