//! AWS control-plane integration
//!
//! Everything that talks to EC2 or Auto Scaling lives here, behind the
//! [`client::CloudApi`] trait so the decision and swap logic can be tested
//! against a mock. The rest of the crate only sees domain types.

pub mod client;
pub mod helpers;
pub mod launch;
pub mod scanner;

pub use client::{AwsCloud, CloudApi};

use crate::error::{Result, SpotctlError};
use aws_config::BehaviorVersion;

/// Enumerates the regions enabled for the account. Failure here is fatal
/// for the cycle.
pub async fn enumerate_regions() -> Result<Vec<String>> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let ec2 = aws_sdk_ec2::Client::new(&sdk_config);
    let output = ec2
        .describe_regions()
        .send()
        .await
        .map_err(|e| SpotctlError::RegionEnumeration(e.to_string()))?;

    let mut regions: Vec<String> = output
        .regions()
        .iter()
        .filter_map(|r| r.region_name().map(str::to_string))
        .collect();
    regions.sort();
    Ok(regions)
}
