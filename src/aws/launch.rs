//! Spot launch specification builder
//!
//! Mechanical transform: copies the donor instance's placement/network
//! settings and the group's launch configuration extras into a concrete
//! spot request for the chosen type. Groups driven by a launch template
//! fall back to the donor's own attributes, which carry the same
//! image/network/storage settings at runtime.
//!
//! Marker tags go onto the request itself so any later invocation can
//! rediscover it; the donor's own tags are propagated for continuity.

use crate::aws::client::CloudApi;
use crate::error::{Result, SpotctlError};
use crate::group::{BlockDeviceMapping, GroupView};
use crate::instance::{
    Instance, LAUNCHED_BY_TAG, LAUNCHED_FOR_ASG_TAG, LAUNCHED_FOR_REPLACING_TAG,
};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use aws_sdk_ec2::types::{EbsBlockDevice, VolumeType};
use tracing::{info, warn};

/// Provider-native launch request, ready to submit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpotLaunchSpec {
    pub group_name: String,
    pub instance_type: String,
    pub zone: String,
    pub bid_price: f64,
    pub image_id: String,
    pub key_name: Option<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    /// Requires an explicit network interface in the request when set.
    pub associate_public_ip: Option<bool>,
    pub user_data: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub ebs_optimized: bool,
    pub monitoring: bool,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Marker tags plus the donor's propagatable tags; applied to the
    /// request and inherited by its instance.
    pub tags: Vec<(String, String)>,
}

/// Assembles the launch spec for replacing `donor` with `instance_type` in
/// its zone. Fails cleanly, with no cloud-side effects, when no bootable
/// image can be determined.
pub fn build_launch_spec(
    view: &GroupView,
    donor: &Instance,
    instance_type: &str,
    zone: &str,
    bid_price: f64,
) -> Result<SpotLaunchSpec> {
    let launch_config = view.launch_config.as_ref();

    let image_id = launch_config
        .and_then(|lc| lc.image_id.clone())
        .or_else(|| donor.image_id.clone())
        .ok_or_else(|| SpotctlError::SwapAborted {
            group: view.group.name.clone(),
            reason: "no image ID available for the replacement launch".to_string(),
        })?;

    let mut tags = vec![
        (LAUNCHED_BY_TAG.to_string(), "true".to_string()),
        (LAUNCHED_FOR_ASG_TAG.to_string(), view.group.name.clone()),
        (
            LAUNCHED_FOR_REPLACING_TAG.to_string(),
            donor.instance_id.clone(),
        ),
    ];
    tags.extend(donor.propagatable_tags());

    Ok(SpotLaunchSpec {
        group_name: view.group.name.clone(),
        instance_type: instance_type.to_string(),
        zone: zone.to_string(),
        bid_price,
        image_id,
        key_name: launch_config
            .and_then(|lc| lc.key_name.clone())
            .or_else(|| donor.key_name.clone()),
        security_group_ids: donor.security_group_ids.clone(),
        subnet_id: donor.subnet_id.clone(),
        associate_public_ip: launch_config.and_then(|lc| lc.associate_public_ip),
        user_data: launch_config.and_then(|lc| lc.user_data.clone()),
        iam_instance_profile: launch_config.and_then(|lc| lc.iam_instance_profile.clone()),
        ebs_optimized: donor.ebs_optimized,
        monitoring: launch_config.map(|lc| lc.instance_monitoring).unwrap_or(false),
        block_device_mappings: launch_config
            .map(|lc| lc.block_device_mappings.clone())
            .unwrap_or_default(),
        tags,
    })
}

/// Submits the spot request and tags it. Tagging is what makes the request
/// rediscoverable, so it retries; the instance itself is left for the
/// fulfillment wait.
pub async fn launch_replacement(
    api: &dyn CloudApi,
    view: &GroupView,
    donor: &Instance,
    instance_type: &str,
    zone: &str,
    bid_price: f64,
) -> Result<String> {
    let spec = build_launch_spec(view, donor, instance_type, zone, bid_price)?;
    let request_id = api.request_spot_instance(&spec).await?;
    info!(
        group = %view.group.name,
        request_id = %request_id,
        instance_type,
        zone,
        bid_price,
        "spot replacement requested"
    );

    let policy = ExponentialBackoffPolicy::for_cloud_api();
    if let Err(e) = policy
        .execute_with_retry(|| api.create_tags(&request_id, &spec.tags))
        .await
    {
        // The request exists but is untagged and invisible to future
        // cycles; cancel-by-termination is not possible yet, so surface it.
        warn!(group = %view.group.name, request_id = %request_id, error = %e, "failed to tag spot request");
        return Err(e);
    }
    Ok(request_id)
}

/// Converts stored block device mappings to the EC2 request shape.
pub fn ec2_block_device_mappings(
    mappings: &[BlockDeviceMapping],
) -> Vec<aws_sdk_ec2::types::BlockDeviceMapping> {
    mappings
        .iter()
        .map(|bdm| {
            let mut builder = aws_sdk_ec2::types::BlockDeviceMapping::builder();
            if let Some(device_name) = &bdm.device_name {
                builder = builder.device_name(device_name);
            }
            if let Some(virtual_name) = &bdm.virtual_name {
                builder = builder.virtual_name(virtual_name);
            }
            if bdm.no_device {
                builder = builder.no_device("");
            }
            if let Some(ebs) = &bdm.ebs {
                let mut ebs_builder = EbsBlockDevice::builder();
                if let Some(delete) = ebs.delete_on_termination {
                    ebs_builder = ebs_builder.delete_on_termination(delete);
                }
                if let Some(encrypted) = ebs.encrypted {
                    ebs_builder = ebs_builder.encrypted(encrypted);
                }
                if let Some(iops) = ebs.iops {
                    ebs_builder = ebs_builder.iops(iops);
                }
                if let Some(snapshot_id) = &ebs.snapshot_id {
                    ebs_builder = ebs_builder.snapshot_id(snapshot_id);
                }
                if let Some(size) = ebs.volume_size {
                    ebs_builder = ebs_builder.volume_size(size);
                }
                if let Some(volume_type) = &ebs.volume_type {
                    ebs_builder = ebs_builder.volume_type(VolumeType::from(volume_type.as_str()));
                }
                builder = builder.ebs(ebs_builder.build());
            }
            builder.build()
        })
        .collect()
}
