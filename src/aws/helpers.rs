//! SDK-to-domain conversions
//!
//! Flattens the generated EC2/Auto Scaling shapes into the crate's own
//! types. Everything here is a plain data transform; missing optional
//! fields become defaults rather than errors, since the decision logic
//! treats unknown state conservatively anyway.

use crate::catalog::SpotPriceSample;
use crate::group::{
    BlockDeviceMapping, EbsSpec, Group, GroupMember, LaunchConfig, LaunchTemplateRef, SpotRequest,
    SpotRequestState,
};
use crate::instance::{Instance, InstanceState, Lifecycle, Virtualization};
use aws_sdk_ec2::primitives::DateTime as SdkDateTime;
use chrono::{DateTime, Utc};

pub fn timestamp_from_sdk(dt: &SdkDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

pub fn instance_from_sdk(sdk: &aws_sdk_ec2::types::Instance) -> Instance {
    Instance {
        instance_id: sdk.instance_id().unwrap_or_default().to_string(),
        instance_type: sdk
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        zone: sdk
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        state: sdk
            .state()
            .and_then(|s| s.name())
            .map(|n| InstanceState::parse(n.as_str()))
            .unwrap_or_default(),
        lifecycle: match sdk.instance_lifecycle().map(|l| l.as_str()) {
            Some("spot") => Lifecycle::Spot,
            _ => Lifecycle::OnDemand,
        },
        launch_time: sdk.launch_time().and_then(timestamp_from_sdk),
        ebs_optimized: sdk.ebs_optimized().unwrap_or(false),
        virtualization: sdk
            .virtualization_type()
            .map(|v| Virtualization::parse(v.as_str()))
            .unwrap_or_default(),
        tags: ec2_tags(sdk.tags()),
        security_group_ids: sdk
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect(),
        subnet_id: sdk.subnet_id().map(str::to_string),
        image_id: sdk.image_id().map(str::to_string),
        key_name: sdk.key_name().map(str::to_string),
    }
}

pub fn group_from_sdk(sdk: &aws_sdk_autoscaling::types::AutoScalingGroup, region: &str) -> Group {
    Group {
        name: sdk.auto_scaling_group_name().unwrap_or_default().to_string(),
        region: region.to_string(),
        desired_capacity: sdk.desired_capacity().unwrap_or(0) as i64,
        min_size: sdk.min_size().unwrap_or(0) as i64,
        max_size: sdk.max_size().unwrap_or(0) as i64,
        health_check_grace_period: sdk.health_check_grace_period().unwrap_or(0) as i64,
        launch_configuration_name: sdk.launch_configuration_name().map(str::to_string),
        launch_template: sdk.launch_template().and_then(|lt| {
            lt.launch_template_id().map(|id| LaunchTemplateRef {
                id: id.to_string(),
                version: lt.version().unwrap_or("$Default").to_string(),
            })
        }),
        members: sdk
            .instances()
            .iter()
            .filter_map(|i| {
                i.instance_id().map(|id| GroupMember {
                    instance_id: id.to_string(),
                    protected_from_scale_in: i.protected_from_scale_in().unwrap_or(false),
                })
            })
            .collect(),
        tags: sdk
            .tags()
            .iter()
            .filter_map(|t| {
                Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string()))
            })
            .collect(),
        uses_mixed_instances_policy: sdk.mixed_instances_policy().is_some(),
    }
}

pub fn launch_config_from_sdk(sdk: &aws_sdk_autoscaling::types::LaunchConfiguration) -> LaunchConfig {
    LaunchConfig {
        name: sdk.launch_configuration_name().unwrap_or_default().to_string(),
        image_id: sdk.image_id().map(str::to_string),
        key_name: sdk.key_name().map(str::to_string),
        iam_instance_profile: sdk.iam_instance_profile().map(str::to_string),
        user_data: sdk.user_data().map(str::to_string),
        instance_monitoring: sdk
            .instance_monitoring()
            .and_then(|m| m.enabled())
            .unwrap_or(false),
        associate_public_ip: sdk.associate_public_ip_address(),
        block_device_mappings: sdk
            .block_device_mappings()
            .iter()
            .map(|bdm| BlockDeviceMapping {
                device_name: bdm.device_name().map(str::to_string),
                virtual_name: bdm.virtual_name().map(str::to_string),
                no_device: bdm.no_device().unwrap_or(false),
                ebs: bdm.ebs().map(|ebs| EbsSpec {
                    delete_on_termination: ebs.delete_on_termination(),
                    encrypted: ebs.encrypted(),
                    iops: ebs.iops(),
                    snapshot_id: ebs.snapshot_id().map(str::to_string),
                    volume_size: ebs.volume_size(),
                    volume_type: ebs.volume_type().map(str::to_string),
                }),
            })
            .collect(),
    }
}

/// Launch template mappings use string `no_device` markers and their own
/// EBS shape; flattened to the same domain type as the configuration's.
pub fn launch_template_mapping_from_sdk(
    sdk: &aws_sdk_ec2::types::LaunchTemplateBlockDeviceMapping,
) -> BlockDeviceMapping {
    BlockDeviceMapping {
        device_name: sdk.device_name().map(str::to_string),
        virtual_name: sdk.virtual_name().map(str::to_string),
        no_device: sdk.no_device().is_some(),
        ebs: sdk.ebs().map(|ebs| EbsSpec {
            delete_on_termination: ebs.delete_on_termination(),
            encrypted: ebs.encrypted(),
            iops: ebs.iops(),
            snapshot_id: ebs.snapshot_id().map(str::to_string),
            volume_size: ebs.volume_size(),
            volume_type: ebs.volume_type().map(|v| v.as_str().to_string()),
        }),
    }
}

pub fn spot_request_from_sdk(sdk: &aws_sdk_ec2::types::SpotInstanceRequest) -> SpotRequest {
    SpotRequest {
        request_id: sdk.spot_instance_request_id().unwrap_or_default().to_string(),
        state: sdk
            .state()
            .map(|s| SpotRequestState::parse(s.as_str()))
            .unwrap_or(SpotRequestState::Unknown),
        status_code: sdk.status().and_then(|s| s.code()).map(str::to_string),
        instance_id: sdk.instance_id().map(str::to_string),
        tags: ec2_tags(sdk.tags()),
    }
}

/// Price history rows with an unparsable price or missing coordinates are
/// skipped, not errors.
pub fn spot_price_from_sdk(sdk: &aws_sdk_ec2::types::SpotPrice) -> Option<SpotPriceSample> {
    Some(SpotPriceSample {
        instance_type: sdk.instance_type().map(|t| t.as_str().to_string())?,
        zone: sdk.availability_zone()?.to_string(),
        price: sdk.spot_price()?.parse().ok()?,
        timestamp: sdk.timestamp().and_then(timestamp_from_sdk)?,
    })
}

fn ec2_tags(tags: &[aws_sdk_ec2::types::Tag]) -> Vec<(String, String)> {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}
