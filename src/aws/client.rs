//! Cloud control-plane client
//!
//! [`CloudApi`] is the seam between the engine and AWS: the scanner, the
//! decision layer and the swap executor only ever see this trait, which keeps
//! the capacity-ordering and compensation logic testable with a mock.
//! [`AwsCloud`] is the real implementation over the EC2 and Auto Scaling
//! SDK clients, one per region.
//!
//! Writes here are never assumed to be synchronously visible; callers treat
//! every mutation as at-least-once and reconcile through tags next cycle.

use crate::aws::helpers;
use crate::aws::launch::SpotLaunchSpec;
use crate::catalog::SpotPriceSample;
use crate::error::{Result, SpotctlError};
use crate::group::{BlockDeviceMapping, Group, LaunchConfig, SpotRequest, SpotRequestState};
use crate::instance::{Instance, LAUNCHED_FOR_ASG_TAG};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::types::{
    Filter, IamInstanceProfileSpecification, InstanceNetworkInterfaceSpecification, InstanceType,
    RequestSpotLaunchSpecification, RunInstancesMonitoringEnabled, SpotPlacement, Tag,
};
use std::time::Duration;
use tracing::{debug, warn};

const FULFILLMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const FULFILLMENT_MAX_ATTEMPTS: u32 = 36;

/// Every control-plane operation the engine performs, in domain terms.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// All Auto Scaling Groups in the region, with tags and membership.
    async fn describe_groups(&self) -> Result<Vec<Group>>;

    /// All pending/running instances in the region.
    async fn describe_instances(&self) -> Result<Vec<Instance>>;

    /// Current spot price history samples for the configured product.
    async fn describe_spot_prices(&self, product_description: &str)
        -> Result<Vec<SpotPriceSample>>;

    /// Spot requests carrying our group marker tag.
    async fn describe_spot_requests(&self) -> Result<Vec<SpotRequest>>;

    async fn describe_launch_configuration(&self, name: &str) -> Result<Option<LaunchConfig>>;

    /// Block device mappings of one launch template version.
    async fn describe_launch_template_mappings(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<Vec<BlockDeviceMapping>>;

    /// Whether the instance has API termination protection enabled.
    async fn is_termination_protected(&self, instance_id: &str) -> Result<bool>;

    /// Submits a one-instance spot request and returns its request ID.
    async fn request_spot_instance(&self, spec: &SpotLaunchSpec) -> Result<String>;

    /// Blocks until the request is fulfilled, returning the instance ID.
    /// Safe to re-enter across invocations; an interrupted wait is resumed by
    /// the next cycle rediscovering the open request from its tags.
    async fn wait_for_fulfillment(&self, request_id: &str) -> Result<String>;

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()>;

    async fn set_group_max_size(&self, group_name: &str, max_size: i64) -> Result<()>;

    async fn attach_instance(&self, group_name: &str, instance_id: &str) -> Result<()>;

    /// Detaches without decrementing desired capacity: the slot must be
    /// backfilled, never silently shrunk.
    async fn detach_instance(&self, group_name: &str, instance_id: &str) -> Result<()>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// Region-scoped client pair backing [`CloudApi`].
pub struct AwsCloud {
    ec2: aws_sdk_ec2::Client,
    autoscaling: aws_sdk_autoscaling::Client,
    region: String,
}

impl AwsCloud {
    pub async fn new(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            autoscaling: aws_sdk_autoscaling::Client::new(&sdk_config),
            region: region.to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl CloudApi for AwsCloud {
    async fn describe_groups(&self) -> Result<Vec<Group>> {
        let mut groups = Vec::new();
        let mut pages = self
            .autoscaling
            .describe_auto_scaling_groups()
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| SpotctlError::cloud("DescribeAutoScalingGroups", e))?;
            for group in page.auto_scaling_groups() {
                groups.push(helpers::group_from_sdk(group, &self.region));
            }
        }
        Ok(groups)
    }

    async fn describe_instances(&self) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut pages = self
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("pending")
                    .values("running")
                    .build(),
            )
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| SpotctlError::cloud("DescribeInstances", e))?;
            for reservation in page.reservations() {
                for instance in reservation.instances() {
                    instances.push(helpers::instance_from_sdk(instance));
                }
            }
        }
        Ok(instances)
    }

    async fn describe_spot_prices(
        &self,
        product_description: &str,
    ) -> Result<Vec<SpotPriceSample>> {
        let mut samples = Vec::new();
        let mut pages = self
            .ec2
            .describe_spot_price_history()
            .product_descriptions(product_description)
            .start_time(std::time::SystemTime::now().into())
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| SpotctlError::cloud("DescribeSpotPriceHistory", e))?;
            samples.extend(
                page.spot_price_history()
                    .iter()
                    .filter_map(helpers::spot_price_from_sdk),
            );
        }
        Ok(samples)
    }

    async fn describe_spot_requests(&self) -> Result<Vec<SpotRequest>> {
        let output = self
            .ec2
            .describe_spot_instance_requests()
            .filters(
                Filter::builder()
                    .name("tag-key")
                    .values(LAUNCHED_FOR_ASG_TAG)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("DescribeSpotInstanceRequests", e))?;
        Ok(output
            .spot_instance_requests()
            .iter()
            .map(helpers::spot_request_from_sdk)
            .collect())
    }

    async fn describe_launch_configuration(&self, name: &str) -> Result<Option<LaunchConfig>> {
        let output = self
            .autoscaling
            .describe_launch_configurations()
            .launch_configuration_names(name)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("DescribeLaunchConfigurations", e))?;
        Ok(output
            .launch_configurations()
            .first()
            .map(helpers::launch_config_from_sdk))
    }

    async fn describe_launch_template_mappings(
        &self,
        template_id: &str,
        version: &str,
    ) -> Result<Vec<BlockDeviceMapping>> {
        let output = self
            .ec2
            .describe_launch_template_versions()
            .launch_template_id(template_id)
            .versions(version)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("DescribeLaunchTemplateVersions", e))?;
        Ok(output
            .launch_template_versions()
            .first()
            .and_then(|v| v.launch_template_data())
            .map(|data| {
                data.block_device_mappings()
                    .iter()
                    .map(helpers::launch_template_mapping_from_sdk)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn is_termination_protected(&self, instance_id: &str) -> Result<bool> {
        let output = self
            .ec2
            .describe_instance_attribute()
            .instance_id(instance_id)
            .attribute(aws_sdk_ec2::types::InstanceAttributeName::DisableApiTermination)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("DescribeInstanceAttribute", e))?;
        Ok(output
            .disable_api_termination()
            .and_then(|v| v.value())
            .unwrap_or(false))
    }

    async fn request_spot_instance(&self, spec: &SpotLaunchSpec) -> Result<String> {
        let mut launch_spec = RequestSpotLaunchSpecification::builder()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .ebs_optimized(spec.ebs_optimized)
            .monitoring(
                RunInstancesMonitoringEnabled::builder()
                    .enabled(spec.monitoring)
                    .build(),
            )
            .placement(
                SpotPlacement::builder()
                    .availability_zone(&spec.zone)
                    .build(),
            );
        if let Some(key) = &spec.key_name {
            launch_spec = launch_spec.key_name(key);
        }
        // A public IP can only be requested through an explicit interface.
        if spec.associate_public_ip == Some(true) {
            let mut nic = InstanceNetworkInterfaceSpecification::builder()
                .device_index(0)
                .associate_public_ip_address(true);
            if let Some(subnet) = &spec.subnet_id {
                nic = nic.subnet_id(subnet);
            }
            for sg in &spec.security_group_ids {
                nic = nic.groups(sg);
            }
            launch_spec = launch_spec.network_interfaces(nic.build());
        } else {
            for sg in &spec.security_group_ids {
                launch_spec = launch_spec.security_group_ids(sg);
            }
            if let Some(subnet) = &spec.subnet_id {
                launch_spec = launch_spec.subnet_id(subnet);
            }
        }
        if let Some(user_data) = &spec.user_data {
            launch_spec = launch_spec.user_data(user_data);
        }
        if let Some(profile) = &spec.iam_instance_profile {
            launch_spec = launch_spec.iam_instance_profile(
                IamInstanceProfileSpecification::builder().name(profile).build(),
            );
        }
        for bdm in crate::aws::launch::ec2_block_device_mappings(&spec.block_device_mappings) {
            launch_spec = launch_spec.block_device_mappings(bdm);
        }

        let output = self
            .ec2
            .request_spot_instances()
            .spot_price(format!("{:.4}", spec.bid_price))
            .instance_count(1)
            .launch_specification(launch_spec.build())
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("RequestSpotInstances", e))?;

        output
            .spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id())
            .map(str::to_string)
            .ok_or_else(|| {
                SpotctlError::cloud_msg("RequestSpotInstances", "no request ID in response")
            })
    }

    async fn wait_for_fulfillment(&self, request_id: &str) -> Result<String> {
        for attempt in 0..FULFILLMENT_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(FULFILLMENT_POLL_INTERVAL).await;
            }

            let output = match self
                .ec2
                .describe_spot_instance_requests()
                .spot_instance_request_ids(request_id)
                .send()
                .await
            {
                Ok(output) => output,
                // Freshly created requests may not be describable yet.
                Err(e) => {
                    debug!(request_id, error = %e, "spot request not describable yet");
                    continue;
                }
            };

            let Some(request) = output
                .spot_instance_requests()
                .first()
                .map(helpers::spot_request_from_sdk)
            else {
                continue;
            };

            match request.state {
                SpotRequestState::Active => {
                    if let Some(instance_id) = request.instance_id {
                        return Ok(instance_id);
                    }
                }
                SpotRequestState::Open => {
                    debug!(
                        request_id,
                        status = request.status_code.as_deref().unwrap_or("unknown"),
                        "spot request still open"
                    );
                }
                state => {
                    return Err(SpotctlError::SpotRequestFailed {
                        request_id: request_id.to_string(),
                        reason: format!(
                            "request entered state {:?} ({})",
                            state,
                            request.status_code.as_deref().unwrap_or("no status")
                        ),
                    });
                }
            }
        }

        Err(SpotctlError::SpotRequestFailed {
            request_id: request_id.to_string(),
            reason: "fulfillment wait timed out for this invocation".to_string(),
        })
    }

    async fn create_tags(&self, resource_id: &str, tags: &[(String, String)]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut call = self.ec2.create_tags().resources(resource_id);
        for (key, value) in tags {
            call = call.tags(Tag::builder().key(key).value(value).build());
        }
        call.send()
            .await
            .map_err(|e| SpotctlError::cloud("CreateTags", e))?;
        Ok(())
    }

    async fn set_group_max_size(&self, group_name: &str, max_size: i64) -> Result<()> {
        self.autoscaling
            .update_auto_scaling_group()
            .auto_scaling_group_name(group_name)
            .max_size(max_size as i32)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("UpdateAutoScalingGroup", e))?;
        Ok(())
    }

    async fn attach_instance(&self, group_name: &str, instance_id: &str) -> Result<()> {
        self.autoscaling
            .attach_instances()
            .auto_scaling_group_name(group_name)
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("AttachInstances", e))?;
        Ok(())
    }

    async fn detach_instance(&self, group_name: &str, instance_id: &str) -> Result<()> {
        self.autoscaling
            .detach_instances()
            .auto_scaling_group_name(group_name)
            .instance_ids(instance_id)
            .should_decrement_desired_capacity(false)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("DetachInstances", e))?;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        warn!(instance_id, "terminating instance");
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| SpotctlError::cloud("TerminateInstances", e))?;
        Ok(())
    }
}
