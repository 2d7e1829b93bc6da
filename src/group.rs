//! Auto Scaling Group model and per-group configuration
//!
//! A [`Group`] is the scanned control-plane view of one ASG. The per-group
//! [`GroupConfig`] is resolved once per cycle from the group's tags with the
//! global config as fallback, so every override is validated in one place
//! and the decision logic only ever sees typed values.
//!
//! Tag override names follow the `spotctl_${setting}` convention.

use crate::config::{AllocationBias, Config};
use crate::instance::Instance;
use crate::pricing::BiddingPolicy;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MIN_ON_DEMAND_NUMBER_TAG: &str = "spotctl_min_on_demand_number";
pub const MIN_ON_DEMAND_PERCENTAGE_TAG: &str = "spotctl_min_on_demand_percentage";
pub const BIDDING_POLICY_TAG: &str = "spotctl_bidding_policy";
pub const SPOT_PRICE_BUFFER_PERCENTAGE_TAG: &str = "spotctl_spot_price_buffer_percentage";
pub const ALLOWED_INSTANCE_TYPES_TAG: &str = "spotctl_allowed_instance_types";
pub const DISALLOWED_INSTANCE_TYPES_TAG: &str = "spotctl_disallowed_instance_types";
pub const ALLOCATION_BIAS_TAG: &str = "spotctl_allocation_bias";
pub const CRON_SCHEDULE_TAG: &str = "spotctl_cron_schedule";
pub const CRON_TIMEZONE_TAG: &str = "spotctl_cron_timezone";
pub const CRON_SCHEDULE_STATE_TAG: &str = "spotctl_cron_schedule_state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplateRef {
    pub id: String,
    pub version: String,
}

/// Membership entry as reported by the ASG control plane.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub instance_id: String,
    pub protected_from_scale_in: bool,
}

/// One opted-in Auto Scaling Group, as scanned this cycle.
#[derive(Debug, Clone, Default)]
pub struct Group {
    pub name: String,
    pub region: String,
    pub desired_capacity: i64,
    pub min_size: i64,
    pub max_size: i64,
    /// Seconds after launch before the group health-checks an instance.
    pub health_check_grace_period: i64,
    pub launch_configuration_name: Option<String>,
    pub launch_template: Option<LaunchTemplateRef>,
    pub members: Vec<GroupMember>,
    pub tags: Vec<(String, String)>,
    pub uses_mixed_instances_policy: bool,
}

impl Group {
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_member(&self, instance_id: &str) -> bool {
        self.members.iter().any(|m| m.instance_id == instance_id)
    }
}

/// Launch configuration fields the engine needs: the ephemeral volume count
/// for storage compatibility, and the template fields the launch spec
/// builder copies over.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub name: String,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    pub user_data: Option<String>,
    pub instance_monitoring: bool,
    pub associate_public_ip: Option<bool>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDeviceMapping {
    pub device_name: Option<String>,
    /// "ephemeralN" for instance-store volumes.
    pub virtual_name: Option<String>,
    pub no_device: bool,
    pub ebs: Option<EbsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EbsSpec {
    pub delete_on_termination: Option<bool>,
    pub encrypted: Option<bool>,
    pub iops: Option<i32>,
    pub snapshot_id: Option<String>,
    pub volume_size: Option<i32>,
    pub volume_type: Option<String>,
}

impl LaunchConfig {
    pub fn ephemeral_volume_count(&self) -> i64 {
        ephemeral_volume_count(&self.block_device_mappings)
    }
}

/// Instance-store volumes actually mapped, which is what storage
/// compatibility is measured against (not the type's theoretical device
/// count).
pub fn ephemeral_volume_count(mappings: &[BlockDeviceMapping]) -> i64 {
    mappings
        .iter()
        .filter(|bdm| {
            !bdm.no_device
                && bdm
                    .virtual_name
                    .as_deref()
                    .map(|v| v.starts_with("ephemeral"))
                    .unwrap_or(false)
        })
        .count() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
    Unknown,
}

impl SpotRequestState {
    pub fn parse(value: &str) -> Self {
        match value {
            "open" => SpotRequestState::Open,
            "active" => SpotRequestState::Active,
            "closed" => SpotRequestState::Closed,
            "cancelled" => SpotRequestState::Cancelled,
            "failed" => SpotRequestState::Failed,
            _ => SpotRequestState::Unknown,
        }
    }
}

/// A spot instance request tagged for one of our groups.
#[derive(Debug, Clone)]
pub struct SpotRequest {
    pub request_id: String,
    pub state: SpotRequestState,
    pub status_code: Option<String>,
    pub instance_id: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl SpotRequest {
    pub fn is_open(&self) -> bool {
        self.state == SpotRequestState::Open
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state == SpotRequestState::Active
            && self.instance_id.is_some()
            && self
                .status_code
                .as_deref()
                .map(|c| c == "fulfilled")
                .unwrap_or(true)
    }

    pub fn launched_for_group(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == crate::instance::LAUNCHED_FOR_ASG_TAG)
            .map(|(_, v)| v.as_str())
    }
}

/// Typed per-group configuration, resolved once per cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub min_on_demand: i64,
    pub allowed_types: Vec<String>,
    pub disallowed_types: Vec<String>,
    pub bidding_policy: BiddingPolicy,
    pub spot_price_buffer_percentage: f64,
    pub allocation_bias: AllocationBias,
    pub cron_schedule: String,
    pub cron_timezone: String,
    pub cron_schedule_state: String,
}

impl GroupConfig {
    /// Resolves the group's effective configuration: tag overrides first,
    /// then global config, then documented defaults. Invalid tag values are
    /// logged and ignored rather than failing the group.
    pub fn resolve(group: &Group, member_count: usize, global: &Config) -> Self {
        let min_on_demand = resolve_min_on_demand(group, member_count, global);

        let allowed_types = group
            .tag_value(ALLOWED_INSTANCE_TYPES_TAG)
            .map(crate::config::split_type_list)
            .unwrap_or_else(|| global.allowed_type_patterns());
        let disallowed_types = group
            .tag_value(DISALLOWED_INSTANCE_TYPES_TAG)
            .map(crate::config::split_type_list)
            .unwrap_or_else(|| global.disallowed_type_patterns());

        let bidding_policy = group
            .tag_value(BIDDING_POLICY_TAG)
            .map(BiddingPolicy::parse)
            .unwrap_or(global.bidding_policy);

        let spot_price_buffer_percentage = group
            .tag_value(SPOT_PRICE_BUFFER_PERCENTAGE_TAG)
            .and_then(|v| match v.parse::<f64>() {
                Ok(p) if p >= 0.0 => Some(p),
                Ok(p) => {
                    warn!(group = %group.name, value = p, "ignoring negative spot price buffer");
                    None
                }
                Err(e) => {
                    warn!(group = %group.name, error = %e, "unparsable spot price buffer tag");
                    None
                }
            })
            .unwrap_or(global.spot_price_buffer_percentage);

        let allocation_bias = group
            .tag_value(ALLOCATION_BIAS_TAG)
            .map(AllocationBias::parse)
            .unwrap_or(global.allocation_bias);

        let cron_schedule = group
            .tag_value(CRON_SCHEDULE_TAG)
            .unwrap_or(&global.cron_schedule)
            .to_string();
        let cron_timezone = group
            .tag_value(CRON_TIMEZONE_TAG)
            .unwrap_or(&global.cron_timezone)
            .to_string();
        let cron_schedule_state = group
            .tag_value(CRON_SCHEDULE_STATE_TAG)
            .unwrap_or(&global.cron_schedule_state)
            .to_string();

        GroupConfig {
            min_on_demand,
            allowed_types,
            disallowed_types,
            bidding_policy,
            spot_price_buffer_percentage,
            allocation_bias,
            cron_schedule,
            cron_timezone,
            cron_schedule_state,
        }
    }

    /// Allow list with the "current" shorthand expanded to the reference's
    /// own type.
    pub fn allowed_types_for(&self, reference_type: &str) -> Vec<String> {
        if self.allowed_types.len() == 1 && self.allowed_types[0] == "current" {
            vec![reference_type.to_string()]
        } else {
            self.allowed_types.clone()
        }
    }
}

fn resolve_min_on_demand(group: &Group, member_count: usize, global: &Config) -> i64 {
    // Tag overrides take priority, absolute number before percentage.
    if let Some(value) = group.tag_value(MIN_ON_DEMAND_NUMBER_TAG) {
        match value.parse::<i64>() {
            Ok(n) if n >= 0 && n <= group.max_size => return n,
            Ok(n) => warn!(group = %group.name, value = n, "min on-demand number out of range"),
            Err(e) => warn!(group = %group.name, error = %e, "unparsable min on-demand number tag"),
        }
    }
    if let Some(value) = group.tag_value(MIN_ON_DEMAND_PERCENTAGE_TAG) {
        match value.parse::<f64>() {
            Ok(p) if (0.0..=100.0).contains(&p) => {
                return percentage_of(member_count, p);
            }
            Ok(p) => warn!(group = %group.name, value = p, "min on-demand percentage out of range"),
            Err(e) => warn!(group = %group.name, error = %e, "unparsable min on-demand percentage tag"),
        }
    }

    if global.min_on_demand_number > 0 && global.min_on_demand_number <= member_count as i64 {
        return global.min_on_demand_number;
    }
    if global.min_on_demand_percentage > 0.0 && global.min_on_demand_percentage <= 100.0 {
        return percentage_of(member_count, global.min_on_demand_percentage);
    }
    debug!(group = %group.name, "no minimum on-demand capacity configured");
    0
}

/// Rounded half-up, matching how operators express "keep 30% on-demand".
fn percentage_of(count: usize, percentage: f64) -> i64 {
    ((count as f64) * percentage / 100.0 + 0.5).floor() as i64
}

/// A member instance joined with its protection flags. Protected instances
/// are never chosen as replacement donors.
#[derive(Debug, Clone)]
pub struct MemberInstance {
    pub instance: Arc<Instance>,
    pub protected_from_scale_in: bool,
    pub protected_from_termination: bool,
}

impl MemberInstance {
    pub fn is_protected(&self) -> bool {
        self.protected_from_scale_in || self.protected_from_termination
    }
}

/// Everything the decision state machine sees for one group in one cycle.
/// Assembled by the scanner from fresh queries only.
#[derive(Debug)]
pub struct GroupView {
    pub group: Group,
    pub config: GroupConfig,
    pub members: Vec<MemberInstance>,
    /// Spot requests tagged `launched-for-asg` with this group's name.
    pub spot_requests: Vec<SpotRequest>,
    /// Instances backing fulfilled requests, keyed by instance ID. May
    /// include instances that are not yet group members.
    pub request_instances: HashMap<String, Arc<Instance>>,
    pub launch_config: Option<LaunchConfig>,
    /// Block device mappings of the group's launch template version, empty
    /// when the group has none.
    pub launch_template_mappings: Vec<BlockDeviceMapping>,
    pub now: DateTime<Utc>,
}

impl GroupView {
    /// (matching, total) running member counts; `spot` selects the lifecycle
    /// counted, `zone` optionally restricts the match to one AZ.
    pub fn running_count(&self, spot: bool, zone: Option<&str>) -> (i64, i64) {
        let mut count = 0;
        let mut total = 0;
        for member in &self.members {
            let inst = &member.instance;
            if !inst.is_running() {
                continue;
            }
            total += 1;
            if inst.is_spot() == spot && zone.map(|z| z == inst.zone).unwrap_or(true) {
                count += 1;
            }
        }
        (count, total)
    }

    pub fn on_demand_running(&self) -> i64 {
        self.running_count(false, None).0
    }

    /// Any running, unprotected on-demand member, optionally restricted to a
    /// zone. Spot members and protected members are never donors.
    pub fn find_donor(&self, zone: Option<&str>) -> Option<&MemberInstance> {
        self.members.iter().find(|member| {
            let inst = &member.instance;
            inst.is_running()
                && !inst.is_spot()
                && !member.is_protected()
                && zone.map(|z| z == inst.zone).unwrap_or(true)
        })
    }

    pub fn any_running_spot(&self) -> Option<&MemberInstance> {
        self.members
            .iter()
            .find(|m| m.instance.is_running() && m.instance.is_spot())
    }

    /// Running spot members of one exact type in one zone, for the
    /// redundancy guard.
    pub fn spot_count_of_type_in_zone(&self, instance_type: &str, zone: &str) -> i64 {
        self.members
            .iter()
            .filter(|m| {
                let inst = &m.instance;
                inst.is_running()
                    && inst.is_spot()
                    && inst.instance_type == instance_type
                    && inst.zone == zone
            })
            .count() as i64
    }

    /// Ephemeral volumes attached through the launch configuration or the
    /// launch template, whichever maps more.
    pub fn attached_ephemeral_volumes(&self) -> i64 {
        let from_config = self
            .launch_config
            .as_ref()
            .map(|lc| lc.ephemeral_volume_count())
            .unwrap_or(0);
        from_config.max(ephemeral_volume_count(&self.launch_template_mappings))
    }
}
