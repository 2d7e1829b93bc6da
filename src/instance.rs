//! Instance model and the per-region instance map
//!
//! An [`Instance`] is our view of one live EC2 instance, flattened from the
//! SDK shape into the fields the decision engine needs. The per-region
//! [`InstanceManager`] is rebuilt from scratch every cycle and guarded by a
//! reader/writer lock because group tasks read it concurrently while the
//! scanner owns the only write phase.
//!
//! Tags are the only state that survives between invocations; the marker
//! tags below let any later cycle rediscover in-flight work with a fresh
//! query instead of in-memory continuation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Set on every resource we launch.
pub const LAUNCHED_BY_TAG: &str = "launched-by-spotctl";
/// Names the group a spot request/instance was launched for.
pub const LAUNCHED_FOR_ASG_TAG: &str = "launched-for-asg";
/// Names the on-demand instance a launch is meant to replace; at most one
/// outstanding launch per donor is enforced through this tag.
pub const LAUNCHED_FOR_REPLACING_TAG: &str = "launched-for-replacing-instance";

/// Tag key prefix reserved by the platform; never propagated.
pub const RESERVED_TAG_PREFIX: &str = "aws:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[default]
    Unknown,
}

impl InstanceState {
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => InstanceState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Virtualization {
    #[default]
    Hvm,
    Paravirtual,
}

impl Virtualization {
    pub fn parse(value: &str) -> Self {
        match value {
            "paravirtual" => Virtualization::Paravirtual,
            _ => Virtualization::Hvm,
        }
    }

    /// Matches the dataset's virtualization type tokens ("HVM"/"PV").
    pub fn matches_token(&self, token: &str) -> bool {
        matches!(
            (self, token),
            (Virtualization::Hvm, "HVM") | (Virtualization::Paravirtual, "PV")
        )
    }
}

/// One live instance as seen during the current cycle's scan.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub instance_id: String,
    pub instance_type: String,
    pub zone: String,
    pub state: InstanceState,
    pub lifecycle: Lifecycle,
    pub launch_time: Option<DateTime<Utc>>,
    pub ebs_optimized: bool,
    pub virtualization: Virtualization,
    pub tags: Vec<(String, String)>,
    pub security_group_ids: Vec<String>,
    pub subnet_id: Option<String>,
    pub image_id: Option<String>,
    pub key_name: Option<String>,
}

impl Instance {
    pub fn is_spot(&self) -> bool {
        self.lifecycle == Lifecycle::Spot
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Group this instance was launched for, when we launched it.
    pub fn launched_for_group(&self) -> Option<&str> {
        self.tag_value(LAUNCHED_FOR_ASG_TAG)
    }

    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.launch_time
            .map(|t| (now - t).num_seconds())
            .unwrap_or(0)
    }

    /// A spot instance is attachable once it is running and has aged past
    /// the group's health check grace period. Attaching earlier risks the
    /// group health checks churning the instance right back out.
    pub fn is_ready_to_attach(&self, grace_period_seconds: i64, now: DateTime<Utc>) -> bool {
        self.is_running() && self.uptime_seconds(now) > grace_period_seconds
    }

    pub fn can_terminate(&self) -> bool {
        !matches!(
            self.state,
            InstanceState::Terminated | InstanceState::ShuttingDown
        )
    }

    /// Tags safe to copy onto a replacement instance: everything except the
    /// platform-reserved namespace and our own marker tags.
    pub fn propagatable_tags(&self) -> Vec<(String, String)> {
        self.tags
            .iter()
            .filter(|(k, _)| {
                !k.starts_with(RESERVED_TAG_PREFIX)
                    && k != LAUNCHED_BY_TAG
                    && k != LAUNCHED_FOR_ASG_TAG
                    && k != LAUNCHED_FOR_REPLACING_TAG
            })
            .cloned()
            .collect()
    }
}

/// Region-wide instance map keyed by instance ID.
///
/// Written only by the scanner at the start of a cycle, then read
/// concurrently by the per-group tasks.
#[derive(Debug, Default)]
pub struct InstanceManager {
    catalog: RwLock<HashMap<String, Arc<Instance>>>,
}

impl InstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.catalog.write().expect("instance map poisoned").clear();
    }

    pub fn add(&self, instance: Instance) {
        let mut map = self.catalog.write().expect("instance map poisoned");
        map.insert(instance.instance_id.clone(), Arc::new(instance));
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.catalog
            .read()
            .expect("instance map poisoned")
            .get(instance_id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.catalog.read().expect("instance map poisoned").len()
    }
}
