//! Region scanner
//!
//! Assembles the complete per-region picture the decision engine runs on:
//! enabled groups, their live members, tagged spot requests and the type
//! catalog. Everything is queried fresh each cycle; tags are the only
//! state carried across invocations.
//!
//! Any API failure aborts the whole region scan. A partial, inconsistent
//! view could launch against stale membership, so the region degrades to
//! "no groups processed this cycle" instead.

use crate::aws::client::CloudApi;
use crate::catalog::{RawDataset, TypeCatalog};
use crate::config::{Config, TagFilter, TagFilteringMode};
use crate::error::Result;
use crate::group::{Group, GroupConfig, GroupView, MemberInstance, SpotRequest};
use crate::instance::InstanceManager;
use chrono::Utc;
use globset::Glob;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything scanned for one region in one cycle.
pub struct RegionScan {
    pub region: String,
    pub catalog: Arc<TypeCatalog>,
    pub views: Vec<GroupView>,
}

pub async fn scan_region(
    api: &dyn CloudApi,
    region: &str,
    config: &Config,
    dataset: &RawDataset,
) -> Result<RegionScan> {
    let filters = config.resolved_tag_filters();
    let groups: Vec<Group> = api
        .describe_groups()
        .await?
        .into_iter()
        .filter(|g| {
            if g.uses_mixed_instances_policy {
                debug!(group = %g.name, "skipping group with a mixed instances policy");
                return false;
            }
            group_enabled(g, &filters, config.tag_filtering_mode)
        })
        .collect();

    if groups.is_empty() {
        debug!(region, "no enabled groups");
        return Ok(RegionScan {
            region: region.to_string(),
            catalog: Arc::new(TypeCatalog::default()),
            views: Vec::new(),
        });
    }
    info!(region, groups = groups.len(), "scanning enabled groups");

    let manager = InstanceManager::new();
    for instance in api.describe_instances().await? {
        manager.add(instance);
    }

    let samples = api
        .describe_spot_prices(&config.spot_product_description)
        .await?;
    let mut catalog = TypeCatalog::build(dataset, region, config);
    catalog.merge_spot_prices(&samples);
    debug!(
        region,
        types = catalog.len(),
        instances = manager.count(),
        "region catalog built"
    );

    let requests = api.describe_spot_requests().await?;

    let now = Utc::now();
    let mut views = Vec::with_capacity(groups.len());
    for group in groups {
        views.push(build_view(api, config, group, &manager, &requests, now).await?);
    }

    Ok(RegionScan {
        region: region.to_string(),
        catalog: Arc::new(catalog),
        views,
    })
}

async fn build_view(
    api: &dyn CloudApi,
    config: &Config,
    group: Group,
    manager: &InstanceManager,
    requests: &[SpotRequest],
    now: chrono::DateTime<Utc>,
) -> Result<GroupView> {
    let mut members = Vec::with_capacity(group.members.len());
    for member in &group.members {
        let Some(instance) = manager.get(&member.instance_id) else {
            // Reported by the control plane but not yet visible in EC2.
            debug!(
                group = %group.name,
                instance_id = %member.instance_id,
                "member instance not visible yet"
            );
            continue;
        };
        let protected_from_termination = if instance.is_spot() {
            false
        } else {
            match api.is_termination_protected(&instance.instance_id).await {
                Ok(protected) => protected,
                // Unknown protection state: treat as protected, never pick
                // a donor we are unsure about.
                Err(e) => {
                    warn!(
                        group = %group.name,
                        instance_id = %instance.instance_id,
                        error = %e,
                        "could not read termination protection"
                    );
                    true
                }
            }
        };
        members.push(MemberInstance {
            instance,
            protected_from_scale_in: member.protected_from_scale_in,
            protected_from_termination,
        });
    }

    let spot_requests: Vec<SpotRequest> = requests
        .iter()
        .filter(|r| r.launched_for_group() == Some(group.name.as_str()))
        .cloned()
        .collect();

    let mut request_instances = HashMap::new();
    for request in &spot_requests {
        if let Some(instance_id) = request.instance_id.as_deref() {
            if let Some(instance) = manager.get(instance_id) {
                request_instances.insert(instance_id.to_string(), instance);
            }
        }
    }

    let launch_config = match &group.launch_configuration_name {
        Some(name) => api.describe_launch_configuration(name).await?,
        None => None,
    };
    let launch_template_mappings = match &group.launch_template {
        Some(template) => {
            api.describe_launch_template_mappings(&template.id, &template.version)
                .await?
        }
        None => Vec::new(),
    };

    let group_config = GroupConfig::resolve(&group, members.len(), config);
    Ok(GroupView {
        group,
        config: group_config,
        members,
        spot_requests,
        request_instances,
        launch_config,
        launch_template_mappings,
        now,
    })
}

/// Opt-in mode enables groups matching every filter; opt-out enables
/// everything except groups matching any filter. Filter values are globs.
pub fn group_enabled(group: &Group, filters: &[TagFilter], mode: TagFilteringMode) -> bool {
    let matches_filter = |filter: &TagFilter| {
        group
            .tag_value(&filter.key)
            .map(|value| glob_matches(&filter.value, value))
            .unwrap_or(false)
    };
    match mode {
        TagFilteringMode::OptIn => filters.iter().all(matches_filter),
        TagFilteringMode::OptOut => !filters.iter().any(matches_filter),
    }
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(value),
        Err(e) => {
            warn!(pattern, error = %e, "invalid tag filter glob");
            pattern == value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::client::MockCloudApi;
    use crate::catalog::{LinuxPrices, RawInstance, RegionPrices, SpotPriceSample};
    use crate::error::SpotctlError;
    use crate::group::{GroupMember, SpotRequestState};
    use crate::instance::{Instance, InstanceState, Lifecycle, LAUNCHED_FOR_ASG_TAG};

    fn tagged_group(name: &str, tags: Vec<(&str, &str)>) -> Group {
        Group {
            name: name.to_string(),
            region: "us-east-1".to_string(),
            desired_capacity: 2,
            min_size: 1,
            max_size: 4,
            tags: tags
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Group::default()
        }
    }

    fn filters() -> Vec<TagFilter> {
        Config::default().resolved_tag_filters()
    }

    #[test]
    fn opt_in_requires_every_filter_to_match() {
        let enabled = tagged_group("a", vec![("spot-enabled", "true")]);
        let disabled = tagged_group("b", vec![("spot-enabled", "false")]);
        let untagged = tagged_group("c", vec![]);
        assert!(group_enabled(&enabled, &filters(), TagFilteringMode::OptIn));
        assert!(!group_enabled(&disabled, &filters(), TagFilteringMode::OptIn));
        assert!(!group_enabled(&untagged, &filters(), TagFilteringMode::OptIn));
    }

    #[test]
    fn opt_out_enables_everything_else() {
        let tagged = tagged_group("a", vec![("spot-enabled", "true")]);
        let untagged = tagged_group("b", vec![]);
        assert!(!group_enabled(&tagged, &filters(), TagFilteringMode::OptOut));
        assert!(group_enabled(&untagged, &filters(), TagFilteringMode::OptOut));
    }

    #[test]
    fn filter_values_match_as_globs() {
        let group = tagged_group("a", vec![("env", "prod-eu")]);
        let filters = vec![TagFilter {
            key: "env".to_string(),
            value: "prod-*".to_string(),
        }];
        assert!(group_enabled(&group, &filters, TagFilteringMode::OptIn));
    }

    fn dataset() -> RawDataset {
        RawDataset {
            instances: vec![RawInstance {
                instance_type: "m4.large".to_string(),
                vcpu: 2,
                memory: 8.0,
                gpu: 0,
                physical_processor: "Intel Xeon".to_string(),
                ebs_throughput: 56.25,
                linux_virtualization_types: vec!["HVM".to_string()],
                ebs_optimized: false,
                storage: None,
                pricing: HashMap::from([(
                    "us-east-1".to_string(),
                    RegionPrices {
                        linux: LinuxPrices {
                            ondemand: "0.10".to_string(),
                        },
                        ebs_surcharge: 0.0,
                    },
                )]),
            }],
        }
    }

    fn running(id: &str, spot: bool, tags: Vec<(String, String)>) -> Instance {
        Instance {
            instance_id: id.to_string(),
            instance_type: "m4.large".to_string(),
            zone: "us-east-1a".to_string(),
            state: InstanceState::Running,
            lifecycle: if spot { Lifecycle::Spot } else { Lifecycle::OnDemand },
            tags,
            ..Instance::default()
        }
    }

    #[tokio::test]
    async fn scan_joins_members_requests_and_catalog() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups().returning(|| {
            let mut enabled = tagged_group("web-asg", vec![("spot-enabled", "true")]);
            enabled.members = vec![
                GroupMember {
                    instance_id: "i-donor".to_string(),
                    protected_from_scale_in: false,
                },
                GroupMember {
                    instance_id: "i-gone".to_string(),
                    protected_from_scale_in: false,
                },
            ];
            Ok(vec![enabled, tagged_group("other", vec![])])
        });
        api.expect_describe_instances().returning(|| {
            Ok(vec![
                running("i-donor", false, vec![]),
                running(
                    "i-pending-spot",
                    true,
                    vec![(LAUNCHED_FOR_ASG_TAG.to_string(), "web-asg".to_string())],
                ),
            ])
        });
        api.expect_describe_spot_prices().returning(|_| {
            Ok(vec![SpotPriceSample {
                instance_type: "m4.large".to_string(),
                zone: "us-east-1a".to_string(),
                price: 0.03,
                timestamp: Utc::now(),
            }])
        });
        api.expect_describe_spot_requests().returning(|| {
            Ok(vec![SpotRequest {
                request_id: "sir-1".to_string(),
                state: SpotRequestState::Active,
                status_code: Some("fulfilled".to_string()),
                instance_id: Some("i-pending-spot".to_string()),
                tags: vec![(LAUNCHED_FOR_ASG_TAG.to_string(), "web-asg".to_string())],
            }])
        });
        api.expect_is_termination_protected()
            .returning(|_| Ok(false));

        let scan = scan_region(&api, "us-east-1", &Config::default(), &dataset())
            .await
            .unwrap();
        assert_eq!(scan.views.len(), 1);

        let view = &scan.views[0];
        assert_eq!(view.group.name, "web-asg");
        // The invisible member was skipped, the visible one joined.
        assert_eq!(view.members.len(), 1);
        assert_eq!(view.members[0].instance.instance_id, "i-donor");
        assert_eq!(view.spot_requests.len(), 1);
        assert!(view.request_instances.contains_key("i-pending-spot"));
        assert!(scan.catalog.get("m4.large").is_some());
        assert_eq!(
            scan.catalog
                .get("m4.large")
                .unwrap()
                .pricing
                .spot
                .get("us-east-1a"),
            Some(&0.03)
        );
    }

    // Launch-template groups carry their block device mappings too, so the
    // storage filter sees ephemeral disks that no launch configuration maps.
    #[tokio::test]
    async fn launch_template_mappings_reach_the_view() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups().returning(|| {
            let mut group = tagged_group("web-asg", vec![("spot-enabled", "true")]);
            group.launch_template = Some(crate::group::LaunchTemplateRef {
                id: "lt-1".to_string(),
                version: "3".to_string(),
            });
            Ok(vec![group])
        });
        api.expect_describe_instances().returning(|| Ok(vec![]));
        api.expect_describe_spot_prices().returning(|_| Ok(vec![]));
        api.expect_describe_spot_requests().returning(|| Ok(vec![]));
        api.expect_describe_launch_template_mappings()
            .withf(|id, version| id == "lt-1" && version == "3")
            .times(1)
            .returning(|_, _| {
                Ok(vec![crate::group::BlockDeviceMapping {
                    virtual_name: Some("ephemeral0".to_string()),
                    ..crate::group::BlockDeviceMapping::default()
                }])
            });

        let scan = scan_region(&api, "us-east-1", &Config::default(), &dataset())
            .await
            .unwrap();
        assert_eq!(scan.views[0].attached_ephemeral_volumes(), 1);
    }

    #[tokio::test]
    async fn no_enabled_groups_short_circuits() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups()
            .returning(|| Ok(vec![tagged_group("other", vec![])]));
        // No further queries expected.
        let scan = scan_region(&api, "us-east-1", &Config::default(), &dataset())
            .await
            .unwrap();
        assert!(scan.views.is_empty());
    }

    #[tokio::test]
    async fn mixed_instances_policy_groups_are_skipped() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups().returning(|| {
            let mut group = tagged_group("web-asg", vec![("spot-enabled", "true")]);
            group.uses_mixed_instances_policy = true;
            Ok(vec![group])
        });
        let scan = scan_region(&api, "us-east-1", &Config::default(), &dataset())
            .await
            .unwrap();
        assert!(scan.views.is_empty());
    }

    #[tokio::test]
    async fn unknown_termination_protection_is_treated_as_protected() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups().returning(|| {
            let mut group = tagged_group("web-asg", vec![("spot-enabled", "true")]);
            group.members = vec![GroupMember {
                instance_id: "i-donor".to_string(),
                protected_from_scale_in: false,
            }];
            Ok(vec![group])
        });
        api.expect_describe_instances()
            .returning(|| Ok(vec![running("i-donor", false, vec![])]));
        api.expect_describe_spot_prices().returning(|_| Ok(vec![]));
        api.expect_describe_spot_requests().returning(|| Ok(vec![]));
        api.expect_is_termination_protected().returning(|_| {
            Err(SpotctlError::cloud_msg("DescribeInstanceAttribute", "throttled"))
        });

        let scan = scan_region(&api, "us-east-1", &Config::default(), &dataset())
            .await
            .unwrap();
        assert!(scan.views[0].members[0].protected_from_termination);
        assert!(scan.views[0].find_donor(None).is_none());
    }

    #[tokio::test]
    async fn api_failure_aborts_the_region() {
        let mut api = MockCloudApi::new();
        api.expect_describe_groups()
            .returning(|| Ok(vec![tagged_group("web-asg", vec![("spot-enabled", "true")])]));
        api.expect_describe_instances()
            .returning(|| Err(SpotctlError::cloud_msg("DescribeInstances", "throttled")));

        let result = scan_region(&api, "us-east-1", &Config::default(), &dataset()).await;
        assert!(matches!(result, Err(SpotctlError::CloudApi { .. })));
    }
}
