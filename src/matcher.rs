//! Compatibility matcher
//!
//! Given a running on-demand reference instance and the region catalog,
//! produces the ordered list of spot instance types that can safely take
//! over the reference's capacity slot. A type survives only if it passes
//! every filter; the survivors are ranked ascending by comparable price,
//! optionally biased towards newer generations.
//!
//! Finding nothing is a frequent, quiet outcome
//! ([`SpotctlError::NoCandidate`]), not a fault.

use crate::catalog::{InstanceTypeInfo, TypeCatalog};
use crate::config::AllocationBias;
use crate::error::{Result, SpotctlError};
use crate::group::GroupView;
use crate::instance::Instance;
use globset::Glob;
use tracing::{debug, warn};

/// Penalty folded into the comparable price per generation behind the
/// newest, when the prefer-newer-generation bias is active.
const GENERATION_PRICE_PENALTY: f64 = 0.1;

/// A surviving candidate with the price it was compared at (spot price in
/// the reference's zone, plus the EBS surcharge where applicable).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub info: InstanceTypeInfo,
    pub price: f64,
}

/// Runs every candidate type in the catalog through the compatibility
/// filters against `reference` and returns the survivors cheapest-first.
pub fn find_candidates(
    reference: &Instance,
    ref_info: &InstanceTypeInfo,
    catalog: &TypeCatalog,
    view: &GroupView,
    allowed: &[String],
    disallowed: &[String],
    bias: AllocationBias,
) -> Result<Vec<Candidate>> {
    let reference_price = effective_on_demand_price(ref_info);

    // Ephemeral volumes actually attached via the launch configuration,
    // capped by what the reference type can hold at all.
    let attached_volumes = view
        .attached_ephemeral_volumes()
        .min(ref_info.instance_store_device_count);

    let mut survivors: Vec<Candidate> = Vec::new();

    for candidate in catalog.iter_sorted() {
        let price = candidate_price(reference, candidate);

        let compatible = is_allowed(&candidate.instance_type, allowed, disallowed)
            && is_price_compatible(price, reference_price)
            && is_ebs_compatible(candidate, ref_info)
            && is_class_compatible(candidate, ref_info)
            && is_storage_compatible(candidate, ref_info, attached_volumes)
            && is_virtualization_compatible(&candidate.virtualization_types, reference)
            && passes_redundancy_guard(view, &candidate.instance_type, &reference.zone);

        if compatible {
            debug!(
                candidate = %candidate.instance_type,
                price,
                reference = %ref_info.instance_type,
                reference_price,
                "compatible spot candidate found"
            );
            survivors.push(Candidate {
                info: candidate.clone(),
                price,
            });
        }
    }

    if survivors.is_empty() {
        return Err(SpotctlError::NoCandidate {
            instance_type: ref_info.instance_type.clone(),
            zone: reference.zone.clone(),
        });
    }

    rank(&mut survivors, catalog, bias);
    Ok(survivors)
}

/// What the reference effectively costs per hour on demand.
pub fn effective_on_demand_price(info: &InstanceTypeInfo) -> f64 {
    info.pricing.on_demand + info.pricing.premium
}

/// What the candidate would cost in the reference's zone right now.
pub fn candidate_price(reference: &Instance, candidate: &InstanceTypeInfo) -> f64 {
    let spot = candidate
        .pricing
        .spot
        .get(&reference.zone)
        .copied()
        .unwrap_or(0.0);
    if reference.ebs_optimized {
        spot + candidate.pricing.ebs_surcharge
    } else {
        spot
    }
}

/// An allow list is exclusive when non-empty; otherwise a deny list rejects
/// its matches; both empty passes everything. Patterns are globs.
fn is_allowed(instance_type: &str, allowed: &[String], disallowed: &[String]) -> bool {
    if !allowed.is_empty() {
        return matches_any(allowed, instance_type);
    }
    if !disallowed.is_empty() {
        return !matches_any(disallowed, instance_type);
    }
    true
}

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid instance type glob");
            false
        }
    })
}

/// A zero price means the type is unavailable in the zone; anything above
/// the reference's effective on-demand price would lose money.
fn is_price_compatible(candidate_price: f64, reference_price: f64) -> bool {
    candidate_price > 0.0 && candidate_price <= reference_price
}

fn is_class_compatible(candidate: &InstanceTypeInfo, reference: &InstanceTypeInfo) -> bool {
    is_same_arch(&candidate.physical_processor, &reference.physical_processor)
        && candidate.vcpu >= reference.vcpu
        && candidate.memory >= reference.memory
        && candidate.gpu >= reference.gpu
}

/// x86 chips (Intel, AMD, and the "Variable" oddball) are mutually
/// compatible; ARM ("AWS Graviton") only with ARM. Never across families.
fn is_same_arch(candidate_cpu: &str, reference_cpu: &str) -> bool {
    (is_x86(candidate_cpu) && is_x86(reference_cpu))
        || (is_arm(candidate_cpu) && is_arm(reference_cpu))
}

fn is_x86(cpu: &str) -> bool {
    cpu.contains("Intel") || cpu.contains("AMD") || cpu.contains("Variable")
}

fn is_arm(cpu: &str) -> bool {
    cpu.contains("AWS")
}

/// Never silently downgrade I/O capability.
fn is_ebs_compatible(candidate: &InstanceTypeInfo, reference: &InstanceTypeInfo) -> bool {
    candidate.ebs_throughput >= reference.ebs_throughput
}

/// Storage compatibility when the reference has attached ephemeral volumes:
/// enough devices, at least the per-device size, and never spinning disk
/// where the reference was solid-state.
fn is_storage_compatible(
    candidate: &InstanceTypeInfo,
    reference: &InstanceTypeInfo,
    attached_volumes: i64,
) -> bool {
    attached_volumes == 0
        || (candidate.instance_store_device_count >= attached_volumes
            && candidate.instance_store_device_size >= reference.instance_store_device_size
            && (candidate.instance_store_is_ssd
                || candidate.instance_store_is_ssd == reference.instance_store_is_ssd))
}

/// An empty supported list defaults to HVM-only.
fn is_virtualization_compatible(supported: &[String], reference: &Instance) -> bool {
    if supported.is_empty() {
        return reference.virtualization.matches_token("HVM");
    }
    supported
        .iter()
        .any(|token| reference.virtualization.matches_token(token))
}

/// Caps correlated-interruption risk: running spot instances of one exact
/// type in one zone must stay below a quarter of the group's desired
/// capacity. The 1:4 threshold is a deliberate policy constant.
fn passes_redundancy_guard(view: &GroupView, instance_type: &str, zone: &str) -> bool {
    let count = view.spot_count_of_type_in_zone(instance_type, zone);
    if count == 0 {
        return true;
    }
    (view.group.desired_capacity as f64) / (count as f64) > 4.0
}

/// Ascending by comparable price; the generation bias folds a penalty of
/// 10% per generation behind the family's newest into the sort key. Ties
/// break on the type name for determinism.
fn rank(candidates: &mut [Candidate], catalog: &TypeCatalog, bias: AllocationBias) {
    candidates.sort_by(|a, b| {
        let ka = sort_price(a, catalog, bias);
        let kb = sort_price(b, catalog, bias);
        ka.total_cmp(&kb)
            .then_with(|| a.info.instance_type.cmp(&b.info.instance_type))
    });
}

fn sort_price(candidate: &Candidate, catalog: &TypeCatalog, bias: AllocationBias) -> f64 {
    match bias {
        AllocationBias::LowestPrice => candidate.price,
        AllocationBias::PreferNewerGeneration => {
            let delta = catalog.generation_delta(&candidate.info.instance_type) as f64;
            candidate.price * (1.0 + GENERATION_PRICE_PENALTY * delta)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        LinuxPrices, RawInstance, RawStorage, RegionPrices, TypeCatalog,
    };
    use crate::config::Config;
    use crate::group::{Group, GroupConfig, GroupView, MemberInstance};
    use crate::instance::{InstanceState, Lifecycle, Virtualization};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct TypeSpec {
        name: &'static str,
        vcpu: i64,
        memory: f64,
        gpu: i64,
        cpu: &'static str,
        ebs_throughput: f64,
        on_demand: &'static str,
        spot_1a: Option<f64>,
        storage: Option<(i64, f64, bool)>,
    }

    impl Default for TypeSpec {
        fn default() -> Self {
            TypeSpec {
                name: "m4.large",
                vcpu: 2,
                memory: 8.0,
                gpu: 0,
                cpu: "Intel Xeon E5-2676 v3",
                ebs_throughput: 56.25,
                on_demand: "0.10",
                spot_1a: Some(0.03),
                storage: None,
            }
        }
    }

    fn build_catalog(specs: Vec<TypeSpec>) -> TypeCatalog {
        let mut samples = Vec::new();
        let instances = specs
            .iter()
            .map(|s| {
                if let Some(price) = s.spot_1a {
                    samples.push(crate::catalog::SpotPriceSample {
                        instance_type: s.name.to_string(),
                        zone: "us-east-1a".to_string(),
                        price,
                        timestamp: Utc::now(),
                    });
                }
                RawInstance {
                    instance_type: s.name.to_string(),
                    vcpu: s.vcpu,
                    memory: s.memory,
                    gpu: s.gpu,
                    physical_processor: s.cpu.to_string(),
                    ebs_throughput: s.ebs_throughput,
                    linux_virtualization_types: vec!["HVM".to_string()],
                    ebs_optimized: false,
                    storage: s.storage.map(|(devices, size, ssd)| RawStorage {
                        ssd,
                        devices,
                        size,
                    }),
                    pricing: HashMap::from([(
                        "us-east-1".to_string(),
                        RegionPrices {
                            linux: LinuxPrices {
                                ondemand: s.on_demand.to_string(),
                            },
                            ebs_surcharge: 0.0,
                        },
                    )]),
                }
            })
            .collect();
        let mut catalog = TypeCatalog::build(
            &crate::catalog::RawDataset { instances },
            "us-east-1",
            &Config::default(),
        );
        catalog.merge_spot_prices(&samples);
        catalog
    }

    fn reference_instance() -> Instance {
        Instance {
            instance_id: "i-ref".to_string(),
            instance_type: "m4.large".to_string(),
            zone: "us-east-1a".to_string(),
            state: InstanceState::Running,
            lifecycle: Lifecycle::OnDemand,
            virtualization: Virtualization::Hvm,
            ..Instance::default()
        }
    }

    fn empty_view(desired: i64) -> GroupView {
        let group = Group {
            name: "web-asg".to_string(),
            region: "us-east-1".to_string(),
            desired_capacity: desired,
            min_size: 1,
            max_size: desired + 2,
            ..Group::default()
        };
        let config = GroupConfig::resolve(&group, 0, &Config::default());
        GroupView {
            group,
            config,
            members: vec![],
            spot_requests: vec![],
            request_instances: HashMap::new(),
            launch_config: None,
            launch_template_mappings: vec![],
            now: Utc::now(),
        }
    }

    fn run_matcher(
        catalog: &TypeCatalog,
        view: &GroupView,
        allowed: &[String],
        disallowed: &[String],
    ) -> Result<Vec<Candidate>> {
        let reference = reference_instance();
        let ref_info = catalog.get("m4.large").unwrap();
        find_candidates(
            &reference,
            ref_info,
            catalog,
            view,
            allowed,
            disallowed,
            AllocationBias::LowestPrice,
        )
    }

    #[test]
    fn cheaper_equivalent_type_is_accepted() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m5.large",
                ebs_throughput: 100.0,
                spot_1a: Some(0.04),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.info.instance_type.as_str()).collect();
        assert_eq!(names, vec!["m4.large", "m5.large"]);
    }

    #[test]
    fn type_unavailable_in_zone_is_rejected() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m5.large",
                spot_1a: None,
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m4.large");
    }

    #[test]
    fn spot_price_above_on_demand_is_rejected() {
        let catalog = build_catalog(vec![TypeSpec {
            spot_1a: Some(0.11),
            ..TypeSpec::default()
        }]);
        let err = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap_err();
        assert!(matches!(err, SpotctlError::NoCandidate { .. }));
    }

    #[test]
    fn smaller_class_is_rejected() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "t3.small",
                vcpu: 2,
                memory: 2.0,
                spot_1a: Some(0.005),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m4.large");
    }

    #[test]
    fn cross_architecture_is_never_compatible() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m6g.large",
                cpu: "AWS Graviton2 Processor",
                vcpu: 4,
                memory: 16.0,
                ebs_throughput: 200.0,
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m4.large");
    }

    #[test]
    fn amd_is_compatible_with_intel_reference() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m5a.large",
                cpu: "AMD EPYC 7571",
                ebs_throughput: 100.0,
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        assert_eq!(candidates[0].info.instance_type, "m5a.large");
    }

    #[test]
    fn lower_ebs_throughput_is_rejected() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m3.large",
                ebs_throughput: 31.25,
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m4.large");
    }

    // Donor has one attached 50 GiB SSD ephemeral volume: a 25 GiB candidate
    // is storage-incompatible, a 100 GiB SSD candidate is accepted.
    #[test]
    fn storage_size_and_ssd_rules_apply() {
        let catalog = build_catalog(vec![
            TypeSpec {
                storage: Some((1, 50.0, true)),
                spot_1a: None,
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "c1.medium",
                vcpu: 2,
                memory: 8.0,
                storage: Some((1, 25.0, true)),
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "m3.xlarge",
                vcpu: 4,
                memory: 15.0,
                storage: Some((1, 100.0, true)),
                spot_1a: Some(0.03),
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "d2.xlarge",
                vcpu: 4,
                memory: 30.5,
                storage: Some((3, 2000.0, false)),
                spot_1a: Some(0.03),
                ..TypeSpec::default()
            },
        ]);

        let mut view = empty_view(4);
        view.launch_config = Some(crate::group::LaunchConfig {
            block_device_mappings: vec![crate::group::BlockDeviceMapping {
                virtual_name: Some("ephemeral0".to_string()),
                ..crate::group::BlockDeviceMapping::default()
            }],
            ..crate::group::LaunchConfig::default()
        });

        let candidates = run_matcher(&catalog, &view, &[], &[]).unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.info.instance_type.as_str()).collect();
        // c1.medium too small, d2.xlarge is spinning disk where the
        // reference was SSD.
        assert_eq!(names, vec!["m3.xlarge"]);
    }

    #[test]
    fn allow_list_is_exclusive() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m5.large",
                ebs_throughput: 100.0,
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
        ]);
        let allowed = vec!["m5.*".to_string()];
        let candidates = run_matcher(&catalog, &empty_view(4), &allowed, &[]).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m5.large");
    }

    #[test]
    fn deny_list_rejects_matches() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m5.large",
                ebs_throughput: 100.0,
                spot_1a: Some(0.02),
                ..TypeSpec::default()
            },
        ]);
        let disallowed = vec!["m5.*".to_string()];
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &disallowed).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].info.instance_type, "m4.large");
    }

    #[test]
    fn redundancy_guard_caps_type_concentration() {
        let catalog = build_catalog(vec![TypeSpec::default()]);
        let mut view = empty_view(4);
        // One running m4.large spot instance in the zone already: 4/1 = 4,
        // not strictly greater, so the type is rejected.
        view.members.push(MemberInstance {
            instance: Arc::new(Instance {
                instance_id: "i-spot1".to_string(),
                instance_type: "m4.large".to_string(),
                zone: "us-east-1a".to_string(),
                state: InstanceState::Running,
                lifecycle: Lifecycle::Spot,
                ..Instance::default()
            }),
            protected_from_scale_in: false,
            protected_from_termination: false,
        });
        let err = run_matcher(&catalog, &view, &[], &[]).unwrap_err();
        assert!(matches!(err, SpotctlError::NoCandidate { .. }));

        // With a desired capacity of 5 the ratio is 5/1 > 4 and it passes.
        view.group.desired_capacity = 5;
        assert!(run_matcher(&catalog, &view, &[], &[]).is_ok());
    }

    #[test]
    fn generation_bias_prefers_newer_at_comparable_price() {
        let catalog = build_catalog(vec![
            TypeSpec::default(),
            TypeSpec {
                name: "m3.large",
                ebs_throughput: 56.25,
                spot_1a: Some(0.029),
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "m5.large",
                ebs_throughput: 100.0,
                spot_1a: Some(0.030),
                ..TypeSpec::default()
            },
        ]);
        let reference = reference_instance();
        let ref_info = catalog.get("m4.large").unwrap();
        let view = empty_view(4);

        let by_price = find_candidates(
            &reference,
            ref_info,
            &catalog,
            &view,
            &[],
            &[],
            AllocationBias::LowestPrice,
        )
        .unwrap();
        assert_eq!(by_price[0].info.instance_type, "m3.large");

        // m3 is two generations behind m5: 0.029 * 1.2 > 0.030 * 1.0.
        let biased = find_candidates(
            &reference,
            ref_info,
            &catalog,
            &view,
            &[],
            &[],
            AllocationBias::PreferNewerGeneration,
        )
        .unwrap();
        assert_eq!(biased[0].info.instance_type, "m5.large");
    }

    #[test]
    fn price_ties_break_on_type_name() {
        let catalog = build_catalog(vec![
            TypeSpec {
                spot_1a: None,
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "m5.large",
                ebs_throughput: 100.0,
                spot_1a: Some(0.03),
                ..TypeSpec::default()
            },
            TypeSpec {
                name: "m5a.large",
                cpu: "AMD EPYC 7571",
                ebs_throughput: 100.0,
                spot_1a: Some(0.03),
                ..TypeSpec::default()
            },
        ]);
        let candidates = run_matcher(&catalog, &empty_view(4), &[], &[]).unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.info.instance_type.as_str()).collect();
        assert_eq!(names, vec!["m5.large", "m5a.large"]);
    }
}
