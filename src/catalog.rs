//! Instance type catalog
//!
//! Turns the raw hardware/pricing dataset (the ec2instances.info JSON blob)
//! plus live spot price history into a per-region map of instance type to
//! hardware spec and pricing. The catalog is built once per cycle and is
//! immutable while groups are being processed.
//!
//! On-demand prices in the dataset are strings that may be absent or
//! non-numeric ("N/A"); either means the type is not offered in the region
//! and the type is dropped rather than carried with a zero price.

use crate::config::Config;
use crate::error::{Result, SpotctlError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Raw dataset record, one per instance type across all regions.
#[derive(Debug, Clone, Deserialize)]
pub struct RawInstance {
    pub instance_type: String,
    #[serde(rename = "vCPU", default)]
    pub vcpu: i64,
    #[serde(default)]
    pub memory: f64,
    #[serde(rename = "GPU", default)]
    pub gpu: i64,
    #[serde(default)]
    pub physical_processor: String,
    #[serde(default)]
    pub ebs_throughput: f64,
    #[serde(default)]
    pub linux_virtualization_types: Vec<String>,
    #[serde(default)]
    pub ebs_optimized: bool,
    #[serde(default)]
    pub storage: Option<RawStorage>,
    #[serde(default)]
    pub pricing: HashMap<String, RegionPrices>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStorage {
    #[serde(default)]
    pub ssd: bool,
    #[serde(default)]
    pub devices: i64,
    #[serde(default)]
    pub size: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegionPrices {
    #[serde(default)]
    pub linux: LinuxPrices,
    #[serde(default)]
    pub ebs_surcharge: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinuxPrices {
    /// String-encoded number, or "N/A" where the type is not offered.
    #[serde(default)]
    pub ondemand: String,
}

/// The full dataset, loaded once per process.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub instances: Vec<RawInstance>,
}

impl RawDataset {
    /// Failure here is fatal for the whole cycle.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SpotctlError::Dataset(format!("{}: {}", path.display(), e)))?;
        let instances: Vec<RawInstance> = serde_json::from_str(&content)
            .map_err(|e| SpotctlError::Dataset(format!("{}: {}", path.display(), e)))?;
        Ok(Self { instances })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prices {
    pub on_demand: f64,
    /// Spot price keyed by availability zone; missing or zero means the type
    /// is not currently available on the spot market there.
    pub spot: HashMap<String, f64>,
    pub ebs_surcharge: f64,
    pub premium: f64,
}

/// Hardware spec and pricing for one instance type in one region.
/// Immutable once the catalog is built for a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceTypeInfo {
    pub instance_type: String,
    pub vcpu: i64,
    pub memory: f64,
    pub gpu: i64,
    pub physical_processor: String,
    pub has_instance_store: bool,
    pub instance_store_device_count: i64,
    pub instance_store_device_size: f64,
    pub instance_store_is_ssd: bool,
    pub ebs_throughput: f64,
    pub virtualization_types: Vec<String>,
    pub pricing: Prices,
}

/// One sample from the spot price history feed.
#[derive(Debug, Clone)]
pub struct SpotPriceSample {
    pub instance_type: String,
    pub zone: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-region catalog of instance types keyed by type name.
#[derive(Debug, Default)]
pub struct TypeCatalog {
    types: HashMap<String, InstanceTypeInfo>,
    /// Newest known generation per instance family, e.g. "c" -> 6.
    newest_generation: HashMap<String, u32>,
}

impl TypeCatalog {
    /// Builds the catalog for one region, dropping types with no usable
    /// on-demand price there.
    pub fn build(dataset: &RawDataset, region: &str, config: &Config) -> Self {
        let mut types = HashMap::new();

        for raw in &dataset.instances {
            let Some(region_prices) = raw.pricing.get(region) else {
                continue;
            };
            let Ok(base_price) = region_prices.linux.ondemand.parse::<f64>() else {
                continue;
            };
            if base_price <= 0.0 {
                continue;
            }

            let mut info = InstanceTypeInfo {
                instance_type: raw.instance_type.clone(),
                vcpu: raw.vcpu,
                memory: raw.memory,
                gpu: raw.gpu,
                physical_processor: raw.physical_processor.clone(),
                ebs_throughput: raw.ebs_throughput,
                virtualization_types: raw.linux_virtualization_types.clone(),
                pricing: Prices {
                    on_demand: base_price * config.on_demand_price_multiplier,
                    spot: HashMap::new(),
                    ebs_surcharge: region_prices.ebs_surcharge,
                    premium: config.spot_product_premium,
                },
                ..InstanceTypeInfo::default()
            };

            if let Some(storage) = &raw.storage {
                info.has_instance_store = true;
                info.instance_store_device_count = storage.devices;
                info.instance_store_device_size = storage.size;
                info.instance_store_is_ssd = storage.ssd;
            }

            types.insert(raw.instance_type.clone(), info);
        }

        let mut catalog = Self {
            types,
            newest_generation: HashMap::new(),
        };
        catalog.index_generations();
        catalog
    }

    /// Folds spot price history into the catalog, keeping the most recent
    /// sample per type per zone. Types absent from the catalog are ignored:
    /// they are not offered on-demand in this region.
    pub fn merge_spot_prices(&mut self, samples: &[SpotPriceSample]) {
        let mut latest: HashMap<(String, String), (DateTime<Utc>, f64)> = HashMap::new();
        for sample in samples {
            let key = (sample.instance_type.clone(), sample.zone.clone());
            match latest.get(&key) {
                Some((seen, _)) if *seen >= sample.timestamp => {}
                _ => {
                    latest.insert(key, (sample.timestamp, sample.price));
                }
            }
        }

        for ((instance_type, zone), (_, price)) in latest {
            if let Some(info) = self.types.get_mut(&instance_type) {
                info.pricing.spot.insert(zone, price);
            }
        }
    }

    pub fn get(&self, instance_type: &str) -> Option<&InstanceTypeInfo> {
        self.types.get(instance_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterates types in alphabetical name order so filtering and ranking
    /// are deterministic across cycles.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &InstanceTypeInfo> {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        names.into_iter().map(move |n| &self.types[n])
    }

    pub fn newest_generation(&self, family: &str) -> Option<u32> {
        self.newest_generation.get(family).copied()
    }

    /// Generations behind the newest known generation in the type's family.
    /// Types with unparsable names count as current.
    pub fn generation_delta(&self, instance_type: &str) -> u32 {
        let Some((family, generation)) = parse_type_name(instance_type) else {
            return 0;
        };
        self.newest_generation(&family)
            .map(|newest| newest.saturating_sub(generation))
            .unwrap_or(0)
    }

    fn index_generations(&mut self) {
        let mut newest: HashMap<String, u32> = HashMap::new();
        for name in self.types.keys() {
            if let Some((family, generation)) = parse_type_name(name) {
                let entry = newest.entry(family).or_insert(generation);
                if generation > *entry {
                    *entry = generation;
                }
            }
        }
        self.newest_generation = newest;
    }
}

/// Splits an instance type name into its family letters and generation
/// number, e.g. "c5d.xlarge" -> ("c", 5). Names that don't follow the
/// family+generation convention return None.
pub fn parse_type_name(instance_type: &str) -> Option<(String, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^([a-z]+)(\d+)[a-z0-9\-]*\.").expect("valid regex"));
    let caps = re.captures(instance_type)?;
    let family = caps.get(1)?.as_str().to_string();
    let generation = caps.get(2)?.as_str().parse().ok()?;
    Some((family, generation))
}
