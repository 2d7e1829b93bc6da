//! Global configuration
//!
//! Loaded once at startup from a TOML file (with CLI override) and threaded
//! through component constructors. Per-group overrides are resolved from ASG
//! tags into a typed [`crate::group::GroupConfig`] at the start of each cycle,
//! so decision logic never reads raw tag strings.

use crate::error::{ConfigError, Result, SpotctlError};
use crate::pricing::BiddingPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ranking bias applied by the compatibility matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AllocationBias {
    /// Rank candidates purely by price.
    #[default]
    LowestPrice,
    /// Fold a generation penalty into the price so newer instance
    /// generations sort earlier at comparable cost.
    PreferNewerGeneration,
}

impl AllocationBias {
    /// Parses a tag or config value, falling back to the default on anything
    /// unrecognized.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "prefer-newer-generation" => AllocationBias::PreferNewerGeneration,
            _ => AllocationBias::LowestPrice,
        }
    }
}

/// A single `key=value` pair matched against ASG tags; values are globs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

/// Whether matching the tag filters opts a group in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TagFilteringMode {
    #[default]
    OptIn,
    OptOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Region name globs to process; empty means every enabled region.
    pub regions: Vec<String>,

    /// Path to the instance type hardware/pricing dataset (JSON).
    pub dataset_path: PathBuf,

    /// ASG tag filters; empty falls back to `spot-enabled=true`.
    pub filter_by_tags: String,
    pub tag_filtering_mode: TagFilteringMode,

    /// Minimum on-demand capacity kept in every group, as an absolute number
    /// or a percentage of the group's running instances. The tag overrides
    /// take priority over both.
    pub min_on_demand_number: i64,
    pub min_on_demand_percentage: f64,

    /// Comma- or space-separated instance type globs.
    pub allowed_instance_types: String,
    pub disallowed_instance_types: String,

    pub on_demand_price_multiplier: f64,
    pub spot_price_buffer_percentage: f64,
    pub spot_product_description: String,
    pub spot_product_premium: f64,
    pub bidding_policy: BiddingPolicy,
    pub allocation_bias: AllocationBias,

    /// Hour + day-of-week crontab fragment gating replacement actions,
    /// e.g. "9-18 1-5". See [`crate::schedule`].
    pub cron_schedule: String,
    pub cron_timezone: String,
    /// "on" runs inside the schedule window, "off" outside it.
    pub cron_schedule_state: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            dataset_path: PathBuf::from("instances.json"),
            filter_by_tags: String::new(),
            tag_filtering_mode: TagFilteringMode::OptIn,
            min_on_demand_number: 0,
            min_on_demand_percentage: 0.0,
            allowed_instance_types: String::new(),
            disallowed_instance_types: String::new(),
            on_demand_price_multiplier: 1.0,
            spot_price_buffer_percentage: 10.0,
            spot_product_description: "Linux/UNIX (Amazon VPC)".to_string(),
            spot_product_premium: 0.0,
            bidding_policy: BiddingPolicy::Normal,
            allocation_bias: AllocationBias::LowestPrice,
            cron_schedule: "* *".to_string(),
            cron_timezone: "UTC".to_string(),
            cron_schedule_state: "on".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            // Try .spotctl.toml in current dir, then ~/.config/spotctl/config.toml
            let local = PathBuf::from(".spotctl.toml");
            if local.exists() {
                local
            } else {
                dirs::config_dir()
                    .map(|d| d.join("spotctl").join("config.toml"))
                    .unwrap_or_else(|| PathBuf::from(".spotctl.toml"))
            }
        };

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&content).map_err(|e| {
                SpotctlError::Config(ConfigError::ParseError(format!(
                    "{}: {}",
                    config_path.display(),
                    e
                )))
            })?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.min_on_demand_percentage) {
            return Err(ConfigError::InvalidValue {
                field: "min_on_demand_percentage".to_string(),
                reason: format!("{} is outside 0..=100", self.min_on_demand_percentage),
            }
            .into());
        }
        if self.min_on_demand_number < 0 {
            return Err(ConfigError::InvalidValue {
                field: "min_on_demand_number".to_string(),
                reason: "must not be negative".to_string(),
            }
            .into());
        }
        if self.spot_price_buffer_percentage < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "spot_price_buffer_percentage".to_string(),
                reason: "must not be negative".to_string(),
            }
            .into());
        }
        if self.on_demand_price_multiplier <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "on_demand_price_multiplier".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// ASG tag filters with the `spot-enabled=true` fallback applied.
    pub fn resolved_tag_filters(&self) -> Vec<TagFilter> {
        let filters = parse_tag_filters(&self.filter_by_tags);
        if filters.is_empty() {
            vec![TagFilter {
                key: "spot-enabled".to_string(),
                value: "true".to_string(),
            }]
        } else {
            filters
        }
    }

    pub fn allowed_type_patterns(&self) -> Vec<String> {
        split_type_list(&self.allowed_instance_types)
    }

    pub fn disallowed_type_patterns(&self) -> Vec<String> {
        split_type_list(&self.disallowed_instance_types)
    }
}

/// Splits a comma- or space-separated list, dropping empty entries.
pub fn split_type_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_tag_filters(value: &str) -> Vec<TagFilter> {
    value
        .trim()
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some(TagFilter {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}
