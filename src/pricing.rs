//! Bidding policy and price computation
//!
//! Two bidding policies, selected per group: `normal` bids exactly the
//! on-demand price (savings come from the spot/on-demand gap alone) and
//! `aggressive` bids a buffer above the live spot price, capped at the
//! on-demand price so we never bid more than we would have paid anyway.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BiddingPolicy {
    #[default]
    Normal,
    Aggressive,
}

impl BiddingPolicy {
    /// Parses a tag or config value. Anything that is not exactly
    /// "aggressive" falls back to the default policy.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "aggressive" => BiddingPolicy::Aggressive,
            _ => BiddingPolicy::Normal,
        }
    }
}

/// Computes the spot bid for one launch.
///
/// The `premium` is a constant surcharge carried by instance types with
/// licensing costs; it is excluded from the buffer multiplication and added
/// back afterwards so the buffer only applies to the market-driven part of
/// the price.
pub fn price_to_bid(
    on_demand_price: f64,
    current_spot_price: f64,
    premium: f64,
    buffer_percentage: f64,
    policy: BiddingPolicy,
) -> f64 {
    match policy {
        BiddingPolicy::Normal => on_demand_price,
        BiddingPolicy::Aggressive => {
            let buffered =
                (current_spot_price - premium) * (1.0 + buffer_percentage / 100.0) + premium;
            on_demand_price.min(buffered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_policy_bids_on_demand_price() {
        assert_eq!(price_to_bid(0.10, 0.03, 0.0, 10.0, BiddingPolicy::Normal), 0.10);
    }

    #[test]
    fn aggressive_policy_bids_buffer_over_spot() {
        let bid = price_to_bid(0.10, 0.03, 0.0, 10.0, BiddingPolicy::Aggressive);
        assert!((bid - 0.033).abs() < 1e-9);
    }

    #[test]
    fn aggressive_policy_is_capped_at_on_demand() {
        // Spot price spiked close to on-demand: the buffer would push the bid
        // above on-demand, so the cap kicks in.
        let bid = price_to_bid(0.10, 0.099, 0.0, 25.0, BiddingPolicy::Aggressive);
        assert_eq!(bid, 0.10);
    }

    #[test]
    fn premium_is_excluded_from_the_buffer() {
        // premium 0.02 on a 0.05 spot price with a 100% buffer: only the
        // 0.03 market part doubles.
        let bid = price_to_bid(1.0, 0.05, 0.02, 100.0, BiddingPolicy::Aggressive);
        assert!((bid - 0.08).abs() < 1e-9);
    }

    #[test]
    fn unknown_policy_values_fall_back_to_normal() {
        assert_eq!(BiddingPolicy::parse("agressive"), BiddingPolicy::Normal);
        assert_eq!(BiddingPolicy::parse("aggressive"), BiddingPolicy::Aggressive);
    }
}
