//! License tiers and the throughput gate.
//!
//! The gate is consulted once per negotiation: when this station requests a
//! connection and when it accepts one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::callsign::Callsign;
use crate::error::ModemError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
}

impl Tier {
    pub const fn max_bandwidth_hz(self) -> u32 {
        match self {
            Tier::Free => 500,
            Tier::Basic => 2000,
            Tier::Pro => 5000,
        }
    }

    /// Maximum symbol rate in baud.
    pub const fn max_symbol_rate(self) -> u32 {
        match self {
            Tier::Free => 100,
            Tier::Basic => 300,
            Tier::Pro => 600,
        }
    }

    pub const fn limits(self) -> Throughput {
        Throughput {
            bandwidth_hz: self.max_bandwidth_hz(),
            symbol_rate: self.max_symbol_rate(),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
        };
        f.write_str(name)
    }
}

impl FromStr for Tier {
    type Err = ModemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            other => Err(ModemError::ConfigurationInvalid(format!(
                "unknown license tier '{}'",
                other
            ))),
        }
    }
}

/// Occupied bandwidth and symbol rate of a modulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Throughput {
    pub bandwidth_hz: u32,
    pub symbol_rate: u32,
}

impl Throughput {
    pub const fn new(bandwidth_hz: u32, symbol_rate: u32) -> Self {
        Self {
            bandwidth_hz,
            symbol_rate,
        }
    }

    /// Component-wise minimum.
    pub fn min(self, other: Throughput) -> Throughput {
        Throughput {
            bandwidth_hz: self.bandwidth_hz.min(other.bandwidth_hz),
            symbol_rate: self.symbol_rate.min(other.symbol_rate),
        }
    }

    pub fn fits_within(self, limit: Throughput) -> bool {
        self.bandwidth_hz <= limit.bandwidth_hz && self.symbol_rate <= limit.symbol_rate
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz @ {} Bd", self.bandwidth_hz, self.symbol_rate)
    }
}

/// What the operator's license allows. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseEntitlement {
    tier: Tier,
    max: Throughput,
    callsign: Option<Callsign>,
}

impl LicenseEntitlement {
    /// Entitlement with explicit limits. Limits above the tier's table values
    /// are reduced to them.
    pub fn new(tier: Tier, max_bandwidth_hz: u32, max_symbol_rate: u32) -> Self {
        Self {
            tier,
            max: Throughput::new(max_bandwidth_hz, max_symbol_rate).min(tier.limits()),
            callsign: None,
        }
    }

    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            max: tier.limits(),
            callsign: None,
        }
    }

    pub fn bound_to(mut self, callsign: Callsign) -> Self {
        self.callsign = Some(callsign);
        self
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn max(&self) -> Throughput {
        self.max
    }

    pub fn callsign(&self) -> Option<&Callsign> {
        self.callsign.as_ref()
    }
}

/// Limit a requested throughput to what the entitlement allows.
pub fn clamp(requested: Throughput, entitlement: &LicenseEntitlement) -> Throughput {
    requested.min(entitlement.max())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_free_tier_clamps_wide_request() {
        let entitlement = LicenseEntitlement::new(Tier::Free, 500, 100);
        let granted = clamp(Throughput::new(2000, 100), &entitlement);
        assert_eq!(granted.bandwidth_hz, 500);
        assert_eq!(granted.symbol_rate, 100);
    }

    #[test]
    fn test_request_within_limits_is_unchanged() {
        let entitlement = LicenseEntitlement::for_tier(Tier::Pro);
        let requested = Throughput::new(2400, 300);
        assert_eq!(clamp(requested, &entitlement), requested);
    }

    #[test]
    fn test_explicit_limits_cannot_exceed_tier() {
        let entitlement = LicenseEntitlement::new(Tier::Basic, 10_000, 10_000);
        assert_eq!(entitlement.max(), Tier::Basic.limits());
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("PRO".parse::<Tier>().unwrap(), Tier::Pro);
        assert!("gold".parse::<Tier>().is_err());
    }

    fn any_tier() -> impl Strategy<Value = Tier> {
        prop_oneof![Just(Tier::Free), Just(Tier::Basic), Just(Tier::Pro)]
    }

    proptest! {
        #[test]
        fn clamp_never_exceeds_entitlement_or_request(
            tier in any_tier(),
            max_bw in 0u32..10_000,
            max_rate in 0u32..2_000,
            bw in 0u32..20_000,
            rate in 0u32..5_000,
        ) {
            let entitlement = LicenseEntitlement::new(tier, max_bw, max_rate);
            let requested = Throughput::new(bw, rate);
            let granted = clamp(requested, &entitlement);
            prop_assert!(granted.fits_within(entitlement.max()));
            prop_assert!(granted.fits_within(requested));
        }
    }
}
