//! Session-Aware TTL Policy
//!
//! Lifetimes shrink while a market trades and stretch to each layer's
//! maximum once it closes. The calculator is a pure function of its
//! configuration, the layer and the session state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::layers::CacheTier;
use crate::domain::MarketSession;
use crate::error::{Error, Result};

/// TTL bounds of one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTtlBounds {
    /// Lifetime outside the extremes (pre-market)
    pub base: Duration,
    /// Floor applied to shortened lifetimes
    pub min: Duration,
    /// Ceiling, used as-is while the market is closed
    pub max: Duration,
}

impl LayerTtlBounds {
    pub const fn new(base: Duration, min: Duration, max: Duration) -> Self {
        Self { base, min, max }
    }

    fn validate(&self, tier: CacheTier) -> Result<()> {
        if self.min.is_zero() {
            return Err(Error::Config(format!("{} minimum TTL must be positive", tier)));
        }
        if self.min > self.base || self.base > self.max {
            return Err(Error::Config(format!(
                "{} TTL bounds must satisfy min <= base <= max (got {:?} / {:?} / {:?})",
                tier, self.min, self.base, self.max
            )));
        }
        Ok(())
    }
}

/// TTL configuration for all three layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtlPolicy {
    pub l1: LayerTtlBounds,
    pub l2: LayerTtlBounds,
    pub l3: LayerTtlBounds,
    /// Multiplier applied to the base TTL during an open session (0 < f <= 1)
    pub open_factor: f64,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        Self {
            l1: LayerTtlBounds::new(
                Duration::from_secs(24 * HOUR),
                Duration::from_secs(HOUR),
                Duration::from_secs(48 * HOUR),
            ),
            l2: LayerTtlBounds::new(
                Duration::from_secs(12 * HOUR),
                Duration::from_secs(30 * MIN),
                Duration::from_secs(24 * HOUR),
            ),
            l3: LayerTtlBounds::new(
                Duration::from_secs(5 * MIN),
                Duration::from_secs(30),
                Duration::from_secs(HOUR),
            ),
            open_factor: 0.5,
        }
    }
}

impl TtlPolicy {
    pub fn bounds(&self, tier: CacheTier) -> &LayerTtlBounds {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
            CacheTier::L3 => &self.l3,
        }
    }

    /// Reject bounds that could produce a TTL outside its own range or an
    /// L3 lifetime longer than L2's
    pub fn validate(&self) -> Result<()> {
        for tier in CacheTier::ALL {
            self.bounds(tier).validate(tier)?;
        }
        if !(self.open_factor > 0.0 && self.open_factor <= 1.0) {
            return Err(Error::Config(format!(
                "open session TTL factor must be in (0, 1], got {}",
                self.open_factor
            )));
        }
        if self.l3.base > self.l2.base || self.l3.max > self.l2.max {
            return Err(Error::Config(
                "L3 TTL bounds must not exceed L2 TTL bounds".into(),
            ));
        }
        Ok(())
    }
}

/// Maps (layer, session) to an entry lifetime
#[derive(Debug, Clone, Default)]
pub struct DynamicTtlCalculator {
    policy: TtlPolicy,
}

impl DynamicTtlCalculator {
    pub fn new(policy: TtlPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// TTL for an entry of `tier` written while the market is in `session`
    pub fn compute_ttl(&self, tier: CacheTier, session: MarketSession) -> Duration {
        let ttl = self.layer_ttl(self.policy.bounds(tier), session);
        match tier {
            CacheTier::L3 => ttl.min(self.layer_ttl(&self.policy.l2, session)),
            _ => ttl,
        }
    }

    fn layer_ttl(&self, bounds: &LayerTtlBounds, session: MarketSession) -> Duration {
        match session {
            MarketSession::Open => bounds
                .base
                .mul_f64(self.policy.open_factor)
                .max(bounds.min)
                .min(bounds.max),
            MarketSession::Pre => bounds.base,
            MarketSession::Post | MarketSession::Closed => bounds.max,
        }
    }
}
