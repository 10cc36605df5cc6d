//! Market Session Adapters
//!
//! - [`FixedSessionSource`]: sessions set explicitly, per market or globally
//! - [`TradingHoursSessionSource`]: derives the session from a UTC trading
//!   day (pre-open, open, close, post-close); weekends are closed

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::{MarketSession, MarketSessionSource};
use crate::error::{Error, Result};

// =============================================================================
// Fixed Sessions
// =============================================================================

/// Session source whose answers are set by hand
#[derive(Debug)]
pub struct FixedSessionSource {
    default: RwLock<MarketSession>,
    per_market: DashMap<String, MarketSession>,
}

impl FixedSessionSource {
    pub fn new(default: MarketSession) -> Self {
        Self {
            default: RwLock::new(default),
            per_market: DashMap::new(),
        }
    }

    /// Change the session of every market without an override
    pub fn set(&self, session: MarketSession) {
        *self.default.write() = session;
    }

    pub fn set_market(&self, market: impl Into<String>, session: MarketSession) {
        self.per_market.insert(market.into(), session);
    }
}

impl Default for FixedSessionSource {
    fn default() -> Self {
        Self::new(MarketSession::Closed)
    }
}

impl MarketSessionSource for FixedSessionSource {
    fn current_session_state(&self, market: &str) -> MarketSession {
        self.per_market
            .get(market)
            .map(|s| *s)
            .unwrap_or_else(|| *self.default.read())
    }
}

// =============================================================================
// Trading Hours
// =============================================================================

/// One market's trading day, in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingHours {
    pub pre_open: NaiveTime,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub post_close: NaiveTime,
}

impl TradingHours {
    /// Parse four `HH:MM` times; they must be strictly increasing
    pub fn parse(pre_open: &str, open: &str, close: &str, post_close: &str) -> Result<Self> {
        let hours = Self {
            pre_open: parse_time(pre_open)?,
            open: parse_time(open)?,
            close: parse_time(close)?,
            post_close: parse_time(post_close)?,
        };
        if !(hours.pre_open < hours.open && hours.open < hours.close && hours.close < hours.post_close)
        {
            return Err(Error::Config(format!(
                "trading hours must be increasing: {} < {} < {} < {}",
                pre_open, open, close, post_close
            )));
        }
        Ok(hours)
    }

    pub fn session_at(&self, now: DateTime<Utc>) -> MarketSession {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return MarketSession::Closed;
        }
        let time = now.time();
        if time < self.pre_open {
            MarketSession::Closed
        } else if time < self.open {
            MarketSession::Pre
        } else if time < self.close {
            MarketSession::Open
        } else if time < self.post_close {
            MarketSession::Post
        } else {
            MarketSession::Closed
        }
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| Error::Config(format!("invalid time '{}': {}", value, e)))
}

/// Session source driven by the wall clock
#[derive(Debug, Clone)]
pub struct TradingHoursSessionSource {
    default: TradingHours,
    per_market: HashMap<String, TradingHours>,
}

impl TradingHoursSessionSource {
    pub fn new(default: TradingHours) -> Self {
        Self {
            default,
            per_market: HashMap::new(),
        }
    }

    pub fn with_market(mut self, market: impl Into<String>, hours: TradingHours) -> Self {
        self.per_market.insert(market.into(), hours);
        self
    }

    pub fn session_at(&self, market: &str, now: DateTime<Utc>) -> MarketSession {
        self.per_market
            .get(market)
            .unwrap_or(&self.default)
            .session_at(now)
    }
}

impl MarketSessionSource for TradingHoursSessionSource {
    fn current_session_state(&self, market: &str) -> MarketSession {
        self.session_at(market, Utc::now())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nyse() -> TradingHours {
        TradingHours::parse("09:00", "14:30", "21:00", "23:00").unwrap()
    }

    #[test]
    fn test_fixed_source_overrides() {
        let source = FixedSessionSource::new(MarketSession::Open);
        source.set_market("JP", MarketSession::Closed);
        assert_eq!(source.current_session_state("US"), MarketSession::Open);
        assert_eq!(source.current_session_state("JP"), MarketSession::Closed);

        source.set(MarketSession::Post);
        assert_eq!(source.current_session_state("US"), MarketSession::Post);
    }

    #[test]
    fn test_trading_day_phases() {
        let hours = nyse();
        // 2026-10-14 is a Wednesday
        let at = |h, m| Utc.with_ymd_and_hms(2026, 10, 14, h, m, 0).unwrap();

        assert_eq!(hours.session_at(at(8, 59)), MarketSession::Closed);
        assert_eq!(hours.session_at(at(9, 0)), MarketSession::Pre);
        assert_eq!(hours.session_at(at(14, 30)), MarketSession::Open);
        assert_eq!(hours.session_at(at(20, 59)), MarketSession::Open);
        assert_eq!(hours.session_at(at(21, 0)), MarketSession::Post);
        assert_eq!(hours.session_at(at(23, 30)), MarketSession::Closed);
    }

    #[test]
    fn test_weekend_is_closed() {
        let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 15, 0, 0).unwrap();
        assert_eq!(nyse().session_at(saturday), MarketSession::Closed);
    }

    #[test]
    fn test_per_market_hours() {
        let tokyo = TradingHours::parse("23:00", "23:10", "23:20", "23:30").unwrap();
        let source = TradingHoursSessionSource::new(nyse()).with_market("JP", tokyo);
        let noon = Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).unwrap();

        assert_eq!(source.session_at("US", noon), MarketSession::Open);
        assert_eq!(source.session_at("JP", noon), MarketSession::Closed);
    }

    #[test]
    fn test_invalid_hours_rejected() {
        assert!(TradingHours::parse("09:00", "08:00", "21:00", "23:00").is_err());
        assert!(TradingHours::parse("9am", "14:30", "21:00", "23:00").is_err());
    }
}
