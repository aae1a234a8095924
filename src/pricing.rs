//! Conversion between money and resource ceilings.
//!
//! All arithmetic truncates toward zero so a ceiling never buys more than the
//! balance it was derived from.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Resources an execution may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Usage {
    pub real_time: Duration,
    /// Bytes.
    pub memory: u64,
}

pub trait Pricer: Send + Sync {
    /// Largest usage `cost` pays for.
    fn max_usage(&self, cost: i64) -> Usage;

    /// What `usage` costs.
    fn cost(&self, usage: &Usage) -> i64;
}

/// `num` cost units buy `den` units of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Factor {
    pub num: i64,
    pub den: i64,
}

impl Factor {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    fn check(&self, what: &'static str) -> Result<(), PricingError> {
        if self.num <= 0 || self.den <= 0 {
            return Err(PricingError::NonPositive {
                what,
                num: self.num,
                den: self.den,
            });
        }
        Ok(())
    }

    fn units_for(&self, cost: i64) -> i64 {
        // i128 keeps large balances from overflowing before the division.
        (cost.max(0) as i128 * self.den as i128 / self.num as i128).min(i64::MAX as i128) as i64
    }

    fn cost_of(&self, units: i64) -> i64 {
        (units.max(0) as i128 * self.num as i128 / self.den as i128).min(i64::MAX as i128) as i64
    }
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("{what} factor must be positive, got {num}/{den}")]
    NonPositive { what: &'static str, num: i64, den: i64 },
}

/// Fixed-ratio pricer: time per millisecond, memory per byte.
///
/// Memory is only priced when a factor is configured. When it is, each
/// resource ceiling is what the whole cost would buy of that resource alone;
/// the deadline is derived from time only.
#[derive(Debug, Clone)]
pub struct FactorPricer {
    time: Factor,
    memory: Option<Factor>,
}

impl FactorPricer {
    pub fn new(time: Factor, memory: Option<Factor>) -> Result<Self, PricingError> {
        time.check("time")?;
        if let Some(memory) = &memory {
            memory.check("memory")?;
        }
        Ok(Self { time, memory })
    }
}

impl Pricer for FactorPricer {
    fn max_usage(&self, cost: i64) -> Usage {
        let millis = self.time.units_for(cost);
        let memory = match &self.memory {
            Some(factor) => factor.units_for(cost) as u64,
            None => u64::MAX,
        };
        Usage {
            real_time: Duration::from_millis(millis as u64),
            memory,
        }
    }

    fn cost(&self, usage: &Usage) -> i64 {
        let millis = usage.real_time.as_millis().min(i64::MAX as u128) as i64;
        let time = self.time.cost_of(millis);
        let memory = match &self.memory {
            Some(factor) => factor.cost_of(usage.memory.min(i64::MAX as u64) as i64),
            None => 0,
        };
        time.saturating_add(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_only(num: i64, den: i64) -> FactorPricer {
        FactorPricer::new(Factor::new(num, den), None).unwrap()
    }

    #[test]
    fn one_unit_per_millisecond() {
        let pricer = time_only(1, 1);
        assert_eq!(pricer.max_usage(1000).real_time, Duration::from_millis(1000));
        let usage = Usage {
            real_time: Duration::from_millis(500),
            memory: 0,
        };
        assert_eq!(pricer.cost(&usage), 500);
    }

    #[test]
    fn never_overshoots_paid_budget() {
        let factors = [(1, 1), (3, 7), (7, 3), (13, 1000), (1000, 13), (5, 5)];
        for (num, den) in factors {
            let pricer = time_only(num, den);
            for cost in (0..5000).chain([i64::MAX / 4, 123_456_789]) {
                let usage = pricer.max_usage(cost);
                assert!(
                    pricer.cost(&usage) <= cost,
                    "{num}/{den} overshot at {cost}"
                );
            }
        }
    }

    #[test]
    fn each_priced_resource_stays_within_cost() {
        let pricer = FactorPricer::new(Factor::new(2, 3), Some(Factor::new(1, 1024))).unwrap();
        for cost in 0..2000 {
            let ceiling = pricer.max_usage(cost);
            let time_only = Usage {
                real_time: ceiling.real_time,
                memory: 0,
            };
            let memory_only = Usage {
                real_time: Duration::ZERO,
                memory: ceiling.memory,
            };
            assert!(pricer.cost(&time_only) <= cost);
            assert!(pricer.cost(&memory_only) <= cost);
        }
    }

    #[test]
    fn truncates_instead_of_rounding_up() {
        let pricer = time_only(3, 1);
        // 10 units buy 3.33ms; the ceiling is 3ms.
        assert_eq!(pricer.max_usage(10).real_time, Duration::from_millis(3));
        let usage = Usage {
            real_time: Duration::from_micros(999),
            memory: 0,
        };
        assert_eq!(pricer.cost(&usage), 0);
    }

    #[test]
    fn negative_cost_buys_nothing() {
        let pricer = time_only(1, 1);
        assert_eq!(pricer.max_usage(-50).real_time, Duration::ZERO);
    }

    #[test]
    fn rejects_zero_factor() {
        assert!(FactorPricer::new(Factor::new(0, 1), None).is_err());
        assert!(FactorPricer::new(Factor::new(1, 1), Some(Factor::new(1, 0))).is_err());
    }
}
