//! PromQL function families served by the merge engines
//!
//! A closed set of operator kinds; each one is bound to its own accumulator
//! type in [`crate::merge`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// `*_over_time` variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverTimeFn {
    /// `sum_over_time`
    Sum,
    /// `avg_over_time`
    Avg,
    /// `max_over_time`
    Max,
    /// `min_over_time`
    Min,
    /// `count_over_time`
    Count,
}

/// Counter functions sharing the reset-corrected accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFn {
    /// Per-second corrected increase
    Rate,
    /// Corrected increase
    Increase,
}

/// Operator kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Plain instant-vector sampling
    Sampling,
    /// `*_over_time`
    OverTime(OverTimeFn),
    /// `rate` / `increase`
    Rate(RateFn),
    /// `irate`
    Irate,
    /// `changes`
    Changes,
    /// `delta`
    Delta,
}

impl Operator {
    /// PromQL function name
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Sampling => "sampling",
            Operator::OverTime(OverTimeFn::Sum) => "sum_over_time",
            Operator::OverTime(OverTimeFn::Avg) => "avg_over_time",
            Operator::OverTime(OverTimeFn::Max) => "max_over_time",
            Operator::OverTime(OverTimeFn::Min) => "min_over_time",
            Operator::OverTime(OverTimeFn::Count) => "count_over_time",
            Operator::Rate(RateFn::Rate) => "rate",
            Operator::Rate(RateFn::Increase) => "increase",
            Operator::Irate => "irate",
            Operator::Changes => "changes",
            Operator::Delta => "delta",
        }
    }

    /// Whether output series keep the `__name__` label
    pub fn keeps_metric_name(&self) -> bool {
        matches!(self, Operator::Sampling)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "sampling" | "" => Operator::Sampling,
            "sum_over_time" => Operator::OverTime(OverTimeFn::Sum),
            "avg_over_time" => Operator::OverTime(OverTimeFn::Avg),
            "max_over_time" => Operator::OverTime(OverTimeFn::Max),
            "min_over_time" => Operator::OverTime(OverTimeFn::Min),
            "count_over_time" => Operator::OverTime(OverTimeFn::Count),
            "rate" => Operator::Rate(RateFn::Rate),
            "increase" => Operator::Rate(RateFn::Increase),
            "irate" => Operator::Irate,
            "changes" => Operator::Changes,
            "delta" => Operator::Delta,
            other => return Err(Error::exec(format!("unsupported function '{}'", other))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        for op in [
            Operator::Sampling,
            Operator::OverTime(OverTimeFn::Avg),
            Operator::OverTime(OverTimeFn::Count),
            Operator::Rate(RateFn::Increase),
            Operator::Irate,
            Operator::Changes,
            Operator::Delta,
        ] {
            assert_eq!(op.name().parse::<Operator>().unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_function() {
        let err = "histogram_quantile".parse::<Operator>().unwrap_err();
        assert_eq!(err.status_code(), 422);
    }
}
