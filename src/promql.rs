//! Already-parsed PromQL selectors
//!
//! The parser lives outside this crate; evaluation consumes the selector
//! tree below. Only the resolved range of a matrix selector is ever
//! rewritten by the query core.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Labels;

/// Label matching operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// `label = "value"`
    Equal,
    /// `label != "value"`
    NotEqual,
    /// `label =~ "regex"`
    Regex,
    /// `label !~ "regex"`
    NotRegex,
}

/// One label matcher of a selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelMatcher {
    /// Label name
    pub name: String,
    /// Operator
    pub op: MatchOp,
    /// Value or pattern
    pub value: String,
}

impl LabelMatcher {
    /// `name = value`
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MatchOp::Equal, value)
    }

    /// `name != value`
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MatchOp::NotEqual, value)
    }

    /// `name =~ pattern`
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, MatchOp::Regex, pattern)
    }

    /// `name !~ pattern`
    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, MatchOp::NotRegex, pattern)
    }

    fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against a label set; an absent label matches as the empty string
    ///
    /// Regex matchers are fully anchored, as in PromQL.
    pub fn matches(&self, labels: &Labels) -> Result<bool> {
        let actual = labels.get(&self.name).unwrap_or("");
        Ok(match self.op {
            MatchOp::Equal => actual == self.value,
            MatchOp::NotEqual => actual != self.value,
            MatchOp::Regex => self.anchored()?.is_match(actual),
            MatchOp::NotRegex => !self.anchored()?.is_match(actual),
        })
    }

    fn anchored(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.value))
            .map_err(|e| Error::bad_data(format!("invalid regex '{}': {}", self.value, e)))
    }
}

/// Instant vector selector: metric name plus matchers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorSelector {
    /// Metric name
    pub metric: String,
    /// Label matchers
    pub matchers: Vec<LabelMatcher>,
}

impl VectorSelector {
    /// Selector for a metric with no matchers
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            matchers: Vec::new(),
        }
    }

    /// Add a matcher
    pub fn with_matcher(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Whether a series with `labels` is selected
    pub fn matches(&self, labels: &Labels) -> Result<bool> {
        for matcher in &self.matchers {
            if !matcher.matches(labels)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Range of a matrix selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeSpec {
    /// `[$__auto]`: resolved to the step, or the instant lookback
    Auto,
    /// Literal range in milliseconds
    Fixed(i64),
}

/// Range vector selector
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixSelector {
    /// Inner selector; must be a vector selector
    pub inner: Box<Expr>,
    /// Range
    pub range: RangeSpec,
}

/// Selector expression consumed by the evaluator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// Instant vector
    Vector(VectorSelector),
    /// Range vector
    Matrix(MatrixSelector),
}

impl Expr {
    /// `selector[range]`
    pub fn matrix(selector: VectorSelector, range: RangeSpec) -> Self {
        Expr::Matrix(MatrixSelector {
            inner: Box::new(Expr::Vector(selector)),
            range,
        })
    }

    /// Vector selector and range of this expression
    ///
    /// A plain vector selector has an automatic range.
    pub fn selector(&self) -> Result<(&VectorSelector, RangeSpec)> {
        match self {
            Expr::Vector(v) => Ok((v, RangeSpec::Auto)),
            Expr::Matrix(m) => match m.inner.as_ref() {
                Expr::Vector(v) => Ok((v, m.range)),
                Expr::Matrix(_) => Err(Error::exec(
                    "expected vector selector inside matrix selector, got matrix selector",
                )),
            },
        }
    }

    /// Replace an automatic range by a concrete one
    pub fn resolve_range(&mut self, range_ms: i64) {
        if let Expr::Matrix(m) = self {
            if m.range == RangeSpec::Auto {
                m.range = RangeSpec::Fixed(range_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Labels {
        Labels::from_pairs([("job", "api"), ("code", "500")])
    }

    #[test]
    fn test_matchers() {
        let l = labels();
        assert!(LabelMatcher::equal("job", "api").matches(&l).unwrap());
        assert!(LabelMatcher::not_equal("job", "web").matches(&l).unwrap());
        assert!(LabelMatcher::regex("code", "5..").matches(&l).unwrap());
        assert!(!LabelMatcher::regex("code", "5").matches(&l).unwrap());
        assert!(LabelMatcher::not_regex("code", "2..").matches(&l).unwrap());
        assert!(LabelMatcher::equal("missing", "").matches(&l).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_bad_data() {
        let err = LabelMatcher::regex("job", "(").matches(&labels()).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_selector_of_nested_matrix_is_exec_error() {
        let inner = Expr::matrix(VectorSelector::new("up"), RangeSpec::Auto);
        let expr = Expr::Matrix(MatrixSelector {
            inner: Box::new(inner),
            range: RangeSpec::Fixed(60_000),
        });
        assert_eq!(expr.selector().unwrap_err().status_code(), 422);
    }

    #[test]
    fn test_resolve_range_only_replaces_auto() {
        let mut expr = Expr::matrix(VectorSelector::new("up"), RangeSpec::Auto);
        expr.resolve_range(60_000);
        assert_eq!(expr.selector().unwrap().1, RangeSpec::Fixed(60_000));
        expr.resolve_range(120_000);
        assert_eq!(expr.selector().unwrap().1, RangeSpec::Fixed(60_000));
    }
}
