//! Linear parameter constraints and bounds on auxiliary metrics.
//!
//! Both are declared as short text expressions, the same way a user writes
//! them in `optimization.yaml`:
//!
//! ```
//! use picopt::constraint::{OutcomeConstraint, ParameterConstraint};
//!
//! let order: ParameterConstraint = "a0 >= 2 * w0 - 0.5".parse().unwrap();
//! let charge: OutcomeConstraint = "beam.charge >= 10".parse().unwrap();
//! assert_eq!(order.to_string(), "a0 >= 2 * w0 - 0.5");
//! ```
//!
//! A [`ParameterConstraint`] makes a point infeasible before it runs: the
//! search space rejects it during validation and the trial fails without
//! using an execution slot. An [`OutcomeConstraint`] is checked after a run:
//! a completed trial whose metrics violate one keeps its objective in the
//! history but never becomes the best trial.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::parameter::ParameterPoint;

/// Slack allowed when comparing a constraint's left-hand side to its limit.
const TOLERANCE: f64 = 1e-9;

/// Direction of an inequality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// `lhs <= limit`.
    AtMost,
    /// `lhs >= limit`.
    AtLeast,
}

impl Bound {
    fn holds(self, lhs: f64, limit: f64) -> bool {
        let slack = TOLERANCE * limit.abs().max(1.0);
        match self {
            Bound::AtMost => lhs <= limit + slack,
            Bound::AtLeast => lhs >= limit - slack,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Bound::AtMost => "<=",
            Bound::AtLeast => ">=",
        }
    }
}

/// Split `text` at its single `<=` or `>=`.
fn split_inequality(text: &str) -> Result<(&str, Bound, &str), String> {
    let at_most = text.match_indices("<=").count();
    let at_least = text.match_indices(">=").count();
    let (symbol, bound) = match (at_most, at_least) {
        (1, 0) => ("<=", Bound::AtMost),
        (0, 1) => (">=", Bound::AtLeast),
        (0, 0) => return Err("expected an inequality with '<=' or '>='".to_string()),
        _ => return Err("expected exactly one '<=' or '>='".to_string()),
    };
    let (lhs, rhs) = text
        .split_once(symbol)
        .ok_or_else(|| format!("expected '{symbol}'"))?;
    Ok((lhs, bound, rhs))
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() {
                    let d = chars[i];
                    let exponent = matches!(d, 'e' | 'E')
                        && match chars.get(i + 1) {
                            Some(n) if n.is_ascii_digit() => true,
                            Some('+' | '-') => chars.get(i + 2).is_some_and(char::is_ascii_digit),
                            _ => false,
                        };
                    if d.is_ascii_digit() || d == '.' {
                        i += 1;
                    } else if exponent {
                        i += 2;
                    } else {
                        break;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("'{literal}' is not a number"))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// A linear expression: coefficients per variable plus a constant.
#[derive(Debug, Default)]
struct Linear {
    coefficients: BTreeMap<String, f64>,
    constant: f64,
}

impl Linear {
    fn parse(text: &str) -> Result<Self, String> {
        let tokens = tokenize(text)?;
        let mut out = Linear::default();
        let mut pos = 0;
        loop {
            let mut sign = 1.0;
            match tokens.get(pos) {
                Some(Token::Plus) => pos += 1,
                Some(Token::Minus) => {
                    sign = -1.0;
                    pos += 1;
                }
                _ if pos > 0 => return Err("expected '+' or '-' between terms".to_string()),
                _ => {}
            }
            pos += match (tokens.get(pos), tokens.get(pos + 1), tokens.get(pos + 2)) {
                (Some(Token::Num(n)), Some(Token::Star), Some(Token::Ident(name)))
                | (Some(Token::Ident(name)), Some(Token::Star), Some(Token::Num(n))) => {
                    *out.coefficients.entry(name.clone()).or_default() += sign * n;
                    3
                }
                (Some(Token::Num(n)), _, _) => {
                    out.constant += sign * n;
                    1
                }
                (Some(Token::Ident(name)), _, _) => {
                    *out.coefficients.entry(name.clone()).or_default() += sign;
                    1
                }
                _ => return Err("expected a number or a variable".to_string()),
            };
            if pos == tokens.len() {
                return Ok(out);
            }
        }
    }
}

/// A linear inequality over numeric variables, such as `x1 + 2 * x2 <= 3`
/// or `x3 >= x4`.
///
/// Terms may appear on both sides; they are moved to the left-hand side on
/// parsing. Coefficients are written `2 * x` or `x * 2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterConstraint {
    expression: String,
    coefficients: BTreeMap<String, f64>,
    bound: Bound,
    limit: f64,
}

impl ParameterConstraint {
    /// The constraint as written.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Coefficient of each variable, after moving every term to the left.
    #[must_use]
    pub fn coefficients(&self) -> &BTreeMap<String, f64> {
        &self.coefficients
    }

    /// The comparison.
    #[must_use]
    pub fn bound(&self) -> Bound {
        self.bound
    }

    /// The right-hand side constant.
    #[must_use]
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// The left-hand side for `point`, or `None` if a referenced variable
    /// is missing or not numeric.
    #[must_use]
    pub fn lhs(&self, point: &ParameterPoint) -> Option<f64> {
        self.coefficients
            .iter()
            .map(|(name, coefficient)| point.get(name)?.as_f64().map(|v| coefficient * v))
            .sum()
    }

    /// `Some(true)` if `point` satisfies the constraint, `None` if it cannot
    /// be evaluated.
    #[must_use]
    pub fn is_satisfied(&self, point: &ParameterPoint) -> Option<bool> {
        self.lhs(point).map(|lhs| self.bound.holds(lhs, self.limit))
    }
}

impl FromStr for ParameterConstraint {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, String> {
        let (lhs, bound, rhs) = split_inequality(text)?;
        let mut left = Linear::parse(lhs)?;
        let right = Linear::parse(rhs)?;
        for (name, coefficient) in right.coefficients {
            *left.coefficients.entry(name).or_default() -= coefficient;
        }
        left.coefficients.retain(|_, c| *c != 0.0);
        if left.coefficients.is_empty() {
            return Err("constraint references no variables".to_string());
        }
        let limit = right.constant - left.constant;
        if left.coefficients.values().any(|c| !c.is_finite()) || !limit.is_finite() {
            return Err("coefficients must be finite".to_string());
        }
        Ok(Self {
            expression: text.trim().to_string(),
            coefficients: left.coefficients,
            bound,
            limit,
        })
    }
}

impl TryFrom<String> for ParameterConstraint {
    type Error = String;

    fn try_from(text: String) -> Result<Self, String> {
        text.parse()
    }
}

impl From<ParameterConstraint> for String {
    fn from(constraint: ParameterConstraint) -> Self {
        constraint.expression
    }
}

impl fmt::Display for ParameterConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// A bound on one auxiliary metric, such as `charge >= 10` or
/// `beam.emittance <= 1e-6`.
///
/// A completed trial that lacks the metric does not satisfy the bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutcomeConstraint {
    metric: String,
    bound: Bound,
    limit: f64,
}

impl OutcomeConstraint {
    /// The constrained metric.
    #[must_use]
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The comparison.
    #[must_use]
    pub fn bound(&self) -> Bound {
        self.bound
    }

    /// The limit.
    #[must_use]
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Whether `metrics` satisfies the bound.
    #[must_use]
    pub fn is_satisfied(&self, metrics: &BTreeMap<String, f64>) -> bool {
        metrics
            .get(&self.metric)
            .is_some_and(|value| self.bound.holds(*value, self.limit))
    }
}

impl FromStr for OutcomeConstraint {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, String> {
        let (lhs, bound, rhs) = split_inequality(text)?;
        let metric = lhs.trim();
        if metric.is_empty() || metric.contains(char::is_whitespace) {
            return Err(format!("'{metric}' is not a metric name"));
        }
        let limit = rhs
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|l| l.is_finite())
            .ok_or_else(|| format!("'{}' is not a finite number", rhs.trim()))?;
        Ok(Self {
            metric: metric.to_string(),
            bound,
            limit,
        })
    }
}

impl TryFrom<String> for OutcomeConstraint {
    type Error = String;

    fn try_from(text: String) -> Result<Self, String> {
        text.parse()
    }
}

impl From<OutcomeConstraint> for String {
    fn from(constraint: OutcomeConstraint) -> Self {
        constraint.to_string()
    }
}

impl fmt::Display for OutcomeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.bound.symbol(), self.limit)
    }
}
