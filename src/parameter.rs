//! Search-space declarations and validated parameter points.
//!
//! A [`SearchSpace`] is declared once per optimization from a list of
//! [`VariableSpec`]s and an optional [`FidelitySpec`]. Every candidate produced
//! by a proposer is a [`ParameterPoint`]; the space checks it with
//! [`validate`](SearchSpace::validate) and turns it into the substitutions a
//! template needs with [`bind_to_template`](SearchSpace::bind_to_template).
//!
//! # Example
//!
//! ```
//! use picopt::parameter::{ParameterPoint, SearchSpace, VariableSpec};
//!
//! let space = SearchSpace::new(
//!     vec![
//!         VariableSpec::continuous("a0", 1.0, 4.0),
//!         VariableSpec::integer("n_cells", 64, 512),
//!         VariableSpec::categorical("laser", ["gaussian", "flattop"]),
//!     ],
//!     None,
//! )
//! .unwrap();
//!
//! let point = ParameterPoint::new()
//!     .with("a0", 2.5)
//!     .with("n_cells", 128)
//!     .with("laser", "gaussian");
//! assert!(space.validate(&point).is_ok());
//! ```

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constraint::{OutcomeConstraint, ParameterConstraint};
use crate::error::{Error, Result};
use crate::template::Substitutions;

/// A concrete value for one variable.
///
/// Serialized untagged: integers as JSON integers, floats as JSON floats and
/// categorical choices as strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
    /// One of a categorical variable's choices.
    Categorical(String),
}

impl ParamValue {
    /// Numeric view of the value, if it has one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Categorical(_) => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "an integer",
            ParamValue::Float(_) => "a float",
            ParamValue::Categorical(_) => "a string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Debug keeps the decimal point on integral floats (`1.0`, not `1`).
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Categorical(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Categorical(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Categorical(v)
    }
}

/// Type and bounds of a variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableKind {
    /// A real value in `[lower, upper]`.
    Continuous {
        /// Lower bound (inclusive).
        lower: f64,
        /// Upper bound (inclusive).
        upper: f64,
    },
    /// An integer value in `[lower, upper]`.
    Integer {
        /// Lower bound (inclusive).
        lower: i64,
        /// Upper bound (inclusive).
        upper: i64,
    },
    /// One of a finite set of strings.
    Categorical {
        /// The allowed values.
        choices: Vec<String>,
    },
}

/// Declaration of one searchable variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Unique name, also the template placeholder it fills.
    pub name: String,
    /// Type and bounds.
    #[serde(flatten)]
    pub kind: VariableKind,
    /// Pin the variable to one value; proposers need not know about it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<ParamValue>,
}

impl VariableSpec {
    /// A continuous variable in `[lower, upper]`.
    #[must_use]
    pub fn continuous(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Continuous { lower, upper },
            fixed: None,
        }
    }

    /// An integer variable in `[lower, upper]`.
    #[must_use]
    pub fn integer(name: impl Into<String>, lower: i64, upper: i64) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Integer { lower, upper },
            fixed: None,
        }
    }

    /// A categorical variable over `choices`.
    #[must_use]
    pub fn categorical<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: VariableKind::Categorical {
                choices: choices.into_iter().map(Into::into).collect(),
            },
            fixed: None,
        }
    }

    /// Pin this variable to `value`.
    #[must_use]
    pub fn fixed(mut self, value: impl Into<ParamValue>) -> Self {
        self.fixed = Some(value.into());
        self
    }

    fn check_declaration(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidDeclaration {
            variable: self.name.clone(),
            reason,
        };
        if !is_identifier(&self.name) {
            return Err(invalid(
                "name must be a non-empty identifier ([A-Za-z_][A-Za-z0-9_]*)".to_string(),
            ));
        }
        match &self.kind {
            VariableKind::Continuous { lower, upper } => {
                if !lower.is_finite() || !upper.is_finite() {
                    return Err(invalid("bounds must be finite".to_string()));
                }
                if lower > upper {
                    return Err(invalid(format!(
                        "lower bound ({lower}) must be less than or equal to upper bound ({upper})"
                    )));
                }
            }
            VariableKind::Integer { lower, upper } => {
                if lower > upper {
                    return Err(invalid(format!(
                        "lower bound ({lower}) must be less than or equal to upper bound ({upper})"
                    )));
                }
            }
            VariableKind::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("categorical choices cannot be empty".to_string()));
                }
                let unique: BTreeSet<&String> = choices.iter().collect();
                if unique.len() != choices.len() {
                    return Err(invalid("categorical choices must be unique".to_string()));
                }
            }
        }
        if let Some(value) = &self.fixed {
            self.check_value(value)
                .map_err(|reason| invalid(format!("fixed value {reason}")))?;
        }
        Ok(())
    }

    /// Check a value against this variable's type and bounds.
    fn check_value(&self, value: &ParamValue) -> core::result::Result<(), String> {
        match (&self.kind, value) {
            (VariableKind::Continuous { lower, upper }, ParamValue::Float(v)) => {
                if !v.is_finite() {
                    Err(format!("{v} is not finite"))
                } else if v < lower || v > upper {
                    Err(format!("{v} is outside [{lower}, {upper}]"))
                } else {
                    Ok(())
                }
            }
            (VariableKind::Integer { lower, upper }, ParamValue::Int(v)) => {
                if v < lower || v > upper {
                    Err(format!("{v} is outside [{lower}, {upper}]"))
                } else {
                    Ok(())
                }
            }
            (VariableKind::Categorical { choices }, ParamValue::Categorical(v)) => {
                if choices.iter().any(|c| c == v) {
                    Ok(())
                } else {
                    Err(format!("'{v}' is not one of {choices:?}"))
                }
            }
            (VariableKind::Continuous { .. }, other) => {
                Err(format!("expected a float, got {}", other.type_name()))
            }
            (VariableKind::Integer { .. }, other) => {
                Err(format!("expected an integer, got {}", other.type_name()))
            }
            (VariableKind::Categorical { .. }, other) => {
                Err(format!("expected a string, got {}", other.type_name()))
            }
        }
    }

    /// Coerce a value into this variable's canonical representation.
    #[allow(clippy::cast_precision_loss)]
    fn normalize(&self, value: ParamValue) -> ParamValue {
        match (&self.kind, value) {
            (VariableKind::Continuous { .. }, ParamValue::Int(v)) => ParamValue::Float(v as f64),
            (_, value) => value,
        }
    }
}

/// Monotonic mapping from fidelity value to relative compute cost.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CostModel {
    /// `cost(f) = f`.
    #[default]
    Linear,
    /// `cost(f) = f^exponent`.
    Power {
        /// Non-negative exponent.
        exponent: f64,
    },
    /// Piecewise-linear interpolation through `(fidelity, cost)` points,
    /// clamped outside the table.
    Table {
        /// Points sorted by strictly increasing fidelity.
        points: Vec<(f64, f64)>,
    },
}

impl CostModel {
    /// The relative cost of evaluating at `fidelity`.
    #[must_use]
    pub fn cost(&self, fidelity: f64) -> f64 {
        match self {
            CostModel::Linear => fidelity,
            CostModel::Power { exponent } => fidelity.powf(*exponent),
            CostModel::Table { points } => interpolate(points, fidelity),
        }
    }

    fn check(&self, lower: f64) -> core::result::Result<(), String> {
        match self {
            CostModel::Linear => {
                if lower < 0.0 {
                    return Err("linear cost requires a non-negative lower bound".to_string());
                }
            }
            CostModel::Power { exponent } => {
                if !exponent.is_finite() || *exponent < 0.0 {
                    return Err(format!("power exponent {exponent} must be finite and >= 0"));
                }
                if lower < 0.0 {
                    return Err("power cost requires a non-negative lower bound".to_string());
                }
            }
            CostModel::Table { points } => {
                if points.is_empty() {
                    return Err("cost table cannot be empty".to_string());
                }
                if points.iter().any(|(f, c)| !f.is_finite() || !c.is_finite()) {
                    return Err("cost table entries must be finite".to_string());
                }
                for pair in points.windows(2) {
                    let ((f0, c0), (f1, c1)) = (pair[0], pair[1]);
                    if f1 <= f0 {
                        return Err("cost table fidelities must be strictly increasing".to_string());
                    }
                    if c1 < c0 {
                        return Err(format!(
                            "cost must be non-decreasing in fidelity ({c0} at {f0} > {c1} at {f1})"
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

fn interpolate(points: &[(f64, f64)], x: f64) -> f64 {
    let Some(&(first_f, first_c)) = points.first() else {
        return 0.0;
    };
    if x <= first_f {
        return first_c;
    }
    for pair in points.windows(2) {
        let ((f0, c0), (f1, c1)) = (pair[0], pair[1]);
        if x <= f1 {
            return c0 + (c1 - c0) * (x - f0) / (f1 - f0);
        }
    }
    points.last().map_or(first_c, |&(_, c)| c)
}

/// The fidelity axis of a multi-fidelity optimization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FidelitySpec {
    /// Placeholder name the fidelity value fills.
    pub name: String,
    /// Lowest (cheapest) fidelity.
    pub lower: f64,
    /// Highest fidelity.
    pub upper: f64,
    /// The fidelity considered "full"; defaults to `upper`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    /// Relative cost as a function of fidelity.
    #[serde(default)]
    pub cost: CostModel,
}

impl FidelitySpec {
    /// A fidelity axis over `[lower, upper]` with linear cost.
    #[must_use]
    pub fn new(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
            target: None,
            cost: CostModel::Linear,
        }
    }

    /// Set the full-fidelity value.
    #[must_use]
    pub fn target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the cost model.
    #[must_use]
    pub fn cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    /// The full-fidelity value.
    #[must_use]
    pub fn target_value(&self) -> f64 {
        self.target.unwrap_or(self.upper)
    }

    fn check_declaration(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidDeclaration {
            variable: self.name.clone(),
            reason,
        };
        if !is_identifier(&self.name) {
            return Err(invalid("fidelity name must be a non-empty identifier".to_string()));
        }
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return Err(invalid("fidelity bounds must be finite".to_string()));
        }
        if self.lower > self.upper {
            return Err(invalid(format!(
                "lower bound ({}) must be less than or equal to upper bound ({})",
                self.lower, self.upper
            )));
        }
        let target = self.target_value();
        if !(self.lower..=self.upper).contains(&target) {
            return Err(invalid(format!(
                "target {target} is outside [{}, {}]",
                self.lower, self.upper
            )));
        }
        self.cost.check(self.lower).map_err(invalid)
    }

    fn check_value(&self, fidelity: f64) -> core::result::Result<(), String> {
        if !fidelity.is_finite() {
            Err(format!("{fidelity} is not finite"))
        } else if fidelity < self.lower || fidelity > self.upper {
            Err(format!(
                "{fidelity} is outside [{}, {}]",
                self.lower, self.upper
            ))
        } else {
            Ok(())
        }
    }
}

/// An immutable assignment of values to variables, plus an optional fidelity.
///
/// Points are never edited in place: the `with*` methods consume the point
/// and return a new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterPoint {
    values: BTreeMap<String, ParamValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fidelity: Option<f64>,
}

impl ParameterPoint {
    /// An empty point.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a point that also assigns `value` to `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Return a point evaluated at `fidelity`.
    #[must_use]
    pub fn with_fidelity(mut self, fidelity: f64) -> Self {
        self.fidelity = Some(fidelity);
        self
    }

    /// The value assigned to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// All assignments, ordered by name.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, ParamValue> {
        &self.values
    }

    /// The fidelity, if any.
    #[must_use]
    pub fn fidelity(&self) -> Option<f64> {
        self.fidelity
    }

    /// `true` if both points assign the same values, ignoring fidelity.
    #[must_use]
    pub fn same_location(&self, other: &ParameterPoint) -> bool {
        self.values == other.values
    }
}

impl<K, V> FromIterator<(K, V)> for ParameterPoint
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            fidelity: None,
        }
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        if let Some(fidelity) = self.fidelity {
            write!(f, " @ {fidelity:?}")?;
        }
        f.write_str("}")
    }
}

/// The declared search space of one optimization.
///
/// Construction validates every declaration; a `SearchSpace` that exists is
/// well formed. Deserialization goes through the same checks.
///
/// Besides variable bounds, a space may carry linear
/// [`ParameterConstraint`]s, which [`validate`](Self::validate) enforces,
/// and [`OutcomeConstraint`]s on auxiliary metrics, which decide whether a
/// completed trial is eligible as the best one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SpaceDeclaration")]
pub struct SearchSpace {
    variables: Vec<VariableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fidelity: Option<FidelitySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    constraints: Vec<ParameterConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outcome_constraints: Vec<OutcomeConstraint>,
}

#[derive(Deserialize)]
struct SpaceDeclaration {
    variables: Vec<VariableSpec>,
    #[serde(default)]
    fidelity: Option<FidelitySpec>,
    #[serde(default)]
    constraints: Vec<ParameterConstraint>,
    #[serde(default)]
    outcome_constraints: Vec<OutcomeConstraint>,
}

impl TryFrom<SpaceDeclaration> for SearchSpace {
    type Error = Error;

    fn try_from(raw: SpaceDeclaration) -> Result<Self> {
        SearchSpace::new(raw.variables, raw.fidelity)?
            .with_constraints(raw.constraints)?
            .with_outcome_constraints(raw.outcome_constraints)
    }
}

impl SearchSpace {
    /// Declare a search space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeclaration`] naming the first malformed
    /// variable: empty or inverted bounds, duplicate names, a fixed value
    /// outside its bounds, or a fidelity axis whose cost decreases.
    pub fn new(variables: Vec<VariableSpec>, fidelity: Option<FidelitySpec>) -> Result<Self> {
        if variables.is_empty() {
            return Err(Error::InvalidDeclaration {
                variable: String::new(),
                reason: "at least one variable must be declared".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        let mut normalized = Vec::with_capacity(variables.len());
        for mut spec in variables {
            if !seen.insert(spec.name.clone()) {
                return Err(Error::InvalidDeclaration {
                    variable: spec.name,
                    reason: "duplicate variable name".to_string(),
                });
            }
            let fixed = spec.fixed.take().map(|v| spec.normalize(v));
            spec.fixed = fixed;
            spec.check_declaration()?;
            normalized.push(spec);
        }

        if let Some(fidelity) = &fidelity {
            if seen.contains(&fidelity.name) {
                return Err(Error::InvalidDeclaration {
                    variable: fidelity.name.clone(),
                    reason: "fidelity name clashes with a variable".to_string(),
                });
            }
            fidelity.check_declaration()?;
        }

        Ok(Self {
            variables: normalized,
            fidelity,
            constraints: Vec::new(),
            outcome_constraints: Vec::new(),
        })
    }

    /// Add linear constraints between variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeclaration`] if a constraint references a
    /// name that is not a declared continuous or integer variable.
    pub fn with_constraints(
        mut self,
        constraints: impl IntoIterator<Item = ParameterConstraint>,
    ) -> Result<Self> {
        for constraint in constraints {
            for name in constraint.coefficients().keys() {
                let numeric = self
                    .variable(name)
                    .is_some_and(|v| !matches!(v.kind, VariableKind::Categorical { .. }));
                if !numeric {
                    return Err(Error::InvalidDeclaration {
                        variable: name.clone(),
                        reason: format!(
                            "constraint '{constraint}' must reference continuous or integer variables"
                        ),
                    });
                }
            }
            self.constraints.push(constraint);
        }
        Ok(self)
    }

    /// Add bounds on auxiliary metrics that a completed trial must meet to
    /// count as a best candidate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeclaration`] if the same metric and bound
    /// direction are constrained twice.
    pub fn with_outcome_constraints(
        mut self,
        constraints: impl IntoIterator<Item = OutcomeConstraint>,
    ) -> Result<Self> {
        for constraint in constraints {
            let duplicate = self
                .outcome_constraints
                .iter()
                .any(|c| c.metric() == constraint.metric() && c.bound() == constraint.bound());
            if duplicate {
                return Err(Error::InvalidDeclaration {
                    variable: constraint.metric().to_string(),
                    reason: format!("duplicate outcome constraint '{constraint}'"),
                });
            }
            self.outcome_constraints.push(constraint);
        }
        Ok(self)
    }

    /// The linear parameter constraints.
    #[must_use]
    pub fn constraints(&self) -> &[ParameterConstraint] {
        &self.constraints
    }

    /// The outcome constraints.
    #[must_use]
    pub fn outcome_constraints(&self) -> &[OutcomeConstraint] {
        &self.outcome_constraints
    }

    /// `true` if every parameter constraint holds for `point`. Constraints
    /// over missing or non-numeric values do not hold.
    #[must_use]
    pub fn satisfies_constraints(&self, point: &ParameterPoint) -> bool {
        self.constraints
            .iter()
            .all(|c| c.is_satisfied(point) == Some(true))
    }

    /// `true` if `metrics` meet every outcome constraint.
    #[must_use]
    pub fn satisfies_outcomes(&self, metrics: &BTreeMap<String, f64>) -> bool {
        self.outcome_constraints
            .iter()
            .all(|c| c.is_satisfied(metrics))
    }

    /// The declared variables in declaration order.
    #[must_use]
    pub fn variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    /// Look up a variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// The fidelity axis, if declared.
    #[must_use]
    pub fn fidelity(&self) -> Option<&FidelitySpec> {
        self.fidelity.as_ref()
    }

    /// Every name a template may reference: variables then the fidelity axis.
    pub fn placeholder_names(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .map(|v| v.name.as_str())
            .chain(self.fidelity.iter().map(|f| f.name.as_str()))
    }

    /// Apply fixed values, coerce integers given for continuous variables,
    /// and fill in the target fidelity when the point has none.
    ///
    /// Returns a new point; the input is left untouched.
    #[must_use]
    pub fn complete(&self, point: &ParameterPoint) -> ParameterPoint {
        let mut values = point.values.clone();
        for spec in &self.variables {
            if let Some(fixed) = &spec.fixed {
                values.insert(spec.name.clone(), fixed.clone());
            } else if let Some(value) = values.remove(&spec.name) {
                values.insert(spec.name.clone(), spec.normalize(value));
            }
        }
        let fidelity = match (&self.fidelity, point.fidelity) {
            (Some(spec), None) => Some(spec.target_value()),
            (_, fidelity) => fidelity,
        };
        ParameterPoint { values, fidelity }
    }

    /// Every reason `point` is invalid, as `(variable, reason)` pairs.
    ///
    /// Empty iff [`validate`](Self::validate) accepts the point. Parameter
    /// constraints are only checked once every variable is valid.
    #[must_use]
    pub fn violations(&self, point: &ParameterPoint) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for spec in &self.variables {
            match point.values.get(&spec.name) {
                None => out.push((spec.name.clone(), "missing".to_string())),
                Some(value) => {
                    if let Err(reason) = spec.check_value(value) {
                        out.push((spec.name.clone(), reason));
                    } else if let Some(fixed) = &spec.fixed {
                        if fixed != value {
                            out.push((
                                spec.name.clone(),
                                format!("variable is fixed to {fixed}, got {value}"),
                            ));
                        }
                    }
                }
            }
        }
        for name in point.values.keys() {
            if self.variable(name).is_none() {
                out.push((name.clone(), "not a declared variable".to_string()));
            }
        }
        match (&self.fidelity, point.fidelity) {
            (Some(spec), Some(fidelity)) => {
                if let Err(reason) = spec.check_value(fidelity) {
                    out.push((spec.name.clone(), reason));
                }
            }
            (Some(spec), None) => out.push((spec.name.clone(), "missing fidelity".to_string())),
            (None, Some(_)) => out.push((
                "fidelity".to_string(),
                "no fidelity axis is declared".to_string(),
            )),
            (None, None) => {}
        }
        if out.is_empty() {
            for constraint in &self.constraints {
                if let (Some(lhs), Some(false)) =
                    (constraint.lhs(point), constraint.is_satisfied(point))
                {
                    out.push((
                        constraint.to_string(),
                        format!("constraint violated (left-hand side is {lhs})"),
                    ));
                }
            }
        }
        out
    }

    /// Check that `point` assigns every declared variable an in-bounds,
    /// correctly typed value, that its fidelity matches the declared axis
    /// and that it satisfies every parameter constraint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first offending
    /// variable, or the violated constraint.
    pub fn validate(&self, point: &ParameterPoint) -> Result<()> {
        match self.violations(point).into_iter().next() {
            Some((variable, reason)) => Err(Error::InvalidParameter { variable, reason }),
            None => Ok(()),
        }
    }

    /// Check that the template placeholders and the declared names match
    /// one-to-one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingVariable`] for a placeholder without a
    /// declaration and [`Error::UnboundVariable`] for a declaration the
    /// template never references.
    pub fn check_template(&self, placeholders: &BTreeSet<String>) -> Result<()> {
        let declared: BTreeSet<&str> = self.placeholder_names().collect();
        if let Some(missing) = placeholders
            .iter()
            .find(|p| !declared.contains(p.as_str()))
        {
            return Err(Error::MissingVariable(missing.clone()));
        }
        if let Some(unbound) = declared.iter().find(|d| !placeholders.contains(**d)) {
            return Err(Error::UnboundVariable((*unbound).to_string()));
        }
        Ok(())
    }

    /// Produce the placeholder substitutions for `point`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingVariable`] if a placeholder has no declared
    /// variable, or [`Error::InvalidParameter`] if the point lacks a value for
    /// a placeholder it should fill.
    pub fn bind_to_template(
        &self,
        point: &ParameterPoint,
        placeholders: &BTreeSet<String>,
    ) -> Result<Substitutions> {
        let mut substitutions = Substitutions::new();
        for name in placeholders {
            let value = if self.variable(name).is_some() {
                point
                    .values
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::InvalidParameter {
                        variable: name.clone(),
                        reason: "missing".to_string(),
                    })?
            } else if self.fidelity.as_ref().is_some_and(|f| &f.name == name) {
                point
                    .fidelity
                    .map(ParamValue::Float)
                    .ok_or_else(|| Error::InvalidParameter {
                        variable: name.clone(),
                        reason: "missing fidelity".to_string(),
                    })?
            } else {
                return Err(Error::MissingVariable(name.clone()));
            };
            substitutions.insert(name.clone(), value);
        }
        Ok(substitutions)
    }

    /// Relative cost of evaluating `point`; `1.0` without a fidelity axis.
    #[must_use]
    pub fn cost(&self, point: &ParameterPoint) -> f64 {
        match (&self.fidelity, point.fidelity) {
            (Some(spec), Some(fidelity)) => spec.cost.cost(fidelity),
            (Some(spec), None) => spec.cost.cost(spec.target_value()),
            (None, _) => 1.0,
        }
    }

    /// `true` if `point` is evaluated at the full (target) fidelity, or if
    /// the space has no fidelity axis.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_full_fidelity(&self, point: &ParameterPoint) -> bool {
        match (&self.fidelity, point.fidelity) {
            (Some(spec), Some(fidelity)) => fidelity == spec.target_value(),
            (Some(_), None) | (None, _) => true,
        }
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
