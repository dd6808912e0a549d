//! The objective extraction adapter contract.
//!
//! After a simulation completes, the driver asks an [`Extractor`] to turn
//! its output location into an objective value plus optional auxiliary
//! metrics. Extraction is synchronous user code; the driver runs it on a
//! blocking thread in a background task under a timeout, so a slow
//! extractor never holds up reports of other trials. It is never retried.
//!
//! Plain closures work as extractors:
//!
//! ```
//! use std::path::Path;
//!
//! use picopt::extraction::Extractor;
//!
//! let extractor = |output: &Path| -> Result<f64, std::io::Error> {
//!     let text = std::fs::read_to_string(output.join("energy.txt"))?;
//!     Ok(text.trim().parse().unwrap_or(f64::NAN))
//! };
//! # let _ = &extractor as &dyn Extractor;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

/// The outcome of a successful extraction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    /// The scalar objective.
    pub objective: f64,
    /// Auxiliary named metrics, stored on the trial record.
    pub metrics: BTreeMap<String, f64>,
}

impl Extraction {
    /// An extraction with no auxiliary metrics.
    #[must_use]
    pub fn new(objective: f64) -> Self {
        Self {
            objective,
            metrics: BTreeMap::new(),
        }
    }

    /// Attach an auxiliary metric.
    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

impl From<f64> for Extraction {
    fn from(objective: f64) -> Self {
        Self::new(objective)
    }
}

/// Turns a completed simulation's output into an objective.
pub trait Extractor: Send + Sync + 'static {
    /// Extract the objective from `output`.
    ///
    /// # Errors
    ///
    /// Returns the failure reason; the trial is recorded as failed with it.
    fn extract(&self, output: &Path) -> Result<Extraction, String>;
}

impl<F, T, E> Extractor for F
where
    F: Fn(&Path) -> Result<T, E> + Send + Sync + 'static,
    T: Into<Extraction>,
    E: ToString,
{
    fn extract(&self, output: &Path) -> Result<Extraction, String> {
        self(output).map(Into::into).map_err(|e| e.to_string())
    }
}

/// Reads a JSON object from a file in the output directory and picks the
/// objective and metrics by key.
///
/// Keys may be dotted paths into nested objects (`"beam.energy"`).
///
/// # Examples
///
/// ```
/// use picopt::extraction::JsonFileExtractor;
///
/// let extractor = JsonFileExtractor::new("diags/summary.json", "beam.energy")
///     .metric("beam.charge")
///     .metric("beam.spread");
/// ```
#[derive(Clone, Debug)]
pub struct JsonFileExtractor {
    file: PathBuf,
    objective: String,
    metrics: Vec<String>,
}

impl JsonFileExtractor {
    /// Read `objective` from `file` (relative to the output directory).
    #[must_use]
    pub fn new(file: impl Into<PathBuf>, objective: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            objective: objective.into(),
            metrics: Vec::new(),
        }
    }

    /// Also record `key` as an auxiliary metric.
    #[must_use]
    pub fn metric(mut self, key: impl Into<String>) -> Self {
        self.metrics.push(key.into());
        self
    }
}

impl Extractor for JsonFileExtractor {
    fn extract(&self, output: &Path) -> Result<Extraction, String> {
        let path = output.join(&self.file);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let document: Value = serde_json::from_str(&text)
            .map_err(|e| format!("cannot parse {}: {e}", path.display()))?;

        let number = |key: &str| -> Result<f64, String> {
            lookup(&document, key)
                .ok_or_else(|| format!("key '{key}' not found in {}", path.display()))?
                .as_f64()
                .ok_or_else(|| format!("key '{key}' in {} is not a number", path.display()))
        };

        let mut extraction = Extraction::new(number(&self.objective)?);
        for key in &self.metrics {
            extraction.metrics.insert(key.clone(), number(key)?);
        }
        Ok(extraction)
    }
}

fn lookup<'a>(document: &'a Value, key: &str) -> Option<&'a Value> {
    document
        .get(key)
        .or_else(|| key.split('.').try_fold(document, |value, part| value.get(part)))
}
