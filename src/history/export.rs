use core::fmt;
use std::collections::BTreeSet;

use super::HistoryView;
use crate::types::{Direction, TrialStatus};

impl HistoryView {
    /// Write every trial to a writer in CSV format.
    ///
    /// Columns: `trial_id`, `status`, `attempt`, `fidelity`, `objective`,
    /// `cost`, then one column per declared variable, one per auxiliary
    /// metric (sorted), and finally `failure`. Missing values are empty
    /// cells.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if writing fails.
    pub fn to_csv(&self, mut writer: impl std::io::Write) -> std::io::Result<()> {
        let variables: Vec<&str> = self
            .space
            .variables()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        let metrics: BTreeSet<&str> = self
            .records
            .iter()
            .flat_map(|r| r.metrics().keys().map(String::as_str))
            .collect();

        // Header.
        write!(writer, "trial_id,status,attempt,fidelity,objective,cost")?;
        for name in variables.iter().chain(metrics.iter()) {
            write!(writer, ",{}", csv_escape(name))?;
        }
        writeln!(writer, ",failure")?;

        for record in &self.records {
            write!(
                writer,
                "{},{},{},",
                record.id(),
                record.status(),
                record.attempt()
            )?;
            if let Some(fidelity) = record.fidelity() {
                write!(writer, "{fidelity}")?;
            }
            write!(writer, ",")?;
            if let Some(objective) = record.objective() {
                write!(writer, "{objective}")?;
            }
            write!(writer, ",{}", self.space.cost(record.point()))?;

            for name in &variables {
                match record.point().get(name) {
                    Some(value) => write!(writer, ",{}", csv_escape(&value.to_string()))?,
                    None => write!(writer, ",")?,
                }
            }
            for name in &metrics {
                match record.metrics().get(*name) {
                    Some(value) => write!(writer, ",{value}")?,
                    None => write!(writer, ",")?,
                }
            }
            writeln!(writer, ",{}", csv_escape(record.failure().unwrap_or("")))?;
        }

        Ok(())
    }

    /// Export every trial to a CSV file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or written.
    pub fn export_csv(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.to_csv(std::io::BufWriter::new(file))
    }

    /// Export every trial record as a pretty-printed JSON array.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be created or written.
    pub fn export_json(&self, path: impl AsRef<std::path::Path>) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.records)
            .map_err(std::io::Error::other)
    }

    /// Return a human-readable summary of the history.
    ///
    /// Includes the direction, trial counts by status, a per-fidelity
    /// breakdown when a fidelity axis is declared, and the best trial.
    #[must_use]
    pub fn summary(&self) -> String {
        use fmt::Write;

        let direction = match self.direction {
            Direction::Minimize => "Minimize",
            Direction::Maximize => "Maximize",
        };
        let mut s = format!("History: {direction} | {} trials", self.records.len());
        let counts: Vec<String> = [
            TrialStatus::Completed,
            TrialStatus::Failed,
            TrialStatus::Cancelled,
            TrialStatus::Dispatched,
            TrialStatus::Running,
            TrialStatus::Proposed,
        ]
        .into_iter()
        .filter_map(|status| match self.count(status) {
            0 => None,
            n => Some(format!("{n} {status}")),
        })
        .collect();
        if !counts.is_empty() {
            let _ = write!(s, " ({})", counts.join(", "));
        }

        if let Some(axis) = self.space.fidelity() {
            let _ = write!(s, "\nFidelity '{}':", axis.name);
            for level in self.per_fidelity() {
                let label = level
                    .fidelity
                    .map_or_else(|| "-".to_string(), |f| f.to_string());
                let _ = write!(
                    s,
                    "\n  {label}: {} trials, {} completed, {} failed, cost {:.3}",
                    level.trials, level.completed, level.failed, level.cost
                );
                if let Some((id, value)) = level.best {
                    let _ = write!(s, ", best {value} (trial #{id})");
                }
            }
        }

        if let Ok(best) = self.best() {
            if let Some(value) = best.objective() {
                let _ = write!(s, "\nBest value: {value} (trial #{})", best.id());
            }
            s.push_str("\nBest parameters:");
            for (name, value) in best.point().values() {
                let _ = write!(s, "\n  {name} = {value}");
            }
            if !best.metrics().is_empty() {
                s.push_str("\nMetrics:");
                for (name, value) in best.metrics() {
                    let _ = write!(s, "\n  {name} = {value}");
                }
            }
        }

        s
    }
}

impl fmt::Display for HistoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Escape a string for CSV output. If the value contains a comma, quote, or
/// newline, wrap it in double-quotes and double any embedded quotes.
fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
