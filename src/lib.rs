#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Resumable, multi-fidelity optimization driver for expensive simulations
//! such as particle-in-cell plasma codes.
//!
//! `picopt` repeatedly proposes parameter points, renders each one into a
//! simulation input through a template, hands it to an execution manager,
//! extracts a scalar objective from the finished run and feeds the
//! observation back to the proposer. Every trial transition is appended to
//! a durable history, so an interrupted optimization resumes where it
//! stopped without re-running finished trials or reusing trial ids.
//!
//! # Getting Started
//!
//! ```no_run
//! use picopt::prelude::*;
//!
//! # async fn example() -> picopt::Result<()> {
//! let space = SearchSpace::new(
//!     vec![
//!         VariableSpec::continuous("a0", 1.0, 4.0),
//!         VariableSpec::integer("nz", 64, 512),
//!     ],
//!     Some(FidelitySpec::new("resolution", 0.25, 1.0)),
//! )?;
//!
//! let mut driver = Driver::builder()
//!     .maximize()
//!     .space(space)
//!     .template(Template::from_file("template.in")?)
//!     .proposer(FidelityLadder::new(SobolProposer::with_seed(7), vec![0.25, 1.0]))
//!     .executor(LocalExecutor::new("runs", "./simulate"))
//!     .extractor(JsonFileExtractor::new("summary.json", "energy"))
//!     .journal("history.jsonl")
//!     .max_in_flight(4)
//!     .stop(StopPolicy::new().max_trials(60))
//!     .build()?;
//!
//! let summary = driver.run().await?;
//! println!("{summary}");
//! println!("{}", driver.history());
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`SearchSpace`](parameter::SearchSpace) | Declared variables, optional fidelity axis and its cost model. |
//! | [`ParameterConstraint`](constraint::ParameterConstraint) | Linear inequality a point must satisfy to be evaluated. |
//! | [`OutcomeConstraint`](constraint::OutcomeConstraint) | Metric bound a completed trial must meet to count as best. |
//! | [`Renderer`](template::Renderer) | Turns a point into simulation input text; [`Template`](template::Template) is the built-in one. |
//! | [`Proposer`](proposer::Proposer) | Pluggable search algorithm. |
//! | [`ExecutionManager`](execution::ExecutionManager) | Runs rendered inputs and reports back asynchronously. |
//! | [`Extractor`](extraction::Extractor) | Reads the objective from a finished run. |
//! | [`HistoryStore`](storage::HistoryStore) | Append-only ledger of trial transitions. |
//! | [`Driver`] | The control loop tying the above together. |
//! | [`HistoryView`](history::HistoryView) | Read-only queries and exports over a history. |
//!
//! # Trial lifecycle
//!
//! Each trial moves through [`TrialStatus`]:
//! `proposed -> dispatched -> running -> completed | failed | cancelled`.
//! Invalid points and render errors fail a trial straight from `proposed`
//! without using an execution slot. A history is appended to before the
//! proposer sees the outcome, so nothing the proposer learned can be lost by
//! a crash.

pub mod config;
pub mod constraint;
pub mod driver;
mod error;
pub mod execution;
pub mod extraction;
pub mod history;
pub mod parameter;
pub mod proposer;
pub mod stop;
pub mod storage;
pub mod template;
pub mod trial;
mod types;

pub use driver::{Driver, DriverBuilder, RunSummary, StopHandle};
pub use error::{Error, RenderError, Result};
pub use types::{Direction, TrialId, TrialStatus};

/// Convenient wildcard import for the most common types.
///
/// ```
/// use picopt::prelude::*;
/// ```
pub mod prelude {
    pub use crate::constraint::{OutcomeConstraint, ParameterConstraint};
    pub use crate::driver::{Driver, DriverBuilder, RunSummary, StopHandle};
    pub use crate::error::{Error, RenderError, Result};
    pub use crate::execution::{
        ExecutionEvent, ExecutionManager, ExecutionReport, JobHandle, JobRequest, LocalExecutor,
        ReportSender, ResourceRequest,
    };
    pub use crate::extraction::{Extraction, Extractor, JsonFileExtractor};
    pub use crate::history::{FidelitySummary, HistoryView};
    pub use crate::parameter::{
        CostModel, FidelitySpec, ParamValue, ParameterPoint, SearchSpace, VariableKind,
        VariableSpec,
    };
    pub use crate::proposer::{FidelityLadder, Proposer, RandomProposer, SobolProposer};
    pub use crate::stop::{StopCondition, StopPolicy, StopReason};
    pub use crate::storage::{HistoryStore, JournalStorage, MemoryStorage};
    pub use crate::template::{Renderer, Template};
    pub use crate::trial::TrialRecord;
    pub use crate::types::{Direction, TrialId, TrialStatus};
}
