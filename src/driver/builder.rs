use core::time::Duration;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use super::Driver;
use crate::error::{Error, Result};
use crate::execution::{ExecutionManager, ResourceRequest};
use crate::extraction::Extractor;
use crate::parameter::{ParameterPoint, SearchSpace};
use crate::proposer::{Proposer, RandomProposer};
use crate::stop::StopPolicy;
use crate::storage::{HistoryHeader, HistoryStore, JournalStorage, MemoryStorage};
use crate::template::Renderer;
use crate::types::{Direction, TrialId};

enum StoreChoice {
    Memory,
    Journal(PathBuf),
    Custom(Arc<dyn HistoryStore>),
}

/// A builder for constructing [`Driver`] instances with a fluent API.
///
/// Created via [`Driver::builder()`]. The search space, template, executor
/// and extractor are required; everything else has a default.
///
/// # Defaults
///
/// - Direction: [`Minimize`](Direction::Minimize)
/// - Proposer: [`RandomProposer`]
/// - Storage: [`MemoryStorage`] (nothing survives the process)
/// - In-flight budget: 1
/// - Stop policy: none (runs until the proposer is exhausted or a stop is
///   requested)
/// - Extraction timeout: none
/// - Grace period: 60 seconds
/// - Resources: one worker, no GPUs
pub struct DriverBuilder {
    direction: Direction,
    space: Option<SearchSpace>,
    renderer: Option<Arc<dyn Renderer>>,
    proposer: Option<Box<dyn Proposer>>,
    executor: Option<Arc<dyn ExecutionManager>>,
    extractor: Option<Arc<dyn Extractor>>,
    store: StoreChoice,
    max_in_flight: usize,
    policy: StopPolicy,
    extraction_timeout: Option<Duration>,
    grace_period: Duration,
    resources: ResourceRequest,
    initial_points: Vec<ParameterPoint>,
}

impl DriverBuilder {
    pub(super) fn new() -> Self {
        Self {
            direction: Direction::Minimize,
            space: None,
            renderer: None,
            proposer: None,
            executor: None,
            extractor: None,
            store: StoreChoice::Memory,
            max_in_flight: 1,
            policy: StopPolicy::new(),
            extraction_timeout: None,
            grace_period: Duration::from_secs(60),
            resources: ResourceRequest::default(),
            initial_points: Vec::new(),
        }
    }

    /// Minimize the objective (the default).
    #[must_use]
    pub fn minimize(mut self) -> Self {
        self.direction = Direction::Minimize;
        self
    }

    /// Maximize the objective.
    #[must_use]
    pub fn maximize(mut self) -> Self {
        self.direction = Direction::Maximize;
        self
    }

    /// Set the optimization direction explicitly.
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// The search space. Required.
    #[must_use]
    pub fn space(mut self, space: SearchSpace) -> Self {
        self.space = Some(space);
        self
    }

    /// The input template. Required.
    #[must_use]
    pub fn template(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// The proposer. Defaults to [`RandomProposer`].
    #[must_use]
    pub fn proposer(mut self, proposer: impl Proposer + 'static) -> Self {
        self.proposer = Some(Box::new(proposer));
        self
    }

    /// The execution manager. Required.
    #[must_use]
    pub fn executor(mut self, executor: impl ExecutionManager + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// The objective extraction adapter. Required.
    #[must_use]
    pub fn extractor(mut self, extractor: impl Extractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// Persist the history to a JSONL journal at `path`, resuming from it if
    /// it exists.
    #[must_use]
    pub fn journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.store = StoreChoice::Journal(path.into());
        self
    }

    /// Use a custom history store.
    ///
    /// Custom stores carry no header, so the declared space is not checked
    /// against them.
    #[must_use]
    pub fn storage(mut self, store: impl HistoryStore + 'static) -> Self {
        self.store = StoreChoice::Custom(Arc::new(store));
        self
    }

    /// Upper bound on trials simultaneously dispatched or running.
    #[must_use]
    pub fn max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n;
        self
    }

    /// When to stop.
    #[must_use]
    pub fn stop(mut self, policy: StopPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound each extraction call; a slower one fails the trial with
    /// `extraction timeout`.
    #[must_use]
    pub fn extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = Some(timeout);
        self
    }

    /// How long a stopping driver waits for in-flight trials before
    /// cancelling them.
    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Resources requested for every simulation.
    #[must_use]
    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Evaluate `point` before consulting the proposer.
    #[must_use]
    pub fn enqueue(mut self, point: ParameterPoint) -> Self {
        self.initial_points.push(point);
        self
    }

    /// Build the driver, loading and reconciling any prior history.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if a required part is missing or the in-flight
    ///   budget is zero.
    /// - [`Error::MissingVariable`] / [`Error::UnboundVariable`] if the
    ///   template and the search space disagree.
    /// - [`Error::LockConflict`], [`Error::CorruptHistory`],
    ///   [`Error::IncompatibleHistory`] or [`Error::Storage`] from the
    ///   history store.
    pub fn build(self) -> Result<Driver> {
        let space = self
            .space
            .ok_or_else(|| Error::Config("no search space declared".to_string()))?;
        let renderer = self
            .renderer
            .ok_or_else(|| Error::Config("no template configured".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| Error::Config("no execution manager configured".to_string()))?;
        let extractor = self
            .extractor
            .ok_or_else(|| Error::Config("no extractor configured".to_string()))?;
        if self.max_in_flight == 0 {
            return Err(Error::Config("max_in_flight must be at least 1".to_string()));
        }
        space.check_template(renderer.placeholders())?;

        let store: Arc<dyn HistoryStore> = match self.store {
            StoreChoice::Memory => Arc::new(MemoryStorage::new()),
            StoreChoice::Journal(path) => Arc::new(JournalStorage::open(
                path,
                HistoryHeader::new(self.direction, space.clone()),
            )?),
            StoreChoice::Custom(store) => store,
        };
        let snapshot = store.load()?;

        let (stop, _) = watch::channel(false);
        let mut driver = Driver {
            direction: self.direction,
            space,
            renderer,
            proposer: self
                .proposer
                .unwrap_or_else(|| Box::new(RandomProposer::new())),
            executor,
            extractor,
            store,
            policy: self.policy,
            max_in_flight: self.max_in_flight,
            extraction_timeout: self.extraction_timeout,
            grace_period: self.grace_period,
            resources: self.resources,
            ledger: Vec::new(),
            next_id: TrialId(0),
            queued: self.initial_points.into_iter().collect::<VecDeque<_>>(),
            resubmit: VecDeque::new(),
            objectives: Vec::new(),
            best: None,
            stop: Arc::new(stop),
        };
        driver.reconcile(snapshot)?;
        Ok(driver)
    }
}
