//! Job graph model.
//!
//! A `JobDefinition` is an immutable graph of job elements (steps, flows,
//! splits and decisions). Elements reference each other by id through their
//! `next` attribute and their ordered transition elements. Definitions are
//! built once per run and shared read-only behind an `Arc`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::filter::ExceptionClassFilter;

/// String key/value property bag.
pub type Properties = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Top-level job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub properties: Properties,
    /// Job listeners, instantiated once per execution.
    #[serde(default)]
    pub listeners: Vec<RefArtifact>,
    /// Ordered job elements. The first step, flow or split is the head.
    pub elements: Vec<JobElement>,
    #[serde(default = "default_true")]
    pub restartable: bool,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: Properties::new(),
            listeners: Vec::new(),
            elements: Vec::new(),
            restartable: true,
        }
    }

    pub fn with_element(mut self, element: impl Into<JobElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_listener(mut self, listener: RefArtifact) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

fn default_true() -> bool {
    true
}

/// One node of the job graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobElement {
    Step(Step),
    Flow(Flow),
    Split(Split),
    Decision(Decision),
}

impl JobElement {
    pub fn id(&self) -> &str {
        match self {
            Self::Step(s) => &s.id,
            Self::Flow(f) => &f.id,
            Self::Split(s) => &s.id,
            Self::Decision(d) => &d.id,
        }
    }
}

impl From<Step> for JobElement {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

impl From<Flow> for JobElement {
    fn from(flow: Flow) -> Self {
        Self::Flow(flow)
    }
}

impl From<Split> for JobElement {
    fn from(split: Split) -> Self {
        Self::Split(split)
    }
}

impl From<Decision> for JobElement {
    fn from(decision: Decision) -> Self {
        Self::Decision(decision)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A control element matched against an exit status pattern.
///
/// Patterns support `*` (any run of characters) and `?` (any one character).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Continue with the element named `to`.
    Next { on: String, to: String },
    /// End the enclosing job as COMPLETED.
    End {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    /// End the enclosing job as FAILED.
    Fail {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
    },
    /// End the enclosing job as STOPPED, optionally recording where a restart
    /// should resume.
    Stop {
        on: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        restart: Option<String>,
    },
}

impl Transition {
    pub fn next(on: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Next {
            on: on.into(),
            to: to.into(),
        }
    }

    pub fn end(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self::End {
            on: on.into(),
            exit_status: exit_status.map(str::to_string),
        }
    }

    pub fn fail(on: impl Into<String>, exit_status: Option<&str>) -> Self {
        Self::Fail {
            on: on.into(),
            exit_status: exit_status.map(str::to_string),
        }
    }

    pub fn stop(on: impl Into<String>, exit_status: Option<&str>, restart: Option<&str>) -> Self {
        Self::Stop {
            on: on.into(),
            exit_status: exit_status.map(str::to_string),
            restart: restart.map(str::to_string),
        }
    }

    /// The exit status pattern this element reacts to.
    pub fn on(&self) -> &str {
        match self {
            Self::Next { on, .. }
            | Self::End { on, .. }
            | Self::Fail { on, .. }
            | Self::Stop { on, .. } => on,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Reference to an artifact by logical name plus its property bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefArtifact {
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
}

impl RefArtifact {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A unit of work: exactly one of `chunk` or `batchlet`, optionally
/// partitioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub listeners: Vec<RefArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Chunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batchlet: Option<RefArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<Partition>,
    /// Maximum number of times this step may be started within one job
    /// instance. 0 means unlimited.
    #[serde(default)]
    pub start_limit: u32,
    /// Re-run this step on restart even if it completed previously.
    #[serde(default)]
    pub allow_start_if_complete: bool,
}

impl Step {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            properties: Properties::new(),
            listeners: Vec::new(),
            chunk: None,
            batchlet: None,
            partition: None,
            start_limit: 0,
            allow_start_if_complete: false,
        }
    }

    pub fn with_chunk(mut self, chunk: Chunk) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_batchlet(mut self, batchlet: RefArtifact) -> Self {
        self.batchlet = Some(batchlet);
        self
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_listener(mut self, listener: RefArtifact) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_start_limit(mut self, start_limit: u32) -> Self {
        self.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }
}

/// How a chunk decides its commit boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Checkpoint after `item_count` items or when `time_limit_secs` elapses.
    #[default]
    Item,
    /// Checkpoint when the chunk's checkpoint algorithm says so.
    Custom,
}

/// Chunk-oriented processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub reader: RefArtifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<RefArtifact>,
    pub writer: RefArtifact,
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,
    #[serde(default = "default_item_count")]
    pub item_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_algorithm: Option<RefArtifact>,
    /// -1 means unlimited.
    #[serde(default = "default_limit")]
    pub skip_limit: i64,
    /// -1 means unlimited.
    #[serde(default = "default_limit")]
    pub retry_limit: i64,
    #[serde(default)]
    pub skippable: ExceptionClassFilter,
    #[serde(default)]
    pub retryable: ExceptionClassFilter,
    #[serde(default)]
    pub no_rollback: ExceptionClassFilter,
}

fn default_item_count() -> u32 {
    10
}

fn default_limit() -> i64 {
    -1
}

impl Chunk {
    pub fn new(reader: RefArtifact, writer: RefArtifact) -> Self {
        Self {
            reader,
            processor: None,
            writer,
            checkpoint_policy: CheckpointPolicy::Item,
            item_count: default_item_count(),
            time_limit_secs: None,
            checkpoint_algorithm: None,
            skip_limit: default_limit(),
            retry_limit: default_limit(),
            skippable: ExceptionClassFilter::default(),
            retryable: ExceptionClassFilter::default(),
            no_rollback: ExceptionClassFilter::default(),
        }
    }

    pub fn with_processor(mut self, processor: RefArtifact) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_item_count(mut self, item_count: u32) -> Self {
        self.item_count = item_count;
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    pub fn with_checkpoint_algorithm(mut self, algorithm: RefArtifact) -> Self {
        self.checkpoint_policy = CheckpointPolicy::Custom;
        self.checkpoint_algorithm = Some(algorithm);
        self
    }

    pub fn with_skip_limit(mut self, limit: i64) -> Self {
        self.skip_limit = limit;
        self
    }

    pub fn with_retry_limit(mut self, limit: i64) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_skippable(mut self, filter: ExceptionClassFilter) -> Self {
        self.skippable = filter;
        self
    }

    pub fn with_retryable(mut self, filter: ExceptionClassFilter) -> Self {
        self.retryable = filter;
        self
    }

    pub fn with_no_rollback(mut self, filter: ExceptionClassFilter) -> Self {
        self.no_rollback = filter;
        self
    }
}

/// Partitioning of a step: a static plan or a mapper artifact, plus optional
/// reducer, collector and analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Partition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PartitionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<RefArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<RefArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector: Option<RefArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<RefArtifact>,
}

impl Partition {
    pub fn with_plan(plan: PartitionPlan) -> Self {
        Self {
            plan: Some(plan),
            ..Self::default()
        }
    }

    pub fn with_mapper(mapper: RefArtifact) -> Self {
        Self {
            mapper: Some(mapper),
            ..Self::default()
        }
    }

    pub fn reducer(mut self, reducer: RefArtifact) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn collector(mut self, collector: RefArtifact) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn analyzer(mut self, analyzer: RefArtifact) -> Self {
        self.analyzer = Some(analyzer);
        self
    }
}

/// Number of partitions, concurrency bound and per-partition property
/// overlays. Also returned by partition mappers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partitions: u32,
    /// Defaults to `partitions` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    /// Overlay for partition `i` at index `i`.
    #[serde(default)]
    pub properties: Vec<Properties>,
    /// On restart, start a fresh set of partitions instead of re-running the
    /// ones that did not complete.
    #[serde(default)]
    pub partitions_override: bool,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            threads: None,
            properties: Vec::new(),
            partitions_override: false,
        }
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_properties(mut self, properties: Vec<Properties>) -> Self {
        self.properties = properties;
        self
    }

    pub fn effective_threads(&self) -> u32 {
        self.threads.unwrap_or(self.partitions).max(1)
    }
}

// ---------------------------------------------------------------------------
// Composites
// ---------------------------------------------------------------------------

/// A sequential sub-graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    pub elements: Vec<JobElement>,
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            transitions: Vec::new(),
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: impl Into<JobElement>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }
}

/// Flows executed concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub flows: Vec<Flow>,
    /// Overrides the engine-wide split timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Split {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next: None,
            flows: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn with_flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Routes on the exit status returned by a decider artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub decider: RefArtifact,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl Decision {
    pub fn new(id: impl Into<String>, decider: RefArtifact) -> Self {
        Self {
            id: id.into(),
            decider,
            transitions: Vec::new(),
        }
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
