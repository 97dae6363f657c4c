//! Property reference substitution.
//!
//! Property values and artifact properties may embed references of the form
//! `#{category['name']}`, optionally followed by `?:default;`. Categories:
//!
//! - `jobParameters`: parameters the execution was started with
//! - `jobProperties`: properties of the enclosing elements, innermost first
//! - `partitionPlan`: the overlay of the running partition
//!
//! A reference that resolves to nothing takes its default, or the empty
//! string. Resolved values are themselves resolved, and a reference cycle
//! resolves to the empty string. `partitionPlan` references are left intact
//! until a partition overlay is supplied.

use batchflow_types::job::{
    Chunk, Decision, Flow, JobDefinition, JobElement, Partition, Properties, RefArtifact, Split,
    Step,
};

const JOB_PARAMETERS: &str = "jobParameters";
const JOB_PROPERTIES: &str = "jobProperties";
const PARTITION_PLAN: &str = "partitionPlan";

/// A parsed `#{category['name']}?:default;` reference.
#[derive(Debug, PartialEq, Eq)]
struct Reference<'a> {
    category: &'a str,
    name: &'a str,
    default: Option<&'a str>,
    /// Bytes consumed from the start of `#{`.
    len: usize,
}

fn parse_reference(input: &str) -> Option<Reference<'_>> {
    let body_end = input.find('}')?;
    let body = input.get(2..body_end)?;

    let open = body.find('[')?;
    let category = body[..open].trim();
    let inner = body[open + 1..].strip_suffix(']')?.trim();
    let name = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;

    if ![JOB_PARAMETERS, JOB_PROPERTIES, PARTITION_PLAN].contains(&category) {
        return None;
    }

    let mut len = body_end + 1;
    let mut default = None;
    if let Some(rest) = input[len..].strip_prefix("?:") {
        if let Some(semi) = rest.find(';') {
            default = Some(&rest[..semi]);
            len += 2 + semi + 1;
        }
    }

    Some(Reference {
        category,
        name,
        default,
        len,
    })
}

enum Lookup {
    Found(String),
    Missing,
    Deferred,
}

/// Resolves property references against job parameters, the stack of
/// enclosing element properties and an optional partition overlay.
#[derive(Debug, Clone, Default)]
pub struct PropertyResolver {
    job_parameters: Properties,
    scopes: Vec<Properties>,
    partition_plan: Option<Properties>,
}

impl PropertyResolver {
    pub fn new(job_parameters: Properties) -> Self {
        Self {
            job_parameters,
            scopes: Vec::new(),
            partition_plan: None,
        }
    }

    /// Resolve `partitionPlan` references from `overlay`.
    pub fn with_partition_plan(mut self, overlay: Properties) -> Self {
        self.partition_plan = Some(overlay);
        self
    }

    /// Push a scope of element properties for `jobProperties` lookups.
    pub fn push_scope(&mut self, properties: Properties) {
        self.scopes.push(properties);
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Substitute every reference in `raw`.
    pub fn resolve(&self, raw: &str) -> String {
        let mut visiting = Vec::new();
        self.resolve_inner(raw, &mut visiting)
    }

    fn resolve_inner(&self, raw: &str, visiting: &mut Vec<(String, String)>) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(start) = rest.find("#{") {
            out.push_str(&rest[..start]);
            let candidate = &rest[start..];
            let Some(reference) = parse_reference(candidate) else {
                out.push_str("#{");
                rest = &candidate[2..];
                continue;
            };

            match self.lookup(&reference, visiting) {
                Lookup::Found(value) => out.push_str(&value),
                Lookup::Deferred => out.push_str(&candidate[..reference.len]),
                Lookup::Missing => {
                    if let Some(default) = reference.default {
                        let value = self.resolve_inner(default, visiting);
                        out.push_str(&value);
                    }
                }
            }
            rest = &candidate[reference.len..];
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, reference: &Reference<'_>, visiting: &mut Vec<(String, String)>) -> Lookup {
        let raw = match reference.category {
            JOB_PARAMETERS => self.job_parameters.get(reference.name),
            JOB_PROPERTIES => self
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.get(reference.name)),
            _ => match &self.partition_plan {
                Some(plan) => plan.get(reference.name),
                None => return Lookup::Deferred,
            },
        };
        let Some(raw) = raw else {
            return Lookup::Missing;
        };

        let key = (reference.category.to_string(), reference.name.to_string());
        if visiting.contains(&key) {
            tracing::warn!(
                category = reference.category,
                name = reference.name,
                "property reference cycle"
            );
            return Lookup::Missing;
        }
        visiting.push(key);
        let value = self.resolve_inner(raw, visiting);
        visiting.pop();

        // A value that is only a cyclic reference collapses to empty.
        if value.is_empty() && !raw.is_empty() {
            return Lookup::Missing;
        }
        Lookup::Found(value)
    }

    pub fn resolve_properties(&self, properties: &Properties) -> Properties {
        properties
            .iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }

    fn resolve_ref(&self, artifact: &RefArtifact) -> RefArtifact {
        RefArtifact {
            name: artifact.name.clone(),
            properties: self.resolve_properties(&artifact.properties),
        }
    }

    fn resolve_refs(&self, artifacts: &[RefArtifact]) -> Vec<RefArtifact> {
        artifacts.iter().map(|a| self.resolve_ref(a)).collect()
    }

    /// A copy of `job` with every property reference substituted.
    pub fn resolve_job(&mut self, job: &JobDefinition) -> JobDefinition {
        self.push_scope(job.properties.clone());
        let resolved = JobDefinition {
            id: job.id.clone(),
            properties: self.resolve_properties(&job.properties),
            listeners: self.resolve_refs(&job.listeners),
            elements: self.resolve_elements(&job.elements),
            restartable: job.restartable,
        };
        self.pop_scope();
        resolved
    }

    fn resolve_elements(&mut self, elements: &[JobElement]) -> Vec<JobElement> {
        elements
            .iter()
            .map(|element| match element {
                JobElement::Step(step) => JobElement::Step(self.resolve_step(step)),
                JobElement::Flow(flow) => JobElement::Flow(self.resolve_flow(flow)),
                JobElement::Split(split) => JobElement::Split(Split {
                    flows: split.flows.iter().map(|f| self.resolve_flow(f)).collect(),
                    ..split.clone()
                }),
                JobElement::Decision(decision) => JobElement::Decision(Decision {
                    decider: self.resolve_ref(&decision.decider),
                    ..decision.clone()
                }),
            })
            .collect()
    }

    fn resolve_flow(&mut self, flow: &Flow) -> Flow {
        Flow {
            elements: self.resolve_elements(&flow.elements),
            ..flow.clone()
        }
    }

    /// A copy of `step` with its properties and artifact properties
    /// substituted.
    pub fn resolve_step(&mut self, step: &Step) -> Step {
        self.push_scope(step.properties.clone());
        let resolved = Step {
            properties: self.resolve_properties(&step.properties),
            listeners: self.resolve_refs(&step.listeners),
            chunk: step.chunk.as_ref().map(|c| self.resolve_chunk(c)),
            batchlet: step.batchlet.as_ref().map(|b| self.resolve_ref(b)),
            partition: step.partition.as_ref().map(|p| self.resolve_partition(p)),
            ..step.clone()
        };
        self.pop_scope();
        resolved
    }

    fn resolve_chunk(&self, chunk: &Chunk) -> Chunk {
        Chunk {
            reader: self.resolve_ref(&chunk.reader),
            processor: chunk.processor.as_ref().map(|p| self.resolve_ref(p)),
            writer: self.resolve_ref(&chunk.writer),
            checkpoint_algorithm: chunk
                .checkpoint_algorithm
                .as_ref()
                .map(|a| self.resolve_ref(a)),
            ..chunk.clone()
        }
    }

    fn resolve_partition(&self, partition: &Partition) -> Partition {
        let plan = partition.plan.as_ref().map(|plan| {
            let mut plan = plan.clone();
            plan.properties = plan
                .properties
                .iter()
                .map(|overlay| self.resolve_properties(overlay))
                .collect();
            plan
        });
        Partition {
            plan,
            mapper: partition.mapper.as_ref().map(|a| self.resolve_ref(a)),
            reducer: partition.reducer.as_ref().map(|a| self.resolve_ref(a)),
            collector: partition.collector.as_ref().map(|a| self.resolve_ref(a)),
            analyzer: partition.analyzer.as_ref().map(|a| self.resolve_ref(a)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
