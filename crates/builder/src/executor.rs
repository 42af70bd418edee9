//! The local build plan executor.
//!
//! Schedules build jobs (one per cache key; split artifacts of one source
//! share a job) onto a bounded worker pool, honouring dependency order.
//! Failure cascades cancellation to every transitive dependent; transient
//! cache errors re-enter the queue once; external cancellation drops ready
//! jobs and signals building ones through the token.

use crate::builder::{BuildOutcome, UnitBuilder};
use crate::error::BuildError;
use morph_core::CacheKey;
use morph_core::graph::BuildGraph;
use std::collections::{BTreeMap, BinaryHeap};
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal and in-flight states of a build job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Ready,
    Building,
    Done(BuildOutcome),
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done(_) | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

/// Final report: the state of every unit in the graph.
#[derive(Clone, Debug)]
pub struct ExecReport {
    /// Per unit index, the state of the job that owned it.
    pub unit_states: Vec<JobState>,
}

impl ExecReport {
    /// Whether every unit finished successfully.
    pub fn succeeded(&self) -> bool {
        self.unit_states
            .iter()
            .all(|state| matches!(state, JobState::Done(_)))
    }

    /// The first failure message, if any.
    pub fn first_failure(&self) -> Option<&str> {
        self.unit_states.iter().find_map(|state| match state {
            JobState::Failed(reason) => Some(reason.as_str()),
            _ => None,
        })
    }
}

struct Job {
    units: Vec<usize>,
    rep: usize,
    priority: u8,
    deps: Vec<CacheKey>,
    dependents: Vec<CacheKey>,
    pending_deps: usize,
    state: JobState,
    retried: bool,
}

/// Executes a build graph with at most `width` concurrent jobs.
pub struct PlanExecutor {
    width: usize,
}

impl PlanExecutor {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub async fn execute(
        &self,
        graph: Arc<BuildGraph>,
        builder: Arc<dyn UnitBuilder>,
        cancel: CancellationToken,
    ) -> ExecReport {
        let mut jobs: BTreeMap<CacheKey, Job> = BTreeMap::new();
        for (index, unit) in graph.units.iter().enumerate() {
            let job = jobs.entry(unit.cache_key).or_insert_with(|| Job {
                units: Vec::new(),
                rep: index,
                priority: unit.kind.priority(),
                deps: Vec::new(),
                dependents: Vec::new(),
                pending_deps: 0,
                state: JobState::Pending,
                retried: false,
            });
            job.units.push(index);
            for &dep in &unit.dependencies {
                let dep_key = graph.units[dep].cache_key;
                if dep_key != unit.cache_key && !job.deps.contains(&dep_key) {
                    job.deps.push(dep_key);
                }
            }
        }
        let keys: Vec<CacheKey> = jobs.keys().copied().collect();
        for key in &keys {
            let deps = jobs[key].deps.clone();
            for dep in deps {
                jobs.get_mut(&dep)
                    .expect("dependency job exists")
                    .dependents
                    .push(*key);
            }
        }

        // Deterministic ready order: kind priority, then cache key.
        let mut heap: BinaryHeap<Reverse<(u8, CacheKey)>> = BinaryHeap::new();
        for (key, job) in jobs.iter_mut() {
            job.pending_deps = job.deps.len();
            if job.pending_deps == 0 {
                job.state = JobState::Ready;
                heap.push(Reverse((job.priority, *key)));
            }
        }

        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(CacheKey, Result<BuildOutcome, BuildError>)>();
        let mut building = 0usize;

        loop {
            // Launch as many ready jobs as the width allows.
            while building < self.width {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(Reverse((_, key))) = heap.pop() else {
                    break;
                };
                let job = jobs.get_mut(&key).expect("job exists");
                if job.state != JobState::Ready {
                    continue;
                }
                job.state = JobState::Building;
                building += 1;
                let graph = graph.clone();
                let builder = builder.clone();
                let cancel = cancel.clone();
                let done_tx = done_tx.clone();
                let rep = job.rep;
                tokio::spawn(async move {
                    let result = builder.build(graph, rep, cancel).await;
                    let _ = done_tx.send((key, result));
                });
            }

            if cancel.is_cancelled() {
                // Drop everything not yet running.
                for job in jobs.values_mut() {
                    if matches!(job.state, JobState::Ready | JobState::Pending) {
                        job.state = JobState::Cancelled;
                    }
                }
                heap.clear();
            }

            if building == 0 {
                break;
            }

            let Some((key, result)) = done_rx.recv().await else {
                break;
            };
            building -= 1;

            match result {
                Ok(outcome) => {
                    let job = jobs.get_mut(&key).expect("job exists");
                    job.state = JobState::Done(outcome);
                    tracing::debug!(key = %key, outcome = ?outcome, "job done");
                    let dependents = job.dependents.clone();
                    for dependent in dependents {
                        let job = jobs.get_mut(&dependent).expect("job exists");
                        if job.state != JobState::Pending {
                            continue;
                        }
                        job.pending_deps -= 1;
                        if job.pending_deps == 0 && !cancel.is_cancelled() {
                            job.state = JobState::Ready;
                            heap.push(Reverse((job.priority, dependent)));
                        }
                    }
                }
                Err(BuildError::Cancelled) => {
                    let job = jobs.get_mut(&key).expect("job exists");
                    job.state = JobState::Cancelled;
                }
                Err(err) if err.is_transient() && !jobs[&key].retried => {
                    tracing::warn!(key = %key, error = %err, "transient failure, requeueing once");
                    let job = jobs.get_mut(&key).expect("job exists");
                    job.retried = true;
                    job.state = JobState::Ready;
                    heap.push(Reverse((job.priority, key)));
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "job failed");
                    let job = jobs.get_mut(&key).expect("job exists");
                    job.state = JobState::Failed(err.to_string());
                    // Everything downstream can never run.
                    let mut queue = vec![key];
                    while let Some(current) = queue.pop() {
                        let dependents = jobs[&current].dependents.clone();
                        for dependent in dependents {
                            let job = jobs.get_mut(&dependent).expect("job exists");
                            if matches!(job.state, JobState::Pending | JobState::Ready) {
                                job.state = JobState::Cancelled;
                                queue.push(dependent);
                            }
                        }
                    }
                }
            }
        }

        // Anything still pending when the loop ends was unreachable or
        // dropped by cancellation.
        for job in jobs.values_mut() {
            if !job.state.is_terminal() {
                job.state = JobState::Cancelled;
            }
        }

        let mut unit_states = vec![JobState::Cancelled; graph.units.len()];
        for job in jobs.values() {
            for &unit in &job.units {
                unit_states[unit] = job.state.clone();
            }
        }
        ExecReport { unit_states }
    }
}
