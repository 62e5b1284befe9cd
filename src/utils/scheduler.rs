// Dependency-aware scheduler: admits ready nodes up to a concurrency budget,
// records every state transition, and skips the dependents of failed nodes.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::config::defs::PipelineError;
use crate::utils::graph::{NodeId, NodeStatus, StageJob, StageNode};

pub type StageResult = Result<Vec<PathBuf>, PipelineError>;

/// Runs a single node. Implementations own all tool-specific behaviour; the
/// scheduler only sees success with the produced paths, or an error.
pub trait StageExecutor: Send + Sync + 'static {
    fn execute(&self, job: StageJob) -> impl Future<Output = StageResult> + Send;
}


#[derive(Serialize)]
struct NodeEvent<'a> {
    timestamp: String,
    node: NodeId,
    unit: String,
    stage: String,
    status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostic: Option<&'a str>,
}

/// Appends one JSON line per node transition.
pub struct Monitor {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Monitor {
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| PipelineError::IOError(format!("Cannot open {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn record(&mut self, node: &StageNode, status: NodeStatus, diagnostic: Option<&str>) {
        let event = NodeEvent {
            timestamp: Local::now().to_rfc3339(),
            node: node.id,
            unit: node.unit.label(),
            stage: node.stage.to_string(),
            status,
            diagnostic,
        };
        let written = serde_json::to_writer(&mut self.writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            // monitoring never fails the run
            warn!("Failed to write monitoring record to {}: {}", self.path.display(), e);
        }
    }
}


pub struct Scheduler<E> {
    executor: Arc<E>,
    budget: usize,
    nodes: Vec<StageNode>,
    monitor: Option<Monitor>,
}

/// Mutable run state. Only the scheduler loop touches it.
struct RunState {
    status: Vec<NodeStatus>,
    diagnostic: Vec<Option<String>>,
    waiting_on: Vec<usize>,
    dependents: Vec<Vec<NodeId>>,
    ready: VecDeque<NodeId>,
}

impl<E: StageExecutor> Scheduler<E> {
    /// # Arguments
    ///
    /// * `executor` - Runs admitted nodes.
    /// * `budget` - Maximum number of nodes running at once; at least 1.
    pub fn new(executor: Arc<E>, budget: usize) -> Self {
        Self {
            executor,
            budget: budget.max(1),
            nodes: Vec::new(),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a batch of nodes. Ids must continue the existing numbering and
    /// every producer must already be known, which keeps the graph acyclic.
    /// The batch is rejected as a whole on the first violation.
    pub fn submit(&mut self, nodes: Vec<StageNode>) -> Result<(), PipelineError> {
        let base = self.nodes.len();
        for (offset, node) in nodes.iter().enumerate() {
            let expected = base + offset;
            if node.id != expected {
                return Err(PipelineError::InvalidGraph(format!(
                    "node {} ({} for {}) submitted at position {}",
                    node.id,
                    node.stage,
                    node.unit.label(),
                    expected
                )));
            }
            if node.status != NodeStatus::Pending {
                return Err(PipelineError::InvalidGraph(format!(
                    "node {} submitted as {:?}",
                    node.id, node.status
                )));
            }
            if let Some(p) = node.producers().into_iter().find(|&p| p >= node.id) {
                return Err(PipelineError::InvalidGraph(format!(
                    "node {} depends on node {}, which does not precede it",
                    node.id, p
                )));
            }
        }
        self.nodes.extend(nodes);
        Ok(())
    }

    /// Runs the graph to quiescence.
    ///
    /// # Returns
    /// Every submitted node, each in a terminal status.
    pub async fn wait(mut self) -> Vec<StageNode> {
        let mut state = self.prepare();
        let mut workers: JoinSet<(NodeId, StageResult)> = JoinSet::new();

        info!(
            "Scheduling {} nodes ({} ready) with budget {}",
            self.nodes.len(),
            state.ready.len(),
            self.budget
        );

        loop {
            while workers.len() < self.budget {
                let Some(id) = state.ready.pop_front() else {
                    break;
                };
                if state.status[id] != NodeStatus::Pending {
                    continue;
                }
                self.admit(id, &mut state, &mut workers);
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok((id, Ok(outputs))) => {
                    debug!("Node {} produced {} file(s)", id, outputs.len());
                    self.complete(id, &mut state);
                }
                Ok((id, Err(e))) => self.fail(id, e.to_string(), &mut state),
                Err(e) => error!("Worker wrapper lost: {}", e),
            }
        }

        // Anything not terminal here lost its worker; count it as failed.
        for id in 0..self.nodes.len() {
            if !state.status[id].is_terminal() {
                self.fail(id, "worker terminated without reporting".to_string(), &mut state);
            }
        }

        for (node, (status, diagnostic)) in self
            .nodes
            .iter_mut()
            .zip(state.status.into_iter().zip(state.diagnostic))
        {
            node.status = status;
            node.diagnostic = diagnostic;
        }
        self.nodes
    }

    fn prepare(&self) -> RunState {
        let n = self.nodes.len();
        let mut waiting_on = vec![0; n];
        let mut dependents: Vec<Vec<NodeId>> = vec![Vec::new(); n];
        for node in &self.nodes {
            let producers = node.producers();
            waiting_on[node.id] = producers.len();
            for p in producers {
                dependents[p].push(node.id);
            }
        }
        let ready = (0..n).filter(|&id| waiting_on[id] == 0).collect();
        RunState {
            status: vec![NodeStatus::Pending; n],
            diagnostic: vec![None; n],
            waiting_on,
            dependents,
            ready,
        }
    }

    fn transition(&mut self, id: NodeId, status: NodeStatus, diagnostic: Option<String>, state: &mut RunState) {
        state.status[id] = status;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record(&self.nodes[id], status, diagnostic.as_deref());
        }
        state.diagnostic[id] = diagnostic;
    }

    fn admit(&mut self, id: NodeId, state: &mut RunState, workers: &mut JoinSet<(NodeId, StageResult)>) {
        let node = &self.nodes[id];
        let inputs: Result<Vec<PathBuf>, PipelineError> =
            node.inputs.iter().map(|h| h.resolve(&state.status)).collect();
        let inputs = match inputs {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail(id, e.to_string(), state);
                return;
            }
        };

        let job = StageJob {
            id,
            stage: node.stage,
            unit: Arc::clone(&node.unit),
            layout: Arc::clone(&node.layout),
            inputs,
            outputs: node.outputs.clone(),
        };
        let tool = node.stage.tool().to_string();
        let unit = node.unit.label();
        debug!("Starting {} for {}", node.stage, unit);
        self.transition(id, NodeStatus::Running, None, state);

        let executor = Arc::clone(&self.executor);
        let handle = tokio::spawn(async move { executor.execute(job).await });
        workers.spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::StageExecution {
                    tool,
                    unit,
                    error: format!("worker panicked: {}", e),
                }),
            };
            (id, result)
        });
    }

    fn complete(&mut self, id: NodeId, state: &mut RunState) {
        debug!("{} for {} succeeded", self.nodes[id].stage, self.nodes[id].unit.label());
        self.transition(id, NodeStatus::Succeeded, None, state);
        for i in 0..state.dependents[id].len() {
            let d = state.dependents[id][i];
            state.waiting_on[d] -= 1;
            if state.waiting_on[d] == 0 && state.status[d] == NodeStatus::Pending {
                state.ready.push_back(d);
            }
        }
    }

    /// Marks `id` failed and every transitive dependent still pending as
    /// skipped. Independent nodes are not touched.
    fn fail(&mut self, id: NodeId, diagnostic: String, state: &mut RunState) {
        let origin = format!("{} for {}", self.nodes[id].stage, self.nodes[id].unit.label());
        error!("{} failed: {}", origin, diagnostic);
        self.transition(id, NodeStatus::Failed, Some(diagnostic), state);

        let mut queue: VecDeque<NodeId> = state.dependents[id].iter().copied().collect();
        while let Some(d) = queue.pop_front() {
            if state.status[d] != NodeStatus::Pending {
                continue;
            }
            let reason = PipelineError::DependencyFailure(format!("{} failed", origin)).to_string();
            warn!("Skipping {} for {}: {}", self.nodes[d].stage, self.nodes[d].unit.label(), reason);
            self.transition(d, NodeStatus::Skipped, Some(reason), state);
            queue.extend(state.dependents[d].iter().copied());
        }
    }
}
