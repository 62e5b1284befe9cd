// Task graph primitives: stages, file handles and nodes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::defs::{FORMAT_PHYLIP_TAG, MAFFT_TAG, ModelFamily, ModelVariant, PipelineError, RAXML_TAG};
use crate::utils::paths::{InputUnit, UnitLayout};

/// Index of a node in the scheduler's table.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// The four stage kinds of a spine, with the model for the fan-out layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Align,
    Reformat,
    InferTree,
    FinalModel(ModelVariant),
}

impl Stage {
    /// Tool tag, also used in log file names.
    pub fn tool(&self) -> &'static str {
        match self {
            Stage::Align => MAFFT_TAG,
            Stage::Reformat => FORMAT_PHYLIP_TAG,
            Stage::InferTree => RAXML_TAG,
            Stage::FinalModel(model) => model.family().tool_tag(),
        }
    }

    /// Number of declared inputs a node of this kind takes:
    /// align `[raw]`, reformat `[alignment]`, infer-tree
    /// `[alignment, formatted]`, codeml `[formatted, tree]`,
    /// hyphy `[formatted, tree, alignment]`.
    pub fn input_arity(&self) -> usize {
        match self {
            Stage::Align | Stage::Reformat => 1,
            Stage::InferTree => 2,
            Stage::FinalModel(model) => match model.family() {
                ModelFamily::Codeml => 2,
                ModelFamily::Hyphy => 3,
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Align => f.write_str("align"),
            Stage::Reformat => f.write_str("reformat"),
            Stage::InferTree => f.write_str("infer_tree"),
            Stage::FinalModel(model) => write!(f, "{}:{}", model.family().tool_tag(), model),
        }
    }
}

/// A path a stage reads. `Raw` exists before the run; `Promised` is the
/// declared output of another node and may not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHandle {
    Raw(PathBuf),
    Promised { producer: NodeId, path: PathBuf },
}

impl FileHandle {
    pub fn producer(&self) -> Option<NodeId> {
        match self {
            FileHandle::Raw(_) => None,
            FileHandle::Promised { producer, .. } => Some(*producer),
        }
    }

    /// Path formula, whether or not the file exists yet.
    pub fn path(&self) -> &Path {
        match self {
            FileHandle::Raw(path) | FileHandle::Promised { path, .. } => path,
        }
    }

    /// Concrete path, only once the producer has succeeded.
    pub fn resolve(&self, status: &[NodeStatus]) -> Result<PathBuf, PipelineError> {
        match self {
            FileHandle::Raw(path) => Ok(path.clone()),
            FileHandle::Promised { producer, path } => match status.get(*producer) {
                Some(NodeStatus::Succeeded) => Ok(path.clone()),
                Some(other) => Err(PipelineError::DependencyFailure(format!(
                    "{} is not available: producer node {} is {:?}",
                    path.display(),
                    producer,
                    other
                ))),
                None => Err(PipelineError::InvalidGraph(format!(
                    "{} refers to unknown node {}",
                    path.display(),
                    producer
                ))),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageNode {
    pub id: NodeId,
    pub stage: Stage,
    pub unit: Arc<InputUnit>,
    pub layout: Arc<UnitLayout>,
    pub inputs: Vec<FileHandle>,
    pub outputs: Vec<PathBuf>,
    pub status: NodeStatus,
    pub diagnostic: Option<String>,
}

impl StageNode {
    pub fn new(
        id: NodeId,
        stage: Stage,
        unit: Arc<InputUnit>,
        layout: Arc<UnitLayout>,
        inputs: Vec<FileHandle>,
        outputs: Vec<PathBuf>,
    ) -> Result<Self, PipelineError> {
        if inputs.len() != stage.input_arity() {
            return Err(PipelineError::InvalidGraph(format!(
                "{} for {} takes {} inputs, got {}",
                stage,
                unit.label(),
                stage.input_arity(),
                inputs.len()
            )));
        }
        if outputs.is_empty() {
            return Err(PipelineError::InvalidGraph(format!(
                "{} for {} declares no outputs",
                stage,
                unit.label()
            )));
        }
        if let Some(h) = inputs.iter().find(|h| h.producer().is_some_and(|p| p >= id)) {
            return Err(PipelineError::InvalidGraph(format!(
                "{} for {} consumes {} from a node that does not precede it",
                stage,
                unit.label(),
                h.path().display()
            )));
        }
        Ok(Self {
            id,
            stage,
            unit,
            layout,
            inputs,
            outputs,
            status: NodeStatus::Pending,
            diagnostic: None,
        })
    }

    /// Handle on one of this node's declared outputs.
    pub fn output(&self, index: usize) -> Option<FileHandle> {
        self.outputs.get(index).map(|path| FileHandle::Promised {
            producer: self.id,
            path: path.clone(),
        })
    }

    /// Distinct upstream nodes, ascending.
    pub fn producers(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inputs.iter().filter_map(FileHandle::producer).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// What a worker gets: the node's identity with every input resolved.
#[derive(Debug, Clone)]
pub struct StageJob {
    pub id: NodeId,
    pub stage: Stage,
    pub unit: Arc<InputUnit>,
    pub layout: Arc<UnitLayout>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}
