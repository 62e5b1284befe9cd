// Per-unit task graph construction. Allocates and wires nodes, runs nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::config::defs::{MAFFT_TAG, ModelFamily, ModelVariant, PipelineError, RAXML_TAG};
use crate::config::executables::Executables;
use crate::utils::graph::{FileHandle, NodeId, Stage, StageNode};
use crate::utils::paths::{InputUnit, UnitLayout};

pub struct GraphBuilder {
    models: Vec<ModelVariant>,
    output_root: PathBuf,
    next_id: NodeId,
}

impl GraphBuilder {
    /// # Arguments
    ///
    /// * `executables` - Registry every tool of the graph must be present in.
    /// * `models` - Final-stage variants, all from one family. Duplicates
    ///   are dropped, first occurrence wins.
    /// * `output_root` - Root the unit layouts are derived from.
    pub fn new(
        executables: &Executables,
        models: &[ModelVariant],
        output_root: &Path,
    ) -> Result<Self, PipelineError> {
        let Some(first) = models.first() else {
            return Err(PipelineError::InvalidConfig("no model variants selected".to_string()));
        };
        let family = first.family();
        let mut unique: Vec<ModelVariant> = Vec::with_capacity(models.len());
        for model in models {
            if model.family() != family {
                return Err(PipelineError::InvalidConfig(format!(
                    "model {} is not a {} model",
                    model,
                    family.tool_tag()
                )));
            }
            if !unique.contains(model) {
                unique.push(*model);
            }
        }

        for tool in [MAFFT_TAG, RAXML_TAG, family.tool_tag()] {
            if !executables.contains(tool) {
                return Err(PipelineError::Executable {
                    tool: tool.to_string(),
                    reason: "missing from the executables registry".to_string(),
                });
            }
        }

        Ok(Self {
            models: unique,
            output_root: output_root.to_path_buf(),
            next_id: 0,
        })
    }

    pub fn models(&self) -> &[ModelVariant] {
        &self.models
    }

    /// Nodes allocated so far across all units.
    pub fn node_count(&self) -> usize {
        self.next_id
    }

    fn node(
        &mut self,
        stage: Stage,
        unit: &Arc<InputUnit>,
        layout: &Arc<UnitLayout>,
        inputs: Vec<FileHandle>,
        output: PathBuf,
    ) -> Result<StageNode, PipelineError> {
        let node = StageNode::new(
            self.next_id,
            stage,
            Arc::clone(unit),
            Arc::clone(layout),
            inputs,
            vec![output],
        )?;
        self.next_id += 1;
        Ok(node)
    }

    /// Builds the spine align -> reformat -> infer-tree for `unit`, then one
    /// final node per model. Final nodes depend on the spine only.
    ///
    /// # Returns
    /// Nodes in id order, ready for `Scheduler::submit`.
    pub fn build(&mut self, unit: &InputUnit) -> Result<Vec<StageNode>, PipelineError> {
        let unit = Arc::new(unit.clone());
        let layout = Arc::new(UnitLayout::new(&unit, &self.output_root));
        let mut nodes = Vec::with_capacity(3 + self.models.len());

        let align = self.node(
            Stage::Align,
            &unit,
            &layout,
            vec![FileHandle::Raw(unit.source.clone())],
            layout.alignment(),
        )?;
        let alignment = promised(&align)?;

        let reformat = self.node(Stage::Reformat, &unit, &layout, vec![alignment.clone()], layout.formatted())?;
        let formatted = promised(&reformat)?;

        let infer = self.node(
            Stage::InferTree,
            &unit,
            &layout,
            vec![alignment.clone(), formatted.clone()],
            layout.tree(),
        )?;
        let tree = promised(&infer)?;

        nodes.extend([align, reformat, infer]);

        let models = self.models.clone();
        for model in models {
            let mut inputs = vec![formatted.clone(), tree.clone()];
            if model.family() == ModelFamily::Hyphy {
                inputs.push(alignment.clone());
            }
            let result = layout.model_result(model);
            nodes.push(self.node(Stage::FinalModel(model), &unit, &layout, inputs, result)?);
        }

        debug!("Built {} nodes for {}", nodes.len(), unit.label());
        Ok(nodes)
    }
}

fn promised(node: &StageNode) -> Result<FileHandle, PipelineError> {
    node.output(0).ok_or_else(|| {
        PipelineError::InvalidGraph(format!("{} for {} has no output", node.stage, node.unit.label()))
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn registry(family_tool: &str) -> Executables {
        Executables::from_paths([
            (MAFFT_TAG, PathBuf::from("/opt/bin/mafft")),
            (RAXML_TAG, PathBuf::from("/opt/bin/raxml")),
            (family_tool, PathBuf::from(format!("/opt/bin/{}", family_tool))),
        ])
    }

    fn shape(nodes: &[StageNode]) -> Vec<(NodeId, Stage, Vec<FileHandle>, Vec<PathBuf>)> {
        nodes
            .iter()
            .map(|n| (n.id, n.stage, n.inputs.clone(), n.outputs.clone()))
            .collect()
    }

    #[test]
    fn test_spine_and_fan_out() {
        let root = Path::new("/in");
        let unit = InputUnit::new(&root.join("A.fasta"), root).unwrap();
        let mut builder =
            GraphBuilder::new(&registry("codeml"), &[ModelVariant::M0, ModelVariant::M8], Path::new("/out")).unwrap();
        let nodes = builder.build(&unit).unwrap();

        let stages: Vec<Stage> = nodes.iter().map(|n| n.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Align,
                Stage::Reformat,
                Stage::InferTree,
                Stage::FinalModel(ModelVariant::M0),
                Stage::FinalModel(ModelVariant::M8),
            ]
        );
        assert_eq!(nodes[1].producers(), vec![0]);
        assert_eq!(nodes[2].producers(), vec![0, 1]);
        // final nodes hang off reformat and infer-tree, never off each other
        assert_eq!(nodes[3].producers(), vec![1, 2]);
        assert_eq!(nodes[4].producers(), vec![1, 2]);
        assert_eq!(nodes[4].outputs, vec![PathBuf::from("/out/A/M8/M8_A.results.txt")]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let root = Path::new("/in");
        let unit = InputUnit::new(&root.join("sub/B.fasta"), root).unwrap();
        let models = [ModelVariant::Fel, ModelVariant::Meme];

        let mut first = GraphBuilder::new(&registry("hyphy"), &models, Path::new("/out")).unwrap();
        let mut second = GraphBuilder::new(&registry("hyphy"), &models, Path::new("/out")).unwrap();
        let a = first.build(&unit).unwrap();
        let b = second.build(&unit).unwrap();
        assert_eq!(shape(&a), shape(&b));
        // hyphy also reads the raw alignment
        assert_eq!(a[3].inputs.len(), 3);
        assert_eq!(a[3].producers(), vec![0, 1, 2]);
    }

    #[test]
    fn test_ids_continue_across_units() {
        let root = Path::new("/in");
        let a = InputUnit::new(&root.join("A.fasta"), root).unwrap();
        let b = InputUnit::new(&root.join("B.fasta"), root).unwrap();
        let mut builder = GraphBuilder::new(&registry("codeml"), &[ModelVariant::M1], Path::new("/out")).unwrap();
        builder.build(&a).unwrap();
        let nodes = builder.build(&b).unwrap();
        assert_eq!(nodes.first().map(|n| n.id), Some(4));
        assert_eq!(nodes[1].producers(), vec![4]);
        assert_eq!(builder.node_count(), 8);
    }

    #[test]
    fn test_rejects_mixed_families_and_missing_tools() {
        let mixed = GraphBuilder::new(
            &registry("codeml"),
            &[ModelVariant::M0, ModelVariant::Fel],
            Path::new("/out"),
        );
        assert!(matches!(mixed, Err(PipelineError::InvalidConfig(_))));

        let missing = GraphBuilder::new(&registry("codeml"), &[ModelVariant::Slac], Path::new("/out"));
        assert!(matches!(missing, Err(PipelineError::Executable { .. })));

        let none = GraphBuilder::new(&registry("codeml"), &[], Path::new("/out"));
        assert!(none.is_err());
    }

    #[test]
    fn test_duplicate_models_are_dropped() {
        let builder = GraphBuilder::new(
            &registry("codeml"),
            &[ModelVariant::M2, ModelVariant::M0, ModelVariant::M2],
            Path::new("/out"),
        )
        .unwrap();
        assert_eq!(builder.models(), &[ModelVariant::M2, ModelVariant::M0]);
    }
}
