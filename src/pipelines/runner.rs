// Stage execution: one external tool (or in-process transform) per node.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, info, warn};
use rand::Rng;
use tokio::fs;

use crate::config::defs::{
    FORMAT_PHYLIP_TAG, MAFFT_TAG, ModelFamily, ModelVariant, PipelineError, RAXML_SEED_RANGE, RAXML_TAG,
    RunConfig,
};
use crate::utils::command::codeml::{self, CodemlConfig};
use crate::utils::command::hyphy::{self, HyphyConfig};
use crate::utils::command::mafft::MafftConfig;
use crate::utils::command::raxml::RaxmlConfig;
use crate::utils::command::{ArgGenerator, StdoutTarget, ToolIo, run_tool};
use crate::utils::file::{missing_outputs, remove_if_exists};
use crate::utils::graph::{Stage, StageJob};
use crate::utils::phylip::format_phylip;
use crate::utils::scheduler::{StageExecutor, StageResult};
use crate::utils::template::render_control_file;

/// Runs stage jobs against the tools and settings of one run.
pub struct ToolRunner {
    config: Arc<RunConfig>,
}

impl ToolRunner {
    pub fn new(config: Arc<RunConfig>) -> Self {
        Self { config }
    }

    fn stage_error(job: &StageJob, error: impl Display) -> PipelineError {
        PipelineError::StageExecution {
            tool: job.stage.tool().to_string(),
            unit: job.unit.label(),
            error: error.to_string(),
        }
    }

    fn schema_error(job: &StageJob) -> PipelineError {
        PipelineError::InvalidGraph(format!(
            "{} for {} received {} inputs and {} outputs",
            job.stage,
            job.unit.label(),
            job.inputs.len(),
            job.outputs.len()
        ))
    }

    async fn align(&self, job: &StageJob) -> Result<(), PipelineError> {
        let ([raw], [alignment]) = (job.inputs.as_slice(), job.outputs.as_slice()) else {
            return Err(Self::schema_error(job));
        };
        let program = self.config.executables.get(MAFFT_TAG)?;
        let threads = self.config.align_threads;
        let (_, stderr) = job.layout.logs(&job.layout.stem, MAFFT_TAG);
        let mafft_config = MafftConfig {
            threads,
            input: raw.clone(),
        };
        let io = ToolIo {
            stdin: None,
            stdout: StdoutTarget::Capture(alignment.clone()),
            stderr,
            cwd: None,
        };
        run_tool(&self.config.launcher, program, &mafft_config, threads, io)
            .await
            .map_err(|e| Self::stage_error(job, e))
    }

    async fn reformat(&self, job: &StageJob) -> Result<(), PipelineError> {
        let ([alignment], [formatted]) = (job.inputs.as_slice(), job.outputs.as_slice()) else {
            return Err(Self::schema_error(job));
        };
        let (input, output) = (alignment.clone(), formatted.clone());
        tokio::task::spawn_blocking(move || format_phylip(&input, &output))
            .await
            .map_err(|e| Self::stage_error(job, anyhow!("{} task failed: {}", FORMAT_PHYLIP_TAG, e)))?
            .map_err(|e| Self::stage_error(job, e))
    }

    async fn infer_tree(&self, job: &StageJob) -> Result<(), PipelineError> {
        let [alignment, _formatted] = job.inputs.as_slice() else {
            return Err(Self::schema_error(job));
        };
        let program = self.config.executables.get(RAXML_TAG)?;
        let layout = &job.layout;

        // RAxML refuses to start when its info file from an earlier attempt exists
        let info_file = layout.raxml_info();
        if remove_if_exists(&info_file).map_err(|e| Self::stage_error(job, e))? {
            warn!("Removed stale {}", info_file.display());
        }

        let seed = {
            let mut rng = self
                .config
                .rng
                .lock()
                .map_err(|_| Self::stage_error(job, "run RNG is poisoned"))?;
            rng.random_range(RAXML_SEED_RANGE)
        };
        debug!("RAxML parsimony seed for {}: {}", job.unit.label(), seed);

        let raxml_config = RaxmlConfig {
            alignment: alignment.clone(),
            run_name: layout.raxml_run_name(),
            workdir: layout.dir.clone(),
            seed,
        };
        let (stdout, stderr) = layout.logs(&layout.stem, RAXML_TAG);
        let io = ToolIo {
            stdin: None,
            stdout: StdoutTarget::Log(stdout),
            stderr,
            cwd: None,
        };
        run_tool(&self.config.launcher, program, &raxml_config, 1, io)
            .await
            .map_err(|e| Self::stage_error(job, e))
    }

    async fn final_model(&self, job: &StageJob, model: ModelVariant) -> Result<(), PipelineError> {
        let [result] = job.outputs.as_slice() else {
            return Err(Self::schema_error(job));
        };
        let family = model.family();
        let substitutions = match (family, job.inputs.as_slice()) {
            (ModelFamily::Codeml, [formatted, tree]) => codeml::substitutions(formatted, tree, result),
            (ModelFamily::Hyphy, [_formatted, tree, alignment]) => hyphy::substitutions(alignment, tree, result),
            _ => return Err(Self::schema_error(job)),
        };
        let tool_config: &dyn ArgGenerator = match family {
            ModelFamily::Codeml => &CodemlConfig,
            ModelFamily::Hyphy => &HyphyConfig,
        };

        let program = self.config.executables.get(family.tool_tag())?;
        let layout = &job.layout;
        let model_dir = layout.model_dir(model);
        fs::create_dir_all(&model_dir).await.map_err(|e| PipelineError::PathResolution {
            path: model_dir.clone(),
            reason: e.to_string(),
        })?;

        let template = self.config.templates_dir.join(model.name()).join(family.control_file());
        let control = layout.control_file(model);
        render_control_file(&template, &control, &substitutions)?;

        let (stdout, stderr) = layout.logs(&format!("{}_{}", layout.stem, model), family.tool_tag());
        let io = ToolIo {
            // hyphy reads its answers from stdin
            stdin: (family == ModelFamily::Hyphy).then(|| control.clone()),
            stdout: StdoutTarget::Log(stdout),
            stderr,
            cwd: Some(model_dir),
        };
        run_tool(&self.config.launcher, program, tool_config, 1, io)
            .await
            .map_err(|e| Self::stage_error(job, e))
    }
}

impl StageExecutor for ToolRunner {
    async fn execute(&self, job: StageJob) -> StageResult {
        let label = job.unit.label();
        if self.config.resume && missing_outputs(&job.outputs).is_empty() {
            info!("{} for {} already complete, not rerunning", job.stage, label);
            return Ok(job.outputs);
        }

        // a tool that exits 0 without writing must not pass on an earlier run's file
        for output in &job.outputs {
            if remove_if_exists(output).map_err(|e| Self::stage_error(&job, e))? {
                debug!("Removed previous {}", output.display());
            }
        }

        info!("Running {} for {}", job.stage, label);
        let started = Instant::now();
        match job.stage {
            Stage::Align => self.align(&job).await?,
            Stage::Reformat => self.reformat(&job).await?,
            Stage::InferTree => self.infer_tree(&job).await?,
            Stage::FinalModel(model) => self.final_model(&job, model).await?,
        }

        let missing: Vec<PathBuf> = missing_outputs(&job.outputs).into_iter().cloned().collect();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            return Err(Self::stage_error(
                &job,
                format!("exited 0 but left missing or empty output: {}", names.join(", ")),
            ));
        }

        info!(
            "{} for {} finished in {:.1}s",
            job.stage,
            label,
            started.elapsed().as_secs_f64()
        );
        Ok(job.outputs)
    }
}
