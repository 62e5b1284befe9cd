use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use serde::Serialize;

use crate::config::defs::{MONITORING_FILE, PipelineError, RunConfig};
use crate::pipelines::builder::GraphBuilder;
use crate::pipelines::runner::ToolRunner;
use crate::utils::graph::{NodeStatus, StageNode};
use crate::utils::paths::{check_collisions, discover, resolve};
use crate::utils::scheduler::{Monitor, Scheduler};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StageCounts {
    fn add(&mut self, status: NodeStatus) {
        match status {
            NodeStatus::Succeeded => self.succeeded += 1,
            NodeStatus::Failed => self.failed += 1,
            NodeStatus::Skipped => self.skipped += 1,
            // wait() only hands back terminal nodes
            NodeStatus::Pending | NodeStatus::Running => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Terminal node set of a run with per-stage and per-unit tallies.
#[derive(Debug)]
pub struct RunSummary {
    pub nodes: Vec<StageNode>,
    pub by_stage: BTreeMap<String, StageCounts>,
    pub by_unit: BTreeMap<String, StageCounts>,
}

impl RunSummary {
    pub fn from_nodes(nodes: Vec<StageNode>) -> Self {
        let mut by_stage: BTreeMap<String, StageCounts> = BTreeMap::new();
        let mut by_unit: BTreeMap<String, StageCounts> = BTreeMap::new();
        for node in &nodes {
            by_stage.entry(node.stage.to_string()).or_default().add(node.status);
            by_unit.entry(node.unit.label()).or_default().add(node.status);
        }
        Self {
            nodes,
            by_stage,
            by_unit,
        }
    }

    pub fn totals(&self) -> StageCounts {
        let mut totals = StageCounts::default();
        for node in &self.nodes {
            totals.add(node.status);
        }
        totals
    }

    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.status == NodeStatus::Succeeded)
    }

    pub fn report(&self) {
        for (stage, counts) in &self.by_stage {
            info!(
                "{:<14} succeeded {:>5}  failed {:>5}  skipped {:>5}",
                stage, counts.succeeded, counts.failed, counts.skipped
            );
        }
        for (unit, counts) in self.by_unit.iter().filter(|(_, c)| c.failed + c.skipped > 0) {
            warn!(
                "{}: {} succeeded, {} failed, {} skipped",
                unit, counts.succeeded, counts.failed, counts.skipped
            );
        }
        for node in self.nodes.iter().filter(|n| n.status == NodeStatus::Failed) {
            error!(
                "{} for {}: {}",
                node.stage,
                node.unit.label(),
                node.diagnostic.as_deref().unwrap_or("no diagnostic")
            );
        }
        let totals = self.totals();
        info!(
            "{} nodes: {} succeeded, {} failed, {} skipped",
            totals.total(),
            totals.succeeded,
            totals.failed,
            totals.skipped
        );
    }
}


/// Discovers the inputs, builds one graph per unit, runs everything and
/// tallies the outcome. Stage failures are reported in the summary;
/// only setup problems (paths, executables, graph) come back as errors.
///
/// # Arguments
///
/// * `config` - Run settings shared with every worker.
///
/// # Returns
/// Result<RunSummary, PipelineError>
pub async fn run(config: Arc<RunConfig>) -> Result<RunSummary, PipelineError> {
    let start = Instant::now();

    let units = discover(&config.input_root, Some(&config.output_root))?;
    if units.is_empty() {
        warn!("No input files found under {}", config.input_root.display());
    } else {
        info!("Found {} input files under {}", units.len(), config.input_root.display());
    }
    check_collisions(&units, &config.output_root)?;

    // every output directory exists before the first stage starts
    for unit in &units {
        resolve(&unit.source, &config.input_root, &config.output_root)?;
    }

    let mut builder = GraphBuilder::new(&config.executables, &config.models, &config.output_root)?;
    let runner = Arc::new(ToolRunner::new(Arc::clone(&config)));
    let mut scheduler = Scheduler::new(runner, config.workers);
    if config.monitoring {
        let monitor_path = config.output_root.join(MONITORING_FILE);
        info!("Recording node transitions in {}", monitor_path.display());
        scheduler = scheduler.with_monitor(Monitor::create(&monitor_path)?);
    }

    for unit in &units {
        scheduler.submit(builder.build(unit)?)?;
    }
    info!(
        "Submitted {} nodes for {} units ({} {} models each)",
        scheduler.len(),
        units.len(),
        builder.models().len(),
        config.family.tool_tag()
    );

    let nodes = scheduler.wait().await;
    let summary = RunSummary::from_nodes(nodes);
    summary.report();
    info!("Pipeline finished in {:.1}s", start.elapsed().as_secs_f64());
    Ok(summary)
}
