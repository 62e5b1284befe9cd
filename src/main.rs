use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use env_logger::{Builder, Target};
use log::{LevelFilter, debug, error, info, warn};

use phylo_pipelines::cli::{Arguments, parse};
use phylo_pipelines::config::defs::{MAFFT_TAG, PipelineError, RAXML_TAG, RunConfig, SRUN_TAG};
use phylo_pipelines::config::executables::{Executables, find_on_path};
use phylo_pipelines::pipelines::phylogenetic;
use phylo_pipelines::utils::command::Launcher;
use phylo_pipelines::utils::system::{detect_physical_cores, generate_rng, read_worker_init, slurm_budget_from_env};


/// Log sink writing every record to stdout and the run's log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let dir = env::current_dir()?;
    let output_root = absolute(&dir, &args.output);
    fs::create_dir_all(&output_root)
        .with_context(|| format!("Cannot create output directory {}", output_root.display()))?;
    let output_root = output_root.canonicalize()?;

    let log_path = output_root.join(format!(
        "phylo-pipelines-{}.log",
        Local::now().format("%d-%m-%Y_%H-%M-%S")
    ));
    let log_file = File::create(&log_path)
        .with_context(|| format!("Cannot create log file {}", log_path.display()))?;

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file: log_file })))
        .init();

    println!("\n-------------\n phylo-pipelines\n-------------\n");

    info!("The current directory is {:?}", dir);
    info!("Logging to {}", log_path.display());

    let run_config = match build_run_config(&args, &dir, output_root) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration failed: {}", e);
            std::process::exit(1);
        }
    };

    match phylogenetic::run(run_config).await {
        Ok(summary) if summary.is_success() => {}
        Ok(summary) => {
            let totals = summary.totals();
            error!(
                "Pipeline finished with {} failed and {} skipped nodes at {} milliseconds.",
                totals.failed,
                totals.skipped,
                run_start.elapsed().as_millis()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


fn absolute(cwd: &Path, path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() { path } else { cwd.join(path) }
}


/// Validates the arguments and assembles the shared run configuration.
/// Everything that can be checked before the first tool runs is checked here.
///
/// # Arguments
/// * `args` - Parsed command line.
/// * `cwd` - Directory relative paths are resolved against.
/// * `output_root` - Created, canonical output root.
///
/// # Returns
/// RunConfig, or the first fatal setup error.
fn build_run_config(args: &Arguments, cwd: &Path, output_root: PathBuf) -> Result<RunConfig, PipelineError> {
    let input_root = absolute(cwd, &args.input);
    let input_root = input_root
        .canonicalize()
        .map_err(|e| PipelineError::PathResolution {
            path: input_root.clone(),
            reason: e.to_string(),
        })?;
    if !input_root.is_dir() {
        return Err(PipelineError::PathResolution {
            path: input_root,
            reason: "input is not a directory".to_string(),
        });
    }

    let family = args.family();
    let models = args.selected_models();
    if let Some(model) = models.iter().find(|m| m.family() != family) {
        return Err(PipelineError::InvalidConfig(format!(
            "model {} does not belong to {} (use --hyphy for the selection tests)",
            model,
            family.tool_tag()
        )));
    }
    if args.align_threads == 0 {
        return Err(PipelineError::InvalidConfig("--align-threads must be at least 1".to_string()));
    }

    let executables = Executables::load(&absolute(cwd, &args.executables))?;
    executables.require(&[MAFFT_TAG, RAXML_TAG, family.tool_tag()])?;

    let templates_dir = absolute(cwd, &args.templates);
    for model in &models {
        let template = templates_dir.join(model.name()).join(family.control_file());
        if !template.is_file() {
            return Err(PipelineError::InvalidConfig(format!(
                "control file template {} not found",
                template.display()
            )));
        }
    }

    let worker_init = match &args.environment {
        Some(path) => read_worker_init(&absolute(cwd, path))?,
        None => None,
    };
    if let Some(init) = &worker_init {
        debug!("Worker init: {}", init);
    }

    let (launcher, workers) = if args.onslurm {
        let srun = find_on_path(SRUN_TAG).ok_or_else(|| PipelineError::Executable {
            tool: SRUN_TAG.to_string(),
            reason: "not found on PATH".to_string(),
        })?;
        if args.threads.is_some() {
            warn!("--threads is ignored with --onslurm; the allocation sets the budget");
        }
        (Launcher::Slurm { srun, worker_init }, slurm_budget_from_env()?)
    } else {
        let workers = args.threads.unwrap_or_else(detect_physical_cores);
        (Launcher::Local { worker_init }, workers)
    };
    if workers == 0 {
        return Err(PipelineError::InvalidConfig("worker budget must be at least 1".to_string()));
    }

    info!("Input root: {}", input_root.display());
    info!("Output root: {}", output_root.display());
    info!(
        "Running {} models [{}] with {} workers{}",
        family.tool_tag(),
        models.iter().map(|m| m.name()).collect::<Vec<_>>().join(", "),
        workers,
        if args.onslurm { " on SLURM" } else { "" }
    );

    Ok(RunConfig {
        input_root,
        output_root,
        templates_dir,
        executables,
        family,
        models,
        workers,
        align_threads: args.align_threads,
        launcher,
        monitoring: args.monitoring,
        resume: args.resume,
        rng: Mutex::new(generate_rng(args.seed)),
    })
}
