// Input discovery and the per-unit output directory layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::config::defs::{
    ALIGNMENT_EXT, FORMATTED_SUFFIX, LOG_SUBDIR, ModelVariant, PipelineError, RAXML_INFO_PREFIX,
    RAXML_RESULT_PREFIX, RAXML_RUN_SUFFIX,
};

/// One sequence file found under the input root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputUnit {
    pub source: PathBuf,
    pub stem: String,
    pub relative_dir: PathBuf,
}

impl InputUnit {
    pub fn new(source: &Path, input_root: &Path) -> Result<Self, PipelineError> {
        let parent = source.parent().unwrap_or_else(|| Path::new(""));
        let relative_dir = parent
            .strip_prefix(input_root)
            .map_err(|_| PipelineError::PathResolution {
                path: source.to_path_buf(),
                reason: format!("not under input root {}", input_root.display()),
            })?
            .to_path_buf();
        let stem = source
            .file_stem()
            .ok_or_else(|| PipelineError::PathResolution {
                path: source.to_path_buf(),
                reason: "no file name".to_string(),
            })?
            .to_str()
            .ok_or_else(|| PipelineError::PathResolution {
                path: source.to_path_buf(),
                reason: "file name is not valid UTF-8".to_string(),
            })?
            .to_string();
        Ok(Self {
            source: source.to_path_buf(),
            stem,
            relative_dir,
        })
    }

    /// `relative/stem`, used to name the unit in logs and reports.
    pub fn label(&self) -> String {
        self.relative_dir.join(&self.stem).to_string_lossy().into_owned()
    }
}


/// Resolves and creates the output directory for one input file.
///
/// # Arguments
///
/// * `input_path` - Sequence file, must live under `input_root`.
/// * `input_root` - Root the input tree was discovered from.
/// * `output_root` - Root all outputs are written under.
///
/// # Returns
/// `output_root/relative_dir/stem`, created together with its `stderr/`
/// subdirectory. Existing directories are reused.
pub fn resolve(input_path: &Path, input_root: &Path, output_root: &Path) -> Result<PathBuf, PipelineError> {
    let unit = InputUnit::new(input_path, input_root)?;
    let layout = UnitLayout::new(&unit, output_root);
    layout.create()?;
    Ok(layout.dir)
}


/// Recursively lists regular files under `input_root`, sorted by path.
/// Hidden entries and anything beneath `exclude` (normally the output root)
/// are not returned.
pub fn discover(input_root: &Path, exclude: Option<&Path>) -> Result<Vec<InputUnit>, PipelineError> {
    if !input_root.is_dir() {
        return Err(PipelineError::PathResolution {
            path: input_root.to_path_buf(),
            reason: "input root is not a directory".to_string(),
        });
    }

    let mut units = Vec::new();
    let walker = WalkDir::new(input_root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let hidden = e.depth() > 0 && e.file_name().to_string_lossy().starts_with('.');
            let excluded = exclude.is_some_and(|ex| e.path().starts_with(ex));
            !hidden && !excluded
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", input_root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        debug!("Discovered {}", entry.path().display());
        units.push(InputUnit::new(entry.path(), input_root)?);
    }

    Ok(units)
}


/// Fails when two inputs would share an output directory (e.g. `A.fasta`
/// and `A.fa` in the same folder).
pub fn check_collisions(units: &[InputUnit], output_root: &Path) -> Result<(), PipelineError> {
    let mut seen: HashMap<PathBuf, &Path> = HashMap::new();
    for unit in units {
        let dir = UnitLayout::new(unit, output_root).dir;
        if let Some(previous) = seen.insert(dir.clone(), &unit.source) {
            return Err(PipelineError::PathResolution {
                path: unit.source.clone(),
                reason: format!(
                    "output directory {} is already claimed by {}",
                    dir.display(),
                    previous.display()
                ),
            });
        }
    }
    Ok(())
}


/// Every path a unit's stages read or write, derived from the output
/// directory and the stem alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    pub dir: PathBuf,
    pub stem: String,
}

impl UnitLayout {
    pub fn new(unit: &InputUnit, output_root: &Path) -> Self {
        Self {
            dir: output_root.join(&unit.relative_dir).join(&unit.stem),
            stem: unit.stem.clone(),
        }
    }

    pub fn create(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(self.log_dir()).map_err(|e| PipelineError::PathResolution {
            path: self.dir.clone(),
            reason: e.to_string(),
        })
    }

    pub fn alignment(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.stem, ALIGNMENT_EXT))
    }

    pub fn formatted(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.stem, FORMATTED_SUFFIX))
    }

    /// The `-n` run name handed to RAxML.
    pub fn raxml_run_name(&self) -> String {
        format!("{}{}", self.stem, RAXML_RUN_SUFFIX)
    }

    pub fn tree(&self) -> PathBuf {
        self.dir.join(format!("{}{}", RAXML_RESULT_PREFIX, self.raxml_run_name()))
    }

    pub fn raxml_info(&self) -> PathBuf {
        self.dir.join(format!("{}{}", RAXML_INFO_PREFIX, self.raxml_run_name()))
    }

    pub fn model_dir(&self, model: ModelVariant) -> PathBuf {
        self.dir.join(model.name())
    }

    pub fn model_result(&self, model: ModelVariant) -> PathBuf {
        self.model_dir(model).join(format!(
            "{}_{}.results.{}",
            model.name(),
            self.stem,
            model.family().result_ext()
        ))
    }

    pub fn control_file(&self, model: ModelVariant) -> PathBuf {
        self.model_dir(model).join(model.family().control_file())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dir.join(LOG_SUBDIR)
    }

    /// `(stdout, stderr)` log paths for one tool run; `label` is the stem,
    /// or `stem_model` for the fan-out stage.
    pub fn logs(&self, label: &str, tool: &str) -> (PathBuf, PathBuf) {
        let dir = self.log_dir();
        (
            dir.join(format!("{}.{}.stdout", label, tool)),
            dir.join(format!("{}.{}.stderr", label, tool)),
        )
    }
}
