use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::ValueEnum;
use rand::rngs::StdRng;
use serde::Serialize;
use thiserror::Error;

use crate::config::executables::Executables;
use crate::utils::command::Launcher;

// External software
pub const MAFFT_TAG: &str = "mafft";
pub const RAXML_TAG: &str = "raxml";
pub const CODEML_TAG: &str = "codeml";
pub const HYPHY_TAG: &str = "hyphy";
pub const SRUN_TAG: &str = "srun";
pub const FORMAT_PHYLIP_TAG: &str = "format_phylip";

// Static Filenames
pub const LOG_SUBDIR: &str = "stderr";
pub const MONITORING_FILE: &str = "monitoring.jsonl";
pub const CODEML_CTL: &str = "codeml.ctl";
pub const HYPHY_CTL: &str = "hyphy.ctl";
pub const ALIGNMENT_EXT: &str = "mafft";
pub const FORMATTED_SUFFIX: &str = "_formatted.phylip";
pub const RAXML_RESULT_PREFIX: &str = "RAxML_result.";
pub const RAXML_INFO_PREFIX: &str = "RAxML_info.";
pub const RAXML_RUN_SUFFIX: &str = "_output.tree";

// Control file anchors
pub const CODEML_SEQFILE_ANCHOR: &str = "%=FASTA_FILE%-f.phylip";
pub const CODEML_TREEFILE_FIELD: &str = "treefile";
pub const CODEML_OUTFILE_FIELD: &str = "outfile";
pub const CODEML_OUTFILE_COMMENT: &str = "   * main result file name";
pub const HYPHY_ALIGNMENT_ANCHOR: &str = "%=FASTA_FILE%.phylip";
pub const HYPHY_TREE_ANCHOR: &str = "RAxML_result.%=FASTA_FILE%.tree";
pub const HYPHY_OUTFILE_ANCHOR: &str = "outfile_result.%=FASTA_FILE%";

// Static Parameters
pub const RAXML_MODEL: &str = "GTRCAT";
pub const RAXML_SEED_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
pub const DEFAULT_TEMPLATES_DIR: &str = "scripts";

/// Which tool family runs in the fan-out stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Codeml,
    Hyphy,
}

impl ModelFamily {
    pub fn tool_tag(&self) -> &'static str {
        match self {
            ModelFamily::Codeml => CODEML_TAG,
            ModelFamily::Hyphy => HYPHY_TAG,
        }
    }

    pub fn control_file(&self) -> &'static str {
        match self {
            ModelFamily::Codeml => CODEML_CTL,
            ModelFamily::Hyphy => HYPHY_CTL,
        }
    }

    pub fn result_ext(&self) -> &'static str {
        match self {
            ModelFamily::Codeml => "txt",
            ModelFamily::Hyphy => "json",
        }
    }

    /// All variants of the family, in the order the workflow has always run them.
    pub fn models(&self) -> Vec<ModelVariant> {
        match self {
            ModelFamily::Codeml => vec![
                ModelVariant::M0,
                ModelVariant::M1,
                ModelVariant::M2,
                ModelVariant::M3,
                ModelVariant::M7,
                ModelVariant::M8,
            ],
            ModelFamily::Hyphy => vec![
                ModelVariant::Ny,
                ModelVariant::Meme,
                ModelVariant::Slac,
                ModelVariant::Fubar,
                ModelVariant::Fel,
                ModelVariant::Absrel,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize)]
pub enum ModelVariant {
    // codeml site models
    #[value(name = "M0")]
    M0,
    #[value(name = "M1")]
    M1,
    #[value(name = "M2")]
    M2,
    #[value(name = "M3")]
    M3,
    #[value(name = "M7")]
    M7,
    #[value(name = "M8")]
    M8,
    // hyphy selection tests
    #[value(name = "ny")]
    Ny,
    #[value(name = "meme")]
    Meme,
    #[value(name = "slac")]
    Slac,
    #[value(name = "fubar")]
    Fubar,
    #[value(name = "fel")]
    Fel,
    #[value(name = "absrel")]
    Absrel,
}

impl ModelVariant {
    /// Directory and file-name token for the model.
    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::M0 => "M0",
            ModelVariant::M1 => "M1",
            ModelVariant::M2 => "M2",
            ModelVariant::M3 => "M3",
            ModelVariant::M7 => "M7",
            ModelVariant::M8 => "M8",
            ModelVariant::Ny => "ny",
            ModelVariant::Meme => "meme",
            ModelVariant::Slac => "slac",
            ModelVariant::Fubar => "fubar",
            ModelVariant::Fel => "fel",
            ModelVariant::Absrel => "absrel",
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            ModelVariant::M0
            | ModelVariant::M1
            | ModelVariant::M2
            | ModelVariant::M3
            | ModelVariant::M7
            | ModelVariant::M8 => ModelFamily::Codeml,
            _ => ModelFamily::Hyphy,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cannot resolve output path for {path}: {reason}")]
    PathResolution { path: PathBuf, reason: String },

    #[error("Control file {template} does not match the expected dialect: {placeholder} not found")]
    TemplateMismatch { template: String, placeholder: String },

    #[error("{tool} failed for {unit}: {error}")]
    StageExecution {
        tool: String,
        unit: String,
        error: String,
    },

    #[error("Upstream stage did not succeed: {0}")]
    DependencyFailure(String),

    #[error("Executable for {tool} not usable: {reason}")]
    Executable { tool: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything a run needs, built once in `main` and shared read-only.
pub struct RunConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub templates_dir: PathBuf,
    pub executables: Executables,
    pub family: ModelFamily,
    pub models: Vec<ModelVariant>,
    pub workers: usize,
    pub align_threads: usize,
    pub launcher: Launcher,
    pub monitoring: bool,
    pub resume: bool,
    pub rng: Mutex<StdRng>,
}
