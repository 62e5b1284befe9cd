use clap::Parser;

use crate::config::defs::{DEFAULT_TEMPLATES_DIR, ModelFamily, ModelVariant};

#[derive(Parser, Debug, Clone)]
#[command(name = "phylo-pipelines", version, about = "Alignment, tree inference and codon/selection models for a directory of sequence files")]
pub struct Arguments {
    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 't', long, help = "Worker budget. Defaults to the number of physical cores (ignored with --onslurm)")]
    pub threads: Option<usize>,

    #[arg(short = 'i', long = "input", help = "Directory searched recursively for sequence files")]
    pub input: String,

    #[arg(short = 'o', long = "output", help = "Output root; one directory per input file is created beneath it")]
    pub output: String,

    #[arg(short = 'e', long = "executables", help = "JSON registry: {\"tool\": {\"executable\": \"...\", \"path\": \"...\"}}")]
    pub executables: String,

    #[arg(long = "env", visible_alias = "environment", help = "Shell lines run before every tool (module loads, exports)")]
    pub environment: Option<String>,

    #[arg(short = 'm', long = "monitoring", action, help = "Append node transitions to monitoring.jsonl in the output root")]
    pub monitoring: bool,

    #[arg(long, action, help = "Run inside a SLURM allocation, one srun step per tool")]
    pub onslurm: bool,

    #[arg(long, action, help = "Run the hyphy selection tests instead of the codeml site models")]
    pub hyphy: bool,

    #[arg(long, value_enum, value_delimiter = ',', help = "Comma-separated subset of models; defaults to the whole family")]
    pub models: Vec<ModelVariant>,

    #[arg(long, default_value = DEFAULT_TEMPLATES_DIR, help = "Directory holding {model}/codeml.ctl or {model}/hyphy.ctl")]
    pub templates: String,

    #[arg(long, default_value_t = 1)]
    pub align_threads: usize,

    #[clap(long, help = "Optional fixed seed for reproducibility; defaults to OS entropy")]
    pub seed: Option<u64>,

    #[arg(
        long,
        action,
        help = "Treat stages whose outputs already exist and are non-empty as done. Only the alignment and PHYLIP \
                files are written atomically; a tree or model result left by a killed tool is not detected, so \
                delete those before resuming an interrupted run"
    )]
    pub resume: bool,
}

impl Arguments {
    pub fn family(&self) -> ModelFamily {
        if self.hyphy { ModelFamily::Hyphy } else { ModelFamily::Codeml }
    }

    /// Requested models, or the whole family when none were given.
    pub fn selected_models(&self) -> Vec<ModelVariant> {
        if self.models.is_empty() {
            self.family().models()
        } else {
            self.models.clone()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_full_codeml_family() {
        let args = Arguments::try_parse_from(["phylo-pipelines", "-i", "in", "-o", "out", "-e", "exe.json"]).unwrap();
        assert_eq!(args.family(), ModelFamily::Codeml);
        assert_eq!(args.selected_models().len(), 6);
        assert_eq!(args.templates, "scripts");
        assert_eq!(args.align_threads, 1);
        assert!(args.threads.is_none());
    }

    #[test]
    fn test_model_subset_and_hyphy() {
        let args = Arguments::try_parse_from([
            "phylo-pipelines",
            "-i",
            "in",
            "-o",
            "out",
            "-e",
            "exe.json",
            "--hyphy",
            "--models",
            "fel,meme",
            "--environment",
            "worker.env",
        ])
        .unwrap();
        assert_eq!(args.family(), ModelFamily::Hyphy);
        assert_eq!(args.selected_models(), vec![ModelVariant::Fel, ModelVariant::Meme]);
        assert_eq!(args.environment.as_deref(), Some("worker.env"));
    }

    #[test]
    fn test_resume_help_names_non_atomic_outputs() {
        use clap::CommandFactory;

        let command = Arguments::command();
        let help = command
            .get_arguments()
            .find(|a| a.get_id() == "resume")
            .and_then(|a| a.get_help())
            .map(|h| h.to_string())
            .unwrap_or_default();
        assert!(help.contains("written atomically"), "{}", help);
        assert!(help.contains("killed tool"));
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let parsed =
            Arguments::try_parse_from(["phylo-pipelines", "-i", "in", "-o", "out", "-e", "x", "--models", "M9"]);
        assert!(parsed.is_err());
    }
}
