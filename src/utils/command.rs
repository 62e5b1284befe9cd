/// Functions and structs for building and running external tool command lines

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::process::Command;

use crate::utils::file::temp_sibling;


pub trait ArgGenerator: Send + Sync {
    fn tag(&self) -> &'static str;
    fn generate_args(&self) -> Vec<String>;
}


pub mod mafft {
    use std::path::PathBuf;
    use crate::config::defs::MAFFT_TAG;
    use super::ArgGenerator;

    pub struct MafftConfig {
        pub threads: usize,
        pub input: PathBuf,
    }

    impl ArgGenerator for MafftConfig {
        fn tag(&self) -> &'static str {
            MAFFT_TAG
        }

        fn generate_args(&self) -> Vec<String> {
            let mut args_vec: Vec<String> = Vec::new();
            args_vec.push("--thread".to_string());
            args_vec.push(self.threads.to_string());
            args_vec.push("--auto".to_string());
            args_vec.push("--phylipout".to_string());
            args_vec.push("--inputorder".to_string());
            args_vec.push(self.input.to_string_lossy().to_string());
            args_vec
        }
    }
}

pub mod raxml {
    use std::path::PathBuf;
    use crate::config::defs::{RAXML_MODEL, RAXML_TAG};
    use super::ArgGenerator;

    pub struct RaxmlConfig {
        pub alignment: PathBuf,
        pub run_name: String,
        pub workdir: PathBuf,
        pub seed: u32,
    }

    impl ArgGenerator for RaxmlConfig {
        fn tag(&self) -> &'static str {
            RAXML_TAG
        }

        fn generate_args(&self) -> Vec<String> {
            vec![
                "-s".to_string(),
                self.alignment.to_string_lossy().to_string(),
                "-m".to_string(),
                RAXML_MODEL.to_string(),
                "-n".to_string(),
                self.run_name.clone(),
                "-w".to_string(),
                self.workdir.to_string_lossy().to_string(),
                "-p".to_string(),
                self.seed.to_string(),
            ]
        }
    }
}

pub mod codeml {
    use std::path::Path;
    use crate::config::defs::{
        CODEML_CTL, CODEML_OUTFILE_COMMENT, CODEML_OUTFILE_FIELD, CODEML_SEQFILE_ANCHOR, CODEML_TAG,
        CODEML_TREEFILE_FIELD,
    };
    use crate::utils::template::Substitution;
    use super::ArgGenerator;

    /// codeml reads everything from the control file in its working directory.
    pub struct CodemlConfig;

    impl ArgGenerator for CodemlConfig {
        fn tag(&self) -> &'static str {
            CODEML_TAG
        }

        fn generate_args(&self) -> Vec<String> {
            vec![CODEML_CTL.to_string()]
        }
    }

    pub fn substitutions(formatted: &Path, tree: &Path, result: &Path) -> Vec<Substitution> {
        vec![
            Substitution::anchor(CODEML_SEQFILE_ANCHOR, formatted.to_string_lossy()),
            Substitution::field(CODEML_TREEFILE_FIELD, tree.to_string_lossy()),
            Substitution::field(
                CODEML_OUTFILE_FIELD,
                format!("{}{}", result.to_string_lossy(), CODEML_OUTFILE_COMMENT),
            ),
        ]
    }
}

pub mod hyphy {
    use std::path::Path;
    use crate::config::defs::{HYPHY_ALIGNMENT_ANCHOR, HYPHY_OUTFILE_ANCHOR, HYPHY_TAG, HYPHY_TREE_ANCHOR};
    use crate::utils::template::Substitution;
    use super::ArgGenerator;

    /// hyphy is driven interactively; the control file is fed on stdin.
    pub struct HyphyConfig;

    impl ArgGenerator for HyphyConfig {
        fn tag(&self) -> &'static str {
            HYPHY_TAG
        }

        fn generate_args(&self) -> Vec<String> {
            Vec::new()
        }
    }

    pub fn substitutions(alignment: &Path, tree: &Path, result: &Path) -> Vec<Substitution> {
        vec![
            Substitution::anchor(HYPHY_ALIGNMENT_ANCHOR, alignment.to_string_lossy()),
            Substitution::anchor(HYPHY_TREE_ANCHOR, tree.to_string_lossy()),
            Substitution::anchor(HYPHY_OUTFILE_ANCHOR, result.to_string_lossy()),
        ]
    }
}


/// How tool processes are started: directly on this machine, or as one
/// `srun` job step each inside a SLURM allocation. `worker_init` is a shell
/// preamble run before the tool (module loads, exports).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    Local {
        worker_init: Option<String>,
    },
    Slurm {
        srun: PathBuf,
        worker_init: Option<String>,
    },
}

impl Launcher {
    pub fn local() -> Self {
        Launcher::Local { worker_init: None }
    }

    fn worker_init(&self) -> Option<&str> {
        match self {
            Launcher::Local { worker_init } | Launcher::Slurm { worker_init, .. } => worker_init.as_deref(),
        }
    }

    /// Builds the command for `program args...`, wrapped for the launcher.
    ///
    /// # Arguments
    ///
    /// * `program` - Resolved tool path.
    /// * `args` - Tool arguments.
    /// * `cpus` - CPUs the step needs (only used under SLURM).
    pub fn command(&self, program: &Path, args: &[String], cpus: usize) -> Command {
        let mut argv: Vec<OsString> = Vec::new();
        let head: OsString = match self.worker_init() {
            Some(init) => {
                argv.push("-c".into());
                argv.push(format!("{}; exec \"$0\" \"$@\"", init).into());
                argv.push(program.as_os_str().to_owned());
                "sh".into()
            }
            None => program.as_os_str().to_owned(),
        };
        argv.extend(args.iter().map(OsString::from));

        match self {
            Launcher::Local { .. } => {
                let mut cmd = Command::new(head);
                cmd.args(argv);
                cmd
            }
            Launcher::Slurm { srun, .. } => {
                let mut cmd = Command::new(srun);
                cmd.args(["--nodes=1", "--ntasks=1", "--exclusive", "--quiet"])
                    .arg(format!("--cpus-per-task={}", cpus.max(1)))
                    .arg(head)
                    .args(argv);
                cmd
            }
        }
    }
}


/// Where a tool's stdout goes.
#[derive(Debug, Clone)]
pub enum StdoutTarget {
    /// Plain log file.
    Log(PathBuf),
    /// stdout is a declared output: captured in a temp sibling and renamed
    /// into place only on success.
    Capture(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ToolIo {
    pub stdin: Option<PathBuf>,
    pub stdout: StdoutTarget,
    pub stderr: PathBuf,
    pub cwd: Option<PathBuf>,
}


/// Runs one tool to completion.
///
/// # Arguments
///
/// * `launcher` - Local or SLURM launching.
/// * `program` - Resolved executable.
/// * `config` - Tool parameters.
/// * `cpus` - CPUs reserved for the run.
/// * `io` - stdin/stdout/stderr redirection and working directory.
///
/// # Returns
/// Ok(()) on exit status 0 (and non-empty captured stdout, if any).
pub async fn run_tool(
    launcher: &Launcher,
    program: &Path,
    config: &dyn ArgGenerator,
    cpus: usize,
    io: ToolIo,
) -> Result<()> {
    let tag = config.tag();
    let args = config.generate_args();
    debug!("{} {}", program.display(), args.join(" "));

    let stderr_file = File::create(&io.stderr)
        .map_err(|e| anyhow!("Failed to create {}: {}", io.stderr.display(), e))?;

    let (stdout, capture) = match &io.stdout {
        StdoutTarget::Log(path) => {
            let file = File::create(path).map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
            (Stdio::from(file), None)
        }
        StdoutTarget::Capture(path) => {
            let tmp = temp_sibling(path).map_err(|e| anyhow!("Failed to stage {}: {}", path.display(), e))?;
            let handle = tmp.as_file().try_clone()?;
            (Stdio::from(handle), Some((tmp, path.clone())))
        }
    };

    let stdin = match &io.stdin {
        Some(path) => Stdio::from(
            File::open(path).map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?,
        ),
        None => Stdio::null(),
    };

    let mut cmd = launcher.command(program, &args, cpus);
    cmd.stdin(stdin).stdout(stdout).stderr(Stdio::from(stderr_file));
    if let Some(cwd) = &io.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {} ({}): {}. Is it installed?", tag, program.display(), e))?;
    let status = child
        .wait()
        .await
        .map_err(|e| anyhow!("Failed to wait on {}: {}", tag, e))?;

    if !status.success() {
        return Err(anyhow!("{} exited with {}; see {}", tag, status, io.stderr.display()));
    }

    if let Some((tmp, dest)) = capture {
        let len = tmp.as_file().metadata()?.len();
        if len == 0 {
            return Err(anyhow!("{} exited 0 but wrote nothing to stdout", tag));
        }
        tmp.persist(&dest)
            .map_err(|e| anyhow!("Failed to move output into {}: {}", dest.display(), e.error))?;
    }

    Ok(())
}
