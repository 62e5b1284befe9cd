// Executable registry: logical tool name -> resolved program path.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error};
use serde::Deserialize;

use crate::config::defs::PipelineError;

#[derive(Debug, Deserialize)]
struct ExecutableEntry {
    executable: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Clone, Default)]
pub struct Executables {
    tools: HashMap<String, PathBuf>,
}

impl Executables {
    /// Loads the JSON registry and resolves every entry.
    ///
    /// Entries with an empty `path` are looked up on `PATH`; otherwise
    /// `path/executable` must exist. Any unresolvable entry is an error.
    ///
    /// # Arguments
    ///
    /// * `registry` - JSON file of `{ tool: { "executable": .., "path": .. } }`.
    ///
    /// # Returns
    /// Executables with absolute program paths.
    pub fn load(registry: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(registry).map_err(|e| {
            PipelineError::InvalidConfig(format!(
                "Cannot read executables file {}: {}",
                registry.display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let entries: BTreeMap<String, ExecutableEntry> = serde_json::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(format!("Malformed executables file: {}", e)))?;

        let mut tools = HashMap::new();
        for (tool, entry) in entries {
            let resolved = if entry.path.trim().is_empty() {
                find_on_path(&entry.executable).ok_or_else(|| {
                    error!("Failed to find the {} executable!", tool);
                    PipelineError::Executable {
                        tool: tool.clone(),
                        reason: format!("{} is not on PATH", entry.executable),
                    }
                })?
            } else {
                let candidate = Path::new(&entry.path).join(&entry.executable);
                if !candidate.is_file() {
                    error!("Failed to find the {} executable on path {}!", tool, entry.path);
                    return Err(PipelineError::Executable {
                        tool,
                        reason: format!("{} does not exist", candidate.display()),
                    });
                }
                candidate
            };
            debug!("{} -> {}", tool, resolved.display());
            tools.insert(tool, resolved);
        }
        Ok(Self { tools })
    }

    /// Builds a registry from already-known paths without touching the filesystem.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = (S, PathBuf)>,
        S: Into<String>,
    {
        Self {
            tools: paths.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, tool: &str) -> Result<&Path, PipelineError> {
        self.tools
            .get(tool)
            .map(PathBuf::as_path)
            .ok_or_else(|| PipelineError::Executable {
                tool: tool.to_string(),
                reason: "missing from the executables registry".to_string(),
            })
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// Checks that every tool the run needs is registered and runnable.
    pub fn require(&self, tools: &[&str]) -> Result<(), PipelineError> {
        for tool in tools {
            let program = self.get(tool)?;
            if !is_executable(program) {
                return Err(PipelineError::Executable {
                    tool: tool.to_string(),
                    reason: format!("{} is not executable", program.display()),
                });
            }
        }
        Ok(())
    }
}

/// Searches `PATH` for an executable file named `name`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
