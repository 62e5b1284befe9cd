// src/utils/system.rs: System functions

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use sysinfo::System;


/// Determines the default worker budget for local runs.
///
/// # Returns
///
/// Number of physical cores, or 1 if it cannot be detected.
pub fn detect_physical_cores() -> usize {
    System::physical_core_count().unwrap_or(1).max(1)
}


/// Worker budget inside a SLURM allocation: cpus per node times node count.
///
/// # Arguments
///
///  * `cpus_on_node` - Value of SLURM_CPUS_ON_NODE.
///  * `nnodes` - Value of SLURM_NNODES.
pub fn slurm_budget(cpus_on_node: Option<&str>, nnodes: Option<&str>) -> Result<usize> {
    let cpus: usize = cpus_on_node
        .ok_or_else(|| anyhow!("SLURM_CPUS_ON_NODE is not set; --onslurm must run inside an allocation"))?
        .trim()
        .parse()
        .map_err(|e| anyhow!("Bad SLURM_CPUS_ON_NODE: {}", e))?;
    let nodes: usize = nnodes
        .ok_or_else(|| anyhow!("SLURM_NNODES is not set; --onslurm must run inside an allocation"))?
        .trim()
        .parse()
        .map_err(|e| anyhow!("Bad SLURM_NNODES: {}", e))?;
    if cpus == 0 || nodes == 0 {
        return Err(anyhow!("SLURM allocation reports zero cpus or nodes"));
    }
    Ok(cpus * nodes)
}

pub fn slurm_budget_from_env() -> Result<usize> {
    slurm_budget(
        env::var("SLURM_CPUS_ON_NODE").ok().as_deref(),
        env::var("SLURM_NNODES").ok().as_deref(),
    )
}


/// Reads the worker environment file: one shell line per entry, blank lines
/// and `#` comments dropped, joined into a single `; `-separated preamble.
pub fn read_worker_init(path: &Path) -> Result<Option<String>> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("Cannot read environment file {}: {}", path.display(), e))?;
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(lines.join("; ")))
}


/// Creates a project-wide RNG from the system, using entropy pool. Optional seed for
/// reproducibility.
///
/// # Arguments
///
///  * `seed` - Seed number that allows reproducible results.
///
/// # Returns
///
/// A StdRng
pub fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
