/// PHYLIP post-processing done in-process between alignment and codeml.
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use regex::Regex;

use crate::utils::file::write_atomic_with;

lazy_static! {
    static ref PHYLIP_HEADER: Regex = Regex::new(r"^\s*(\d+)\s+(\d+)").unwrap();
}


/// Rewrites the PHYLIP header `ntaxa nchar [...]` to `ntaxa nchar I`, the
/// interleaved marker codeml expects. Every following line is kept as is.
///
/// # Arguments
///
/// * `content` - Whole PHYLIP file as produced by `mafft --phylipout`.
///
/// # Returns
/// Reformatted text.
pub fn interleave_header(content: &str) -> Result<String> {
    let (first, rest) = match content.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (content, ""),
    };
    let caps = PHYLIP_HEADER
        .captures(first)
        .ok_or_else(|| anyhow!("Invalid PHYLIP header: '{}'", first.trim_end()))?;
    Ok(format!("{} {} I\n{}", &caps[1], &caps[2], rest))
}


/// Reads `input`, reformats its header and writes `output` all-or-nothing.
pub fn format_phylip(input: &Path, output: &Path) -> Result<()> {
    let content = fs::read_to_string(input)
        .map_err(|e| anyhow!("Failed to read {}: {}", input.display(), e))?;
    let formatted = interleave_header(&content)?;
    write_atomic_with(output, |file| file.write_all(formatted.as_bytes()))
        .map_err(|e| anyhow!("Failed to write {}: {}", output.display(), e))?;
    Ok(())
}
