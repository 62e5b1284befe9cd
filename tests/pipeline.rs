#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use phylo_pipelines::config::defs::{ModelFamily, ModelVariant, RunConfig};
use phylo_pipelines::config::executables::Executables;
use phylo_pipelines::pipelines::phylogenetic;
use phylo_pipelines::utils::command::Launcher;
use phylo_pipelines::utils::graph::{NodeStatus, Stage};
use phylo_pipelines::utils::system::generate_rng;

const MAFFT_STUB: &str = r#"#!/bin/sh
for last; do :; done
[ -s "$last" ] || exit 2
case "$last" in
  *broken*) echo "bad input" >&2; exit 1 ;;
esac
printf ' 2 6\nseqA      ACGTAC\nseqB      ACGTTC\n'
"#;

const RAXML_STUB: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -n) name="$2"; shift 2 ;;
    -w) dir="$2"; shift 2 ;;
    *) shift ;;
  esac
done
[ -e "$dir/RAxML_info.$name" ] && exit 4
echo "(seqA,seqB);" > "$dir/RAxML_result.$name"
echo "done" > "$dir/RAxML_info.$name"
"#;

const CODEML_STUB: &str = r#"#!/bin/sh
grep -q "_formatted.phylip" "$1" || exit 3
out=$(sed -n 's/^ *outfile = \([^ ]*\).*/\1/p' "$1")
echo "lnL(ntime: 1  np: 3): -12.5" > "$out"
"#;

// answers come on stdin; the last line names the result file
const HYPHY_STUB: &str = r#"#!/bin/sh
[ "$(basename "$PWD")" = "fel" ] || exit 5
while IFS= read -r line; do
  case "$line" in
    *.mafft) [ -s "$line" ] || exit 3 ;;
    *_output.tree) [ -s "$line" ] || exit 4 ;;
    *.results.json) out="$line" ;;
  esac
done
[ -n "$out" ] || exit 6
echo '{"test results": {}}' > "$out"
"#;

const HYPHY_TEMPLATE: &str = "1
4
1
%=FASTA_FILE%.phylip
RAxML_result.%=FASTA_FILE%.tree
2
outfile_result.%=FASTA_FILE%
";

const CODEML_TEMPLATE: &str = "      seqfile = %=FASTA_FILE%-f.phylip   * sequence data filename
     treefile = tree.nwk      * tree structure file name
      outfile = mlc           * main result file name

        noisy = 9
      seqtype = 1
";

fn write_stub(dir: &Path, name: &str, body: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

struct Fixture {
    _root: tempfile::TempDir,
    bin: PathBuf,
    input: PathBuf,
    output: PathBuf,
    config: RunConfig,
}

fn fixture(inputs: &[(&str, &str)], models: &[ModelVariant], resume: bool) -> Result<Fixture> {
    let root = tempfile::tempdir()?;
    let input = root.path().join("input");
    let output = root.path().join("output");
    let bin = root.path().join("bin");
    let templates = root.path().join("scripts");
    for dir in [&input, &output, &bin] {
        fs::create_dir_all(dir)?;
    }

    for (name, content) in inputs {
        let path = input.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }

    write_stub(&bin, "mafft", MAFFT_STUB)?;
    write_stub(&bin, "raxmlHPC", RAXML_STUB)?;
    write_stub(&bin, "codeml", CODEML_STUB)?;
    write_stub(&bin, "hyphy", HYPHY_STUB)?;
    let family = models.first().map(|m| m.family()).unwrap_or(ModelFamily::Codeml);
    let template = match family {
        ModelFamily::Codeml => CODEML_TEMPLATE,
        ModelFamily::Hyphy => HYPHY_TEMPLATE,
    };
    for model in models {
        let dir = templates.join(model.name());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(family.control_file()), template)?;
    }

    let registry = format!(
        r#"{{
            "mafft": {{"executable": "mafft", "path": "{bin}"}},
            "raxml": {{"executable": "raxmlHPC", "path": "{bin}"}},
            "codeml": {{"executable": "codeml", "path": "{bin}"}},
            "hyphy": {{"executable": "hyphy", "path": "{bin}"}}
        }}"#,
        bin = bin.display()
    );
    let executables = Executables::parse(&registry)?;

    let config = RunConfig {
        input_root: input.clone(),
        output_root: output.clone(),
        templates_dir: templates,
        executables,
        family,
        models: models.to_vec(),
        workers: 4,
        align_threads: 1,
        launcher: Launcher::local(),
        monitoring: true,
        resume,
        rng: Mutex::new(generate_rng(Some(42))),
    };
    Ok(Fixture {
        _root: root,
        bin,
        input,
        output,
        config,
    })
}

const FASTA: &str = ">seqA\nACGTAC\n>seqB\nACGTTC\n";


#[tokio::test]
async fn test_two_units_two_models_end_to_end() -> Result<()> {
    let models = [ModelVariant::M0, ModelVariant::M1];
    let fx = fixture(&[("A.fasta", FASTA), ("B.fasta", FASTA)], &models, false)?;
    let out = fx.output.clone();

    let summary = phylogenetic::run(Arc::new(fx.config)).await?;

    assert_eq!(summary.nodes.len(), 10);
    assert!(summary.is_success(), "{:?}", summary.by_unit);

    for stem in ["A", "B"] {
        let dir = out.join(stem);
        assert_eq!(
            fs::read_to_string(dir.join(format!("{}.mafft", stem)))?,
            " 2 6\nseqA      ACGTAC\nseqB      ACGTTC\n"
        );
        assert!(fs::read_to_string(dir.join(format!("{}_formatted.phylip", stem)))?.starts_with("2 6 I\n"));
        assert!(dir.join(format!("RAxML_result.{}_output.tree", stem)).is_file());
        for model in &models {
            let result = dir.join(model.name()).join(format!("{}_{}.results.txt", model, stem));
            assert!(fs::metadata(&result)?.len() > 0);

            let control = fs::read_to_string(dir.join(model.name()).join("codeml.ctl"))?;
            assert!(control.contains(&format!("treefile = {}", dir.join(format!("RAxML_result.{}_output.tree", stem)).display())));
            assert!(control.contains(&format!("outfile = {}   * main result file name", result.display())));
        }
        assert!(dir.join("stderr").join(format!("{}.mafft.stderr", stem)).is_file());
        assert!(dir.join("stderr").join(format!("{}_M0.codeml.stdout", stem)).is_file());
    }

    let monitoring = fs::read_to_string(out.join("monitoring.jsonl"))?;
    assert_eq!(monitoring.lines().count(), 20);
    Ok(())
}

#[tokio::test]
async fn test_broken_input_only_fails_its_own_spine() -> Result<()> {
    let models = [ModelVariant::M0, ModelVariant::M8];
    let fx = fixture(
        &[("broken.fasta", FASTA), ("genes/ORF1.fasta", FASTA)],
        &models,
        false,
    )?;
    let out = fx.output.clone();

    let summary = phylogenetic::run(Arc::new(fx.config)).await?;

    assert!(!summary.is_success());
    let broken = summary.by_unit["broken"];
    assert_eq!((broken.succeeded, broken.failed, broken.skipped), (0, 1, 4));
    assert_eq!(summary.by_unit["genes/ORF1"].succeeded, 5);

    // no alignment under the final name, no downstream files
    assert!(!out.join("broken/broken.mafft").exists());
    assert!(!out.join("broken/broken_formatted.phylip").exists());
    assert!(out.join("genes/ORF1/M8/M8_ORF1.results.txt").is_file());
    Ok(())
}

#[tokio::test]
async fn test_missing_template_anchor_fails_model_node() -> Result<()> {
    let models = [ModelVariant::M2];
    let fx = fixture(&[("A.fasta", FASTA)], &models, false)?;
    let template = fx.config.templates_dir.join("M2").join("codeml.ctl");
    fs::write(&template, "     treefile = tree.nwk\n      outfile = mlc\n")?;
    let out = fx.output.clone();

    let summary = phylogenetic::run(Arc::new(fx.config)).await?;

    let node = summary
        .nodes
        .iter()
        .find(|n| n.stage == Stage::FinalModel(ModelVariant::M2))
        .unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(node.diagnostic.as_deref().unwrap_or_default().contains("%=FASTA_FILE%-f.phylip"));
    assert!(!out.join("A/M2/codeml.ctl").exists());
    // the spine is unaffected
    assert!(out.join("A/RAxML_result.A_output.tree").is_file());
    Ok(())
}

fn rerun_config(fx: &Fixture, models: &[ModelVariant], resume: bool) -> RunConfig {
    RunConfig {
        input_root: fx.input.clone(),
        output_root: fx.output.clone(),
        templates_dir: fx.config.templates_dir.clone(),
        executables: fx.config.executables.clone(),
        family: fx.config.family,
        models: models.to_vec(),
        workers: 2,
        align_threads: 1,
        launcher: Launcher::local(),
        monitoring: false,
        resume,
        rng: Mutex::new(generate_rng(Some(1))),
    }
}

#[tokio::test]
async fn test_rerun_clears_stale_raxml_info() -> Result<()> {
    let models = [ModelVariant::M3];
    let fx = fixture(&[("A.fasta", FASTA)], &models, false)?;
    let again = rerun_config(&fx, &models, false);
    let out = fx.output.clone();

    assert!(phylogenetic::run(Arc::new(fx.config)).await?.is_success());
    assert!(out.join("A/RAxML_info.A_output.tree").is_file());

    // the raxml stub exits non-zero when its info file is already there
    let summary = phylogenetic::run(Arc::new(again)).await?;
    assert!(summary.is_success(), "{:?}", summary.by_stage);
    Ok(())
}

#[tokio::test]
async fn test_resume_leaves_finished_work_alone() -> Result<()> {
    let models = [ModelVariant::M7];
    let fx = fixture(&[("A.fasta", FASTA)], &models, false)?;
    let resumed = rerun_config(&fx, &models, true);
    let out = fx.output.clone();
    let bin = fx.bin.clone();

    assert!(phylogenetic::run(Arc::new(fx.config)).await?.is_success());
    let tree = fs::read_to_string(out.join("A/RAxML_result.A_output.tree"))?;

    // any stage that reran would now fail to spawn its tool
    for stub in ["mafft", "raxmlHPC", "codeml"] {
        fs::remove_file(bin.join(stub))?;
    }
    let summary = phylogenetic::run(Arc::new(resumed)).await?;
    assert!(summary.is_success(), "{:?}", summary.by_stage);
    assert_eq!(fs::read_to_string(out.join("A/RAxML_result.A_output.tree"))?, tree);
    Ok(())
}

#[tokio::test]
async fn test_hyphy_model_end_to_end() -> Result<()> {
    let models = [ModelVariant::Fel];
    let fx = fixture(&[("A.fasta", FASTA)], &models, false)?;
    let out = fx.output.clone();

    let summary = phylogenetic::run(Arc::new(fx.config)).await?;

    assert_eq!(summary.nodes.len(), 4);
    assert!(summary.is_success(), "{:?}", summary.nodes);
    let node = summary
        .nodes
        .iter()
        .find(|n| n.stage == Stage::FinalModel(ModelVariant::Fel))
        .unwrap();
    assert_eq!(node.inputs.len(), 3);

    let dir = out.join("A");
    let result = dir.join("fel").join("fel_A.results.json");
    assert_eq!(fs::read_to_string(&result)?, "{\"test results\": {}}\n");

    let control = fs::read_to_string(dir.join("fel").join("hyphy.ctl"))?;
    let expected = format!(
        "1\n4\n1\n{}\n{}\n2\n{}\n",
        dir.join("A.mafft").display(),
        dir.join("RAxML_result.A_output.tree").display(),
        result.display()
    );
    assert_eq!(control, expected);
    assert!(!control.contains("%=FASTA_FILE%"));
    assert!(dir.join("stderr").join("A_fel.hyphy.stdout").is_file());
    Ok(())
}

#[tokio::test]
async fn test_rerun_does_not_accept_previous_results() -> Result<()> {
    let models = [ModelVariant::M1];
    let fx = fixture(&[("A.fasta", FASTA)], &models, false)?;
    let again = rerun_config(&fx, &models, false);
    let out = fx.output.clone();
    let bin = fx.bin.clone();

    assert!(phylogenetic::run(Arc::new(fx.config)).await?.is_success());
    let result = out.join("A/M1/M1_A.results.txt");
    assert!(result.is_file());

    // exits 0 without writing anything
    write_stub(&bin, "codeml", "#!/bin/sh\nexit 0\n")?;
    let summary = phylogenetic::run(Arc::new(again)).await?;

    let node = summary
        .nodes
        .iter()
        .find(|n| n.stage == Stage::FinalModel(ModelVariant::M1))
        .unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(node.diagnostic.as_deref().unwrap_or_default().contains("missing or empty output"));
    assert!(!result.exists());
    // the spine reran and replaced its own outputs
    assert!(out.join("A/RAxML_result.A_output.tree").is_file());
    Ok(())
}
