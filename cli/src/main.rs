//! VST CLI: inspect, partition and train variable trees from the command line.
//!
//! # Usage
//!
//! ```text
//! vst init --config train.yaml --out vars.json
//! vst show vars.json
//! vst get vars.json params/dense/kernel
//! vst split vars.json params --selected params.json --rest state.json
//! vst merge params.json state.json --out vars.json
//! vst train --config train.yaml --out ckpt.json
//! vst diff before.json after.json
//! ```

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use varstate_core::checkpoint::{load_tree, save_tree};
use varstate_core::train::Trainer;
use varstate_core::{merge, split, Checkpoint, TrainConfig, TreeDiff, VariableTree};

#[derive(Parser, Debug)]
#[command(name = "vst", about = "Inspect, partition and train variable trees")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every leaf with its shape, plus per-collection totals.
    Show { file: PathBuf },
    /// Print the value at a `/`-separated path as JSON.
    Get { file: PathBuf, path: String },
    /// Move one collection into its own file.
    Split {
        file: PathBuf,
        collection: String,
        #[arg(long)]
        selected: PathBuf,
        #[arg(long)]
        rest: PathBuf,
    },
    /// Combine two trees with disjoint collections.
    Merge {
        a: PathBuf,
        b: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Leaf-level differences between two trees.
    Diff { old: PathBuf, new: PathBuf },
    /// Initialize model variables from a training config.
    Init {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Train on synthetic data and write a checkpoint.
    Train {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        resume: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the default training config as YAML.
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("vst: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(command: Command) -> Result<String> {
    match command {
        Command::Show { file } => Ok(read_tree(&file)?.to_string()),
        Command::Get { file, path } => {
            let tree = read_tree(&file)?;
            let node = tree.get(&path)?;
            Ok(serde_json::to_string_pretty(node)?)
        }
        Command::Split {
            file,
            collection,
            selected,
            rest,
        } => {
            let tree = read_tree(&file)?;
            let (picked, remaining) = split(tree, &collection)?;
            write_tree(&picked, &selected)?;
            write_tree(&remaining, &rest)?;
            Ok(format!(
                "{}: {} leaves -> {}, {} leaves -> {}",
                collection,
                picked.leaf_count(),
                selected.display(),
                remaining.leaf_count(),
                rest.display()
            ))
        }
        Command::Merge { a, b, out } => {
            let merged = merge(read_tree(&a)?, read_tree(&b)?)?;
            write_tree(&merged, &out)?;
            Ok(format!(
                "merged {} collections -> {}",
                merged.len(),
                out.display()
            ))
        }
        Command::Diff { old, new } => {
            let diff = TreeDiff::compute(&read_tree(&old)?, &read_tree(&new)?);
            Ok(render_diff(&diff))
        }
        Command::Init { config, out } => {
            let config = load_config(config.as_deref())?;
            let trainer = Trainer::new(config)?;
            let variables = trainer.state().variables()?;
            write_tree(&variables, &out)?;
            Ok(format!(
                "initialized {} leaves ({} elements) -> {}",
                variables.leaf_count(),
                variables.element_count(),
                out.display()
            ))
        }
        Command::Train {
            config,
            resume,
            out,
        } => {
            let config = load_config(config.as_deref())?;
            let mut trainer = match resume {
                Some(path) => {
                    let ckpt = Checkpoint::load(&path)
                        .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
                    Trainer::resume(config, ckpt)?
                }
                None => Trainer::new(config)?,
            };
            let history = trainer.fit()?;
            let eval_loss = trainer.evaluate()?;
            let ckpt = trainer.checkpoint()?;
            ckpt.save(&out)
                .with_context(|| format!("failed to write {}", out.display()))?;
            let last = history
                .last()
                .map(|m| format!("{:.6}", m.loss))
                .unwrap_or_else(|| "-".into());
            Ok(format!(
                "step {}: train loss {}, eval loss {:.6} -> {}",
                ckpt.step,
                last,
                eval_loss,
                out.display()
            ))
        }
        Command::Config => Ok(TrainConfig::default().to_yaml_string()?),
    }
}

fn read_tree(path: &Path) -> Result<VariableTree> {
    load_tree(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write_tree(tree: &VariableTree, path: &Path) -> Result<()> {
    save_tree(tree, path).with_context(|| format!("failed to write {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<TrainConfig> {
    match path {
        Some(p) => TrainConfig::load(p).with_context(|| format!("failed to load config {}", p.display())),
        None => Ok(TrainConfig::default()),
    }
}

fn render_diff(diff: &TreeDiff) -> String {
    let mut lines = vec![diff.summary()];
    for path in &diff.added {
        lines.push(format!("+ {}", path));
    }
    for path in &diff.removed {
        lines.push(format!("- {}", path));
    }
    for change in &diff.changed {
        match change.max_abs_delta {
            Some(delta) => lines.push(format!("~ {} (max |delta| {:.6})", change.path, delta)),
            None => lines.push(format!(
                "~ {} (shape {:?} -> {:?})",
                change.path, change.old_shape, change.new_shape
            )),
        }
    }
    lines.join("\n")
}
