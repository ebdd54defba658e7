use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memotask::config::DEFAULT_NAMESPACE_ROOT;
use memotask::service::PendingCallbackRecord;
use memotask::{DurabilityMode, MemoryDataStore};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "memotask-tool")]
#[command(about = "Operator tooling for MemoTask pending callback stores")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print pending callback records
    List {
        #[arg(long)]
        data_dir: PathBuf,
        /// Only records owned by this node
        #[arg(long)]
        node: Option<String>,
        #[arg(long, default_value = DEFAULT_NAMESPACE_ROOT)]
        root: String,
    },
    /// Write a snapshot and truncate the write-ahead log
    Checkpoint {
        #[arg(long)]
        data_dir: PathBuf,
    },
    /// Count pending records per node
    Stats {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value = DEFAULT_NAMESPACE_ROOT)]
        root: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::List {
            data_dir,
            node,
            root,
        } => list(&data_dir, node.as_deref(), &root),
        Command::Checkpoint { data_dir } => {
            let store = open_store(&data_dir)?;
            let count = store.binding_count()?;
            store
                .checkpoint()
                .with_context(|| format!("Failed to checkpoint '{}'", data_dir.display()))?;
            println!("Checkpointed {} bindings in {}", count, data_dir.display());
            Ok(())
        }
        Command::Stats { data_dir, root } => stats(&data_dir, &root),
    }
}

fn open_store(data_dir: &Path) -> Result<Arc<MemoryDataStore>> {
    if !data_dir.is_dir() {
        anyhow::bail!("Data directory '{}' does not exist", data_dir.display());
    }
    MemoryDataStore::open(data_dir, DurabilityMode::Sync, usize::MAX)
        .with_context(|| format!("Failed to open store in '{}'", data_dir.display()))
}

/// Splits `<root><node>.<sequence>` into node and sequence.
fn split_name<'a>(name: &'a str, root: &str) -> Option<(&'a str, &'a str)> {
    name.strip_prefix(root)?.rsplit_once('.')
}

fn list(data_dir: &Path, node: Option<&str>, root: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let prefix = match node {
        Some(node) => format!("{}{}.", root, node),
        None => root.to_string(),
    };
    let names = store.committed_names(&prefix)?;
    if names.is_empty() {
        println!("No pending callback records under '{}'", prefix);
        return Ok(());
    }
    for name in names {
        let Some(value) = store.committed_value(&name)? else {
            continue;
        };
        match PendingCallbackRecord::from_value(value) {
            Ok(record) => println!(
                "{}\towner={}\ttarget={}\tcreated={}",
                name,
                record.owner,
                record.target.kind_label(),
                record.created_at.to_rfc3339()
            ),
            Err(err) => println!("{}\t<unreadable: {}>", name, err),
        }
    }
    Ok(())
}

fn stats(data_dir: &Path, root: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let mut per_node: BTreeMap<String, usize> = BTreeMap::new();
    for name in store.committed_names(root)? {
        if let Some((node, _)) = split_name(&name, root) {
            *per_node.entry(node.to_string()).or_default() += 1;
        }
    }
    println!("Bindings: {}", store.binding_count()?);
    if per_node.is_empty() {
        println!("No pending callback records");
    }
    for (node, count) in per_node {
        println!("{}\t{}", node, count);
    }
    Ok(())
}
