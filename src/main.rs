use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tesforge::consistency::ConsistencyAllocator;
use tesforge::load_order::{load_plugins, LoadOrder};
use tesforge::plugin::{Plugin, PluginOptions};
use tesforge::subrecord::{SubrecordRegistry, UnmappedPolicy};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tesforge", about = "Read, rebuild and merge TES plugin files")]
struct Cli {
    /// Treat subrecords with no registered layout as reference-free
    #[arg(long, global = true)]
    assume_opaque: bool,
    /// zlib level for records that must be recompressed (0-9)
    #[arg(long, global = true, default_value = "6")]
    level: u32,
    /// Keep the HEDR record count as stored instead of recounting
    #[arg(long, global = true)]
    keep_record_count: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a plugin's masters and groups
    Info {
        input: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a plugin and write it back out
    Rebuild {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Reduce the masters to the ones records reference, ordered by
        /// this plugins.txt
        #[arg(long)]
        load_order: Option<PathBuf>,
        /// Folder holding .consistency files for new records
        #[arg(long)]
        consistency: Option<PathBuf>,
    },
    /// Merge the plugins of a load order into one
    Merge {
        /// plugins.txt listing the plugins to merge, in order
        #[arg(long)]
        plugins: PathBuf,
        /// Folder containing the plugin files
        #[arg(long)]
        data: PathBuf,
        /// Load order the merged plugin's masters are sorted by
        #[arg(long)]
        load_order: PathBuf,
        /// File name of the merged plugin
        #[arg(long)]
        name: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = ".")]
        consistency: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = if cli.assume_opaque {
        SubrecordRegistry::skyrim().with_policy(UnmappedPolicy::AssumeOpaque)
    } else {
        SubrecordRegistry::skyrim()
    };
    let options = PluginOptions {
        compression_level:    cli.level,
        refresh_record_count: !cli.keep_record_count,
    };

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let plugin = read_plugin(&input)?;
            let summary = plugin.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            println!("── {} ──────────────────────────────────────────", summary.name);
            println!("  Master file    {}", summary.master);
            println!("  Author         {}", plugin.author().unwrap_or_default());
            println!("  Description    {}", plugin.description().unwrap_or_default());
            println!("  Records        {}", summary.records);
            println!("  Masters ({}):", summary.masters.len());
            for (i, m) in summary.masters.iter().enumerate() {
                println!("    {:02X}  {}", i, m);
            }
            println!("  {:<6} {:>8} {:>6} {:>8}", "Group", "Records", "New", "Deleted");
            for g in &summary.groups {
                println!("  {:<6} {:>8} {:>6} {:>8}", g.label, g.records, g.new, g.deleted);
            }
        }

        // ── Rebuild ──────────────────────────────────────────────────────────
        Commands::Rebuild { input, output, load_order, consistency } => {
            let plugin = read_plugin(&input)?;
            let allocator = match consistency {
                Some(folder) => ConsistencyAllocator::new(folder),
                None         => ConsistencyAllocator::in_memory(),
            };
            let mut out = Vec::new();
            match load_order {
                Some(path) => {
                    let order = LoadOrder::read(path)?.with(plugin.name());
                    plugin.render(order.plugins(), &registry, &allocator, &options, &mut out)?;
                }
                None => {
                    let masters = plugin.masters().masters().to_vec();
                    plugin.render_with_masters(&masters, &registry, &allocator, &options, &mut out)?;
                }
            }
            std::fs::write(&output, &out)?;
            println!("Rebuilt {} → {} ({} bytes)", input.display(), output.display(), out.len());
        }

        // ── Merge ────────────────────────────────────────────────────────────
        Commands::Merge { plugins, data, load_order, name, output, consistency } => {
            let inputs = load_plugins(&LoadOrder::read(&plugins)?, &data)?;
            let merged = Plugin::merge(&name, &inputs, &registry)?;
            let order = LoadOrder::read(&load_order)?.with(&name);
            let allocator = ConsistencyAllocator::new(consistency);
            let mut out = Vec::new();
            merged.render(order.plugins(), &registry, &allocator, &options, &mut out)?;
            std::fs::write(&output, &out)?;
            println!("Merged {} plugin(s) into {} ({} records)", inputs.len(), output.display(), merged.records().count());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn read_plugin(path: &PathBuf) -> Result<Plugin, Box<dyn std::error::Error>> {
    let name = path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| format!("{} has no file name", path.display()))?;
    let bytes = std::fs::read(path)?;
    Ok(Plugin::parse(&name, &bytes)?)
}
