mod config;
mod logging;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use difflora_core::config::UNetConfig;
use difflora_core::lora::{
    normalize, pack_weights, partition_by_target, write_lora_layers, CheckpointSource, Dialect,
    LoadOptions, LoraLoader, StateDict, TargetKind, TargetPartition, LORA_WEIGHT_NAME_SAFE,
};
use tracing::info;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "difflora", about = "Inspect and convert LoRA checkpoints for diffusion pipelines")]
struct Cli {
    /// Log level when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect a checkpoint's dialect and summarize its layers per target
    Inspect {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Rewrite a checkpoint into canonical keys with embedded alphas
    Convert {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory to write into
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Name of the written file
        #[arg(long, default_value = LORA_WEIGHT_NAME_SAFE)]
        output_name: String,

        /// Request the legacy pickle format (not writable; fails)
        #[arg(long)]
        unsafe_serialization: bool,
    },
    /// Show or persist configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration file merged with the given overrides
    Show {
        #[command(flatten)]
        overrides: ConfigArgs,
    },
    /// Merge the given overrides into the configuration file
    Save {
        #[command(flatten)]
        overrides: ConfigArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// UNet layers per block, for SGM checkpoints
    #[arg(long)]
    layers_per_block: Option<usize>,

    /// Device to load tensors on (cpu, cuda, cuda:N, metal)
    #[arg(long)]
    device: Option<String>,

    /// Convert floating-point tensors to bf16, fp16 or fp32
    #[arg(long)]
    dtype: Option<String>,

    /// Hub revision for repository sources
    #[arg(long)]
    revision: Option<String>,
}

impl ConfigArgs {
    fn to_config(&self) -> CliConfig {
        CliConfig {
            layers_per_block: self.layers_per_block,
            device: self.device.clone(),
            dtype: self.dtype.clone(),
            revision: self.revision.clone(),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SourceArgs {
    /// Local file, local directory or hub repository id
    source: String,

    /// Weights file inside a directory or repository
    #[arg(long)]
    weight_name: Option<String>,

    /// Subfolder inside a directory or repository
    #[arg(long)]
    subfolder: Option<String>,

    /// Read layers_per_block from a diffusers UNet config.json
    #[arg(long)]
    unet_config: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,
}

impl SourceArgs {
    fn load_options(&self, config: &CliConfig) -> LoadOptions {
        LoadOptions {
            weight_name: self.weight_name.clone(),
            subfolder: self.subfolder.clone(),
            revision: config.revision.clone(),
            ..Default::default()
        }
    }

    /// Overrides from this invocation. An explicit `--layers-per-block`
    /// wins over `--unet-config`.
    fn overrides(&self) -> anyhow::Result<CliConfig> {
        let mut overrides = self.config.to_config();
        if overrides.layers_per_block.is_none() {
            if let Some(path) = &self.unet_config {
                overrides.layers_per_block = Some(UNetConfig::from_file(path)?.layers_per_block);
            }
        }
        Ok(overrides)
    }
}

/// What `inspect` found for one target.
#[derive(Debug, Default, PartialEq)]
struct TargetSummary {
    modules: usize,
    /// Rank to number of modules with that rank.
    ranks: BTreeMap<usize, usize>,
    alphas: Vec<f32>,
}

impl TargetSummary {
    fn from_partition(partition: &TargetPartition) -> Self {
        let mut ranks = BTreeMap::new();
        for (key, tensor) in &partition.state_dict {
            if key.ends_with(".lora_A.weight") {
                if let Some(rank) = tensor.dims().first() {
                    *ranks.entry(*rank).or_insert(0) += 1;
                }
            }
        }
        let mut alphas: Vec<f32> = partition.alphas.values().copied().collect();
        alphas.sort_by(f32::total_cmp);
        alphas.dedup();
        Self {
            modules: partition.num_modules(),
            ranks,
            alphas,
        }
    }
}

fn loader(config: &CliConfig) -> anyhow::Result<LoraLoader> {
    let device = config.device()?;
    Ok(match config.dtype()? {
        Some(dtype) => LoraLoader::new(device, dtype),
        None => LoraLoader::native_dtype(device),
    })
}

fn load_partitions(
    source: &SourceArgs,
    config: &CliConfig,
) -> anyhow::Result<(Dialect, BTreeMap<TargetKind, TargetPartition>)> {
    let state_dict = loader(config)?.load_state_dict(
        CheckpointSource::parse(&source.source),
        &source.load_options(config),
    )?;
    let checkpoint = normalize(state_dict, Some(config.layers_per_block()))?;
    let dialect = checkpoint.dialect;
    Ok((dialect, partition_by_target(checkpoint)?))
}

fn inspect(source: &SourceArgs, config: &CliConfig) -> anyhow::Result<BTreeMap<TargetKind, TargetSummary>> {
    let (dialect, partitions) = load_partitions(source, config)?;
    println!("source:  {}", source.source);
    println!("dialect: {dialect:?}");

    let summaries: BTreeMap<TargetKind, TargetSummary> = partitions
        .iter()
        .map(|(kind, partition)| (*kind, TargetSummary::from_partition(partition)))
        .collect();
    for (kind, summary) in &summaries {
        let ranks: Vec<String> = summary
            .ranks
            .iter()
            .map(|(rank, count)| format!("{rank} (x{count})"))
            .collect();
        println!("{kind}:");
        println!("  modules: {}", summary.modules);
        println!("  ranks:   {}", ranks.join(", "));
        if summary.alphas.is_empty() {
            println!("  alphas:  none");
        } else {
            let alphas: Vec<String> = summary.alphas.iter().map(f32::to_string).collect();
            println!("  alphas:  {}", alphas.join(", "));
        }
    }
    Ok(summaries)
}

fn convert(
    source: &SourceArgs,
    config: &CliConfig,
    output_dir: &Path,
    output_name: &str,
) -> anyhow::Result<Option<PathBuf>> {
    let (dialect, partitions) = load_partitions(source, config)?;
    info!(?dialect, targets = partitions.len(), "converting checkpoint");

    let mut state_dict = StateDict::new();
    for (kind, partition) in partitions {
        state_dict.extend(pack_weights(partition.with_embedded_alphas()?, kind.name()));
    }
    let written = write_lora_layers(
        &state_dict,
        output_dir,
        true,
        Some(output_name),
        config.safe_serialization(),
    )?;
    if let Some(path) = &written {
        println!("{}", path.display());
    }
    Ok(written)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref())?;

    let mut config = CliConfig::load();
    if let Some(path) = CliConfig::default_path() {
        if path.exists() {
            info!(path = %path.display(), "loaded config");
        }
    }

    match cli.command {
        Command::Inspect { source } => {
            config.merge(&source.overrides()?);
            inspect(&source, &config)?;
        }
        Command::Convert {
            source,
            output_dir,
            output_name,
            unsafe_serialization,
        } => {
            let mut overrides = source.overrides()?;
            overrides.output_dir = output_dir;
            if unsafe_serialization {
                overrides.safe_serialization = Some(false);
            }
            config.merge(&overrides);
            convert(&source, &config, &config.output_dir(), &output_name)?;
        }
        Command::Config { action } => match action {
            ConfigAction::Show { overrides } => {
                config.merge(&overrides.to_config());
                print!("{}", config.to_toml()?);
            }
            ConfigAction::Save { overrides } => {
                config.merge(&overrides.to_config());
                let path = config.save()?;
                println!("saved {}", path.display());
            }
        },
    }
    Ok(())
}
