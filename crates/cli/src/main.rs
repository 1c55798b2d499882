use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};

use bitvit_common::{BatchDataset, BitVitConfig, DeviceChoice, ImageDataset, Split};
use bitvit_core::{compression_stats, BitVisionTransformer};
use bitvit_train::{LrDecay, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "bitvit", about = "Train and inspect quantised Vision Transformers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on CIFAR-10 from scratch or resume from saved weights.
    Train(TrainArgs),
    /// Evaluate a trained model directory on the CIFAR-10 test split.
    Eval(EvalArgs),
    /// Print parameter counts and ternary weight distributions.
    Inspect(InspectArgs),
    /// Write the default model config.
    InitConfig(InitConfigArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Directory with the CIFAR-10 binary files.
    #[arg(long, default_value = "data/cifar-10-batches-bin")]
    data_dir: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 3e-4)]
    lr: f64,
    #[arg(long, default_value_t = 0.0)]
    lr_min: f64,
    #[arg(long, default_value_t = 0)]
    lr_warmup_steps: usize,
    #[arg(long, default_value_t = 1e-4)]
    weight_decay: f64,
    /// Fraction of each split to use, sampled per class (1.0 = everything).
    #[arg(long, default_value_t = 0.1)]
    dataset_size: f64,
    #[arg(long, default_value = "step", value_parser = ["cosine", "linear", "step", "none"])]
    lr_decay: String,
    /// Epochs between learning-rate drops for `step` decay.
    #[arg(long, default_value_t = 5)]
    lr_step_epochs: usize,
    #[arg(long, default_value_t = 0.5)]
    lr_gamma: f64,
    #[arg(long, default_value_t = 0.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f64,
    /// Save a numbered checkpoint every N epochs (0 = only best and final).
    #[arg(long, default_value_t = 0)]
    save_every: usize,
    #[arg(long, default_value_t = 50)]
    log_every: usize,
    #[arg(long, default_value_t = 0)]
    debug_every: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Override the device from the config (cpu, cuda, metal, auto).
    #[arg(long)]
    device: Option<DeviceChoice>,
    /// Safetensors file to initialise the weights from.
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Optimiser steps already completed by the run being resumed.
    #[arg(long, default_value_t = 0, requires = "resume")]
    resume_step: usize,
}

// ── Eval / Inspect / Init ──────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvalArgs {
    /// Directory containing config.json and the weights.
    #[arg(long)]
    model_dir: PathBuf,
    /// Weights file inside `model_dir`.
    #[arg(long, default_value = "best.safetensors")]
    weights: String,
    #[arg(long, default_value = "data/cifar-10-batches-bin")]
    data_dir: PathBuf,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 1.0)]
    dataset_size: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long)]
    device: Option<DeviceChoice>,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Optional safetensors file; prints per-layer ternary distributions.
    #[arg(long)]
    weights: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn load_or_create_config(path: &Path) -> Result<BitVitConfig> {
    if path.exists() {
        return BitVitConfig::load(path);
    }
    let default = BitVitConfig::default();
    default.save(path)?;
    tracing::info!(path = %path.display(), "Created default config");
    Ok(default)
}

fn subset_ratio(dataset_size: f64) -> Option<f64> {
    (dataset_size < 1.0).then_some(dataset_size)
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = load_or_create_config(&args.config)?;
    model_config.validate()?;

    let subset = subset_ratio(args.dataset_size);
    let train = ImageDataset::load_cifar10(&args.data_dir, Split::Train, subset, args.seed)?;
    let test = ImageDataset::load_cifar10(&args.data_dir, Split::Test, subset, args.seed)?;
    anyhow::ensure!(!train.is_empty(), "training split is empty");

    let steps_per_epoch = train.num_batches(args.batch_size);
    let lr_decay = LrDecay::from_name(
        &args.lr_decay,
        args.lr_step_epochs * steps_per_epoch,
        args.lr_gamma,
    )?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        epochs: args.epochs,
        max_steps: args.epochs * steps_per_epoch,
        lr: args.lr,
        lr_min: args.lr_min,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_decay,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        label_smoothing: args.label_smoothing,
        save_every: args.save_every,
        log_every: args.log_every,
        debug_every: args.debug_every,
        seed: args.seed,
        show_progress: true,
        output_dir: args.output_dir.clone(),
    };

    let device = args.device.unwrap_or(model_config.device).resolve()?;
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;
    tracing::info!(device = ?trainer.device(), steps_per_epoch, "Training setup");
    if let Some(ref path) = args.resume {
        trainer.resume(path, args.resume_step)?;
    }

    let summary = trainer.fit(&train, &test)?;
    match summary.best_epoch {
        Some(epoch) => println!(
            "Best test accuracy {:.2}% at epoch {}. Saved to {}",
            summary.best_accuracy,
            epoch + 1,
            args.output_dir.display()
        ),
        None => println!("No epochs run. Saved to {}", args.output_dir.display()),
    }
    Ok(())
}

fn cmd_eval(args: EvalArgs) -> Result<()> {
    let config = BitVitConfig::load(&args.model_dir.join("config.json"))?;
    let device = args.device.unwrap_or(config.device).resolve()?;

    let test = ImageDataset::load_cifar10(
        &args.data_dir,
        Split::Test,
        subset_ratio(args.dataset_size),
        args.seed,
    )?;

    let trainer_config = TrainerConfig {
        batch_size: args.batch_size,
        show_progress: false,
        output_dir: args.model_dir.clone(),
        ..Default::default()
    };
    let mut trainer = Trainer::new(config, trainer_config, device)?;
    trainer.load_weights(&args.model_dir.join(&args.weights))?;

    let (loss, accuracy) = trainer.evaluate(&test)?;
    println!(
        "images {}  loss {loss:.4}  accuracy {accuracy:.2}%",
        test.len()
    );
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let config = BitVitConfig::load(&args.config)?;
    config.validate()?;

    let stats = compression_stats(&config);
    println!("patches:            {}", config.num_patches());
    println!("total params:       {}", stats.total_params);
    println!("quantised params:   {}", stats.quantized_params);
    println!("bits / param:       {:.2}", stats.effective_bits_per_param);
    println!("compression vs f32: {:.2}x", stats.compression_ratio_vs_f32);

    if let Some(ref weights) = args.weights {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &candle_core::Device::Cpu);
        let model = BitVisionTransformer::new(vb, &config)?;
        varmap
            .load(weights)
            .with_context(|| format!("loading weights from {}", weights.display()))?;

        println!();
        for (name, dist) in model.weight_distributions()? {
            println!("{name:<24} {dist}");
        }
    }
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    let config = BitVitConfig::default();
    config.save(&args.output)?;
    println!("Wrote default config to {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_defaults_follow_reference_recipe() {
        let cli = Cli::try_parse_from(["bitvit", "train"]).unwrap();
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.epochs, 10);
        assert_eq!(args.batch_size, 32);
        assert_eq!(args.lr, 3e-4);
        assert_eq!(args.weight_decay, 1e-4);
        assert_eq!(args.lr_decay, "step");
        assert_eq!(args.lr_step_epochs, 5);
        assert_eq!(args.lr_gamma, 0.5);
        assert!(args.device.is_none());
    }

    #[test]
    fn resume_step_needs_resume_path() {
        let cli = Cli::try_parse_from([
            "bitvit",
            "train",
            "--resume",
            "ckpt/checkpoint-400.safetensors",
            "--resume-step",
            "400",
        ])
        .unwrap();
        let Command::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.resume_step, 400);
        assert!(args.resume.is_some());

        assert!(Cli::try_parse_from(["bitvit", "train", "--resume-step", "4"]).is_err());
    }

    #[test]
    fn parses_device_and_rejects_unknown_decay() {
        let cli = Cli::try_parse_from(["bitvit", "eval", "--model-dir", "m", "--device", "cpu"])
            .unwrap();
        let Command::Eval(args) = cli.command else {
            panic!("expected eval");
        };
        assert_eq!(args.device, Some(DeviceChoice::Cpu));

        assert!(Cli::try_parse_from(["bitvit", "train", "--lr-decay", "exp"]).is_err());
    }

    #[test]
    fn init_config_then_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        cmd_init_config(InitConfigArgs {
            output: path.clone(),
        })
        .unwrap();
        assert_eq!(BitVitConfig::load(&path).unwrap(), BitVitConfig::default());
        cmd_inspect(InspectArgs {
            config: path,
            weights: None,
        })
        .unwrap();
    }

    #[test]
    fn subset_ratio_keeps_full_split_at_one() {
        assert_eq!(subset_ratio(1.0), None);
        assert_eq!(subset_ratio(2.0), None);
        assert_eq!(subset_ratio(0.1), Some(0.1));
    }
}
