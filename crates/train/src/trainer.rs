//! Trainer: encapsulates the full training loop.
//!
//! Decouples the compute graph (forward + loss) from the optimisation step
//! (backward, gradient clipping, AdamW, schedule advance) and from the epoch
//! loop (shuffled batches, evaluation, best-checkpoint tracking).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};

use bitvit_common::{batch_to_tensors, BatchDataset, BitVitConfig};
use bitvit_core::{compression_stats, BitVisionTransformer};

use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Horizon for cosine / linear decay, in optimiser steps (0 = constant).
    pub max_steps: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    /// 0 disables clipping.
    pub grad_clip_max_norm: f64,
    pub label_smoothing: f64,
    /// Save a numbered checkpoint every N epochs (0 = never).
    pub save_every: usize,
    pub log_every: usize,
    pub debug_every: usize,
    /// Base seed for the per-epoch shuffle.
    pub seed: u64,
    pub show_progress: bool,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 10,
            max_steps: 0,
            lr: 3e-4,
            lr_min: 0.0,
            lr_warmup_steps: 0,
            lr_decay: LrDecay::None,
            weight_decay: 1e-4,
            grad_clip_max_norm: 0.0,
            label_smoothing: 0.0,
            save_every: 0,
            log_every: 50,
            debug_every: 0,
            seed: 42,
            show_progress: true,
            output_dir: PathBuf::from("checkpoints"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub correct: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub grad_norm: Option<f64>,
}

impl StepMetrics {
    /// Batch accuracy in percent.
    pub fn accuracy(&self) -> f64 {
        percent(self.correct, self.batch_size)
    }
}

/// Per-epoch summary. Test metrics are filled in by [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub images: usize,
    pub lr: f64,
    pub test_loss: Option<f64>,
    pub test_accuracy: Option<f64>,
}

/// Outcome of a full [`Trainer::fit`] run.
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub history: Vec<EpochMetrics>,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, and LR schedule.
pub struct Trainer {
    pub model: BitVisionTransformer,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    model_config: BitVitConfig,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(
        model_config: BitVitConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(trainer_config.batch_size > 0, "batch_size must be > 0");

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = BitVisionTransformer::new(vb, &model_config)?;
        let vars = varmap.all_vars();

        let stats = compression_stats(&model_config);
        tracing::info!(
            total_params = stats.total_params,
            quantized_params = stats.quantized_params,
            effective_bits = format!("{:.2}", stats.effective_bits_per_param),
            compression = format!("{:.2}x", stats.compression_ratio_vs_f32),
            "Model compression stats"
        );

        let lr_scheduler = LrScheduler::new(
            trainer_config.lr,
            trainer_config.lr_min,
            trainer_config.lr_warmup_steps,
            trainer_config.max_steps,
            trainer_config.lr_decay,
        );

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.lr,
                weight_decay: trainer_config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            config: trainer_config,
            model_config,
            global_step: 0,
            device,
        })
    }

    /// One optimiser step on a `(B, C, H, W)` image batch with `(B,)` u32 labels.
    pub fn step(&mut self, images: &Tensor, labels: &Tensor) -> anyhow::Result<StepMetrics> {
        let batch_size = labels.dim(0)?;

        // Forward + loss
        let logits = self.model.forward_t(images, true)?;
        let loss = cross_entropy_with_label_smoothing(&logits, labels, self.config.label_smoothing)?;
        let loss_val = loss.to_scalar::<f32>()?;
        let correct = count_correct(&logits, labels)?;

        // Backward
        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = loss.backward()?;

        // Debug gradient norm
        let debug_grad_norm =
            if self.config.debug_every > 0 && self.global_step % self.config.debug_every == 0 {
                Some(grad_norm(&grads, &self.vars)?)
            } else {
                None
            };

        // Gradient clipping
        if self.config.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?;
        }

        // Optimiser step
        self.optimizer.step(&grads)?;

        // Advance schedule
        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            correct,
            batch_size,
            lr,
            grad_norm: debug_grad_norm,
        })
    }

    /// Run one pass over `dataset` in a seeded shuffled order.
    pub fn train_epoch(
        &mut self,
        dataset: &impl BatchDataset,
        epoch: usize,
    ) -> anyhow::Result<EpochMetrics> {
        let batch_size = self.config.batch_size;
        let pb = self.progress_bar(dataset.num_batches(batch_size), epoch)?;
        let seed = self.config.seed.wrapping_add(epoch as u64);

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;
        let mut lr = self.lr_scheduler.current_lr();

        for batch in dataset.batches(batch_size, Some(seed)) {
            let (images, labels) =
                batch_to_tensors(&batch, self.model_config.image_size, &self.device)?;
            let m = self.step(&images, &labels)?;

            loss_sum += m.loss as f64 * m.batch_size as f64;
            correct += m.correct;
            seen += m.batch_size;
            lr = m.lr;

            if self.config.log_every > 0 && m.step % self.config.log_every == 0 {
                tracing::debug!(step = m.step, loss = m.loss, lr = m.lr, "train step");
            }
            if let Some(gn) = m.grad_norm {
                tracing::debug!(step = m.step, grad_norm = gn, "gradient norm");
            }

            pb.set_message(format!(
                "loss {:.4} acc {:.2}% lr {:.2e}",
                loss_sum / seen as f64,
                percent(correct, seen),
                m.lr
            ));
            pb.inc(1);
        }
        pb.finish_and_clear();

        anyhow::ensure!(seen > 0, "training dataset is empty");

        Ok(EpochMetrics {
            epoch,
            train_loss: loss_sum / seen as f64,
            train_accuracy: percent(correct, seen),
            images: seen,
            lr,
            test_loss: None,
            test_accuracy: None,
        })
    }

    /// Evaluate in inference mode: returns `(average loss, accuracy %)`.
    pub fn evaluate(&self, dataset: &impl BatchDataset) -> anyhow::Result<(f64, f64)> {
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for batch in dataset.batches(self.config.batch_size, None) {
            let (images, labels) =
                batch_to_tensors(&batch, self.model_config.image_size, &self.device)?;
            let logits = self.model.forward_t(&images, false)?.detach();
            let l = loss::cross_entropy(&logits, &labels)?;
            loss_sum += l.to_scalar::<f32>()? as f64 * batch.len() as f64;
            correct += count_correct(&logits, &labels)?;
            seen += batch.len();
        }

        anyhow::ensure!(seen > 0, "evaluation dataset is empty");
        Ok((loss_sum / seen as f64, percent(correct, seen)))
    }

    /// Train for `config.epochs` epochs, evaluating after each one.
    ///
    /// The checkpoint with the best test accuracy is kept as
    /// `best.safetensors`; the last weights go to `model.safetensors`.
    /// Per-epoch metrics are appended to `metrics.csv`.
    pub fn fit(
        &mut self,
        train: &impl BatchDataset,
        test: &impl BatchDataset,
    ) -> anyhow::Result<FitSummary> {
        let output_dir = self.config.output_dir.clone();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        let metrics_path = output_dir.join("metrics.csv");
        let mut metrics_file = std::fs::File::create(&metrics_path)
            .with_context(|| format!("creating {}", metrics_path.display()))?;
        writeln!(metrics_file, "epoch,train_loss,train_acc,test_loss,test_acc,lr")?;

        tracing::info!(
            epochs = self.config.epochs,
            train_images = train.num_images(),
            test_images = test.num_images(),
            batch_size = self.config.batch_size,
            "Starting training"
        );

        let started = Instant::now();
        let mut history = Vec::with_capacity(self.config.epochs);
        let mut best_accuracy = 0.0f64;
        let mut best_epoch = None;

        for epoch in 0..self.config.epochs {
            let mut m = self.train_epoch(train, epoch)?;
            let (test_loss, test_acc) = self.evaluate(test)?;
            m.test_loss = Some(test_loss);
            m.test_accuracy = Some(test_acc);

            tracing::info!(
                epoch = epoch + 1,
                epochs = self.config.epochs,
                train_loss = format!("{:.4}", m.train_loss),
                train_acc = format!("{:.2}%", m.train_accuracy),
                test_loss = format!("{test_loss:.4}"),
                test_acc = format!("{test_acc:.2}%"),
                "Epoch complete"
            );
            writeln!(
                metrics_file,
                "{},{:.6},{:.4},{:.6},{:.4},{:.3e}",
                epoch + 1,
                m.train_loss,
                m.train_accuracy,
                test_loss,
                test_acc,
                m.lr
            )?;

            if best_epoch.is_none() || test_acc > best_accuracy {
                best_accuracy = test_acc;
                best_epoch = Some(epoch);
                let path = self.save_best()?;
                tracing::info!(path = %path.display(), accuracy = test_acc, "New best model");
            }
            if self.config.save_every > 0 && (epoch + 1) % self.config.save_every == 0 {
                let path = self.save_checkpoint()?;
                tracing::info!(path = %path.display(), "Saved checkpoint");
            }
            history.push(m);
        }

        let path = self.save_final()?;
        tracing::info!(
            best_accuracy = format!("{best_accuracy:.2}%"),
            elapsed_secs = started.elapsed().as_secs(),
            path = %path.display(),
            "Training complete"
        );

        Ok(FitSummary {
            history,
            best_accuracy,
            best_epoch,
        })
    }

    /// Save checkpoint.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        self.save_as(&format!("checkpoint-{}.safetensors", self.global_step))
    }

    /// Save the best-so-far model.
    pub fn save_best(&self) -> anyhow::Result<PathBuf> {
        self.save_as("best.safetensors")
    }

    /// Save final model.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_as("model.safetensors")
    }

    fn save_as(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = self.config.output_dir.join(file_name);
        self.varmap
            .save(&path)
            .with_context(|| format!("saving weights to {}", path.display()))?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Restore parameters from a safetensors file into the live `VarMap`.
    pub fn load_weights(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("loading weights from {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded weights");
        Ok(())
    }

    /// Restore weights and continue counting from `completed_steps`.
    ///
    /// The LR schedule and checkpoint numbering pick up where the earlier run
    /// stopped. AdamW moments are not persisted and restart from zero.
    pub fn resume(&mut self, path: &Path, completed_steps: usize) -> anyhow::Result<()> {
        self.load_weights(path)?;
        self.global_step = completed_steps;
        self.lr_scheduler.set_step(completed_steps);
        tracing::info!(
            step = completed_steps,
            lr = self.lr_scheduler.current_lr(),
            "Resumed training"
        );
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> anyhow::Result<ProgressBar> {
        if !self.config.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_prefix(format!("Epoch {}/{}", epoch + 1, self.config.epochs));
        Ok(pb)
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy with label smoothing.
///
/// `(1 - s) · NLL + s · mean_c(-log p_c)`, averaged over the batch.
pub fn cross_entropy_with_label_smoothing(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
) -> candle_core::Result<Tensor> {
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, labels);
    }
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let nll = loss::nll(&log_probs, labels)?;
    let uniform = log_probs.mean(D::Minus1)?.neg()?.mean_all()?;
    nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?
}

/// Number of rows whose arg-max logit equals the label.
pub fn count_correct(logits: &Tensor, labels: &Tensor) -> candle_core::Result<usize> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as usize)
}

fn percent(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<()> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
