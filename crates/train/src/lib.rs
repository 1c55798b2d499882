//! # bitvit-train: training loop
//!
//! Training, evaluation and scheduling for quantised Vision Transformers:
//!
//! * **[`Trainer`]**: owns model + optimiser + schedule. One call to
//!   [`Trainer::step`] runs forward, backward, gradient clipping, AdamW and
//!   schedule advancement; [`Trainer::fit`] drives whole epochs, evaluates
//!   and keeps the best checkpoint.
//! * **[`LrScheduler`]**: warmup → cosine / linear / step / constant.

pub mod scheduler;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{
    count_correct, cross_entropy_with_label_smoothing, EpochMetrics, FitSummary, StepMetrics,
    Trainer, TrainerConfig,
};
