//! Learning rate schedule.

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Learning rate schedule: warmup → cosine / linear / step / constant decay.
#[derive(Clone)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrDecay {
    Cosine,
    Linear,
    /// Multiply the rate by `gamma` every `step_size` optimiser steps.
    Step { step_size: usize, gamma: f64 },
    None,
}

impl LrDecay {
    /// Parse a decay name. `step` uses the given `step_size` and `gamma`.
    pub fn from_name(name: &str, step_size: usize, gamma: f64) -> anyhow::Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "step" => {
                anyhow::ensure!(step_size > 0, "step decay needs step_size > 0");
                anyhow::ensure!(
                    gamma > 0.0 && gamma <= 1.0,
                    "step decay gamma must be in (0, 1], got {gamma}"
                );
                Ok(Self::Step { step_size, gamma })
            }
            "none" => Ok(Self::None),
            other => anyhow::bail!("unknown lr decay '{other}' (cosine|linear|step|none)"),
        }
    }
}

impl LrScheduler {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_steps: usize,
        max_steps: usize,
        decay: LrDecay,
    ) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    /// Current learning rate at the current step.
    pub fn current_lr(&self) -> f64 {
        let step = self.step;

        // Warmup phase: linear ramp from 0 to lr.
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }
        let since_warmup = step - self.warmup_steps;

        // Step decay does not depend on max_steps.
        if let LrDecay::Step { step_size, gamma } = self.decay {
            let drops = since_warmup / step_size.max(1);
            return self.lr * gamma.powi(drops as i32);
        }

        if self.max_steps == 0 || self.decay == LrDecay::None {
            return self.lr;
        }

        let step = step.min(self.max_steps);
        if step <= self.warmup_steps {
            return self.lr;
        }

        let decay_steps = (self.max_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;

        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::Step { .. } | LrDecay::None => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Jump to an absolute step.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
