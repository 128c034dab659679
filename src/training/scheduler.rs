use crate::training::optimizer::TrainOptimizer;
use serde::{Deserialize, Serialize};

/// Learning rate schedule shape, as a factor on each group's initial rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant,
    /// Step decay: multiply by gamma every step_size steps
    Step { step_size: usize, gamma: f64 },
    /// Exponential decay: gamma^step
    Exponential { gamma: f64 },
    /// Cosine annealing down to `min_factor`
    Cosine { t_max: usize, min_factor: f64 },
    /// Cosine annealing with warm restarts
    CosineWithRestarts { t_0: usize, t_mult: usize, min_factor: f64 },
    /// Linear decay to zero
    Linear { total_steps: usize },
}

impl LearningRateScheduler {
    /// Factor applied to the initial rate at `step`
    pub fn factor(&self, step: usize) -> f64 {
        match *self {
            Self::Constant => 1.0,
            Self::Step { step_size, gamma } => gamma.powi((step / step_size.max(1)) as i32),
            Self::Exponential { gamma } => gamma.powi(step as i32),
            Self::Cosine { t_max, min_factor } => {
                if step >= t_max {
                    min_factor
                } else {
                    cosine(step as f64 / t_max as f64, min_factor)
                }
            }
            Self::CosineWithRestarts { t_0, t_mult, min_factor } => {
                // Find current restart period
                let mut t_cur = step;
                let mut t_i = t_0.max(1);
                while t_cur >= t_i {
                    t_cur -= t_i;
                    t_i *= t_mult.max(1);
                }
                cosine(t_cur as f64 / t_i as f64, min_factor)
            }
            Self::Linear { total_steps } => {
                if step >= total_steps {
                    0.0
                } else {
                    1.0 - step as f64 / total_steps as f64
                }
            }
        }
    }
}

impl Default for LearningRateScheduler {
    fn default() -> Self {
        Self::Constant
    }
}

fn cosine(progress: f64, min_factor: f64) -> f64 {
    min_factor + (1.0 - min_factor) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
}

/// Schedule plus linear warmup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub schedule: LearningRateScheduler,
    /// Steps of linear warmup from zero
    pub warmup_steps: usize,
}

/// Source of the most recently applied per-group learning rates
pub trait LrSource {
    /// Rates in parameter group order
    fn get_last_lr(&self) -> Vec<f64>;
}

/// Scheduler driving every parameter group of an optimizer
#[derive(Debug, Clone)]
pub struct GroupScheduler {
    config: SchedulerConfig,
    base_lrs: Vec<f64>,
    current_step: usize,
    last_lr: Vec<f64>,
}

impl GroupScheduler {
    /// Create a scheduler for explicit base rates
    pub fn new(config: SchedulerConfig, base_lrs: Vec<f64>) -> Self {
        let mut scheduler = Self {
            config,
            last_lr: Vec::with_capacity(base_lrs.len()),
            base_lrs,
            current_step: 0,
        };
        scheduler.last_lr = scheduler.lrs_at(0);
        scheduler
    }

    /// Create a scheduler from the optimizer's initial group rates
    pub fn for_optimizer(config: SchedulerConfig, optimizer: &TrainOptimizer) -> Self {
        let base_lrs = optimizer
            .param_groups()
            .iter()
            .map(|group| group.initial_lr)
            .collect();
        Self::new(config, base_lrs)
    }

    /// Rates for every group at `step`
    pub fn lrs_at(&self, step: usize) -> Vec<f64> {
        let warmup = if step < self.config.warmup_steps {
            (step + 1) as f64 / (self.config.warmup_steps + 1) as f64
        } else {
            1.0
        };
        let post_warmup = step.saturating_sub(self.config.warmup_steps);
        let factor = warmup * self.config.schedule.factor(post_warmup);
        self.base_lrs.iter().map(|lr| lr * factor).collect()
    }

    /// Advance one step and push the new rates into the optimizer
    pub fn step(&mut self, optimizer: &mut TrainOptimizer) {
        self.current_step += 1;
        self.last_lr = self.lrs_at(self.current_step);
        optimizer.set_lrs(&self.last_lr);
    }

    /// Steps taken
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

impl LrSource for GroupScheduler {
    fn get_last_lr(&self) -> Vec<f64> {
        self.last_lr.clone()
    }
}
