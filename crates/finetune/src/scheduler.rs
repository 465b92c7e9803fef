use std::f64::consts::PI;

use crate::error::{Result, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one optimizer step and returns the new learning rate.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

/// Linear warmup rate for `step_count` out of `warmup_steps`.
///
/// Returns `None` once warmup is over, or when it is disabled.
pub fn warmup_lr(base_lr: f64, step_count: usize, warmup_steps: usize) -> Option<f64> {
    if warmup_steps == 0 || step_count > warmup_steps {
        return None;
    }
    Some(base_lr * step_count as f64 / warmup_steps as f64)
}

/// Cosine decay from `base_lr` to `eta_min` over `t_max` steps, then flat.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f64,
    eta_min: f64,
    t_max: usize,
    step: usize,
    current_lr: f64,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, eta_min: f64, t_max: usize) -> Result<Self> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(0.0..=base_lr).contains(&eta_min) {
            return Err(TrainingError::initialization(
                "scheduler eta_min must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            base_lr,
            eta_min,
            t_max: t_max.max(1),
            step: 0,
            current_lr: base_lr,
        })
    }

    /// Schedule that decays over the steps left after warmup.
    pub fn after_warmup(base_lr: f64, planned_steps: usize, warmup_steps: usize) -> Result<Self> {
        Self::new(base_lr, 0.0, planned_steps.saturating_sub(warmup_steps))
    }

    pub fn t_max(&self) -> usize {
        self.t_max
    }

    fn lr_at(&self, step: usize) -> f64 {
        let progress = step.min(self.t_max) as f64 / self.t_max as f64;
        self.eta_min + (self.base_lr - self.eta_min) * 0.5 * (1.0 + f64::cos(PI * progress))
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.lr_at(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn warmup_is_linear_in_step_count() {
        assert_eq!(warmup_lr(3e-4, 0, 100), Some(0.0));
        assert_relative_eq!(warmup_lr(3e-4, 50, 100).unwrap_or_default(), 1.5e-4);
        assert_relative_eq!(warmup_lr(3e-4, 100, 100).unwrap_or_default(), 3e-4);
        assert_eq!(warmup_lr(3e-4, 101, 100), None);
        assert_eq!(warmup_lr(3e-4, 0, 0), None);
    }

    #[test]
    fn cosine_reaches_half_then_floor() -> Result<()> {
        let mut sched = CosineAnnealing::after_warmup(1.0, 104, 100)?;
        assert_eq!(sched.t_max(), 4);
        assert_eq!(sched.learning_rate(), 1.0);
        sched.step();
        let half = sched.step();
        assert_relative_eq!(half, 0.5, epsilon = 1e-12);
        sched.step();
        assert_relative_eq!(sched.step(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(sched.step(), 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn warmup_longer_than_run_still_builds() -> Result<()> {
        let sched = CosineAnnealing::after_warmup(3e-4, 10, 100)?;
        assert_eq!(sched.t_max(), 1);
        assert!(CosineAnnealing::new(0.0, 0.0, 5).is_err());
        Ok(())
    }
}
