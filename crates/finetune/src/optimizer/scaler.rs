//! Dynamic loss scaling for `16-mixed` runs.
//!
//! Only float16 autocast can underflow small gradients, so every other
//! precision gets a pass-through scaler.

use candle_core::{DType, Tensor};
use layers::Precision;

use crate::error::{to_runtime_error, Result};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(16),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    fn sanitized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(0.0..1.0).contains(&self.backoff_factor) || self.backoff_factor == 0.0 {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

#[derive(Debug, Clone)]
struct ScaleState {
    scale: f32,
    clean_steps: usize,
    config: LossScaleConfig,
}

/// Scales the loss before backward and unscales gradients before the update.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: Option<ScaleState>,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision != Precision::F16Mixed {
            return Self { state: None };
        }
        let config = config.sanitized();
        Self {
            state: Some(ScaleState {
                scale: config.initial_scale,
                clean_steps: 0,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.state.as_ref().map_or(1.0, |state| state.scale)
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        match &self.state {
            None => Ok(loss.clone()),
            Some(state) => loss.affine(state.scale as f64, 0.0).map_err(to_runtime_error),
        }
    }

    /// Divides every present gradient by the current scale.
    pub fn unscale(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<Option<Tensor>>> {
        let Some(state) = &self.state else {
            return Ok(grads);
        };
        let inverse = 1.0 / state.scale as f64;
        grads
            .into_iter()
            .map(|grad| {
                grad.map(|g| g.affine(inverse, 0.0).map_err(to_runtime_error))
                    .transpose()
            })
            .collect()
    }

    /// True when any gradient holds an inf or NaN; always false when disabled.
    pub fn has_overflow(&self, grads: &[Option<Tensor>]) -> Result<bool> {
        if self.state.is_none() {
            return Ok(false);
        }
        for grad in grads.iter().flatten() {
            if contains_non_finite(grad)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Backs off after an overflow, grows after `growth_interval` clean steps.
    pub fn update(&mut self, found_overflow: bool) {
        let Some(state) = &mut self.state else {
            return;
        };
        if found_overflow {
            state.scale = (state.scale * state.config.backoff_factor).max(state.config.min_scale);
            state.clean_steps = 0;
            return;
        }
        state.clean_steps += 1;
        if state.clean_steps >= state.config.growth_interval {
            state.scale = (state.scale * state.config.growth_factor).min(state.config.max_scale);
            state.clean_steps = 0;
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let total = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_scalar::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!total.is_finite())
}
