//! Optimizers over the adapter parameters.
//!
//! Gradients are accumulated into a [`GradientBuffer`] across micro-batches
//! and handed to [`TrainerOptimizer::step`] once per optimizer step. Updates
//! are computed in `f32`; parameters stored in a half dtype keep an `f32`
//! master copy.

pub mod scaler;

pub use scaler::{GradientScaler, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};

use crate::{
    config::OptimizerKind,
    error::{to_runtime_error, Result, TrainingError},
};

const LION_BETAS: (f64, f64) = (0.9, 0.99);
const ADAMW_BETAS: (f64, f64) = (0.9, 0.999);
const ADAMW_EPS: f64 = 1e-8;

/// Sums per-parameter gradients over micro-batches.
#[derive(Debug)]
pub struct GradientBuffer {
    params: Vec<Var>,
    grads: Vec<Option<Tensor>>,
}

impl GradientBuffer {
    pub fn new(params: &[(String, Var)]) -> Self {
        Self {
            params: params.iter().map(|(_, var)| var.clone()).collect(),
            grads: vec![None; params.len()],
        }
    }

    /// Adds the gradients found in `store` for every tracked parameter.
    pub fn accumulate(&mut self, store: &GradStore) -> Result<()> {
        for (slot, param) in self.grads.iter_mut().zip(&self.params) {
            let Some(grad) = store.get(param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            *slot = Some(match slot.take() {
                Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.grads.iter().all(Option::is_none)
    }

    /// Drains the accumulated gradients, one entry per parameter.
    pub fn take(&mut self) -> Vec<Option<Tensor>> {
        std::mem::replace(&mut self.grads, vec![None; self.params.len()])
    }
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Tensor>,
    first_moment: Tensor,
    second_moment: Option<Tensor>,
}

/// Lion or (paged) AdamW over named adapter parameters.
#[derive(Debug)]
pub struct TrainerOptimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    weight_decay: f64,
    params: Vec<ParameterSlot>,
    step: usize,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        kind: OptimizerKind,
        learning_rate: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        if named_parameters.is_empty() {
            log::warn!("optimizer has no trainable parameters; steps will not change the model");
        }
        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            let state_device = match kind {
                OptimizerKind::PagedAdamW => Device::Cpu,
                _ => tensor.device().clone(),
            };
            let zeros = || {
                Tensor::zeros(tensor.dims(), DType::F32, &state_device).map_err(to_runtime_error)
            };
            let first_moment = zeros()?;
            let second_moment = match kind {
                OptimizerKind::Lion => None,
                _ => Some(zeros()?),
            };
            let dtype = tensor.dtype();
            let master = if dtype == DType::F32 {
                None
            } else {
                Some(tensor.to_dtype(DType::F32).map_err(to_runtime_error)?)
            };
            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }
        Ok(Self {
            kind,
            learning_rate,
            weight_decay,
            params,
            step: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    /// Applies one update; `grads[i]` belongs to the `i`-th parameter.
    ///
    /// With no parameters this only advances the step counter.
    pub fn step(&mut self, grads: &[Option<Tensor>]) -> Result<()> {
        if grads.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "expected {} gradients, received {}",
                self.params.len(),
                grads.len()
            )));
        }
        self.step += 1;
        let (lr, wd, step, kind) = (self.learning_rate, self.weight_decay, self.step, self.kind);
        for (slot, grad) in self.params.iter_mut().zip(grads) {
            let Some(grad) = grad else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let next = match kind {
                OptimizerKind::Lion => lion_update(slot, &grad, lr, wd),
                OptimizerKind::AdamW | OptimizerKind::PagedAdamW => {
                    adamw_update(slot, &grad, lr, wd, step)
                }
            }
            .map_err(to_runtime_error)?;
            write_back(slot, next).map_err(to_runtime_error)?;
        }
        Ok(())
    }
}

fn current_value(slot: &ParameterSlot) -> candle_core::Result<Tensor> {
    match &slot.master {
        Some(master) => Ok(master.clone()),
        None => slot.param.as_tensor().to_dtype(DType::F32),
    }
}

fn write_back(slot: &mut ParameterSlot, next: Tensor) -> candle_core::Result<()> {
    if slot.master.is_some() {
        slot.param.set(&next.to_dtype(slot.dtype)?)?;
        slot.master = Some(next);
    } else {
        slot.param.set(&next)?;
    }
    Ok(())
}

fn sign(tensor: &Tensor) -> candle_core::Result<Tensor> {
    let positive = tensor.gt(0f32)?.to_dtype(DType::F32)?;
    let negative = tensor.lt(0f32)?.to_dtype(DType::F32)?;
    positive - negative
}

fn lion_update(
    slot: &mut ParameterSlot,
    grad: &Tensor,
    lr: f64,
    wd: f64,
) -> candle_core::Result<Tensor> {
    let (beta1, beta2) = LION_BETAS;
    let device = grad.device();
    let moment = slot.first_moment.to_device(device)?;
    let interpolated = (moment.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
    let update = sign(&interpolated)?.affine(lr, 0.0)?;
    let next = (current_value(slot)?.affine(1.0 - lr * wd, 0.0)? - update)?;
    let moment = (moment.affine(beta2, 0.0)? + grad.affine(1.0 - beta2, 0.0)?)?;
    slot.first_moment = moment.to_device(slot.first_moment.device())?;
    Ok(next)
}

fn adamw_update(
    slot: &mut ParameterSlot,
    grad: &Tensor,
    lr: f64,
    wd: f64,
    step: usize,
) -> candle_core::Result<Tensor> {
    let (beta1, beta2) = ADAMW_BETAS;
    let device = grad.device();
    let state_device = slot.first_moment.device().clone();
    let m = slot.first_moment.to_device(device)?;
    let v = match &slot.second_moment {
        Some(v) => v.to_device(device)?,
        None => grad.zeros_like()?,
    };
    let m = (m.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
    let v = (v.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
    let m_hat = m.affine(1.0 / (1.0 - beta1.powi(step as i32)), 0.0)?;
    let v_hat = v.affine(1.0 / (1.0 - beta2.powi(step as i32)), 0.0)?;
    let update = m_hat
        .div(&v_hat.sqrt()?.affine(1.0, ADAMW_EPS)?)?
        .affine(lr, 0.0)?;
    let next = (current_value(slot)?.affine(1.0 - lr * wd, 0.0)? - update)?;
    slot.first_moment = m.to_device(&state_device)?;
    slot.second_moment = Some(v.to_device(&state_device)?);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn param(values: &[f32]) -> candle_core::Result<Var> {
        Var::from_slice(values, values.len(), &Device::Cpu)
    }

    #[test]
    fn lion_moves_by_learning_rate_times_sign() -> Result<()> {
        let var = param(&[1.0, -1.0, 0.5])?;
        let mut optimizer =
            TrainerOptimizer::new(vec![("w.lora_A".into(), var.clone())], OptimizerKind::Lion, 0.1, 0.0)?;
        let grad = Tensor::from_slice(&[2.0f32, -3.0, 0.0], 3, &Device::Cpu)?;
        optimizer.step(&[Some(grad)])?;
        let values = var.as_tensor().to_vec1::<f32>()?;
        assert_relative_eq!(values[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(values[1], -0.9, epsilon = 1e-6);
        assert_relative_eq!(values[2], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn lion_applies_decoupled_weight_decay() -> Result<()> {
        let var = param(&[2.0])?;
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var.clone())], OptimizerKind::Lion, 0.1, 0.5)?;
        optimizer.step(&[Some(Tensor::from_slice(&[1.0f32], 1, &Device::Cpu)?)])?;
        // 2 * (1 - 0.05) - 0.1
        assert_relative_eq!(var.as_tensor().to_vec1::<f32>()?[0], 1.8, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn adamw_first_step_is_learning_rate_sized() -> Result<()> {
        for kind in [OptimizerKind::AdamW, OptimizerKind::PagedAdamW] {
            let var = param(&[1.0, 1.0])?;
            let mut optimizer = TrainerOptimizer::new(vec![("w".into(), var.clone())], kind, 0.01, 0.0)?;
            optimizer.step(&[Some(Tensor::from_slice(&[0.5f32, -4.0], 2, &Device::Cpu)?)])?;
            let values = var.as_tensor().to_vec1::<f32>()?;
            assert_relative_eq!(values[0], 0.99, epsilon = 1e-5);
            assert_relative_eq!(values[1], 1.01, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn missing_gradients_leave_parameters_untouched() -> Result<()> {
        let var = param(&[3.0])?;
        let mut optimizer = TrainerOptimizer::new(vec![("w".into(), var.clone())], OptimizerKind::Lion, 0.1, 0.1)?;
        optimizer.step(&[None])?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![3.0]);
        assert!(optimizer.step(&[]).is_err());
        Ok(())
    }

    #[test]
    fn empty_parameter_list_steps_without_error() -> Result<()> {
        let mut optimizer = TrainerOptimizer::new(Vec::new(), OptimizerKind::AdamW, 0.1, 0.0)?;
        assert_eq!(optimizer.parameter_names().count(), 0);
        optimizer.step(&[])?;
        assert_eq!(optimizer.steps_taken(), 1);
        assert!(optimizer.step(&[None]).is_err());

        let mut buffer = GradientBuffer::new(&[]);
        assert!(buffer.take().is_empty());
        Ok(())
    }

    #[test]
    fn buffer_sums_micro_batches() -> Result<()> {
        let var = param(&[1.0, 2.0])?;
        let mut buffer = GradientBuffer::new(&[("w".into(), var.clone())]);
        for _ in 0..3 {
            let loss = var.as_tensor().sum_all()?;
            buffer.accumulate(&loss.backward()?)?;
        }
        let grads = buffer.take();
        let summed = grads[0].as_ref().map(|g| g.to_vec1::<f32>()).transpose()?;
        assert_eq!(summed, Some(vec![3.0, 3.0]));
        assert!(buffer.is_empty());
        Ok(())
    }
}
