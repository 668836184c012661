// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use sc_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with a local Euclidean gradient accumulator.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Returns the currently accumulated gradient, if any.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient update into the local buffer.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Applies plain gradient descent with the supplied learning rate and
    /// resets the accumulator.
    pub fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_mut() {
            self.value.add_scaled(grad, -lr)?;
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
        Ok(())
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn accumulators_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// High-level module trait inspired by PyTorch's `nn.Module` but expressed in
/// pure Rust.
///
/// Activations travel as `(batch, features)` tensors. Spatial layers read the
/// feature axis as channel-major planes of the `(height, width)` they were
/// constructed for.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Recomputes the forward activations inside `backward`. Unlike
    /// [`Module::forward`] it never folds batch statistics into running
    /// estimates, so one training step updates them exactly once.
    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward(input)
    }

    /// Propagates a gradient backwards. Implementations should populate the
    /// relevant parameter accumulators before returning the gradient with
    /// respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits non-trainable state (running statistics) by name.
    fn visit_buffers(
        &self,
        _visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    /// Visits non-trainable state mutably.
    fn visit_buffers_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    /// Switches between batch statistics (training) and running statistics
    /// (inference). Stateless layers ignore the flag; containers forward it.
    fn set_training(&self, _training: bool) {}

    /// Reports the `(channels, height, width)` produced by spatial layers.
    /// Shape-preserving and non-spatial modules return `None`.
    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        None
    }

    /// Applies every parameter update.
    fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(lr))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Number of scalar parameters owned by the module.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0usize;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter and buffer keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        self.visit_buffers(&mut |name, buffer| {
            state.insert(name.to_string(), buffer.clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters and buffers from a state dictionary produced by
    /// [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })?;
        self.visit_buffers_mut(&mut |name, buffer| {
            let Some(value) = state.get(name) else {
                return Err(TensorError::MissingParameter {
                    name: name.to_string(),
                });
            };
            if value.shape() != buffer.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: buffer.shape(),
                    right: value.shape(),
                });
            }
            *buffer = value.clone();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_accumulates_and_steps() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 3).unwrap());
        let update = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[2.0, -4.0, 1.0]);
        assert!((param.accumulators_norm_sq() - 21.0).abs() < 1e-9);

        param.apply_step(0.5).unwrap();
        assert_eq!(param.value().data(), &[-1.0, 2.0, -0.5]);
        assert_eq!(param.accumulators_norm_sq(), 0.0);
    }

    #[test]
    fn parameter_rejects_mismatched_updates() {
        let mut param = Parameter::new("gate", Tensor::zeros(2, 2).unwrap());
        let update = Tensor::zeros(1, 4).unwrap();
        assert!(matches!(
            param.accumulate_euclidean(&update),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(param.load_value(&update).is_err());
    }
}
