// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::Relu;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// Default running-statistics momentum (weight of the current batch).
pub const DEFAULT_MOMENTUM: f32 = 0.01;
/// Default variance stabiliser.
pub const DEFAULT_EPSILON: f32 = 1e-3;

/// Batch normalisation over channel-major feature planes.
///
/// Each channel is normalised with statistics gathered over the batch and
/// every pixel of its plane. Training mode uses batch statistics and folds
/// them into the running estimates; evaluation mode reads the running
/// estimates and leaves them untouched.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    spatial: (usize, usize),
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
}

impl BatchNorm2d {
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        spatial: (usize, usize),
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 || spatial.0 == 0 || spatial.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: spatial.0 * spatial.1,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        let running_mean = Tensor::zeros(1, channels)?;
        let running_var = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            name,
            channels,
            spatial,
            epsilon,
            momentum,
            running_mean: RefCell::new(running_mean),
            running_var: RefCell::new(running_var),
            training: Cell::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Snapshot of the running mean.
    pub fn running_mean(&self) -> Tensor {
        self.running_mean.borrow().clone()
    }

    /// Snapshot of the running variance.
    pub fn running_var(&self) -> Tensor {
        self.running_var.borrow().clone()
    }

    fn plane(&self) -> usize {
        self.spatial.0 * self.spatial.1
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        let features = self.channels * self.plane();
        if cols != features {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, features),
            });
        }
        Ok(())
    }

    fn compute_stats(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        let batch = input.shape().0;
        let plane = self.plane();
        let count = (batch * plane) as f32;
        let mut mean = vec![0.0f32; self.channels];
        let mut variance = vec![0.0f32; self.channels];
        for b in 0..batch {
            for (c, values) in input.row(b).chunks(plane).enumerate() {
                mean[c] += values.iter().sum::<f32>();
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        for b in 0..batch {
            for (c, values) in input.row(b).chunks(plane).enumerate() {
                variance[c] += values
                    .iter()
                    .map(|v| {
                        let centered = v - mean[c];
                        centered * centered
                    })
                    .sum::<f32>();
            }
        }
        for value in variance.iter_mut() {
            *value /= count;
        }
        (mean, variance)
    }

    fn fold_running(&self, mean: &[f32], variance: &[f32]) {
        let m = self.momentum;
        {
            let mut running_mean = self.running_mean.borrow_mut();
            for (running, batch) in running_mean.data_mut().iter_mut().zip(mean) {
                *running = m * batch + (1.0 - m) * *running;
            }
        }
        let mut running_var = self.running_var.borrow_mut();
        for (running, batch) in running_var.data_mut().iter_mut().zip(variance) {
            *running = m * batch + (1.0 - m) * *running;
        }
    }

    fn statistics(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        if self.training.get() {
            self.compute_stats(input)
        } else {
            (
                self.running_mean.borrow().data().to_vec(),
                self.running_var.borrow().data().to_vec(),
            )
        }
    }

    /// Normalises `input` with the statistics of the current mode. With
    /// `fold` set, training-mode batch statistics also move the running
    /// estimates.
    pub fn normalise(&self, input: &Tensor, fold: bool) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (mean, variance) = self.statistics(input);
        if fold && self.training.get() {
            self.fold_running(&mean, &variance);
        }
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let plane = self.plane();
        let mut output = input.clone();
        {
            let cols = self.channels * plane;
            for row in output.data_mut().chunks_mut(cols) {
                for (c, values) in row.chunks_mut(plane).enumerate() {
                    let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
                    for value in values.iter_mut() {
                        *value = (*value - mean[c]) * inv_std * gamma[c] + beta[c];
                    }
                }
            }
        }
        Ok(output)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalise(input, true)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalise(input, false)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let training = self.training.get();
        let (mean, variance) = self.statistics(input);
        let batch = input.shape().0;
        let plane = self.plane();
        let count = (batch * plane) as f32;
        let gamma = self.gamma.value().data().to_vec();
        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];
        let mut grad_input = Tensor::zeros(batch, self.channels * plane)?;

        for c in 0..self.channels {
            let inv_std = 1.0 / (variance[c] + self.epsilon).sqrt();
            let span = c * plane..(c + 1) * plane;
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            for b in 0..batch {
                let xs = &input.row(b)[span.clone()];
                let gs = &grad_output.row(b)[span.clone()];
                for (x, g) in xs.iter().zip(gs) {
                    let normed = (x - mean[c]) * inv_std;
                    grad_gamma[c] += g * normed;
                    grad_beta[c] += g;
                    sum_grad += g * gamma[c];
                    sum_grad_norm += g * gamma[c] * normed;
                }
            }
            let cols = self.channels * plane;
            let grad_data = grad_input.data_mut();
            for b in 0..batch {
                let xs = &input.row(b)[span.clone()];
                let gs = &grad_output.row(b)[span.clone()];
                let out = &mut grad_data[b * cols + c * plane..b * cols + (c + 1) * plane];
                for ((dst, x), g) in out.iter_mut().zip(xs).zip(gs) {
                    let g_gamma = g * gamma[c];
                    *dst = if training {
                        let normed = (x - mean[c]) * inv_std;
                        (count * g_gamma - sum_grad - normed * sum_grad_norm) / count * inv_std
                    } else {
                        g_gamma * inv_std
                    };
                }
            }
        }

        self.gamma
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, grad_gamma)?)?;
        self.beta
            .accumulate_euclidean(&Tensor::from_vec(1, self.channels, grad_beta)?)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        let mean_name = format!("{}::running_mean", self.name);
        let var_name = format!("{}::running_var", self.name);
        visitor(mean_name.as_str(), &*self.running_mean.borrow())?;
        visitor(var_name.as_str(), &*self.running_var.borrow())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        let mean_name = format!("{}::running_mean", self.name);
        let var_name = format!("{}::running_var", self.name);
        visitor(mean_name.as_str(), self.running_mean.get_mut())?;
        visitor(var_name.as_str(), self.running_var.get_mut())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        Some((self.channels, self.spatial.0, self.spatial.1))
    }
}

/// Normalises `activations` per channel and applies ReLU.
///
/// `is_training` selects batch statistics (and updates the running
/// estimates) or the running estimates (read-only). The layer's own mode is
/// restored before returning.
pub fn batch_norm_relu(
    norm: &BatchNorm2d,
    activations: &Tensor,
    is_training: bool,
) -> PureResult<Tensor> {
    let previous = norm.is_training();
    norm.set_training(is_training);
    let normed = norm.forward(activations);
    norm.set_training(previous);
    Relu::new().forward(&normed?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_input() -> Tensor {
        // Two samples, two channels, 1x2 planes.
        Tensor::from_vec(2, 4, vec![1.0, 3.0, 10.0, 10.0, 5.0, 7.0, 20.0, 40.0]).unwrap()
    }

    #[test]
    fn batch_norm_forward_normalises_each_channel() {
        let norm = BatchNorm2d::new("bn", 2, (1, 2), 0.1, 1e-5).unwrap();
        let output = norm.forward(&demo_input()).unwrap();
        for c in 0..2 {
            let values: Vec<f32> = (0..2)
                .flat_map(|b| output.row(b)[c * 2..(c + 1) * 2].to_vec())
                .collect();
            let mean: f32 = values.iter().sum::<f32>() / 4.0;
            let var: f32 = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        // Channel 0 mean is 4, so the running mean moves 10% of the way there.
        let running = norm.running_mean();
        assert!((running.data()[0] - 0.4).abs() < 1e-6);
        assert!((running.data()[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn evaluation_mode_leaves_running_statistics_untouched() {
        let norm = BatchNorm2d::new("bn", 2, (1, 2), DEFAULT_MOMENTUM, DEFAULT_EPSILON).unwrap();
        norm.forward(&demo_input()).unwrap();
        let mean = norm.running_mean();
        let var = norm.running_var();
        let first = batch_norm_relu(&norm, &demo_input(), false).unwrap();
        let second = batch_norm_relu(&norm, &demo_input(), false).unwrap();
        assert_eq!(first, second);
        assert_eq!(norm.running_mean(), mean);
        assert_eq!(norm.running_var(), var);
        assert!(first.data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn batch_norm_relu_clamps_negative_activations() {
        let norm = BatchNorm2d::new("bn", 2, (1, 2), DEFAULT_MOMENTUM, DEFAULT_EPSILON).unwrap();
        let output = batch_norm_relu(&norm, &demo_input(), true).unwrap();
        assert_eq!(output.shape(), (2, 4));
        // The smallest value of every channel normalises below zero.
        assert_eq!(output.data()[0], 0.0);
        assert_eq!(output.data()[2], 0.0);
        assert!(norm.is_training());
    }

    #[test]
    fn batch_norm_backward_matches_finite_differences() {
        let mut norm = BatchNorm2d::new("bn", 2, (1, 2), 0.1, 1e-3).unwrap();
        let input = demo_input();
        let grad_out = Tensor::from_vec(2, 4, vec![0.3, -0.2, 0.5, 0.1, -0.4, 0.7, 0.2, -0.6])
            .unwrap();
        let grad_in = norm.backward(&input, &grad_out).unwrap();
        let objective = |x: &Tensor| -> f32 {
            let y = norm.forward(x).unwrap();
            y.data().iter().zip(grad_out.data()).map(|(a, b)| a * b).sum()
        };
        let eps = 1e-2;
        for idx in 0..8 {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
            assert!((numeric - grad_in.data()[idx]).abs() < 5e-3);
        }
        let mut names = Vec::new();
        norm.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some());
            names.push(param.name().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec!["bn::gamma", "bn::beta"]);
    }

    #[test]
    fn replay_and_backward_leave_running_statistics_alone() {
        let mut norm = BatchNorm2d::new("bn", 2, (1, 2), 0.5, 1e-3).unwrap();
        let forwarded = norm.forward(&demo_input()).unwrap();
        let mean = norm.running_mean();
        let var = norm.running_var();
        assert_eq!(norm.replay(&demo_input()).unwrap(), forwarded);
        let grad_out = Tensor::from_vec(2, 4, vec![1.0; 8]).unwrap();
        norm.backward(&demo_input(), &grad_out).unwrap();
        assert_eq!(norm.running_mean(), mean);
        assert_eq!(norm.running_var(), var);
    }

    #[test]
    fn batch_norm_relu_restores_the_layer_mode() {
        let norm = BatchNorm2d::new("bn", 2, (1, 2), 0.1, 1e-3).unwrap();
        norm.set_training(false);
        batch_norm_relu(&norm, &demo_input(), true).unwrap();
        assert!(!norm.is_training());
        assert!((norm.running_mean().data()[0] - 0.4).abs() < 1e-6);

        norm.set_training(true);
        let before = norm.running_mean();
        batch_norm_relu(&norm, &demo_input(), false).unwrap();
        assert!(norm.is_training());
        assert_eq!(norm.running_mean(), before);
    }

    #[test]
    fn running_statistics_travel_with_the_state_dict() {
        let trained = BatchNorm2d::new("stem_conv1_bn", 2, (1, 2), 0.1, 1e-3).unwrap();
        trained.forward(&demo_input()).unwrap();
        let state = trained.state_dict().unwrap();
        assert_eq!(state.len(), 4);
        assert_eq!(state["stem_conv1_bn::running_mean"], trained.running_mean());
        assert_eq!(state["stem_conv1_bn::running_var"], trained.running_var());

        let mut fresh = BatchNorm2d::new("stem_conv1_bn", 2, (1, 2), 0.1, 1e-3).unwrap();
        fresh.load_state_dict(&state).unwrap();
        assert_eq!(fresh.running_mean(), trained.running_mean());
        assert_eq!(fresh.running_var(), trained.running_var());

        let mut partial = state.clone();
        partial.remove("stem_conv1_bn::running_var");
        assert_eq!(
            fresh.load_state_dict(&partial),
            Err(TensorError::MissingParameter {
                name: "stem_conv1_bn::running_var".into()
            })
        );
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        assert!(BatchNorm2d::new("bn", 2, (2, 2), 1.5, 1e-3).is_err());
        assert!(BatchNorm2d::new("bn", 2, (2, 2), 0.1, 0.0).is_err());
        assert!(BatchNorm2d::new("bn", 0, (2, 2), 0.1, 1e-3).is_err());
    }
}
