// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor};

/// Sequential container that mirrors `nn.Sequential`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Appends a pre-boxed module to the sequence.
    pub fn push_boxed(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Builder-style variant of [`Sequential::push`].
    pub fn with<M>(mut self, layer: M) -> Self
    where
        M: Module + 'static,
    {
        self.push(layer);
        self
    }

    /// Returns the number of layers registered in the container.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the container does not hold any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.forward(&activ)?;
        }
        Ok(activ)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.replay(&activ)?;
        }
        Ok(activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.layers.is_empty() {
            return Ok(grad_output.clone());
        }
        let mut activations = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            let next = layer.replay(&current)?;
            activations.push(next.clone());
            current = next;
        }
        let mut grad = grad_output.clone();
        for (idx, layer) in self.layers.iter_mut().enumerate().rev() {
            let layer_input = if idx == 0 {
                input
            } else {
                &activations[idx - 1]
            };
            grad = layer.backward(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_buffers(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_buffers_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        self.layers.iter().rev().find_map(|layer| layer.output_chw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::{Conv2d, MaxPool2d, Padding};
    use crate::layers::Relu;

    fn small_stack() -> Sequential {
        Sequential::new()
            .with(Conv2d::new("c1", 1, 2, (3, 3), (1, 1), Padding::Same, (4, 4), Some(1)).unwrap())
            .with(Relu::new())
            .with(MaxPool2d::new(2, (2, 2), (2, 2), Padding::Valid, (4, 4)).unwrap())
            .with(Relu::new())
    }

    #[test]
    fn sequential_forward_and_backward() {
        let mut seq = small_stack();
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.output_chw(), Some((2, 2, 2)));

        let input = Tensor::random_normal(2, 16, 0.0, 1.0, Some(3)).unwrap();
        let output = seq.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 8));
        let grad_out = Tensor::from_vec(2, 8, vec![1.0; 16]).unwrap();
        let grad_in = seq.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), input.shape());

        let mut grads = 0;
        seq.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some());
            grads += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(grads, 2);
        seq.apply_step(0.01).unwrap();
        seq.zero_accumulators().unwrap();
    }

    #[test]
    fn backward_replay_keeps_nested_running_statistics() {
        use crate::layers::conv_unit::ConvUnit;

        let unit = |name: &str, seed| {
            ConvUnit::new(name, 1, 1, (3, 3), (1, 1), Padding::Same, (4, 4), Some(seed))
                .unwrap()
                .with_batch_norm(0.5, 1e-3)
                .unwrap()
        };
        let mut seq = Sequential::new().with(unit("a", 1)).with(unit("b", 2));
        let input = Tensor::random_normal(2, 16, 0.0, 1.0, Some(3)).unwrap();
        seq.forward(&input).unwrap();
        let folded = seq.state_dict().unwrap();
        assert!(folded.contains_key("b_bn::running_var"));

        let grad_out = Tensor::from_vec(2, 16, vec![1.0; 32]).unwrap();
        seq.backward(&input, &grad_out).unwrap();
        let after = seq.state_dict().unwrap();
        for name in ["a_bn::running_mean", "a_bn::running_var", "b_bn::running_mean"] {
            assert_eq!(after[name], folded[name], "{name} moved during backward");
        }
    }

    #[test]
    fn empty_sequence_passes_gradients_through() {
        let mut seq = Sequential::new();
        assert!(seq.is_empty());
        let grad = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        assert_eq!(seq.backward(&grad, &grad).unwrap(), grad);
        assert_eq!(seq.output_chw(), None);
    }
}
