// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::layers::conv::{Conv2d, Padding};
use crate::layers::normalization::BatchNorm2d;
use crate::layers::Relu;
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor};

/// Convolution followed by optional batch normalisation and a ReLU.
///
/// The normaliser, when present, is named `{name}_bn`.
#[derive(Debug)]
pub struct ConvUnit {
    name: String,
    conv: Conv2d,
    norm: Option<BatchNorm2d>,
    relu: Relu,
}

impl ConvUnit {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let conv = Conv2d::new(
            name.clone(),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            seed,
        )?;
        Ok(Self {
            name,
            conv,
            norm: None,
            relu: Relu::new(),
        })
    }

    /// Inserts a [`BatchNorm2d`] between the convolution and the ReLU.
    pub fn with_batch_norm(mut self, momentum: f32, epsilon: f32) -> PureResult<Self> {
        let norm = BatchNorm2d::new(
            format!("{}_bn", self.name),
            self.conv.out_channels(),
            self.conv.output_hw(),
            momentum,
            epsilon,
        )?;
        self.norm = Some(norm);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    pub fn norm(&self) -> Option<&BatchNorm2d> {
        self.norm.as_ref()
    }
}

impl Module for ConvUnit {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = self.conv.forward(input)?;
        if let Some(norm) = &self.norm {
            activ = norm.forward(&activ)?;
        }
        self.relu.forward(&activ)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = self.conv.forward(input)?;
        if let Some(norm) = &self.norm {
            activ = norm.replay(&activ)?;
        }
        self.relu.forward(&activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let convolved = self.conv.forward(input)?;
        let grad = match self.norm.as_mut() {
            Some(norm) => {
                let normed = norm.replay(&convolved)?;
                let grad = self.relu.backward(&normed, grad_output)?;
                norm.backward(&convolved, &grad)?
            }
            None => self.relu.backward(&convolved, grad_output)?,
        };
        self.conv.backward(input, &grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)?;
        if let Some(norm) = &self.norm {
            norm.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)?;
        if let Some(norm) = self.norm.as_mut() {
            norm.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        match &self.norm {
            Some(norm) => norm.visit_buffers(visitor),
            None => Ok(()),
        }
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        match self.norm.as_mut() {
            Some(norm) => norm.visit_buffers_mut(visitor),
            None => Ok(()),
        }
    }

    fn set_training(&self, training: bool) {
        if let Some(norm) = &self.norm {
            norm.set_training(training);
        }
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        self.conv.output_chw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_without_norm_is_conv_then_relu() {
        let unit =
            ConvUnit::new("u", 1, 3, (3, 3), (1, 1), Padding::Same, (4, 4), Some(9)).unwrap();
        let input = Tensor::random_normal(1, 16, 0.0, 1.0, Some(2)).unwrap();
        let mut expected = unit.conv().forward(&input).unwrap();
        expected.relu_inplace();
        assert_eq!(unit.forward(&input).unwrap(), expected);
        assert!(unit.norm().is_none());
        assert_eq!(unit.state_dict().unwrap().len(), 2);
    }

    #[test]
    fn batch_norm_parameters_follow_the_unit_name() {
        let mut unit = ConvUnit::new("stem_conv1", 1, 2, (3, 3), (2, 2), Padding::Valid, (7, 7), None)
            .unwrap()
            .with_batch_norm(0.01, 1e-3)
            .unwrap();
        let state = unit.state_dict().unwrap();
        for key in [
            "stem_conv1::weight",
            "stem_conv1::bias",
            "stem_conv1_bn::gamma",
            "stem_conv1_bn::beta",
        ] {
            assert!(state.contains_key(key), "missing {key}");
        }
        assert_eq!(unit.output_chw(), Some((2, 3, 3)));

        let input = Tensor::random_normal(3, 49, 0.0, 1.0, Some(5)).unwrap();
        let grad_out = Tensor::from_vec(3, 18, vec![1.0; 54]).unwrap();
        let grad_in = unit.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (3, 49));

        unit.set_training(false);
        assert!(!unit.norm().unwrap().is_training());
    }

    #[test]
    fn one_training_step_folds_running_statistics_once() {
        let mut unit = ConvUnit::new("u", 1, 1, (1, 1), (1, 1), Padding::Valid, (2, 2), Some(4))
            .unwrap()
            .with_batch_norm(0.5, 1e-3)
            .unwrap();
        let input = Tensor::random_normal(2, 4, 0.0, 1.0, Some(6)).unwrap();
        let convolved = unit.conv().forward(&input).unwrap();
        let batch_mean = convolved.data().iter().sum::<f32>() / 8.0;

        unit.forward(&input).unwrap();
        let norm = unit.norm().unwrap();
        assert_eq!((norm.name(), norm.momentum(), norm.epsilon()), ("u_bn", 0.5, 1e-3));
        let after_forward = norm.running_mean();
        assert!((after_forward.data()[0] - 0.5 * batch_mean).abs() < 1e-5);

        let grad_out = Tensor::from_vec(2, 4, vec![1.0; 8]).unwrap();
        unit.backward(&input, &grad_out).unwrap();
        assert_eq!(unit.norm().unwrap().running_mean(), after_forward);
        assert_eq!(unit.replay(&input).unwrap(), unit.forward(&input).unwrap());
    }
}
