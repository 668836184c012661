// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fans one input out to parallel branches and joins their outputs along the
/// channel axis.
///
/// Every branch must report its output shape through [`Module::output_chw`].
/// Branches are checked against the first one as they are added, so a
/// junction that would merge mismatched feature planes fails at construction
/// with [`TensorError::JunctionMismatch`].
pub struct Branches {
    label: String,
    branches: Vec<Box<dyn Module>>,
    widths: Vec<usize>,
    spatial: Option<(usize, usize)>,
    channels: usize,
}

impl core::fmt::Debug for Branches {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Branches(label={},num_branches={},channels={},spatial={:?})",
            self.label,
            self.branches.len(),
            self.channels,
            self.spatial
        )
    }
}

impl Branches {
    /// Creates an empty junction identified by `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            branches: Vec::new(),
            widths: Vec::new(),
            spatial: None,
            channels: 0,
        }
    }

    /// Adds a branch, validating its spatial extent against the junction.
    pub fn with_branch<M>(mut self, branch: M) -> PureResult<Self>
    where
        M: Module + 'static,
    {
        self.push_boxed(Box::new(branch))?;
        Ok(self)
    }

    /// Adds a pre-boxed branch.
    pub fn push_boxed(&mut self, branch: Box<dyn Module>) -> PureResult<()> {
        let Some((channels, h, w)) = branch.output_chw() else {
            return Err(TensorError::InvalidValue {
                label: "junction_branch_without_spatial_shape",
            });
        };
        match self.spatial {
            Some(expected) if expected != (h, w) => {
                return Err(TensorError::JunctionMismatch {
                    junction: self.label.clone(),
                    expected,
                    got: (h, w),
                });
            }
            Some(_) => {}
            None => self.spatial = Some((h, w)),
        }
        self.channels += channels;
        self.widths.push(channels * h * w);
        self.branches.push(branch);
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Channel count after the junction.
    pub fn channels(&self) -> usize {
        self.channels
    }
}

impl Module for Branches {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if self.branches.is_empty() {
            return Err(TensorError::EmptyInput("junction_branches"));
        }
        let mut outputs = Vec::with_capacity(self.branches.len());
        for (branch, width) in self.branches.iter().zip(&self.widths) {
            let output = branch.forward(input)?;
            if output.shape().1 != *width {
                return Err(TensorError::ShapeMismatch {
                    left: output.shape(),
                    right: (output.shape().0, *width),
                });
            }
            outputs.push(output);
        }
        Tensor::cat_cols(&outputs)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        if self.branches.is_empty() {
            return Err(TensorError::EmptyInput("junction_branches"));
        }
        let outputs = self
            .branches
            .iter()
            .map(|branch| branch.replay(input))
            .collect::<PureResult<Vec<_>>>()?;
        Tensor::cat_cols(&outputs)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.branches.is_empty() {
            return Err(TensorError::EmptyInput("junction_branches"));
        }
        let grads = grad_output.split_cols(&self.widths)?;
        let (rows, cols) = input.shape();
        let mut total = Tensor::zeros(rows, cols)?;
        for (branch, grad) in self.branches.iter_mut().zip(grads.iter()) {
            let contribution = branch.backward(input, grad)?;
            total.add_scaled(&contribution, 1.0)?;
        }
        Ok(total)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &self.branches {
            branch.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &mut self.branches {
            branch.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &self.branches {
            branch.visit_buffers(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        for branch in &mut self.branches {
            branch.visit_buffers_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for branch in &self.branches {
            branch.set_training(training);
        }
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        self.spatial.map(|(h, w)| (self.channels, h, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::{AvgPool2d, Conv2d, MaxPool2d, Padding};
    use crate::layers::Relu;

    #[test]
    fn junction_concatenates_channel_planes_in_branch_order() {
        let pool = MaxPool2d::new(2, (3, 3), (2, 2), Padding::Valid, (5, 5)).unwrap();
        let conv = Conv2d::new("b12", 2, 3, (3, 3), (2, 2), Padding::Valid, (5, 5), Some(3))
            .unwrap();
        let input = Tensor::random_normal(2, 50, 0.0, 1.0, Some(8)).unwrap();
        let pooled = pool.forward(&input).unwrap();
        let convolved = conv.forward(&input).unwrap();

        let junction = Branches::new("junction1")
            .with_branch(pool)
            .unwrap()
            .with_branch(conv)
            .unwrap();
        assert_eq!(junction.output_chw(), Some((5, 2, 2)));
        let joined = junction.forward(&input).unwrap();
        assert_eq!(joined.shape(), (2, 20));
        for b in 0..2 {
            assert_eq!(&joined.row(b)[..8], pooled.row(b));
            assert_eq!(&joined.row(b)[8..], convolved.row(b));
        }
    }

    #[test]
    fn mismatched_branches_are_rejected_with_the_junction_label() {
        let same = AvgPool2d::new(1, (2, 2), (1, 1), Padding::Same, (6, 6)).unwrap();
        let valid = Conv2d::new("b12", 1, 4, (3, 3), (1, 1), Padding::Valid, (6, 6), Some(1))
            .unwrap();
        let err = Branches::new("incepX_junction1")
            .with_branch(same)
            .unwrap()
            .with_branch(valid)
            .unwrap_err();
        assert_eq!(
            err,
            TensorError::JunctionMismatch {
                junction: "incepX_junction1".into(),
                expected: (6, 6),
                got: (4, 4),
            }
        );
        assert!(Branches::new("j").with_branch(Relu::new()).is_err());
    }

    #[test]
    fn gradients_reach_every_branch() {
        let mut junction = Branches::new("j")
            .with_branch(
                Conv2d::new("a", 1, 2, (1, 1), (1, 1), Padding::Valid, (3, 3), Some(1)).unwrap(),
            )
            .unwrap()
            .with_branch(
                Conv2d::new("b", 1, 1, (3, 3), (1, 1), Padding::Same, (3, 3), Some(2)).unwrap(),
            )
            .unwrap();
        let input = Tensor::random_normal(1, 9, 0.0, 1.0, Some(4)).unwrap();
        let grad_out = Tensor::from_vec(1, 27, vec![1.0; 27]).unwrap();
        let grad_in = junction.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (1, 9));
        assert!(grad_in.squared_l2_norm() > 0.0);

        let mut seen = Vec::new();
        junction
            .visit_parameters(&mut |param| {
                assert!(param.gradient().is_some(), "{} has no gradient", param.name());
                seen.push(param.name().to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a::weight", "a::bias", "b::weight", "b::bias"]);
    }

    #[test]
    fn empty_junction_refuses_to_run() {
        let junction = Branches::new("j");
        assert!(junction.is_empty());
        let input = Tensor::zeros(1, 4).unwrap();
        assert_eq!(
            junction.forward(&input),
            Err(TensorError::EmptyInput("junction_branches"))
        );
    }
}
