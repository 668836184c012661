// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use sc_config::determinism;
use std::cell::RefCell;

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Border handling for sliding-window layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Padding {
    /// No padding; windows must fit entirely inside the input.
    #[default]
    Valid,
    /// Output extent is `ceil(input / stride)`. The required padding is split
    /// with the smaller half before the input, so it may be asymmetric.
    Same,
    /// Symmetric zero padding of `(rows, cols)` on both sides.
    Explicit(usize, usize),
}

impl Padding {
    /// Returns `(output_extent, padding_before)` along one axis.
    fn resolve_axis(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
        axis: usize,
    ) -> PureResult<(usize, usize)> {
        match self {
            Padding::Valid => {
                if input < kernel {
                    return Err(TensorError::InvalidDimensions {
                        rows: input,
                        cols: kernel,
                    });
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
            Padding::Same => {
                let out = input.div_ceil(stride);
                let total = ((out - 1) * stride + kernel).saturating_sub(input);
                Ok((out, total / 2))
            }
            Padding::Explicit(ph, pw) => {
                let pad = if axis == 0 { ph } else { pw };
                if input + 2 * pad < kernel {
                    return Err(TensorError::InvalidDimensions {
                        rows: input + 2 * pad,
                        cols: kernel,
                    });
                }
                Ok(((input + 2 * pad - kernel) / stride + 1, pad))
            }
        }
    }

    /// Spatial extent produced by a window of `kernel`/`stride` over `input_hw`.
    pub fn output_hw(
        self,
        input_hw: (usize, usize),
        kernel: (usize, usize),
        stride: (usize, usize),
    ) -> PureResult<(usize, usize)> {
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let (oh, _) = self.resolve_axis(input_hw.0, kernel.0, stride.0, 0)?;
        let (ow, _) = self.resolve_axis(input_hw.1, kernel.1, stride.1, 1)?;
        Ok((oh, ow))
    }
}

/// Resolved geometry shared by convolutions and pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Window {
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
    output_hw: (usize, usize),
    offset: (usize, usize),
}

impl Window {
    fn new(
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let (oh, top) = padding.resolve_axis(input_hw.0, kernel.0, stride.0, 0)?;
        let (ow, left) = padding.resolve_axis(input_hw.1, kernel.1, stride.1, 1)?;
        Ok(Self {
            kernel,
            stride,
            input_hw,
            output_hw: (oh, ow),
            offset: (top, left),
        })
    }

    fn input_plane(&self) -> usize {
        self.input_hw.0 * self.input_hw.1
    }

    fn output_plane(&self) -> usize {
        self.output_hw.0 * self.output_hw.1
    }

    /// Maps a kernel tap at an output position to its input pixel, or `None`
    /// when the tap lands in the padding.
    #[inline]
    fn source(&self, oh_idx: usize, ow_idx: usize, kh: usize, kw: usize) -> Option<usize> {
        let ih = (oh_idx * self.stride.0 + kh).checked_sub(self.offset.0)?;
        let iw = (ow_idx * self.stride.1 + kw).checked_sub(self.offset.1)?;
        if ih >= self.input_hw.0 || iw >= self.input_hw.1 {
            return None;
        }
        Some(ih * self.input_hw.1 + iw)
    }
}

fn check_cols(cols: usize, expected: usize) -> PureResult<()> {
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (1, cols),
            right: (1, expected),
        });
    }
    Ok(())
}

/// 2D convolution over channel-major feature planes.
///
/// Weights are stored as `(out_channels, in_channels * kh * kw)` and
/// initialised with Glorot-uniform samples; biases start at zero.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    padding: Padding,
    window: Window,
}

impl Conv2d {
    /// Builds a convolution. When `seed` is `None` the process-wide
    /// determinism settings decide how the weights are sampled.
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
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        let window = Window::new(kernel, stride, padding, input_hw)?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let receptive = kernel.0 * kernel.1;
        let limit = (6.0 / ((in_channels + out_channels) * receptive) as f32).sqrt();
        let mut rng = determinism::rng_for_component(seed, &name);
        let weight = Tensor::random_uniform_with(out_channels, span, -limit, limit, &mut rng)?;
        let bias = Tensor::zeros(1, out_channels)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            padding,
            window,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.window.kernel
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.window.input_hw
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.window.output_hw
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    fn kernel_elems(&self) -> usize {
        self.in_channels * self.window.kernel.0 * self.window.kernel.1
    }

    fn im2col(&self, input: &Tensor, batch: usize) -> PureResult<Tensor> {
        let kernel_elems = self.kernel_elems();
        let (oh, ow) = self.window.output_hw;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let plane = self.window.input_plane();
        {
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = input.row(b);
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let offset = (b * oh * ow + oh_idx * ow + ow_idx) * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * plane;
                            for kh in 0..self.window.kernel.0 {
                                for kw in 0..self.window.kernel.1 {
                                    if let Some(index) = self.window.source(oh_idx, ow_idx, kh, kw)
                                    {
                                        column_data[offset + col_idx] = row[channel_offset + index];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn grad_output_to_matrix(&self, grad_output: &Tensor, batch: usize) -> PureResult<Tensor> {
        let spatial = self.window.output_plane();
        let mut matrix = Tensor::zeros(batch * spatial, self.out_channels)?;
        {
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = grad_output.row(b);
                for s in 0..spatial {
                    let offset = (b * spatial + s) * self.out_channels;
                    for oc in 0..self.out_channels {
                        matrix_data[offset + oc] = grad_row[oc * spatial + s];
                    }
                }
            }
        }
        Ok(matrix)
    }

    fn col2im(&self, cols: &Tensor, batch: usize) -> PureResult<Tensor> {
        let (oh, ow) = self.window.output_hw;
        let kernel_elems = self.kernel_elems();
        let expected_rows = batch * oh * ow;
        if cols.shape() != (expected_rows, kernel_elems) {
            return Err(TensorError::ShapeMismatch {
                left: cols.shape(),
                right: (expected_rows, kernel_elems),
            });
        }
        let plane = self.window.input_plane();
        let output_cols = self.in_channels * plane;
        let mut output = Tensor::zeros(batch, output_cols)?;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * plane;
                            for kh in 0..self.window.kernel.0 {
                                for kw in 0..self.window.kernel.1 {
                                    if let Some(index) = self.window.source(oh_idx, ow_idx, kh, kw)
                                    {
                                        grad_in_row[channel_offset + index] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        check_cols(cols, self.in_channels * self.window.input_plane())?;
        let patches = self.im2col(input, batch)?;
        let mut contracted = patches.matmul(&self.weight.value().transpose())?;
        contracted.add_row_inplace(self.bias.value().data())?;
        // (batch * spatial, out) -> (batch, out * spatial), one plane per channel.
        let spatial = self.window.output_plane();
        let out_cols = self.out_channels * spatial;
        let mut out = Tensor::zeros(batch, out_cols)?;
        {
            let source = contracted.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                for s in 0..spatial {
                    let src = &source[(b * spatial + s) * self.out_channels..][..self.out_channels];
                    for (oc, value) in src.iter().enumerate() {
                        out_data[b * out_cols + oc * spatial + s] = *value;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        check_cols(cols, self.in_channels * self.window.input_plane())?;
        let expected = (batch, self.out_channels * self.window.output_plane());
        if grad_output.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: expected,
            });
        }
        let patches = self.im2col(input, batch)?;
        let grad_matrix = self.grad_output_to_matrix(grad_output, batch)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        let grad_bias = Tensor::from_vec(1, self.out_channels, grad_matrix.sum_axis0())?;
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        let grad_input = self.col2im(&grad_patches, batch)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.bias.accumulate_euclidean(&grad_bias)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        let (oh, ow) = self.window.output_hw;
        Some((self.out_channels, oh, ow))
    }
}

/// Max pooling. Taps that land in padding never win.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    window: Window,
    last_indices: RefCell<Vec<usize>>,
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        Ok(Self {
            channels,
            window: Window::new(kernel, stride, padding, input_hw)?,
            last_indices: RefCell::new(Vec::new()),
        })
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.window.output_hw
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        check_cols(cols, self.channels * self.window.input_plane())?;
        let (oh, ow) = self.window.output_hw;
        let plane = self.window.input_plane();
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let mut indices = self.last_indices.borrow_mut();
        indices.clear();
        indices.resize(batch * self.channels * oh * ow, 0);
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = input.row(b);
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * plane;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut best = f32::NEG_INFINITY;
                            let mut best_idx = None;
                            for kh in 0..self.window.kernel.0 {
                                for kw in 0..self.window.kernel.1 {
                                    let Some(index) = self.window.source(oh_idx, ow_idx, kh, kw)
                                    else {
                                        continue;
                                    };
                                    let value = row[channel_offset + index];
                                    if best_idx.is_none() || value > best {
                                        best = value;
                                        best_idx = Some(channel_offset + index);
                                    }
                                }
                            }
                            let Some(best_idx) = best_idx else {
                                return Err(TensorError::InvalidValue {
                                    label: "max_pool_window_outside_input",
                                });
                            };
                            let out_index = c * (oh * ow) + oh_idx * ow + ow_idx;
                            out_row[out_index] = best;
                            indices[b * out_cols + out_index] = best_idx;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        // Refresh the argmax cache for this input.
        self.forward(input)?;
        let (batch, cols) = grad_output.shape();
        check_cols(cols, self.channels * self.window.output_plane())?;
        if batch != input.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, cols),
            });
        }
        let grad_input_cols = self.channels * self.window.input_plane();
        let mut grad_input = Tensor::zeros(batch, grad_input_cols)?;
        let indices = self.last_indices.borrow();
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = grad_output.row(b);
                let grad_in_row =
                    &mut grad_input_data[b * grad_input_cols..(b + 1) * grad_input_cols];
                for (idx, grad) in grad_row.iter().enumerate() {
                    grad_in_row[indices[b * cols + idx]] += grad;
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        let (oh, ow) = self.window.output_hw;
        Some((self.channels, oh, ow))
    }
}

/// Average pooling. The divisor counts only taps inside the input, so padded
/// borders do not dilute the mean.
#[derive(Debug)]
pub struct AvgPool2d {
    channels: usize,
    window: Window,
}

impl AvgPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: Padding,
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        Ok(Self {
            channels,
            window: Window::new(kernel, stride, padding, input_hw)?,
        })
    }

    pub fn output_hw(&self) -> (usize, usize) {
        self.window.output_hw
    }

    fn taps(&self, oh_idx: usize, ow_idx: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.window.kernel.0).flat_map(move |kh| {
            (0..self.window.kernel.1).filter_map(move |kw| self.window.source(oh_idx, ow_idx, kh, kw))
        })
    }
}

impl Module for AvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        check_cols(cols, self.channels * self.window.input_plane())?;
        let (oh, ow) = self.window.output_hw;
        let plane = self.window.input_plane();
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = input.row(b);
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * plane;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut acc = 0.0f32;
                            let mut count = 0usize;
                            for index in self.taps(oh_idx, ow_idx) {
                                acc += row[channel_offset + index];
                                count += 1;
                            }
                            if count == 0 {
                                return Err(TensorError::InvalidValue {
                                    label: "avg_pool_window_outside_input",
                                });
                            }
                            out_row[c * (oh * ow) + oh_idx * ow + ow_idx] = acc / count as f32;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        check_cols(cols, self.channels * self.window.output_plane())?;
        if batch != input.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, cols),
            });
        }
        let (oh, ow) = self.window.output_hw;
        let plane = self.window.input_plane();
        let grad_input_cols = self.channels * plane;
        let mut grad_input = Tensor::zeros(batch, grad_input_cols)?;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = grad_output.row(b);
                let grad_in_row =
                    &mut grad_input_data[b * grad_input_cols..(b + 1) * grad_input_cols];
                for c in 0..self.channels {
                    let channel_offset = c * plane;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let count = self.taps(oh_idx, ow_idx).count();
                            if count == 0 {
                                continue;
                            }
                            let go = grad_row[c * (oh * ow) + oh_idx * ow + ow_idx] / count as f32;
                            for index in self.taps(oh_idx, ow_idx) {
                                grad_in_row[channel_offset + index] += go;
                            }
                        }
                    }
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        let (oh, ow) = self.window.output_hw;
        Some((self.channels, oh, ow))
    }
}
