// SPDX-License-Identifier: AGPL-3.0-or-later

use sc_nn::PureResult;
use sc_tensor::{Tensor, TensorError};
use std::fmt;

/// Logical `(batch, height, width, channels)` shape of an activation tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActivationShape {
    pub batch: usize,
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ActivationShape {
    pub fn new(batch: usize, height: usize, width: usize, channels: usize) -> Self {
        Self {
            batch,
            height,
            width,
            channels,
        }
    }

    /// Builds a shape from the `(channels, height, width)` triple layers report.
    pub fn from_chw(batch: usize, chw: (usize, usize, usize)) -> Self {
        Self::new(batch, chw.1, chw.2, chw.0)
    }

    /// Columns of the planar tensor holding one sample.
    pub fn features(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Shape of the backing `(rows, cols)` tensor.
    pub fn tensor_shape(&self) -> (usize, usize) {
        (self.batch, self.features())
    }
}

impl fmt::Display for ActivationShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.height, self.width, self.channels
        )
    }
}

fn expected_cols(channels: usize, hw: (usize, usize)) -> PureResult<usize> {
    channels
        .checked_mul(hw.0)
        .and_then(|value| value.checked_mul(hw.1))
        .filter(|value| *value > 0)
        .ok_or(TensorError::InvalidDimensions {
            rows: hw.0,
            cols: hw.1,
        })
}

/// Reorders interleaved `(B, H, W, C)` rows into channel-major planes.
pub fn nhwc_to_planar(tensor: &Tensor, channels: usize, hw: (usize, usize)) -> PureResult<Tensor> {
    let (batch, cols) = tensor.shape();
    let expected = expected_cols(channels, hw)?;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, expected),
        });
    }
    let spatial = hw.0 * hw.1;
    let mut data = vec![0.0f32; batch * cols];
    for b in 0..batch {
        let row = tensor.row(b);
        let out = &mut data[b * cols..(b + 1) * cols];
        for index in 0..spatial {
            for c in 0..channels {
                out[c * spatial + index] = row[index * channels + c];
            }
        }
    }
    Tensor::from_vec(batch, cols, data)
}

/// Inverse of [`nhwc_to_planar`].
pub fn planar_to_nhwc(tensor: &Tensor, channels: usize, hw: (usize, usize)) -> PureResult<Tensor> {
    let (batch, cols) = tensor.shape();
    let expected = expected_cols(channels, hw)?;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, expected),
        });
    }
    let spatial = hw.0 * hw.1;
    let mut data = Vec::with_capacity(batch * cols);
    for b in 0..batch {
        let row = tensor.row(b);
        for index in 0..spatial {
            for c in 0..channels {
                data.push(row[c * spatial + index]);
            }
        }
    }
    Tensor::from_vec(batch, cols, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nhwc_pixels_land_in_their_channel_plane() {
        // One sample, 2x2 pixels, 3 channels; value = 10 * pixel + channel.
        let nhwc = Tensor::from_fn(1, 12, |_, i| (10 * (i / 3) + i % 3) as f32).unwrap();
        let planar = nhwc_to_planar(&nhwc, 3, (2, 2)).unwrap();
        assert_eq!(
            planar.data(),
            &[0.0, 10.0, 20.0, 30.0, 1.0, 11.0, 21.0, 31.0, 2.0, 12.0, 22.0, 32.0]
        );
        assert_eq!(planar_to_nhwc(&planar, 3, (2, 2)).unwrap(), nhwc);
    }

    #[test]
    fn converters_reject_wrong_widths() {
        let tensor = Tensor::zeros(2, 10).unwrap();
        assert!(nhwc_to_planar(&tensor, 3, (2, 2)).is_err());
        assert!(planar_to_nhwc(&tensor, 0, (2, 2)).is_err());
    }

    #[test]
    fn activation_shape_reports_planar_width() {
        let shape = ActivationShape::from_chw(4, (192, 12, 12));
        assert_eq!(shape, ActivationShape::new(4, 12, 12, 192));
        assert_eq!(shape.tensor_shape(), (4, 192 * 144));
        assert_eq!(shape.to_string(), "(4, 12, 12, 192)");
    }
}
