// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::utils::ActivationShape;
use sc_config::determinism;
use sc_nn::io;
use sc_nn::layers::branches::Branches;
use sc_nn::layers::conv::{AvgPool2d, MaxPool2d, Padding};
use sc_nn::layers::conv_unit::ConvUnit;
use sc_nn::layers::normalization::{DEFAULT_EPSILON, DEFAULT_MOMENTUM};
use sc_nn::layers::sequential::Sequential;
use sc_nn::module::{Module, Parameter};
use sc_nn::PureResult;
use sc_tensor::{Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info};

/// Channels produced by the per-frame stem path.
pub const FRAME_STEM_CHANNELS: usize = 48;

type Chw = (usize, usize, usize);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InceptionConfig {
    /// Number of single-channel frames stacked along the channel axis.
    pub frames: usize,
    pub frame_hw: (usize, usize),
    /// Channels after the 1x1 projection that closes the stem.
    pub stem_channels: usize,
    /// Repetitions of the Inception-A, Inception-B and Inception-C blocks.
    pub block_depths: [usize; 3],
    /// Inserts batch normalisation between every convolution and its ReLU.
    pub batch_norm: bool,
    pub momentum: f32,
    pub epsilon: f32,
    /// Appends an average pool that collapses the final feature planes to 1x1.
    pub global_pool: bool,
    pub seed: Option<u64>,
}

impl Default for InceptionConfig {
    fn default() -> Self {
        Self {
            frames: 29,
            frame_hw: (64, 64),
            stem_channels: 192,
            block_depths: [1, 1, 1],
            batch_norm: false,
            momentum: DEFAULT_MOMENTUM,
            epsilon: DEFAULT_EPSILON,
            global_pool: false,
            seed: None,
        }
    }
}

impl InceptionConfig {
    /// Inception-v4 block repetition (4 x A, 7 x B, 3 x C).
    pub fn inception_v4() -> Self {
        Self {
            block_depths: [4, 7, 3],
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_batch_norm(mut self, enabled: bool) -> Self {
        self.batch_norm = enabled;
        self
    }

    /// Checks the configuration and returns the spatial extent after the stem.
    pub fn validate(&self) -> PureResult<(usize, usize)> {
        if self.frames == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.frames,
                cols: self.frame_hw.0 * self.frame_hw.1,
            });
        }
        if self.stem_channels == 0 {
            return Err(TensorError::InvalidValue {
                label: "inception_stem_channels",
            });
        }
        if !(0.0..=1.0).contains(&self.momentum) || !self.momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "inception_batchnorm_momentum",
            });
        }
        if self.epsilon <= 0.0 || !self.epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "inception_batchnorm_epsilon",
                value: self.epsilon,
            });
        }
        let stem_hw = FrameStem::output_hw(self.frame_hw)?;
        // Each reduction trims two pixels from both axes.
        if stem_hw.0 < 5 || stem_hw.1 < 5 {
            return Err(TensorError::InvalidDimensions {
                rows: stem_hw.0,
                cols: stem_hw.1,
            });
        }
        Ok(stem_hw)
    }

    pub fn from_json_str(json: &str) -> PureResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| TensorError::SerializationError {
                message: err.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_path<P: AsRef<Path>>(path: P) -> PureResult<Self> {
        let file = File::open(path.as_ref()).map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            TensorError::SerializationError {
                message: err.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> PureResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })
    }
}

/// How every convolution of the network is built.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConvOptions {
    /// `(momentum, epsilon)` of the batch norm inserted after each convolution.
    pub batch_norm: Option<(f32, f32)>,
    pub seed: Option<u64>,
}

impl ConvOptions {
    pub fn from_config(config: &InceptionConfig) -> Self {
        Self {
            batch_norm: config
                .batch_norm
                .then_some((config.momentum, config.epsilon)),
            seed: config.seed,
        }
    }

    fn unit(&self, name: String, input: Chw, def: &ConvDef) -> PureResult<ConvUnit> {
        let unit = ConvUnit::new(
            name,
            input.0,
            def.filters,
            def.kernel,
            def.stride,
            def.padding,
            (input.1, input.2),
            self.seed,
        )?;
        match self.batch_norm {
            Some((momentum, epsilon)) => unit.with_batch_norm(momentum, epsilon),
            None => Ok(unit),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ConvDef {
    name: &'static str,
    filters: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: Padding,
}

impl ConvDef {
    const fn same(name: &'static str, filters: usize, kernel: (usize, usize)) -> Self {
        Self {
            name,
            filters,
            kernel,
            stride: (1, 1),
            padding: Padding::Same,
        }
    }

    const fn valid(name: &'static str, filters: usize, kernel: (usize, usize)) -> Self {
        Self {
            name,
            filters,
            kernel,
            stride: (1, 1),
            padding: Padding::Valid,
        }
    }

    const fn strided(mut self, stride: usize) -> Self {
        self.stride = (stride, stride);
        self
    }
}

fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Appends `defs` to `seq`, threading the spatial shape through each layer.
fn conv_chain(
    options: &ConvOptions,
    prefix: &str,
    mut seq: Sequential,
    input: Chw,
    defs: &[ConvDef],
) -> PureResult<(Sequential, Chw)> {
    let mut shape = input;
    for def in defs {
        let unit = options.unit(scoped(prefix, def.name), shape, def)?;
        shape = unit.output_chw().ok_or(TensorError::InvalidValue {
            label: "conv_unit_shape",
        })?;
        seq.push(unit);
    }
    Ok((seq, shape))
}

fn chain(
    options: &ConvOptions,
    prefix: &str,
    input: Chw,
    defs: &[ConvDef],
) -> PureResult<Sequential> {
    conv_chain(options, prefix, Sequential::new(), input, defs).map(|(seq, _)| seq)
}

/// Stride-1 "same" 2x2 average pool followed by `defs`.
fn pooled_chain(
    options: &ConvOptions,
    prefix: &str,
    input: Chw,
    defs: &[ConvDef],
) -> PureResult<Sequential> {
    let pool = AvgPool2d::new(input.0, (2, 2), (1, 1), Padding::Same, (input.1, input.2))?;
    conv_chain(options, prefix, Sequential::new().with(pool), input, defs).map(|(seq, _)| seq)
}

/// 3x3 stride-1 valid max pool used by both reduction blocks.
fn reduction_pool(input: Chw) -> PureResult<MaxPool2d> {
    MaxPool2d::new(input.0, (3, 3), (1, 1), Padding::Valid, (input.1, input.2))
}

/// Conv chain that ends in a two-way split of asymmetric convolutions.
fn split_chain(
    options: &ConvOptions,
    prefix: &str,
    input: Chw,
    defs: &[ConvDef],
    junction: &str,
    split: [ConvDef; 2],
) -> PureResult<Sequential> {
    let (seq, shape) = conv_chain(options, prefix, Sequential::new(), input, defs)?;
    let fork = Branches::new(scoped(prefix, junction))
        .with_branch(chain(options, prefix, shape, &split[..1])?)?
        .with_branch(chain(options, prefix, shape, &split[1..])?)?;
    Ok(seq.with(fork))
}

/// Per-frame feature extractor shared by every frame of the stack, followed
/// by a 1x1 projection over the concatenated frame features.
pub struct FrameStem {
    frames: usize,
    frame_hw: (usize, usize),
    per_frame: Sequential,
    per_frame_chw: Chw,
    stem_dim: ConvUnit,
}

impl core::fmt::Debug for FrameStem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FrameStem(frames={},frame_hw={:?},per_frame={:?},out={:?})",
            self.frames,
            self.frame_hw,
            self.per_frame_chw,
            self.stem_dim.output_chw()
        )
    }
}

impl FrameStem {
    pub fn new(
        frames: usize,
        frame_hw: (usize, usize),
        out_channels: usize,
        options: &ConvOptions,
    ) -> PureResult<Self> {
        if frames == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: frames,
                cols: frame_hw.0 * frame_hw.1,
            });
        }
        let input = (1, frame_hw.0, frame_hw.1);
        let (trunk, shape) = conv_chain(
            options,
            "",
            Sequential::new(),
            input,
            &[
                ConvDef::valid("stem_conv1", 8, (3, 3)).strided(2),
                ConvDef::valid("stem_conv2", 8, (3, 3)),
                ConvDef::same("stem_conv3", 16, (3, 3)),
            ],
        )?;

        let junction1 = Branches::new("stem_junction1")
            .with_branch(MaxPool2d::new(
                shape.0,
                (3, 3),
                (2, 2),
                Padding::Valid,
                (shape.1, shape.2),
            )?)?
            .with_branch(chain(
                options,
                "",
                shape,
                &[ConvDef::valid("stem_b12_conv1", 24, (3, 3)).strided(2)],
            )?)?;
        let Some(shape) = junction1.output_chw() else {
            return Err(TensorError::EmptyInput("stem_junction1"));
        };

        let junction2 = Branches::new("stem_junction2")
            .with_branch(chain(
                options,
                "",
                shape,
                &[
                    ConvDef::same("stem_b21_conv1", 16, (1, 3)),
                    ConvDef::valid("stem_b21_conv2", 24, (3, 3)),
                ],
            )?)?
            .with_branch(chain(
                options,
                "",
                shape,
                &[
                    ConvDef::same("stem_b22_conv1", 16, (1, 3)),
                    ConvDef::same("stem_b22_conv2", 16, (1, 5)),
                    ConvDef::same("stem_b22_conv3", 16, (5, 1)),
                    ConvDef::valid("stem_b22_conv4", 24, (3, 3)),
                ],
            )?)?;
        let Some(per_frame_chw) = junction2.output_chw() else {
            return Err(TensorError::EmptyInput("stem_junction2"));
        };

        let per_frame = trunk.with(junction1).with(junction2);
        let stacked = (frames * per_frame_chw.0, per_frame_chw.1, per_frame_chw.2);
        let stem_dim = options.unit(
            "stem_dim".to_string(),
            stacked,
            &ConvDef::valid("stem_dim", out_channels, (1, 1)),
        )?;
        Ok(Self {
            frames,
            frame_hw,
            per_frame,
            per_frame_chw,
            stem_dim,
        })
    }

    /// Spatial extent the stem produces for frames of `frame_hw`.
    pub fn output_hw(frame_hw: (usize, usize)) -> PureResult<(usize, usize)> {
        let hw = Padding::Valid.output_hw(frame_hw, (3, 3), (2, 2))?;
        let hw = Padding::Valid.output_hw(hw, (3, 3), (1, 1))?;
        // stem_conv3 keeps the extent; the first bifurcation halves it.
        let hw = Padding::Valid.output_hw(hw, (3, 3), (2, 2))?;
        Padding::Valid.output_hw(hw, (3, 3), (1, 1))
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// `(channels, height, width)` of one frame after the shared path.
    pub fn per_frame_chw(&self) -> (usize, usize, usize) {
        self.per_frame_chw
    }

    /// 1x1 projection over the concatenated frame features.
    pub fn stem_dim(&self) -> &ConvUnit {
        &self.stem_dim
    }

    fn frame_plane(&self) -> usize {
        self.frame_hw.0 * self.frame_hw.1
    }

    fn per_frame_features(&self) -> usize {
        self.per_frame_chw.0 * self.per_frame_chw.1 * self.per_frame_chw.2
    }

    /// Splits `(batch, frames * H * W)` into `(batch * frames, H * W)`, one
    /// frame per row. Planar layout keeps each frame contiguous, so this is a
    /// reshape.
    fn unstack(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let expected = self.frames * self.frame_plane();
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (batch, cols),
                right: (batch, expected),
            });
        }
        input.reshape(batch * self.frames, self.frame_plane())
    }

    /// Runs the shared per-frame path, returning one row per `(sample, frame)`
    /// pair in sample-major order.
    pub fn frame_features(&self, input: &Tensor) -> PureResult<Tensor> {
        let frames = self.unstack(input)?;
        self.per_frame.forward(&frames)
    }

    /// Frame features joined along the channel axis in frame order.
    fn stacked_features(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = input.shape().0;
        let features = self.frame_features(input)?;
        features.reshape(batch, self.frames * self.per_frame_features())
    }
}

impl Module for FrameStem {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let stacked = self.stacked_features(input)?;
        self.stem_dim.forward(&stacked)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = input.shape().0;
        let stacked = self
            .per_frame
            .replay(&self.unstack(input)?)?
            .reshape(batch, self.frames * self.per_frame_features())?;
        self.stem_dim.replay(&stacked)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = input.shape().0;
        let frames = self.unstack(input)?;
        let stacked = self
            .per_frame
            .replay(&frames)?
            .reshape(batch, self.frames * self.per_frame_features())?;
        let grad_stacked = self.stem_dim.backward(&stacked, grad_output)?;
        let grad_frames =
            grad_stacked.reshape(batch * self.frames, self.per_frame_features())?;
        // Every frame row contributes to the one shared parameter set.
        let grad_input = self.per_frame.backward(&frames, &grad_frames)?;
        grad_input.reshape(batch, self.frames * self.frame_plane())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.per_frame.visit_parameters(visitor)?;
        self.stem_dim.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.per_frame.visit_parameters_mut(visitor)?;
        self.stem_dim.visit_parameters_mut(visitor)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.per_frame.visit_buffers(visitor)?;
        self.stem_dim.visit_buffers(visitor)
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.per_frame.visit_buffers_mut(visitor)?;
        self.stem_dim.visit_buffers_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.per_frame.set_training(training);
        self.stem_dim.set_training(training);
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        self.stem_dim.output_chw()
    }
}

/// Block families of the backbone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    InceptionA,
    ReductionA,
    InceptionB,
    ReductionB,
    InceptionC,
}

impl BlockKind {
    /// Prefix shared by the layer names of the block.
    pub fn tag(self) -> &'static str {
        match self {
            BlockKind::InceptionA => "incepA",
            BlockKind::ReductionA => "reducA",
            BlockKind::InceptionB => "incepB",
            BlockKind::ReductionB => "reducB",
            BlockKind::InceptionC => "incepC",
        }
    }
}

/// One multi-branch block: parallel branches over a shared input merged at a
/// channel junction.
#[derive(Debug)]
pub struct InceptionBlock {
    kind: BlockKind,
    prefix: String,
    input_chw: Chw,
    output_chw: Chw,
    junction: Branches,
}

impl InceptionBlock {
    fn assemble(kind: BlockKind, prefix: &str, input: Chw, junction: Branches) -> PureResult<Self> {
        let Some(output_chw) = junction.output_chw() else {
            return Err(TensorError::EmptyInput("inception_block_branches"));
        };
        Ok(Self {
            kind,
            prefix: prefix.to_string(),
            input_chw: input,
            output_chw,
            junction,
        })
    }

    /// Four same-padded branches, 48 channels each; spatial extent preserved.
    pub fn inception_a(prefix: &str, input: Chw, options: &ConvOptions) -> PureResult<Self> {
        let junction = Branches::new(scoped(prefix, "incepA_junction1"))
            .with_branch(pooled_chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepA_b11_conv1", 48, (1, 1))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepA_b12_conv1", 48, (1, 1))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("incepA_b13_conv1", 32, (1, 1)),
                    ConvDef::same("incepA_b13_conv2", 48, (3, 3)),
                ],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("incepA_b14_conv1", 32, (1, 1)),
                    ConvDef::same("incepA_b14_conv2", 48, (3, 3)),
                    ConvDef::same("incepA_b14_conv3", 48, (3, 3)),
                ],
            )?)?;
        Self::assemble(BlockKind::InceptionA, prefix, input, junction)
    }

    /// Shrinks both spatial axes by two and adds 320 channels.
    pub fn reduction_a(prefix: &str, input: Chw, options: &ConvOptions) -> PureResult<Self> {
        let junction = Branches::new(scoped(prefix, "reducA_junction1"))
            .with_branch(reduction_pool(input)?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[ConvDef::valid("reducA_b12_conv1", 192, (3, 3))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("reducA_b13_conv1", 96, (1, 1)),
                    ConvDef::same("reducA_b13_conv2", 112, (3, 3)),
                    ConvDef::valid("reducA_b13_conv3", 128, (3, 3)),
                ],
            )?)?;
        Self::assemble(BlockKind::ReductionA, prefix, input, junction)
    }

    /// Factorised 1x5/5x1 branches; 512 output channels, extent preserved.
    pub fn inception_b(prefix: &str, input: Chw, options: &ConvOptions) -> PureResult<Self> {
        let junction = Branches::new(scoped(prefix, "incepB_junction1"))
            .with_branch(pooled_chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepB_b11_conv1", 64, (1, 1))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepB_b12_conv1", 192, (1, 1))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("incepB_b13_conv1", 96, (1, 1)),
                    ConvDef::same("incepB_b13_conv2", 112, (1, 5)),
                    ConvDef::same("incepB_b13_conv3", 128, (5, 1)),
                ],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("incepB_b14_conv1", 96, (1, 1)),
                    ConvDef::same("incepB_b14_conv2", 96, (1, 5)),
                    ConvDef::same("incepB_b14_conv3", 112, (5, 1)),
                    ConvDef::same("incepB_b14_conv4", 112, (1, 5)),
                    ConvDef::same("incepB_b14_conv5", 128, (5, 1)),
                ],
            )?)?;
        Self::assemble(BlockKind::InceptionB, prefix, input, junction)
    }

    /// Shrinks both spatial axes by two and adds 256 channels.
    pub fn reduction_b(prefix: &str, input: Chw, options: &ConvOptions) -> PureResult<Self> {
        let junction = Branches::new(scoped(prefix, "reducB_junction1"))
            .with_branch(reduction_pool(input)?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("reducB_b12_conv1", 96, (1, 1)),
                    ConvDef::valid("reducB_b12_conv2", 96, (3, 3)),
                ],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("reducB_b13_conv1", 128, (1, 1)),
                    ConvDef::same("reducB_b13_conv2", 128, (1, 5)),
                    ConvDef::same("reducB_b13_conv3", 160, (5, 1)),
                    ConvDef::valid("reducB_b13_conv4", 160, (3, 3)),
                ],
            )?)?;
        Self::assemble(BlockKind::ReductionB, prefix, input, junction)
    }

    /// Six outputs (two of them nested 1x3/3x1 splits); 768 channels.
    pub fn inception_c(prefix: &str, input: Chw, options: &ConvOptions) -> PureResult<Self> {
        let junction = Branches::new(scoped(prefix, "incepC_junction1"))
            .with_branch(pooled_chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepC_b11_conv1", 128, (1, 1))],
            )?)?
            .with_branch(chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepC_b12_conv1", 128, (1, 1))],
            )?)?
            .with_branch(split_chain(
                options,
                prefix,
                input,
                &[ConvDef::same("incepC_b13_conv1", 192, (1, 1))],
                "incepC_b13_junction1",
                [
                    ConvDef::same("incepC_b13_b11_conv1", 128, (1, 3)),
                    ConvDef::same("incepC_b13_b12_conv1", 128, (3, 1)),
                ],
            )?)?
            .with_branch(split_chain(
                options,
                prefix,
                input,
                &[
                    ConvDef::same("incepC_b14_conv1", 192, (1, 1)),
                    ConvDef::same("incepC_b14_conv2", 224, (1, 3)),
                    ConvDef::same("incepC_b14_conv3", 256, (3, 1)),
                ],
                "incepC_b14_junction1",
                [
                    ConvDef::same("incepC_b14_b11_conv1", 128, (1, 3)),
                    ConvDef::same("incepC_b14_b12_conv1", 128, (3, 1)),
                ],
            )?)?;
        Self::assemble(BlockKind::InceptionC, prefix, input, junction)
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Scope prepended to layer names (empty for unscoped blocks).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn input_chw(&self) -> (usize, usize, usize) {
        self.input_chw
    }

    pub fn output_shape(&self, batch: usize) -> ActivationShape {
        ActivationShape::from_chw(batch, self.output_chw)
    }

    pub fn junction(&self) -> &Branches {
        &self.junction
    }
}

impl Module for InceptionBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.junction.forward(input)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        self.junction.replay(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.junction.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.junction.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.junction.visit_parameters_mut(visitor)
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.junction.visit_buffers(visitor)
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.junction.visit_buffers_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.junction.set_training(training);
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        Some(self.output_chw)
    }
}

/// Frame-stack backbone: shared-weight stem followed by
/// `A x a -> reduction A -> B x b -> reduction B -> C x c`.
///
/// Repeated Inception blocks scope their layer names with their index
/// (`incepA0.`, `incepA1.`, ...). The stem and the reductions are unscoped.
pub struct FrameInception {
    config: InceptionConfig,
    stem: FrameStem,
    blocks: Vec<InceptionBlock>,
    global_pool: Option<AvgPool2d>,
    output_chw: Chw,
}

impl core::fmt::Debug for FrameInception {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FrameInception(frames={},blocks={},global_pool={},out={:?})",
            self.config.frames,
            self.blocks.len(),
            self.global_pool.is_some(),
            self.output_chw
        )
    }
}

impl FrameInception {
    pub fn new(config: InceptionConfig) -> PureResult<Self> {
        config.validate()?;
        let options = ConvOptions::from_config(&config);
        let stem = FrameStem::new(
            config.frames,
            config.frame_hw,
            config.stem_channels,
            &options,
        )?;
        let mut shape = stem.output_chw().ok_or(TensorError::EmptyInput("stem"))?;
        debug!(block = "stem", output = ?shape, "built frame stem");

        let [depth_a, depth_b, depth_c] = config.block_depths;
        let mut blocks = Vec::with_capacity(depth_a + depth_b + depth_c + 2);
        let mut push = |block: InceptionBlock, shape: &mut Chw| {
            *shape = block.output_chw;
            debug!(
                block = block.kind.tag(),
                prefix = %block.prefix,
                input = ?block.input_chw,
                output = ?block.output_chw,
                "built block"
            );
            blocks.push(block);
        };
        for idx in 0..depth_a {
            let prefix = format!("incepA{idx}");
            push(
                InceptionBlock::inception_a(&prefix, shape, &options)?,
                &mut shape,
            );
        }
        push(InceptionBlock::reduction_a("", shape, &options)?, &mut shape);
        for idx in 0..depth_b {
            let prefix = format!("incepB{idx}");
            push(
                InceptionBlock::inception_b(&prefix, shape, &options)?,
                &mut shape,
            );
        }
        push(InceptionBlock::reduction_b("", shape, &options)?, &mut shape);
        for idx in 0..depth_c {
            let prefix = format!("incepC{idx}");
            push(
                InceptionBlock::inception_c(&prefix, shape, &options)?,
                &mut shape,
            );
        }

        let global_pool = if config.global_pool {
            let hw = (shape.1, shape.2);
            let pool = AvgPool2d::new(shape.0, hw, (1, 1), Padding::Valid, hw)?;
            shape = (shape.0, 1, 1);
            Some(pool)
        } else {
            None
        };

        let model = Self {
            config,
            stem,
            blocks,
            global_pool,
            output_chw: shape,
        };
        info!(
            frames = model.config.frames,
            blocks = model.blocks.len(),
            parameters = model.parameter_count()?,
            batch_norm = model.config.batch_norm,
            deterministic = determinism::config().enabled,
            output = ?model.output_chw,
            "assembled frame inception backbone"
        );
        Ok(model)
    }

    pub fn config(&self) -> &InceptionConfig {
        &self.config
    }

    pub fn stem(&self) -> &FrameStem {
        &self.stem
    }

    pub fn blocks(&self) -> &[InceptionBlock] {
        &self.blocks
    }

    /// Logical input shape for `batch` samples.
    pub fn input_shape(&self, batch: usize) -> ActivationShape {
        let (h, w) = self.config.frame_hw;
        ActivationShape::new(batch, h, w, self.config.frames)
    }

    pub fn output_shape(&self, batch: usize) -> ActivationShape {
        ActivationShape::from_chw(batch, self.output_chw)
    }

    pub fn output_features(&self) -> usize {
        self.output_chw.0 * self.output_chw.1 * self.output_chw.2
    }

    /// `(block tag, output chw)` for the stem and every block in order.
    pub fn stage_shapes(&self) -> Vec<(&'static str, (usize, usize, usize))> {
        let mut shapes = Vec::with_capacity(self.blocks.len() + 1);
        if let Some(chw) = self.stem.output_chw() {
            shapes.push(("stem", chw));
        }
        for block in &self.blocks {
            shapes.push((block.kind.tag(), block.output_chw));
        }
        shapes
    }

    pub fn load_weights_json<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_json(self, path)
    }

    pub fn load_weights_bincode<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_bincode(self, path)
    }
}

impl Module for FrameInception {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = self.stem.forward(input)?;
        for block in &self.blocks {
            activ = block.forward(&activ)?;
        }
        if let Some(pool) = &self.global_pool {
            activ = pool.forward(&activ)?;
        }
        Ok(activ)
    }

    fn replay(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = self.stem.replay(input)?;
        for block in &self.blocks {
            activ = block.replay(&activ)?;
        }
        if let Some(pool) = &self.global_pool {
            activ = pool.forward(&activ)?;
        }
        Ok(activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let mut block_inputs = Vec::with_capacity(self.blocks.len());
        let mut activ = self.stem.replay(input)?;
        for block in &self.blocks {
            block_inputs.push(activ.clone());
            activ = block.replay(&activ)?;
        }
        let mut grad = match self.global_pool.as_mut() {
            Some(pool) => pool.backward(&activ, grad_output)?,
            None => grad_output.clone(),
        };
        for (block, block_input) in self
            .blocks
            .iter_mut()
            .rev()
            .zip(block_inputs.into_iter().rev())
        {
            grad = block.backward(&block_input, &grad)?;
        }
        self.stem.backward(input, &grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem.visit_parameters(visitor)?;
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem.visit_parameters_mut(visitor)?;
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers(
        &self,
        visitor: &mut dyn FnMut(&str, &Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem.visit_buffers(visitor)?;
        for block in &self.blocks {
            block.visit_buffers(visitor)?;
        }
        Ok(())
    }

    fn visit_buffers_mut(
        &mut self,
        visitor: &mut dyn FnMut(&str, &mut Tensor) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem.visit_buffers_mut(visitor)?;
        for block in &mut self.blocks {
            block.visit_buffers_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.stem.set_training(training);
        for block in &self.blocks {
            block.set_training(training);
        }
    }

    fn output_chw(&self) -> Option<(usize, usize, usize)> {
        Some(self.output_chw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConvOptions {
        ConvOptions {
            batch_norm: None,
            seed: Some(7),
        }
    }

    #[test]
    fn stem_extent_follows_the_kernel_sequence() {
        assert_eq!(FrameStem::output_hw((64, 64)).unwrap(), (12, 12));
        assert!(FrameStem::output_hw((9, 9)).is_err());
    }

    #[test]
    fn inception_a_preserves_extent_and_yields_192_channels() {
        let block = InceptionBlock::inception_a("", (16, 6, 6), &options()).unwrap();
        assert_eq!(block.output_chw(), Some((192, 6, 6)));
        assert_eq!(block.junction().len(), 4);
        assert_eq!(block.junction().label(), "incepA_junction1");
    }

    #[test]
    fn reductions_trim_two_pixels_and_add_channels() {
        let a = InceptionBlock::reduction_a("", (192, 6, 6), &options()).unwrap();
        assert_eq!(a.output_shape(2), ActivationShape::new(2, 4, 4, 512));
        let b = InceptionBlock::reduction_b("", (512, 6, 6), &options()).unwrap();
        assert_eq!(b.output_shape(2), ActivationShape::new(2, 4, 4, 768));
        assert_eq!(b.junction().label(), "reducB_junction1");
    }

    #[test]
    fn inception_b_and_c_channel_totals() {
        let b = InceptionBlock::inception_b("incepB0", (24, 5, 5), &options()).unwrap();
        assert_eq!(b.output_chw(), Some((512, 5, 5)));
        assert_eq!(b.junction().label(), "incepB0.incepB_junction1");
        let c = InceptionBlock::inception_c("incepC0", (24, 4, 4), &options()).unwrap();
        assert_eq!(c.output_chw(), Some((768, 4, 4)));
    }

    #[test]
    fn scoped_layer_names() {
        let block = InceptionBlock::inception_c("incepC3", (8, 3, 3), &options()).unwrap();
        let state = block.state_dict().unwrap();
        assert!(state.contains_key("incepC3.incepC_b14_b12_conv1::weight"));
        assert!(state.contains_key("incepC3.incepC_b11_conv1::bias"));
        let block = InceptionBlock::reduction_b("", (8, 5, 5), &options()).unwrap();
        let state = block.state_dict().unwrap();
        assert!(state.contains_key("reducB_b13_conv4::weight"));
        assert_eq!(block.kind(), BlockKind::ReductionB);
        assert_eq!(block.prefix(), "");
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        assert_eq!(InceptionConfig::default().validate().unwrap(), (12, 12));
        let mut config = InceptionConfig::default();
        config.frames = 0;
        assert!(config.validate().is_err());
        let mut config = InceptionConfig::default();
        config.frame_hw = (20, 20);
        assert!(config.validate().is_err());
        let mut config = InceptionConfig::default();
        config.momentum = f32::NAN;
        assert!(config.validate().is_err());
        let mut config = InceptionConfig::default();
        config.epsilon = 0.0;
        assert!(config.validate().is_err());
        let mut config = InceptionConfig::default();
        config.stem_channels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = InceptionConfig::from_json_str(r#"{ "block_depths": [4, 7, 3] }"#).unwrap();
        assert_eq!(config, InceptionConfig::inception_v4());
        assert!(InceptionConfig::from_json_str(r#"{ "frames": 0 }"#).is_err());
        assert!(matches!(
            InceptionConfig::from_json_str("{"),
            Err(TensorError::SerializationError { .. })
        ));
    }
}
