// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision backbones for stacks of single-channel frames.
//!
//! The models consume `(batch, frames * height * width)` tensors laid out plane
//! by plane. [`models::nhwc_to_planar`] converts interleaved `(B, H, W, C)`
//! buffers into that layout.

pub mod models;

pub use models::{
    nhwc_to_planar, planar_to_nhwc, ActivationShape, BlockKind, ConvOptions, FrameInception,
    FrameStem, InceptionBlock, InceptionConfig,
};
