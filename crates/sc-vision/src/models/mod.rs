// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Inception backbone implemented on top of the stackception neural module stack.
//!
//! Each block implements [`sc_nn::module::Module`], so the whole network can be
//! snapshotted with [`sc_nn::io`] and differentiated end to end.

mod utils;

pub mod inception;

pub use self::inception::{
    BlockKind, ConvOptions, FrameInception, FrameStem, InceptionBlock, InceptionConfig,
};
pub use self::utils::{nhwc_to_planar, planar_to_nhwc, ActivationShape};
