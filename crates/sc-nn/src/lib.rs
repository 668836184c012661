//! High-level neural module API built on top of the pure tensor primitives.
//!
//! This crate offers a lightweight `nn.Module` style surface: convolutions,
//! pooling, batch normalisation and the fan-out/junction containers that
//! multi-branch convolutional blocks are assembled from.

pub mod io;
pub mod layers;
pub mod module;

pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::branches::Branches;
pub use layers::conv::{AvgPool2d, Conv2d, MaxPool2d, Padding};
pub use layers::conv_unit::ConvUnit;
pub use layers::normalization::{batch_norm_relu, BatchNorm2d};
pub use layers::sequential::Sequential;
pub use layers::Relu;
pub use module::{Module, Parameter};

pub use sc_tensor::{PureResult, Tensor, TensorError};
