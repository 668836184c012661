pub mod activation;
pub mod branches;
pub mod conv;
pub mod conv_unit;
pub mod normalization;
pub mod sequential;

pub use activation::Relu;
