//! Legalization of framework-level tensor operators into a compact target instruction set.
//!
//! A [`Function`] holds source operators ([`SourceOp`]) with their declared result types.
//! [`legalize_function`] rewrites each one into [`TargetOp`] instructions through the
//! per-operator [`rules`], then cleans up and verifies that only legal operations remain.

pub mod config;
pub mod constant;
pub mod conversion;
pub mod driver;
mod env;
pub mod error;
pub mod index;
pub mod ir;
pub mod passes;
pub mod pattern;
pub mod rewriter;
pub mod rules;
pub mod scalar;
pub mod shape_helpers;
pub mod source;
pub mod target;

pub use config::LegalizeConfig;
pub use conversion::{
    check_function_legality, legalize_function, ConversionFailure, ConversionStats,
    LegalitySpec,
};
pub use error::{LegalizeError, LegalizeResult};
pub use ir::{DType, Dimension, Function, FunctionBuilder, Shape, TensorType, ValueId};
pub use source::SourceOp;
pub use target::TargetOp;
