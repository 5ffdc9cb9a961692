//! Hardware-oriented target instruction set.
//!
//! Elementwise operations broadcast implicitly: shapes are right-aligned, size-1 axes
//! stretch, and a rank-0 operand broadcasts against anything. Spatial operations use
//! channels-last layouts (NHWC activations, OHWI weights).

use serde::{Deserialize, Serialize};

use crate::ir::{DType, TensorLiteral};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetOp {
    Const(TensorLiteral),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(CompareOp),
    /// `select(cond, on_true, on_false)`, broadcasting all three operands.
    Select,
    Clamp(ClampSpec),
    Cast(CastSpec),
    Rescale(RescaleSpec),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    Slice(SliceSpec),
    Concat(ConcatSpec),
    /// Reduces one axis and keeps it with extent 1.
    Reduce(ReduceSpec),
    /// Index of the maximum along one axis; the axis is dropped.
    ArgMax(ArgMaxSpec),
    /// Batched matrix product over rank-3 operands `[B, M, K] x [B, K, N]`.
    MatMul(MatMulSpec),
    /// Operands: NHWC input, OHWI weight, bias of length O.
    Conv2d(Conv2dSpec),
    MaxPool2d(PoolSpec),
    AvgPool2d(PoolSpec),
    /// Operands: values `[N, K, C]` and `Si32` indices `[N, W]`; result `[N, W, C]`.
    Gather,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Negate,
    Exp,
    Log,
    Tanh,
    Sigmoid,
    Rsqrt,
    Reciprocal,
    Floor,
    Ceil,
    BitwiseNot,
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Integer division truncating toward zero.
    IntDiv,
    Maximum,
    Minimum,
    Pow,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Greater,
    GreaterEqual,
    Equal,
}

/// Bounds are chosen by the operand element type: integer bounds for integer tensors,
/// floating-point bounds otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampSpec {
    pub min_int: i64,
    pub max_int: i64,
    pub min_fp: f32,
    pub max_fp: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// `out = round((in - input_zero_point) * scale) + output_zero_point`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RescaleSpec {
    pub scale: f64,
    pub input_zero_point: i64,
    pub output_zero_point: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReshapeDim {
    Fixed(usize),
    /// Extent derived from the element count; at most one per shape.
    Infer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<ReshapeDim>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

impl TransposeSpec {
    pub fn is_identity(&self) -> bool {
        self.perm.iter().enumerate().all(|(i, &axis)| i == axis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub starts: Vec<usize>,
    pub sizes: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Prod,
    Max,
    Min,
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgMaxSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MatMulSpec {
    pub lhs_zero_point: i64,
    pub rhs_zero_point: i64,
}

/// Padding is `[top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dSpec {
    pub padding: [usize; 4],
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub input_zero_point: i64,
    pub weight_zero_point: i64,
}

/// Padding is `[top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 4],
}
