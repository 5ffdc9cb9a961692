//! Per-operator lowering rules.
//!
//! Every rule reads its operands through a [`RuleContext`], stages target instructions
//! and returns the values replacing the root's results, in result order. Rules never
//! touch the function directly; an `Err` leaves the graph as it was.

mod arith;
mod compare;
mod conv;
mod elementwise;
mod fill;
mod gelu;
mod indexing;
mod matmul;
mod norm;
mod pooling;
mod reduce;
mod structural;

pub use gelu::erf_approx;

use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, Dimension, Shape, TensorType, ValueId};
use crate::scalar::materialize_scalar;
use crate::shape_helpers::broadcast_shapes;
use crate::source::SourceOp;
use crate::target::{BinaryOp, CompareOp, TargetOp, UnaryOp};

/// Lowering for one source operator.
pub type Rule = fn(&mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>>;

/// Rule table. Every [`SourceOp`] appears exactly once.
pub static RULES: &[(SourceOp, Rule)] = &[
    (SourceOp::Log, elementwise::unary_float as Rule),
    (SourceOp::Exp, elementwise::unary_float as Rule),
    (SourceOp::Tanh, elementwise::unary_float as Rule),
    (SourceOp::Sigmoid, elementwise::unary_float as Rule),
    (SourceOp::Neg, elementwise::unary_any as Rule),
    (SourceOp::Floor, elementwise::unary_any as Rule),
    (SourceOp::Ceil, elementwise::unary_any as Rule),
    (SourceOp::Rsqrt, elementwise::unary_any as Rule),
    (SourceOp::Reciprocal, elementwise::unary_any as Rule),
    (SourceOp::BitwiseNot, elementwise::unary_any as Rule),
    (SourceOp::Relu, elementwise::relu as Rule),
    (SourceOp::LeakyRelu, elementwise::leaky_relu as Rule),
    (SourceOp::Log2, elementwise::log2 as Rule),
    (SourceOp::Maximum, elementwise::min_max as Rule),
    (SourceOp::Minimum, elementwise::min_max as Rule),
    (SourceOp::PowTensorScalar, elementwise::pow_scalar as Rule),
    (SourceOp::Threshold, elementwise::threshold as Rule),
    (SourceOp::Clamp, elementwise::clamp as Rule),
    (SourceOp::WhereSelf, elementwise::where_self as Rule),
    (SourceOp::AddTensor, arith::add_sub as Rule),
    (SourceOp::AddScalar, arith::add_sub as Rule),
    (SourceOp::SubTensor, arith::add_sub as Rule),
    (SourceOp::SubScalar, arith::add_sub as Rule),
    (SourceOp::RsubScalar, arith::rsub_scalar as Rule),
    (SourceOp::MulTensor, arith::mul as Rule),
    (SourceOp::MulScalar, arith::mul as Rule),
    (SourceOp::Square, arith::mul as Rule),
    (SourceOp::DivTensor, arith::div as Rule),
    (SourceOp::DivScalar, arith::div as Rule),
    (SourceOp::GtTensor, compare::compare as Rule),
    (SourceOp::GtScalar, compare::compare as Rule),
    (SourceOp::LtTensor, compare::compare as Rule),
    (SourceOp::LtScalar, compare::compare as Rule),
    (SourceOp::EqTensor, compare::compare as Rule),
    (SourceOp::EqScalar, compare::compare as Rule),
    (SourceOp::NeTensor, compare::compare as Rule),
    (SourceOp::NeScalar, compare::compare as Rule),
    (SourceOp::BitwiseAndTensor, compare::bitwise as Rule),
    (SourceOp::BitwiseOrTensor, compare::bitwise as Rule),
    (SourceOp::BitwiseXorTensor, compare::bitwise as Rule),
    (SourceOp::MeanDim, reduce::reduce as Rule),
    (SourceOp::SumDimIntList, reduce::reduce as Rule),
    (SourceOp::AnyDim, reduce::reduce as Rule),
    (SourceOp::All, reduce::reduce as Rule),
    (SourceOp::Any, reduce::reduce as Rule),
    (SourceOp::Sum, reduce::reduce as Rule),
    (SourceOp::Argmax, reduce::argmax as Rule),
    (SourceOp::MaxDim, reduce::max_dim as Rule),
    (SourceOp::Matmul, matmul::matmul as Rule),
    (SourceOp::Mm, matmul::matmul as Rule),
    (SourceOp::Bmm, matmul::matmul as Rule),
    (SourceOp::Linear, matmul::linear as Rule),
    (SourceOp::Convolution, conv::convolution as Rule),
    (SourceOp::BatchNorm, norm::batch_norm as Rule),
    (SourceOp::NativeLayerNorm, norm::layer_norm as Rule),
    (SourceOp::Gelu, gelu::gelu as Rule),
    (SourceOp::GeluBackward, gelu::gelu_backward as Rule),
    (SourceOp::Reshape, structural::reshape as Rule),
    (SourceOp::View, structural::reshape as Rule),
    (SourceOp::Flatten, structural::flatten as Rule),
    (SourceOp::Squeeze, structural::squeeze as Rule),
    (SourceOp::SqueezeDim, structural::squeeze as Rule),
    (SourceOp::Unsqueeze, structural::unsqueeze as Rule),
    (SourceOp::Permute, structural::permute as Rule),
    (SourceOp::TransposeInt, structural::transpose_int as Rule),
    (SourceOp::SliceTensor, structural::slice as Rule),
    (SourceOp::BroadcastTo, structural::broadcast_to as Rule),
    (SourceOp::Embedding, indexing::embedding as Rule),
    (SourceOp::Gather, indexing::gather as Rule),
    (SourceOp::MaxPool2d, pooling::pool as Rule),
    (SourceOp::AvgPool2d, pooling::pool as Rule),
    (SourceOp::AdaptiveAvgPool2d, pooling::pool as Rule),
    (SourceOp::Ones, fill::ones_zeros as Rule),
    (SourceOp::Zeros, fill::ones_zeros as Rule),
    (SourceOp::FillScalar, fill::fill_scalar as Rule),
    (SourceOp::MaskedFillScalar, fill::masked_fill as Rule),
    (SourceOp::MaskedFillTensor, fill::masked_fill as Rule),
    (SourceOp::ArangeStartStep, fill::arange as Rule),
    (SourceOp::NumToTensor, fill::num_to_tensor as Rule),
    (SourceOp::Contiguous, fill::contiguous as Rule),
    (SourceOp::Dropout, fill::dropout as Rule),
    (SourceOp::Copy, fill::copy as Rule),
    (SourceOp::ToDtype, fill::to_dtype as Rule),
    (SourceOp::Clone, fill::clone as Rule),
];

/// Static dims of a rank-`rank` splat constant.
fn ones(rank: usize) -> Vec<usize> {
    vec![1; rank]
}

fn require_float_dtype(ty: &TensorType, what: &str) -> LegalizeResult<()> {
    if ty.dtype.is_float() {
        Ok(())
    } else {
        Err(LegalizeError::dtype(format!(
            "{what} supports floating-point inputs only, got {:?}",
            ty.dtype
        )))
    }
}

fn require_int_or_float(ty: &TensorType, what: &str) -> LegalizeResult<()> {
    if ty.dtype.is_int_or_float() {
        Ok(())
    } else {
        Err(LegalizeError::dtype(format!(
            "{what} supports integer or floating-point inputs only, got {:?}",
            ty.dtype
        )))
    }
}

fn require_static(ty: &TensorType, what: &str) -> LegalizeResult<Vec<usize>> {
    ty.shape.static_dims().ok_or_else(|| {
        LegalizeError::shape(format!(
            "{what} requires a static shape, got {:?}",
            ty.shape.dims()
        ))
    })
}

fn broadcast_type(lhs: &TensorType, rhs: &TensorType, dtype: DType) -> LegalizeResult<TensorType> {
    let shape = broadcast_shapes(&lhs.shape, &rhs.shape).ok_or_else(|| {
        LegalizeError::shape_mismatch(format!(
            "{:?} does not broadcast with {:?}",
            lhs.shape.dims(),
            rhs.shape.dims()
        ))
    })?;
    Ok(TensorType::new(dtype, shape))
}

fn emit_unary(
    ctx: &mut RuleContext<'_, '_>,
    op: UnaryOp,
    value: ValueId,
) -> LegalizeResult<ValueId> {
    let ty = ctx.tensor_type(value)?;
    let out = TensorType::new(ty.dtype, ty.shape);
    Ok(ctx.emit(TargetOp::Unary(op), &[value], out))
}

/// Broadcasting binary op; the result takes the element type of `lhs`.
fn emit_binary(
    ctx: &mut RuleContext<'_, '_>,
    op: BinaryOp,
    lhs: ValueId,
    rhs: ValueId,
) -> LegalizeResult<ValueId> {
    let lhs_ty = ctx.tensor_type(lhs)?;
    let rhs_ty = ctx.tensor_type(rhs)?;
    let out = broadcast_type(&lhs_ty, &rhs_ty, lhs_ty.dtype)?;
    Ok(ctx.emit(TargetOp::Binary(op), &[lhs, rhs], out))
}

fn emit_compare(
    ctx: &mut RuleContext<'_, '_>,
    op: CompareOp,
    lhs: ValueId,
    rhs: ValueId,
) -> LegalizeResult<ValueId> {
    let lhs_ty = ctx.tensor_type(lhs)?;
    let rhs_ty = ctx.tensor_type(rhs)?;
    let out = broadcast_type(&lhs_ty, &rhs_ty, DType::I1)?;
    Ok(ctx.emit(TargetOp::Compare(op), &[lhs, rhs], out))
}

fn emit_select(
    ctx: &mut RuleContext<'_, '_>,
    cond: ValueId,
    on_true: ValueId,
    on_false: ValueId,
) -> LegalizeResult<ValueId> {
    let cond_ty = ctx.tensor_type(cond)?;
    let true_ty = ctx.tensor_type(on_true)?;
    let false_ty = ctx.tensor_type(on_false)?;
    let values = broadcast_type(&true_ty, &false_ty, true_ty.dtype)?;
    let out = broadcast_type(&cond_ty, &values, true_ty.dtype)?;
    Ok(ctx.emit(TargetOp::Select, &[cond, on_true, on_false], out))
}

/// Single-element constant of `dtype` at `rank`, built from an f32 value.
fn float_const(
    ctx: &mut RuleContext<'_, '_>,
    value: f32,
    dtype: DType,
    rank: usize,
) -> LegalizeResult<ValueId> {
    let splat = ctx.f32_splat(value, rank);
    ctx.cast(splat, dtype)
}

/// `shape` with `axes` removed.
fn drop_axes(shape: &Shape, axes: &[usize]) -> Vec<Dimension> {
    shape
        .dims()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, dim)| *dim)
        .collect()
}

/// `shape` with `axes` set to 1.
fn keep_axes(shape: &Shape, axes: &[usize]) -> Vec<Dimension> {
    shape
        .dims()
        .iter()
        .enumerate()
        .map(|(axis, dim)| {
            if axes.contains(&axis) {
                Dimension::Static(1)
            } else {
                *dim
            }
        })
        .collect()
}

/// Operand `index` as a tensor: tensors pass through, scalar literals are materialized
/// at `dtype` as a rank-`rank` splat.
fn tensor_or_scalar(
    ctx: &mut RuleContext<'_, '_>,
    index: usize,
    dtype: DType,
    rank: usize,
) -> LegalizeResult<ValueId> {
    let value = ctx.operand(index)?;
    if ctx.value_type(value).is_some_and(|ty| ty.is_tensor()) {
        return Ok(value);
    }
    materialize_scalar(ctx, value, dtype, &ones(rank))
}
