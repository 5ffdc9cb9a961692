use crate::constant::{is_none, require_bool, require_int_list};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{Dimension, Shape, TensorType, ValueId};
use crate::source::SourceOp;
use crate::target::{PoolSpec, TargetOp};

use super::conv::{read_pair, sliding_window_extent, NCHW_TO_NHWC, NHWC_TO_NCHW};
use super::require_float_dtype;

const CHW_TO_HWC: [usize; 3] = [1, 2, 0];
const HWC_TO_CHW: [usize; 3] = [2, 0, 1];

/// Window parameters resolved by a pooling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Max,
    Avg,
}

/// How the window is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowStrategy {
    /// Constant kernel, stride and padding operands.
    Fixed,
    /// Derived from the requested output size.
    Adaptive,
}

fn read_fixed_window(ctx: &RuleContext<'_, '_>, kind: PoolKind) -> LegalizeResult<Window> {
    let kernel = read_pair(ctx, ctx.operand(1)?, "kernel_size")?;
    let stride_operand = ctx.operand(2)?;
    let stride = match require_int_list(ctx, stride_operand, "stride")?.as_slice() {
        [] => kernel,
        _ => read_pair(ctx, stride_operand, "stride")?,
    };
    let padding = read_pair(ctx, ctx.operand(3)?, "padding")?;
    let ceil_mode_index = match kind {
        PoolKind::Max => {
            let dilation = read_pair(ctx, ctx.operand(4)?, "dilation")?;
            if dilation != [1, 1] {
                return Err(LegalizeError::option(format!(
                    "max pooling with dilation {dilation:?} is not supported"
                )));
            }
            5
        }
        PoolKind::Avg => 4,
    };
    if require_bool(ctx, ctx.operand(ceil_mode_index)?, "ceil_mode")? {
        return Err(LegalizeError::option("ceil_mode = true is not supported"));
    }
    if kind == PoolKind::Avg {
        let count_include_pad = require_bool(ctx, ctx.operand(5)?, "count_include_pad")?;
        if count_include_pad && padding != [0, 0] {
            return Err(LegalizeError::option(
                "average pooling that counts padded elements is not supported",
            ));
        }
        if ctx.operand_count() > 6 && !is_none(ctx, ctx.operand(6)?) {
            return Err(LegalizeError::option("divisor_override is not supported"));
        }
    }
    Ok(Window {
        kernel,
        stride,
        padding,
    })
}

/// `stride = in / out`, `kernel = in - (out - 1) * stride`; non-positive sizes keep the
/// input extent.
fn read_adaptive_window(
    ctx: &RuleContext<'_, '_>,
    spatial: [Dimension; 2],
) -> LegalizeResult<Window> {
    let sizes = require_int_list(ctx, ctx.operand(1)?, "output_size")?;
    let requested = match sizes.as_slice() {
        [both] => [*both, *both],
        [h, w] => [*h, *w],
        other => {
            return Err(LegalizeError::operand(format!(
                "output_size must have one or two entries, got {other:?}"
            )))
        }
    };
    let mut window = Window {
        kernel: [1, 1],
        stride: [1, 1],
        padding: [0, 0],
    };
    for axis in 0..2 {
        let Dimension::Static(input) = spatial[axis] else {
            return Err(LegalizeError::shape(
                "adaptive pooling requires static spatial extents",
            ));
        };
        let output = usize::try_from(requested[axis])
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(input);
        if output > input {
            return Err(LegalizeError::shape(format!(
                "adaptive pooling cannot upsample {input} to {output}"
            )));
        }
        let stride = input / output;
        window.stride[axis] = stride;
        window.kernel[axis] = input - (output - 1) * stride;
    }
    Ok(window)
}

/// `max_pool2d`, `avg_pool2d`, `adaptive_avg_pool2d` on CHW or NCHW inputs.
pub(super) fn pool(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (kind, strategy) = match ctx.op() {
        SourceOp::MaxPool2d => (PoolKind::Max, WindowStrategy::Fixed),
        SourceOp::AvgPool2d => (PoolKind::Avg, WindowStrategy::Fixed),
        SourceOp::AdaptiveAvgPool2d => (PoolKind::Avg, WindowStrategy::Adaptive),
        other => unreachable!("{other} is not a pooling operator"),
    };
    let (input, ty) = ctx.tensor_operand(0)?;
    if kind == PoolKind::Avg {
        require_float_dtype(&ty, ctx.op().name())?;
    }
    let rank = ty.rank();
    if rank != 3 && rank != 4 {
        return Err(LegalizeError::shape(format!(
            "pooling expects a CHW or NCHW input, got rank {rank}"
        )));
    }
    let spatial = [ty.shape.dim(rank - 2), ty.shape.dim(rank - 1)];
    let window = match strategy {
        WindowStrategy::Fixed => read_fixed_window(ctx, kind)?,
        WindowStrategy::Adaptive => read_adaptive_window(ctx, spatial)?,
    };

    let nhwc = if rank == 4 {
        ctx.transpose(input, &NCHW_TO_NHWC)?
    } else {
        let hwc = ctx.transpose(input, &CHW_TO_HWC)?;
        let hwc_dims = ctx.tensor_type(hwc)?.shape.into_dims();
        let mut batched = vec![Dimension::Static(1)];
        batched.extend(hwc_dims);
        ctx.reshape(hwc, &batched)?
    };
    let nhwc_ty = ctx.tensor_type(nhwc)?;

    let mut out_spatial = [Dimension::Dynamic; 2];
    for axis in 0..2 {
        out_spatial[axis] = sliding_window_extent(
            spatial[axis],
            2 * window.padding[axis],
            window.kernel[axis],
            window.stride[axis],
            1,
        )?;
    }
    let spec = PoolSpec {
        kernel: window.kernel,
        stride: window.stride,
        padding: [
            window.padding[0],
            window.padding[0],
            window.padding[1],
            window.padding[1],
        ],
    };
    let op = match kind {
        PoolKind::Max => TargetOp::MaxPool2d(spec),
        PoolKind::Avg => TargetOp::AvgPool2d(spec),
    };
    let pooled_ty = TensorType::new(
        ty.dtype,
        Shape::new(vec![
            nhwc_ty.shape.dim(0),
            out_spatial[0],
            out_spatial[1],
            nhwc_ty.shape.dim(3),
        ]),
    );
    let pooled = ctx.emit(op, &[nhwc], pooled_ty);

    let restored = if rank == 4 {
        ctx.transpose(pooled, &NHWC_TO_NCHW)?
    } else {
        let channels = nhwc_ty.shape.dim(3);
        let hwc = ctx.reshape(pooled, &[out_spatial[0], out_spatial[1], channels])?;
        ctx.transpose(hwc, &HWC_TO_CHW)?
    };
    let out = ctx.result_type()?;
    Ok(vec![ctx.cast(restored, out.dtype)?])
}
