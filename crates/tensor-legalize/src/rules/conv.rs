use crate::constant::{is_none, require_bool, require_int, require_int_list};
use crate::conversion::RuleContext;
use crate::error::{LegalizeError, LegalizeResult};
use crate::ir::{DType, Dimension, Shape, TensorLiteral, TensorType, ValueId};
use crate::target::{Conv2dSpec, RescaleSpec, TargetOp};

use super::require_static;

pub(super) const NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];
pub(super) const NHWC_TO_NCHW: [usize; 4] = [0, 3, 1, 2];

/// Output extent of a sliding window: `(in + pad - dilation * (kernel - 1) - 1) / stride + 1`.
///
/// An unknown input extent stays unknown.
pub(super) fn sliding_window_extent(
    input: Dimension,
    pad_total: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> LegalizeResult<Dimension> {
    let Dimension::Static(input) = input else {
        return Ok(Dimension::Dynamic);
    };
    if stride == 0 || kernel == 0 {
        return Err(LegalizeError::operand(format!(
            "window kernel {kernel} and stride {stride} must be positive"
        )));
    }
    let span = dilation * (kernel - 1) + 1;
    let padded = input + pad_total;
    if padded < span {
        return Err(LegalizeError::shape(format!(
            "window of extent {span} does not fit input {input} with padding {pad_total}"
        )));
    }
    Ok(Dimension::Static((padded - span) / stride + 1))
}

/// Reads a constant list of one or two non-negative ints; one entry applies to both axes.
pub(super) fn read_pair(
    ctx: &RuleContext<'_, '_>,
    operand: ValueId,
    what: &str,
) -> LegalizeResult<[usize; 2]> {
    let values = require_int_list(ctx, operand, what)?;
    let pair = match values.as_slice() {
        [both] => [*both, *both],
        [h, w] => [*h, *w],
        other => {
            return Err(LegalizeError::operand(format!(
                "{what} must have one or two entries, got {other:?}"
            )))
        }
    };
    let mut out = [0usize; 2];
    for (slot, value) in out.iter_mut().zip(pair) {
        *slot = usize::try_from(value).map_err(|_| {
            LegalizeError::operand(format!("{what} entries must be non-negative, got {value}"))
        })?;
    }
    Ok(out)
}

/// `convolution(input, weight, bias?, stride, padding, dilation, transposed,
/// output_padding, groups)` as an NHWC/OHWI `conv2d`.
pub(super) fn convolution(ctx: &mut RuleContext<'_, '_>) -> LegalizeResult<Vec<ValueId>> {
    let (input, input_ty) = ctx.tensor_operand(0)?;
    let (weight, weight_ty) = ctx.tensor_operand(1)?;
    if input_ty.rank() != 4 {
        return Err(LegalizeError::shape(format!(
            "convolution input must be rank 4, got rank {}",
            input_ty.rank()
        )));
    }
    if weight_ty.rank() != 4 {
        return Err(LegalizeError::shape(format!(
            "convolution weight must be rank 4, got rank {}",
            weight_ty.rank()
        )));
    }
    let weight_dims = require_static(&weight_ty, "convolution weight")?;
    if !(input_ty.dtype.is_float() || input_ty.dtype.is_quantized()) {
        return Err(LegalizeError::dtype(format!(
            "convolution supports float and quantized inputs, got {:?}",
            input_ty.dtype
        )));
    }
    if weight_ty.dtype != input_ty.dtype {
        return Err(LegalizeError::type_mismatch(format!(
            "convolution input is {:?} but weight is {:?}",
            input_ty.dtype, weight_ty.dtype
        )));
    }

    if require_bool(ctx, ctx.operand(6)?, "transposed")? {
        return Err(LegalizeError::option("transposed convolution is not supported"));
    }
    let groups = require_int(ctx, ctx.operand(8)?, "groups")?;
    if groups != 1 {
        return Err(LegalizeError::option(format!(
            "grouped convolution (groups = {groups}) is not supported"
        )));
    }
    let stride = read_pair(ctx, ctx.operand(3)?, "stride")?;
    let padding = read_pair(ctx, ctx.operand(4)?, "padding")?;
    let dilation = read_pair(ctx, ctx.operand(5)?, "dilation")?;
    if dilation.contains(&0) {
        return Err(LegalizeError::operand("dilation entries must be positive"));
    }

    let out_channels = weight_dims[0];
    let acc_dtype = if input_ty.dtype.is_quantized() {
        DType::Si32
    } else {
        input_ty.dtype
    };
    let bias = ctx.operand(2)?;
    let bias = if is_none(ctx, bias) {
        let zeros = if acc_dtype == DType::Si32 {
            TensorLiteral::int(DType::Si32, &[out_channels], vec![0])
        } else {
            TensorLiteral::f32(&[out_channels], vec![0.0])
        };
        let zeros = ctx.constant(zeros);
        ctx.cast(zeros, acc_dtype)?
    } else {
        let bias_ty = ctx.tensor_type(bias)?;
        if bias_ty.rank() != 1 || !bias_ty.shape.dim(0).is_compatible_with(out_channels.into()) {
            return Err(LegalizeError::shape_mismatch(format!(
                "convolution bias {:?} does not match {out_channels} output channels",
                bias_ty.shape.dims()
            )));
        }
        ctx.cast(bias, acc_dtype)?
    };

    let input_nhwc = ctx.transpose(input, &NCHW_TO_NHWC)?;
    let weight_ohwi = ctx.transpose(weight, &NCHW_TO_NHWC)?;

    let (kernel_h, kernel_w) = (weight_dims[2], weight_dims[3]);
    let out_h = sliding_window_extent(
        input_ty.shape.dim(2),
        2 * padding[0],
        kernel_h,
        stride[0],
        dilation[0],
    )?;
    let out_w = sliding_window_extent(
        input_ty.shape.dim(3),
        2 * padding[1],
        kernel_w,
        stride[1],
        dilation[1],
    )?;
    let spec = Conv2dSpec {
        padding: [padding[0], padding[0], padding[1], padding[1]],
        stride,
        dilation,
        input_zero_point: input_ty.quant.map_or(0, |quant| quant.zero_point),
        weight_zero_point: weight_ty.quant.map_or(0, |quant| quant.zero_point),
    };
    let conv_ty = TensorType::new(
        acc_dtype,
        Shape::new(vec![
            input_ty.shape.dim(0),
            out_h,
            out_w,
            Dimension::Static(out_channels),
        ]),
    );
    let conv = ctx.emit(
        TargetOp::Conv2d(spec),
        &[input_nhwc, weight_ohwi, bias],
        conv_ty,
    );
    let conv = ctx.transpose(conv, &NHWC_TO_NCHW)?;

    let out = ctx.result_type()?;
    if !input_ty.dtype.is_quantized() {
        return Ok(vec![ctx.cast(conv, out.dtype)?]);
    }
    let (Some(input_q), Some(weight_q), Some(out_q)) = (input_ty.quant, weight_ty.quant, out.quant)
    else {
        return Err(LegalizeError::unsupported_type(
            "quantized convolution needs quantization parameters on input, weight and result",
        ));
    };
    let spec = RescaleSpec {
        scale: input_q.scale * weight_q.scale / out_q.scale,
        input_zero_point: 0,
        output_zero_point: out_q.zero_point,
    };
    let shape = ctx.tensor_type(conv)?.shape;
    Ok(vec![ctx.emit(
        TargetOp::Rescale(spec),
        &[conv],
        TensorType::quantized(shape, out_q),
    )])
}
