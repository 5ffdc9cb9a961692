mod legalize_support;

use anyhow::Result;
use legalize_support::{assert_close, f32_ty, legalize_and_run, ramp, rule_error};
use tensor_legalize::{FunctionBuilder, LegalizeError, SourceOp, ValueId};
use tensor_legalize_ref_cpu::CpuTensor;
use test_case::test_case;

/// Single-image NCHW convolution with symmetric padding, square dilation and OIHW
/// weights.
#[allow(clippy::too_many_arguments)]
fn host_conv(
    input: &[f32],
    [c, h, w]: [usize; 3],
    weight: &[f32],
    [o, k]: [usize; 2],
    bias: &[f32],
    stride: usize,
    pad: usize,
    dilation: usize,
) -> (Vec<f32>, [usize; 2]) {
    let span = dilation * (k - 1) + 1;
    let out_h = (h + 2 * pad - span) / stride + 1;
    let out_w = (w + 2 * pad - span) / stride + 1;
    let mut out = Vec::with_capacity(o * out_h * out_w);
    for oc in 0..o {
        for y in 0..out_h {
            for x in 0..out_w {
                let mut acc = bias[oc];
                for ic in 0..c {
                    for ky in 0..k {
                        for kx in 0..k {
                            let iy = (y * stride + ky * dilation) as isize - pad as isize;
                            let ix = (x * stride + kx * dilation) as isize - pad as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            let pixel = input[ic * h * w + iy as usize * w + ix as usize];
                            acc += pixel * weight[((oc * c + ic) * k + ky) * k + kx];
                        }
                    }
                }
                out.push(acc);
            }
        }
    }
    (out, [out_h, out_w])
}

/// Per-channel sliding window average that counts only in-bounds elements.
fn host_avg_pool(
    input: &[f32],
    [c, h, w]: [usize; 3],
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Vec<f32> {
    let out_h = (h + 2 * pad - kernel) / stride + 1;
    let out_w = (w + 2 * pad - kernel) / stride + 1;
    let mut out = Vec::new();
    for ch in 0..c {
        for y in 0..out_h {
            for x in 0..out_w {
                let (mut sum, mut count) = (0.0, 0);
                for ky in 0..kernel {
                    for kx in 0..kernel {
                        let iy = (y * stride + ky) as isize - pad as isize;
                        let ix = (x * stride + kx) as isize - pad as isize;
                        if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                            continue;
                        }
                        sum += input[ch * h * w + iy as usize * w + ix as usize];
                        count += 1;
                    }
                }
                out.push(sum / count as f32);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn conv_graph(
    b: &mut FunctionBuilder,
    input: ValueId,
    weight: ValueId,
    bias: ValueId,
    stride: i64,
    pad: i64,
    dilation: i64,
    groups: i64,
    out: &[usize],
) -> ValueId {
    let stride = b.int_list(&[stride, stride]);
    let padding = b.int_list(&[pad, pad]);
    let dilation = b.int_list(&[dilation, dilation]);
    let transposed = b.bool(false);
    let output_padding = b.int_list(&[0, 0]);
    let groups = b.int(groups);
    b.source(
        SourceOp::Convolution,
        &[input, weight, bias, stride, padding, dilation, transposed, output_padding, groups],
        f32_ty(out),
    )
}

#[test_case(1, &[1, 3, 5, 5]; "unit stride")]
#[test_case(2, &[1, 3, 3, 3]; "stride two")]
fn conv2d_matches_direct_convolution(stride: usize, out_dims: &[usize]) -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 2, 5, 5]));
    let w = b.add_parameter(f32_ty(&[3, 2, 3, 3]));
    let bias = b.add_parameter(f32_ty(&[3]));
    let y = conv_graph(&mut b, x, w, bias, stride as i64, 1, 1, 1, out_dims);

    let xs = ramp(50);
    let ws: Vec<f32> = (0..54).map(|i| ((i % 5) as f32 - 2.0) * 0.1).collect();
    let bs = vec![0.1, -0.2, 0.3];
    let out = legalize_and_run(
        b.finish("conv", vec![y]),
        &[
            CpuTensor::f32(&[1, 2, 5, 5], xs.clone()),
            CpuTensor::f32(&[3, 2, 3, 3], ws.clone()),
            CpuTensor::f32(&[3], bs.clone()),
        ],
    )?;

    let (expected, [out_h, out_w]) = host_conv(&xs, [2, 5, 5], &ws, [3, 3], &bs, stride, 1, 1);
    assert_eq!(out[0].dims, vec![1, 3, out_h, out_w]);
    assert_close(out[0].as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn dilated_conv2d_spreads_the_kernel_taps() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 2, 7, 7]));
    let w = b.add_parameter(f32_ty(&[3, 2, 3, 3]));
    let bias = b.add_parameter(f32_ty(&[3]));
    // Span 2 * (3 - 1) + 1 = 5 over 7 + 2 padded rows leaves 5 output rows.
    let y = conv_graph(&mut b, x, w, bias, 1, 1, 2, 1, &[1, 3, 5, 5]);

    let xs = ramp(98);
    let ws: Vec<f32> = (0..54).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();
    let bs = vec![0.0, 0.5, -0.5];
    let out = legalize_and_run(
        b.finish("dilated_conv", vec![y]),
        &[
            CpuTensor::f32(&[1, 2, 7, 7], xs.clone()),
            CpuTensor::f32(&[3, 2, 3, 3], ws.clone()),
            CpuTensor::f32(&[3], bs.clone()),
        ],
    )?;

    let (expected, [out_h, out_w]) = host_conv(&xs, [2, 7, 7], &ws, [3, 3], &bs, 1, 1, 2);
    assert_eq!([out_h, out_w], [5, 5]);
    assert_eq!(out[0].dims, vec![1, 3, 5, 5]);
    assert_close(out[0].as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn conv2d_without_bias_uses_zero_bias() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 1, 3, 3]));
    let w = b.add_parameter(f32_ty(&[1, 1, 3, 3]));
    let bias = b.none();
    let y = conv_graph(&mut b, x, w, bias, 1, 0, 1, 1, &[1, 1, 1, 1]);
    let out = legalize_and_run(
        b.finish("conv_no_bias", vec![y]),
        &[
            CpuTensor::f32(&[1, 1, 3, 3], vec![1.0; 9]),
            CpuTensor::f32(&[1, 1, 3, 3], (0..9).map(|i| i as f32).collect()),
        ],
    )?;
    assert_close(out[0].as_f32()?, &[36.0], 1e-5);
    Ok(())
}

#[test]
fn grouped_convolution_is_rejected() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 2, 5, 5]));
    let w = b.add_parameter(f32_ty(&[2, 1, 3, 3]));
    let bias = b.none();
    let y = conv_graph(&mut b, x, w, bias, 1, 1, 1, 2, &[1, 2, 5, 5]);
    let err = rule_error(b.finish("grouped", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}

#[test]
fn max_pool_takes_window_maxima() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 1, 4, 4]));
    let kernel = b.int_list(&[2]);
    let stride = b.int_list(&[2]);
    let padding = b.int_list(&[0]);
    let dilation = b.int_list(&[1]);
    let ceil_mode = b.bool(false);
    let y = b.source(
        SourceOp::MaxPool2d,
        &[x, kernel, stride, padding, dilation, ceil_mode],
        f32_ty(&[1, 1, 2, 2]),
    );
    let xs: Vec<f32> = vec![
        1.0, 5.0, 2.0, 0.0, //
        3.0, -1.0, 7.0, 4.0, //
        -2.0, -3.0, 0.5, 0.25, //
        -4.0, -5.0, 1.5, 9.0,
    ];
    let out = legalize_and_run(
        b.finish("max_pool", vec![y]),
        &[CpuTensor::f32(&[1, 1, 4, 4], xs)],
    )?;
    assert_eq!(out[0].as_f32()?, &[5.0, 7.0, -2.0, 9.0]);
    Ok(())
}

#[test]
fn max_pool_with_empty_stride_uses_the_kernel() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 4, 4]));
    let kernel = b.int_list(&[2, 2]);
    let stride = b.int_list(&[]);
    let padding = b.int_list(&[0, 0]);
    let dilation = b.int_list(&[1, 1]);
    let ceil_mode = b.bool(false);
    let y = b.source(
        SourceOp::MaxPool2d,
        &[x, kernel, stride, padding, dilation, ceil_mode],
        f32_ty(&[2, 2, 2]),
    );
    let xs: Vec<f32> = (0..32).map(|i| i as f32).collect();
    let out = legalize_and_run(b.finish("max_pool_chw", vec![y]), &[CpuTensor::f32(&[2, 4, 4], xs)])?;
    assert_eq!(out[0].dims, vec![2, 2, 2]);
    assert_eq!(out[0].as_f32()?, &[5.0, 7.0, 13.0, 15.0, 21.0, 23.0, 29.0, 31.0]);
    Ok(())
}

fn avg_pool_graph(count_include_pad: bool, ceil_mode: bool) -> tensor_legalize::Function {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[1, 2, 3, 3]));
    let kernel = b.int_list(&[3, 3]);
    let stride = b.int_list(&[1, 1]);
    let padding = b.int_list(&[1, 1]);
    let ceil_mode = b.bool(ceil_mode);
    let count_include_pad = b.bool(count_include_pad);
    let divisor = b.none();
    let y = b.source(
        SourceOp::AvgPool2d,
        &[x, kernel, stride, padding, ceil_mode, count_include_pad, divisor],
        f32_ty(&[1, 2, 3, 3]),
    );
    b.finish("avg_pool", vec![y])
}

#[test]
fn avg_pool_excludes_padding_from_the_count() -> Result<()> {
    let xs = ramp(18);
    let out = legalize_and_run(
        avg_pool_graph(false, false),
        &[CpuTensor::f32(&[1, 2, 3, 3], xs.clone())],
    )?;
    assert_close(out[0].as_f32()?, &host_avg_pool(&xs, [2, 3, 3], 3, 1, 1), 1e-5);
    Ok(())
}

#[test_case(true, false; "counting padded elements")]
#[test_case(false, true; "ceil mode")]
fn avg_pool_rejects_unsupported_options(count_include_pad: bool, ceil_mode: bool) {
    let err = rule_error(avg_pool_graph(count_include_pad, ceil_mode));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}

#[test_case(&[1, 2, 10, 10], &[1, 2, 5, 5]; "batched input")]
#[test_case(&[2, 10, 10], &[2, 5, 5]; "unbatched input")]
fn adaptive_avg_pool_halves_each_axis(input: &[usize], output: &[usize]) -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(input));
    let size = b.int_list(&[5, 5]);
    let y = b.source(SourceOp::AdaptiveAvgPool2d, &[x, size], f32_ty(output));
    let xs = ramp(200);
    let out = legalize_and_run(
        b.finish("adaptive", vec![y]),
        &[CpuTensor::f32(input, xs.clone())],
    )?;
    assert_eq!(out[0].dims, output.to_vec());
    assert_close(out[0].as_f32()?, &host_avg_pool(&xs, [2, 10, 10], 2, 2, 0), 1e-5);
    Ok(())
}
