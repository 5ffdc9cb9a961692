mod legalize_support;

use anyhow::Result;
use legalize_support::{assert_close, f32_ty, legalize_and_run, project, ramp, rule_error, tuple};
use tensor_legalize::rules::erf_approx;
use tensor_legalize::{FunctionBuilder, LegalizeError, SourceOp};
use tensor_legalize_ref_cpu::CpuTensor;

#[test]
fn layer_norm_returns_output_mean_and_variance() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let weight = b.add_parameter(f32_ty(&[4]));
    let bias = b.add_parameter(f32_ty(&[4]));
    let shape = b.int_list(&[4]);
    let eps = b.float(1e-5);
    let norm = b.source(
        SourceOp::NativeLayerNorm,
        &[x, shape, weight, bias, eps],
        tuple(vec![f32_ty(&[2, 3, 4]), f32_ty(&[2, 3, 1]), f32_ty(&[2, 3, 1])]),
    );
    let out = project(&mut b, norm, 0, f32_ty(&[2, 3, 4]));
    let mean = project(&mut b, norm, 1, f32_ty(&[2, 3, 1]));
    let var = project(&mut b, norm, 2, f32_ty(&[2, 3, 1]));

    let xs = ramp(24);
    let ws = vec![1.0, 0.5, -1.0, 2.0];
    let bs = vec![0.0, 0.25, 0.5, -0.5];
    let results = legalize_and_run(
        b.finish("layer_norm", vec![out, mean, var]),
        &[
            CpuTensor::f32(&[2, 3, 4], xs.clone()),
            CpuTensor::f32(&[4], ws.clone()),
            CpuTensor::f32(&[4], bs.clone()),
        ],
    )?;

    let (mut expected_out, mut expected_mean, mut expected_var) = (Vec::new(), Vec::new(), Vec::new());
    for row in xs.chunks(4) {
        let mean = row.iter().sum::<f32>() / 4.0;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        let inv_std = 1.0 / (var + 1e-5).sqrt();
        for (i, v) in row.iter().enumerate() {
            expected_out.push((v - mean) * inv_std * ws[i] + bs[i]);
        }
        expected_mean.push(mean);
        expected_var.push(var);
    }
    assert_eq!(results[0].dims, vec![2, 3, 4]);
    assert_eq!(results[1].dims, vec![2, 3, 1]);
    assert_close(results[0].as_f32()?, &expected_out, 1e-4);
    assert_close(results[1].as_f32()?, &expected_mean, 1e-5);
    assert_close(results[2].as_f32()?, &expected_var, 1e-5);
    Ok(())
}

#[test]
fn layer_norm_requires_a_trailing_normalized_shape() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 4]));
    let shape = b.int_list(&[3]);
    let weight = b.none();
    let bias = b.none();
    let eps = b.float(1e-5);
    let norm = b.source(
        SourceOp::NativeLayerNorm,
        &[x, shape, weight, bias, eps],
        tuple(vec![f32_ty(&[2, 3, 4]), f32_ty(&[2, 3, 1]), f32_ty(&[2, 3, 1])]),
    );
    let out = project(&mut b, norm, 0, f32_ty(&[2, 3, 4]));
    let err = rule_error(b.finish("bad_layer_norm", vec![out]));
    assert!(matches!(err, LegalizeError::ShapeMismatch(_)), "{err}");
}

fn batch_norm_graph(training: bool, with_momentum: bool) -> tensor_legalize::Function {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[2, 3, 2, 2]));
    let weight = b.add_parameter(f32_ty(&[3]));
    let bias = b.add_parameter(f32_ty(&[3]));
    let mean = b.add_parameter(f32_ty(&[3]));
    let var = b.add_parameter(f32_ty(&[3]));
    let training = b.bool(training);
    let momentum = if with_momentum { b.float(0.1) } else { b.none() };
    let eps = b.float(1e-5);
    let cudnn = b.bool(true);
    let y = b.source(
        SourceOp::BatchNorm,
        &[x, weight, bias, mean, var, training, momentum, eps, cudnn],
        f32_ty(&[2, 3, 2, 2]),
    );
    b.finish("batch_norm", vec![y])
}

#[test]
fn batch_norm_uses_running_statistics() -> Result<()> {
    let xs = ramp(24);
    let ws = vec![1.0, 2.0, 0.5];
    let bs = vec![0.0, -1.0, 1.0];
    let means = vec![0.1, -0.2, 0.3];
    let vars = vec![1.0, 0.25, 4.0];
    let results = legalize_and_run(
        batch_norm_graph(false, true),
        &[
            CpuTensor::f32(&[2, 3, 2, 2], xs.clone()),
            CpuTensor::f32(&[3], ws.clone()),
            CpuTensor::f32(&[3], bs.clone()),
            CpuTensor::f32(&[3], means.clone()),
            CpuTensor::f32(&[3], vars.clone()),
        ],
    )?;
    let expected: Vec<f32> = xs
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let c = (i / 4) % 3;
            (v - means[c]) / (vars[c] + 1e-5).sqrt() * ws[c] + bs[c]
        })
        .collect();
    assert_close(results[0].as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn batch_norm_without_momentum_is_rejected() {
    let err = rule_error(batch_norm_graph(false, false));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}

#[test]
fn training_mode_batch_norm_is_rejected() {
    let err = rule_error(batch_norm_graph(true, true));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
    assert!(err.to_string().contains("training"), "{err}");
}

fn host_cdf(x: f32) -> f32 {
    0.5 * (1.0 + erf_approx(f64::from(x) / std::f64::consts::SQRT_2) as f32)
}

#[test]
fn gelu_matches_the_erf_polynomial() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[11]));
    let approximate = b.str("none");
    let y = b.source(SourceOp::Gelu, &[x, approximate], f32_ty(&[11]));
    let xs: Vec<f32> = (0..11).map(|i| (i as f32 - 5.0) * 0.6).collect();
    let results = legalize_and_run(b.finish("gelu", vec![y]), &[CpuTensor::f32(&[11], xs.clone())])?;
    let expected: Vec<f32> = xs.iter().map(|&x| x * host_cdf(x)).collect();
    assert_close(results[0].as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn gelu_backward_scales_the_gradient() -> Result<()> {
    let mut b = FunctionBuilder::new();
    let grad = b.add_parameter(f32_ty(&[2, 3]));
    let x = b.add_parameter(f32_ty(&[2, 3]));
    let approximate = b.str("none");
    let y = b.source(SourceOp::GeluBackward, &[grad, x, approximate], f32_ty(&[2, 3]));
    let grads = vec![1.0, -0.5, 2.0, 0.25, 1.5, -1.0];
    let xs = vec![-2.0, -0.5, 0.0, 0.3, 1.0, 2.5];
    let results = legalize_and_run(
        b.finish("gelu_backward", vec![y]),
        &[CpuTensor::f32(&[2, 3], grads.clone()), CpuTensor::f32(&[2, 3], xs.clone())],
    )?;
    let inv_sqrt_2pi = 1.0 / (2.0 * std::f32::consts::PI).sqrt();
    let expected: Vec<f32> = grads
        .iter()
        .zip(&xs)
        .map(|(&g, &x)| g * (host_cdf(x) + x * (-0.5 * x * x).exp() * inv_sqrt_2pi))
        .collect();
    assert_close(results[0].as_f32()?, &expected, 1e-4);
    Ok(())
}

#[test]
fn tanh_approximated_gelu_is_rejected() {
    let mut b = FunctionBuilder::new();
    let x = b.add_parameter(f32_ty(&[4]));
    let approximate = b.str("tanh");
    let y = b.source(SourceOp::Gelu, &[x, approximate], f32_ty(&[4]));
    let err = rule_error(b.finish("gelu_tanh", vec![y]));
    assert!(matches!(err, LegalizeError::UnsupportedOption(_)), "{err}");
}
