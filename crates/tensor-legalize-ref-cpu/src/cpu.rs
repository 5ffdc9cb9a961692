use std::collections::HashMap;
use std::sync::Arc;

use tensor_legalize::ir::{
    ConstantValue, DType, Function, LiteralData, Operand, Operation, TensorLiteral, TensorType,
    ValueId, ValueType,
};
use tensor_legalize::target::{
    BinaryOp, ClampSpec, CompareOp, Conv2dSpec, MatMulSpec, PoolSpec, ReduceKind, ReshapeDim,
    RescaleSpec, SliceSpec, TargetOp, UnaryOp,
};
use tracing::{debug, trace};

use crate::{BackendError, BackendResult};

/// Host tensor with static dims. Every float type is held as `f32`, every integer type
/// (including quantized storage) as `i64` wrapped to its width.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Int(Arc<[i64]>),
    Bool(Arc<[bool]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Int(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements at `positions`, in order.
    fn take(&self, positions: &[usize]) -> TensorData {
        match self {
            TensorData::F32(values) => {
                TensorData::F32(positions.iter().map(|&p| values[p]).collect())
            }
            TensorData::Int(values) => {
                TensorData::Int(positions.iter().map(|&p| values[p]).collect())
            }
            TensorData::Bool(values) => {
                TensorData::Bool(positions.iter().map(|&p| values[p]).collect())
            }
        }
    }
}

impl CpuTensor {
    pub fn f32(dims: &[usize], values: Vec<f32>) -> Self {
        Self {
            dtype: DType::F32,
            dims: dims.to_vec(),
            data: TensorData::F32(Arc::from(values)),
        }
    }

    pub fn int(dtype: DType, dims: &[usize], values: Vec<i64>) -> Self {
        Self {
            dtype,
            dims: dims.to_vec(),
            data: TensorData::Int(Arc::from(values)),
        }
    }

    pub fn bool(dims: &[usize], values: Vec<bool>) -> Self {
        Self {
            dtype: DType::I1,
            dims: dims.to_vec(),
            data: TensorData::Bool(Arc::from(values)),
        }
    }

    /// Expands a literal, repeating a splat payload over the whole shape.
    pub fn from_literal(literal: &TensorLiteral) -> BackendResult<Self> {
        let dims = literal.ty.shape.static_dims().ok_or_else(|| {
            BackendError::execution("literal with a dynamic shape cannot be materialized")
        })?;
        let count: usize = dims.iter().product();
        let payload = literal.data.len();
        if payload != count && payload != 1 {
            return Err(BackendError::execution(format!(
                "literal holds {payload} elements for shape {dims:?}"
            )));
        }
        let positions: Vec<usize> = if payload == 1 {
            vec![0; count]
        } else {
            (0..count).collect()
        };
        let dtype = literal.ty.dtype;
        let data = match &literal.data {
            LiteralData::Float(values) => {
                TensorData::F32(positions.iter().map(|&p| values[p]).collect())
            }
            LiteralData::Int(values) if dtype == DType::I1 => {
                TensorData::Bool(positions.iter().map(|&p| values[p] != 0).collect())
            }
            LiteralData::Int(values) => TensorData::Int(
                positions
                    .iter()
                    .map(|&p| wrap_int(values[p], dtype))
                    .collect(),
            ),
            LiteralData::Bool(values) => {
                TensorData::Bool(positions.iter().map(|&p| values[p]).collect())
            }
        };
        Ok(Self { dtype, dims, data })
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn as_f32(&self) -> BackendResult<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            _ => Err(BackendError::execution(format!(
                "expected a float tensor, got {:?}",
                self.dtype
            ))),
        }
    }

    pub fn as_int(&self) -> BackendResult<&[i64]> {
        match &self.data {
            TensorData::Int(values) => Ok(values),
            _ => Err(BackendError::execution(format!(
                "expected an integer tensor, got {:?}",
                self.dtype
            ))),
        }
    }

    pub fn as_bool(&self) -> BackendResult<&[bool]> {
        match &self.data {
            TensorData::Bool(values) => Ok(values),
            _ => Err(BackendError::execution(format!(
                "expected a boolean tensor, got {:?}",
                self.dtype
            ))),
        }
    }

    fn with_data(dtype: DType, dims: Vec<usize>, data: TensorData) -> Self {
        Self { dtype, dims, data }
    }
}

/// Evaluates a legalized function on `inputs`, one per parameter.
///
/// Scalar constants and lists left behind without dead-code elimination are skipped.
/// Source operators are rejected.
pub fn run_function(func: &Function, inputs: &[CpuTensor]) -> BackendResult<Vec<CpuTensor>> {
    if func.parameter_ids.len() != inputs.len() {
        return Err(BackendError::execution(format!(
            "function @{} takes {} input(s), got {}",
            func.name,
            func.parameter_ids.len(),
            inputs.len()
        )));
    }
    let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
    for ((id, ty), input) in func
        .parameter_ids
        .iter()
        .zip(&func.parameters)
        .zip(inputs)
    {
        if let ValueType::Tensor(ty) = ty {
            check_input(ty, input)?;
        }
        values.insert(*id, input.clone());
    }

    for (index, inst) in func.body.iter().enumerate() {
        let op = match &inst.op {
            Operation::Target(op) => op,
            Operation::Constant(ConstantValue::Tensor(literal)) => {
                values.insert(inst.id, CpuTensor::from_literal(literal)?);
                continue;
            }
            Operation::Constant(_) | Operation::ListConstruct => continue,
            Operation::Source(op) => {
                return Err(BackendError::unimplemented(
                    op.name(),
                    "source operators must be legalized before evaluation",
                ))
            }
        };
        let ValueType::Tensor(out_ty) = &inst.output else {
            return Err(BackendError::execution(format!(
                "target instruction %{} does not produce a tensor",
                inst.id.0
            )));
        };
        let result = {
            let args = inst
                .operands
                .iter()
                .map(|operand| match operand {
                    Operand::Value(id) => values.get(id).ok_or_else(|| {
                        BackendError::execution(format!("operand %{} has no value", id.0))
                    }),
                    Operand::TupleElement { tuple, .. } => Err(BackendError::execution(format!(
                        "tuple projection of %{} reached the evaluator",
                        tuple.0
                    ))),
                })
                .collect::<BackendResult<Vec<_>>>()?;
            execute_operation(op, &args, out_ty)
                .map_err(|err| augment_backend_error(err, &func.name, index, op))?
        };
        trace!(op = op_label(op), id = inst.id.0, dims = ?result.dims, "evaluated");
        values.insert(inst.id, result);
    }

    let results = func
        .result_ids
        .iter()
        .map(|id| {
            values.remove(id).ok_or_else(|| {
                BackendError::execution(format!("function result %{} has no value", id.0))
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;
    debug!(function = %func.name, results = results.len(), "function evaluated");
    Ok(results)
}

fn check_input(ty: &TensorType, input: &CpuTensor) -> BackendResult<()> {
    let dims_match = ty.rank() == input.dims.len()
        && ty
            .shape
            .dims()
            .iter()
            .zip(&input.dims)
            .all(|(dim, &extent)| dim.as_static().map_or(true, |expected| expected == extent));
    if ty.dtype != input.dtype || !dims_match {
        return Err(BackendError::execution(format!(
            "input {:?}{:?} does not match parameter {:?}{:?}",
            input.dtype,
            input.dims,
            ty.dtype,
            ty.shape.dims()
        )));
    }
    Ok(())
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    op: &TargetOp,
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{function_name}` instruction #{instruction_index}, {})",
                op_label(op)
            ),
        },
        other => other,
    }
}

fn op_label(op: &TargetOp) -> &'static str {
    match op {
        TargetOp::Const(_) => "const",
        TargetOp::Unary(_) => "unary",
        TargetOp::Binary(_) => "binary",
        TargetOp::Compare(_) => "compare",
        TargetOp::Select => "select",
        TargetOp::Clamp(_) => "clamp",
        TargetOp::Cast(_) => "cast",
        TargetOp::Rescale(_) => "rescale",
        TargetOp::Reshape(_) => "reshape",
        TargetOp::Transpose(_) => "transpose",
        TargetOp::Slice(_) => "slice",
        TargetOp::Concat(_) => "concat",
        TargetOp::Reduce(_) => "reduce",
        TargetOp::ArgMax(_) => "argmax",
        TargetOp::MatMul(_) => "matmul",
        TargetOp::Conv2d(_) => "conv2d",
        TargetOp::MaxPool2d(_) => "max_pool2d",
        TargetOp::AvgPool2d(_) => "avg_pool2d",
        TargetOp::Gather => "gather",
    }
}

fn execute_operation(
    op: &TargetOp,
    inputs: &[&CpuTensor],
    output: &TensorType,
) -> BackendResult<CpuTensor> {
    let dtype = output.dtype;
    match op {
        TargetOp::Const(literal) => CpuTensor::from_literal(literal),
        TargetOp::Unary(op) => op_unary(expect_single(inputs)?, *op, dtype),
        TargetOp::Binary(op) => {
            let [lhs, rhs] = expect_n::<2>(inputs)?;
            op_binary(lhs, rhs, *op, dtype)
        }
        TargetOp::Compare(op) => {
            let [lhs, rhs] = expect_n::<2>(inputs)?;
            op_compare(lhs, rhs, *op)
        }
        TargetOp::Select => {
            let [cond, on_true, on_false] = expect_n::<3>(inputs)?;
            op_select(cond, on_true, on_false, dtype)
        }
        TargetOp::Clamp(spec) => op_clamp(expect_single(inputs)?, spec, dtype),
        TargetOp::Cast(spec) => op_cast(expect_single(inputs)?, spec.dtype),
        TargetOp::Rescale(spec) => op_rescale(expect_single(inputs)?, spec, dtype),
        TargetOp::Reshape(spec) => op_reshape(expect_single(inputs)?, &spec.new_shape, dtype),
        TargetOp::Transpose(spec) => op_transpose(expect_single(inputs)?, &spec.perm, dtype),
        TargetOp::Slice(spec) => op_slice(expect_single(inputs)?, spec, dtype),
        TargetOp::Concat(spec) => op_concat(inputs, spec.axis, dtype),
        TargetOp::Reduce(spec) => op_reduce(expect_single(inputs)?, spec.kind, spec.axis, dtype),
        TargetOp::ArgMax(spec) => op_argmax(expect_single(inputs)?, spec.axis, dtype),
        TargetOp::MatMul(spec) => {
            let [lhs, rhs] = expect_n::<2>(inputs)?;
            op_matmul(lhs, rhs, spec, dtype)
        }
        TargetOp::Conv2d(spec) => {
            let [input, weight, bias] = expect_n::<3>(inputs)?;
            op_conv2d(input, weight, bias, spec, dtype)
        }
        TargetOp::MaxPool2d(spec) => op_pool(expect_single(inputs)?, spec, PoolKind::Max, dtype),
        TargetOp::AvgPool2d(spec) => op_pool(expect_single(inputs)?, spec, PoolKind::Avg, dtype),
        TargetOp::Gather => {
            let [values, indices] = expect_n::<2>(inputs)?;
            op_gather(values, indices, dtype)
        }
    }
}

fn op_unary(input: &CpuTensor, op: UnaryOp, dtype: DType) -> BackendResult<CpuTensor> {
    let data = match &input.data {
        TensorData::F32(values) => {
            let f: fn(f32) -> f32 = match op {
                UnaryOp::Abs => f32::abs,
                UnaryOp::Negate => |x| -x,
                UnaryOp::Exp => f32::exp,
                UnaryOp::Log => f32::ln,
                UnaryOp::Tanh => f32::tanh,
                UnaryOp::Sigmoid => |x| 1.0 / (1.0 + (-x).exp()),
                UnaryOp::Rsqrt => |x| 1.0 / x.sqrt(),
                UnaryOp::Reciprocal => |x| 1.0 / x,
                UnaryOp::Floor => f32::floor,
                UnaryOp::Ceil => f32::ceil,
                UnaryOp::BitwiseNot | UnaryOp::LogicalNot => {
                    return Err(BackendError::execution(format!(
                        "{op:?} is not defined for float tensors"
                    )))
                }
            };
            TensorData::F32(values.iter().map(|&x| f(x)).collect())
        }
        TensorData::Int(values) => {
            let f: fn(i64) -> i64 = match op {
                UnaryOp::Abs => i64::wrapping_abs,
                UnaryOp::Negate => i64::wrapping_neg,
                UnaryOp::BitwiseNot => |x| !x,
                UnaryOp::Floor | UnaryOp::Ceil => |x| x,
                other => {
                    return Err(BackendError::execution(format!(
                        "{other:?} is not defined for integer tensors"
                    )))
                }
            };
            TensorData::Int(values.iter().map(|&x| wrap_int(f(x), dtype)).collect())
        }
        TensorData::Bool(values) => match op {
            UnaryOp::LogicalNot | UnaryOp::BitwiseNot => {
                TensorData::Bool(values.iter().map(|&x| !x).collect())
            }
            other => {
                return Err(BackendError::execution(format!(
                    "{other:?} is not defined for boolean tensors"
                )))
            }
        },
    };
    Ok(CpuTensor::with_data(dtype, input.dims.clone(), data))
}

fn float_binary(op: BinaryOp, x: f32, y: f32) -> BackendResult<f32> {
    Ok(match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::IntDiv => (x / y).trunc(),
        BinaryOp::Maximum => x.max(y),
        BinaryOp::Minimum => x.min(y),
        BinaryOp::Pow => x.powf(y),
        other => {
            return Err(BackendError::execution(format!(
                "{other:?} is not defined for float tensors"
            )))
        }
    })
}

fn int_binary(op: BinaryOp, x: i64, y: i64) -> BackendResult<i64> {
    Ok(match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::IntDiv => {
            if y == 0 {
                return Err(BackendError::execution("integer division by zero"));
            }
            x.wrapping_div(y)
        }
        BinaryOp::Maximum => x.max(y),
        BinaryOp::Minimum => x.min(y),
        BinaryOp::Pow => {
            let exponent = u32::try_from(y).map_err(|_| {
                BackendError::execution(format!("integer power with exponent {y}"))
            })?;
            x.wrapping_pow(exponent)
        }
        BinaryOp::BitwiseAnd => x & y,
        BinaryOp::BitwiseOr => x | y,
        BinaryOp::BitwiseXor => x ^ y,
        other => {
            return Err(BackendError::execution(format!(
                "{other:?} is not defined for integer tensors"
            )))
        }
    })
}

fn bool_binary(op: BinaryOp, x: bool, y: bool) -> BackendResult<bool> {
    Ok(match op {
        BinaryOp::LogicalAnd | BinaryOp::BitwiseAnd | BinaryOp::Mul | BinaryOp::Minimum => x && y,
        BinaryOp::LogicalOr | BinaryOp::BitwiseOr | BinaryOp::Maximum => x || y,
        BinaryOp::BitwiseXor => x ^ y,
        other => {
            return Err(BackendError::execution(format!(
                "{other:?} is not defined for boolean tensors"
            )))
        }
    })
}

fn op_binary(
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    op: BinaryOp,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let dims = broadcast_dims(&lhs.dims, &rhs.dims)?;
    let lp = broadcast_positions(&lhs.dims, &dims);
    let rp = broadcast_positions(&rhs.dims, &dims);
    let pairs = lp.iter().zip(&rp);
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(
            pairs
                .map(|(&i, &j)| float_binary(op, a[i], b[j]))
                .collect::<BackendResult<Vec<_>>>()?
                .into(),
        ),
        (TensorData::Int(a), TensorData::Int(b)) => TensorData::Int(
            pairs
                .map(|(&i, &j)| int_binary(op, a[i], b[j]).map(|v| wrap_int(v, dtype)))
                .collect::<BackendResult<Vec<_>>>()?
                .into(),
        ),
        (TensorData::Bool(a), TensorData::Bool(b)) => TensorData::Bool(
            pairs
                .map(|(&i, &j)| bool_binary(op, a[i], b[j]))
                .collect::<BackendResult<Vec<_>>>()?
                .into(),
        ),
        _ => {
            return Err(BackendError::execution(format!(
                "binary operands disagree: {:?} and {:?}",
                lhs.dtype, rhs.dtype
            )))
        }
    };
    Ok(CpuTensor::with_data(dtype, dims, data))
}

fn op_compare(lhs: &CpuTensor, rhs: &CpuTensor, op: CompareOp) -> BackendResult<CpuTensor> {
    fn apply<T: PartialOrd>(op: CompareOp, x: T, y: T) -> bool {
        match op {
            CompareOp::Greater => x > y,
            CompareOp::GreaterEqual => x >= y,
            CompareOp::Equal => x == y,
        }
    }
    let dims = broadcast_dims(&lhs.dims, &rhs.dims)?;
    let lp = broadcast_positions(&lhs.dims, &dims);
    let rp = broadcast_positions(&rhs.dims, &dims);
    let pairs = lp.iter().zip(&rp);
    let values: Vec<bool> = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            pairs.map(|(&i, &j)| apply(op, a[i], b[j])).collect()
        }
        (TensorData::Int(a), TensorData::Int(b)) => {
            pairs.map(|(&i, &j)| apply(op, a[i], b[j])).collect()
        }
        (TensorData::Bool(a), TensorData::Bool(b)) => {
            pairs.map(|(&i, &j)| apply(op, a[i], b[j])).collect()
        }
        _ => {
            return Err(BackendError::execution(format!(
                "compare operands disagree: {:?} and {:?}",
                lhs.dtype, rhs.dtype
            )))
        }
    };
    Ok(CpuTensor::bool(&dims, values))
}

fn op_select(
    cond: &CpuTensor,
    on_true: &CpuTensor,
    on_false: &CpuTensor,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let flags = cond.as_bool()?;
    let dims = broadcast_dims(&cond.dims, &broadcast_dims(&on_true.dims, &on_false.dims)?)?;
    let cp = broadcast_positions(&cond.dims, &dims);
    let tp = broadcast_positions(&on_true.dims, &dims);
    let fp = broadcast_positions(&on_false.dims, &dims);
    let data = match (&on_true.data, &on_false.data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(
            (0..cp.len())
                .map(|k| if flags[cp[k]] { a[tp[k]] } else { b[fp[k]] })
                .collect(),
        ),
        (TensorData::Int(a), TensorData::Int(b)) => TensorData::Int(
            (0..cp.len())
                .map(|k| if flags[cp[k]] { a[tp[k]] } else { b[fp[k]] })
                .collect(),
        ),
        (TensorData::Bool(a), TensorData::Bool(b)) => TensorData::Bool(
            (0..cp.len())
                .map(|k| if flags[cp[k]] { a[tp[k]] } else { b[fp[k]] })
                .collect(),
        ),
        _ => {
            return Err(BackendError::execution(format!(
                "select branches disagree: {:?} and {:?}",
                on_true.dtype, on_false.dtype
            )))
        }
    };
    Ok(CpuTensor::with_data(dtype, dims, data))
}

fn op_clamp(input: &CpuTensor, spec: &ClampSpec, dtype: DType) -> BackendResult<CpuTensor> {
    let data = match &input.data {
        TensorData::F32(values) => TensorData::F32(
            values
                .iter()
                .map(|&x| x.max(spec.min_fp).min(spec.max_fp))
                .collect(),
        ),
        TensorData::Int(values) => TensorData::Int(
            values
                .iter()
                .map(|&x| x.max(spec.min_int).min(spec.max_int))
                .collect(),
        ),
        TensorData::Bool(_) => {
            return Err(BackendError::execution("clamp is not defined for booleans"))
        }
    };
    Ok(CpuTensor::with_data(dtype, input.dims.clone(), data))
}

/// Float to integer conversion truncates toward zero and saturates; NaN becomes 0.
fn op_cast(input: &CpuTensor, dtype: DType) -> BackendResult<CpuTensor> {
    let data = if dtype.is_float() {
        match &input.data {
            TensorData::F32(values) => TensorData::F32(values.clone()),
            TensorData::Int(values) => TensorData::F32(values.iter().map(|&x| x as f32).collect()),
            TensorData::Bool(values) => {
                TensorData::F32(values.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect())
            }
        }
    } else if dtype == DType::I1 {
        match &input.data {
            TensorData::F32(values) => TensorData::Bool(values.iter().map(|&x| x != 0.0).collect()),
            TensorData::Int(values) => TensorData::Bool(values.iter().map(|&x| x != 0).collect()),
            TensorData::Bool(values) => TensorData::Bool(values.clone()),
        }
    } else {
        let (min, max) = int_range(dtype);
        match &input.data {
            TensorData::F32(values) => TensorData::Int(
                values
                    .iter()
                    .map(|&x| {
                        if x.is_nan() {
                            0
                        } else {
                            (x.trunc() as f64).clamp(min as f64, max as f64) as i64
                        }
                    })
                    .collect(),
            ),
            TensorData::Int(values) => {
                TensorData::Int(values.iter().map(|&x| wrap_int(x, dtype)).collect())
            }
            TensorData::Bool(values) => TensorData::Int(values.iter().map(|&x| x as i64).collect()),
        }
    };
    Ok(CpuTensor::with_data(dtype, input.dims.clone(), data))
}

/// `round((x - input_zp) * scale) + output_zp`, rounding half away from zero and
/// saturating to the output type.
fn op_rescale(input: &CpuTensor, spec: &RescaleSpec, dtype: DType) -> BackendResult<CpuTensor> {
    let values = input.as_int()?;
    let (min, max) = int_range(dtype);
    let out = values
        .iter()
        .map(|&x| {
            let scaled = ((x - spec.input_zero_point) as f64 * spec.scale).round() as i64;
            scaled.saturating_add(spec.output_zero_point).clamp(min, max)
        })
        .collect::<Vec<_>>();
    Ok(CpuTensor::int(dtype, &input.dims, out))
}

fn op_reshape(input: &CpuTensor, new_shape: &[ReshapeDim], dtype: DType) -> BackendResult<CpuTensor> {
    let count = input.element_count();
    let fixed: usize = new_shape
        .iter()
        .map(|dim| match dim {
            ReshapeDim::Fixed(extent) => *extent,
            ReshapeDim::Infer => 1,
        })
        .product();
    let inferred = if new_shape.contains(&ReshapeDim::Infer) {
        if fixed == 0 || count % fixed != 0 {
            return Err(BackendError::execution(format!(
                "cannot infer a reshape extent for {count} elements"
            )));
        }
        count / fixed
    } else {
        1
    };
    let dims: Vec<usize> = new_shape
        .iter()
        .map(|dim| match dim {
            ReshapeDim::Fixed(extent) => *extent,
            ReshapeDim::Infer => inferred,
        })
        .collect();
    if dims.iter().product::<usize>() != count {
        return Err(BackendError::execution("reshape element count mismatch"));
    }
    Ok(CpuTensor::with_data(dtype, dims, input.data.clone()))
}

fn op_transpose(input: &CpuTensor, perm: &[usize], dtype: DType) -> BackendResult<CpuTensor> {
    if perm.len() != input.dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims: Vec<usize> = perm.iter().map(|&axis| input.dims[axis]).collect();
    let in_strides = compute_strides(&input.dims);
    let positions: Vec<usize> = (0..out_dims.iter().product())
        .map(|idx| {
            unravel_index(idx, &out_dims)
                .iter()
                .zip(perm)
                .map(|(&coord, &axis)| coord * in_strides[axis])
                .sum()
        })
        .collect();
    Ok(CpuTensor::with_data(dtype, out_dims, input.data.take(&positions)))
}

fn op_slice(input: &CpuTensor, spec: &SliceSpec, dtype: DType) -> BackendResult<CpuTensor> {
    let rank = input.dims.len();
    if spec.starts.len() != rank || spec.sizes.len() != rank {
        return Err(BackendError::execution("slice rank mismatch"));
    }
    for axis in 0..rank {
        if spec.starts[axis] + spec.sizes[axis] > input.dims[axis] {
            return Err(BackendError::execution("slice out of bounds"));
        }
    }
    let strides = compute_strides(&input.dims);
    let positions: Vec<usize> = (0..spec.sizes.iter().product())
        .map(|idx| {
            unravel_index(idx, &spec.sizes)
                .iter()
                .enumerate()
                .map(|(axis, &coord)| (spec.starts[axis] + coord) * strides[axis])
                .sum()
        })
        .collect();
    Ok(CpuTensor::with_data(
        dtype,
        spec.sizes.clone(),
        input.data.take(&positions),
    ))
}

fn op_concat(inputs: &[&CpuTensor], axis: usize, dtype: DType) -> BackendResult<CpuTensor> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("concat needs at least one operand"))?;
    let rank = first.dims.len();
    if axis >= rank {
        return Err(BackendError::execution("concat axis out of range"));
    }
    for input in inputs {
        let agrees = input.dims.len() == rank
            && (0..rank).all(|k| k == axis || input.dims[k] == first.dims[k]);
        if !agrees {
            return Err(BackendError::execution(format!(
                "concat operand {:?} does not match {:?}",
                input.dims, first.dims
            )));
        }
    }
    let outer: usize = first.dims[..axis].iter().product();
    let inner: usize = first.dims[axis + 1..].iter().product();
    let mut sources = Vec::new();
    for o in 0..outer {
        for (part, input) in inputs.iter().enumerate() {
            let chunk = input.dims[axis] * inner;
            sources.extend((0..chunk).map(|k| (part, o * chunk + k)));
        }
    }
    let data = match &first.data {
        TensorData::F32(_) => {
            let parts = inputs.iter().map(|t| t.as_f32()).collect::<BackendResult<Vec<_>>>()?;
            TensorData::F32(sources.iter().map(|&(p, k)| parts[p][k]).collect())
        }
        TensorData::Int(_) => {
            let parts = inputs.iter().map(|t| t.as_int()).collect::<BackendResult<Vec<_>>>()?;
            TensorData::Int(sources.iter().map(|&(p, k)| parts[p][k]).collect())
        }
        TensorData::Bool(_) => {
            let parts = inputs.iter().map(|t| t.as_bool()).collect::<BackendResult<Vec<_>>>()?;
            TensorData::Bool(sources.iter().map(|&(p, k)| parts[p][k]).collect())
        }
    };
    let mut dims = first.dims.clone();
    dims[axis] = inputs.iter().map(|t| t.dims[axis]).sum();
    Ok(CpuTensor::with_data(dtype, dims, data))
}

/// `(outer, extent, inner)` around `axis`.
fn split_axis(dims: &[usize], axis: usize) -> BackendResult<(usize, usize, usize)> {
    if axis >= dims.len() {
        return Err(BackendError::execution(format!(
            "axis {axis} out of range for {dims:?}"
        )));
    }
    Ok((
        dims[..axis].iter().product(),
        dims[axis],
        dims[axis + 1..].iter().product(),
    ))
}

fn op_reduce(
    input: &CpuTensor,
    kind: ReduceKind,
    axis: usize,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let (outer, extent, inner) = split_axis(&input.dims, axis)?;
    let lanes = |o: usize, i: usize| (0..extent).map(move |k| (o * extent + k) * inner + i);
    let slots: Vec<(usize, usize)> = (0..outer)
        .flat_map(|o| (0..inner).map(move |i| (o, i)))
        .collect();
    let data = match (&input.data, kind) {
        (TensorData::F32(values), _) => {
            let fold = |o, i| -> BackendResult<f32> {
                let lane = lanes(o, i).map(|p| values[p]);
                Ok(match kind {
                    ReduceKind::Sum => lane.sum(),
                    ReduceKind::Prod => lane.product(),
                    ReduceKind::Max => lane.fold(f32::NEG_INFINITY, f32::max),
                    ReduceKind::Min => lane.fold(f32::INFINITY, f32::min),
                    other => {
                        return Err(BackendError::execution(format!(
                            "{other:?} reduction is not defined for floats"
                        )))
                    }
                })
            };
            TensorData::F32(
                slots
                    .iter()
                    .map(|&(o, i)| fold(o, i))
                    .collect::<BackendResult<Vec<_>>>()?
                    .into(),
            )
        }
        (TensorData::Int(values), _) => {
            let fold = |o, i| -> BackendResult<i64> {
                let mut lane = lanes(o, i).map(|p| values[p]);
                Ok(match kind {
                    ReduceKind::Sum => lane.fold(0i64, i64::wrapping_add),
                    ReduceKind::Prod => lane.fold(1i64, i64::wrapping_mul),
                    ReduceKind::Max => lane.fold(i64::MIN, i64::max),
                    ReduceKind::Min => lane.fold(i64::MAX, i64::min),
                    ReduceKind::Any => i64::from(lane.any(|x| x != 0)),
                    ReduceKind::All => i64::from(lane.all(|x| x != 0)),
                })
            };
            TensorData::Int(
                slots
                    .iter()
                    .map(|&(o, i)| fold(o, i).map(|v| wrap_int(v, dtype)))
                    .collect::<BackendResult<Vec<_>>>()?
                    .into(),
            )
        }
        (TensorData::Bool(values), ReduceKind::Any | ReduceKind::Max) => TensorData::Bool(
            slots
                .iter()
                .map(|&(o, i)| lanes(o, i).any(|p| values[p]))
                .collect(),
        ),
        (TensorData::Bool(values), ReduceKind::All | ReduceKind::Min) => TensorData::Bool(
            slots
                .iter()
                .map(|&(o, i)| lanes(o, i).all(|p| values[p]))
                .collect(),
        ),
        (TensorData::Bool(_), other) => {
            return Err(BackendError::execution(format!(
                "{other:?} reduction is not defined for booleans"
            )))
        }
    };
    let mut dims = input.dims.clone();
    dims[axis] = 1;
    Ok(CpuTensor::with_data(dtype, dims, data))
}

/// First index of the maximum along `axis`.
fn op_argmax(input: &CpuTensor, axis: usize, dtype: DType) -> BackendResult<CpuTensor> {
    let (outer, extent, inner) = split_axis(&input.dims, axis)?;
    if extent == 0 {
        return Err(BackendError::execution("argmax over an empty axis"));
    }
    let keys: Vec<f64> = match &input.data {
        TensorData::F32(values) => values.iter().map(|&x| f64::from(x)).collect(),
        TensorData::Int(values) => values.iter().map(|&x| x as f64).collect(),
        TensorData::Bool(values) => values.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
    };
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            for k in 1..extent {
                if keys[(o * extent + k) * inner + i] > keys[(o * extent + best) * inner + i] {
                    best = k;
                }
            }
            out.push(best as i64);
        }
    }
    let mut dims = input.dims.clone();
    dims.remove(axis);
    Ok(CpuTensor::int(dtype, &dims, out))
}

fn op_matmul(
    lhs: &CpuTensor,
    rhs: &CpuTensor,
    spec: &MatMulSpec,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let (&[lb, m, k], &[rb, k2, n]) = (lhs.dims.as_slice(), rhs.dims.as_slice()) else {
        return Err(BackendError::execution(format!(
            "matmul expects rank-3 operands, got {:?} and {:?}",
            lhs.dims, rhs.dims
        )));
    };
    if k != k2 || (lb != rb && lb != 1 && rb != 1) {
        return Err(BackendError::execution(format!(
            "matmul operands {:?} and {:?} are incompatible",
            lhs.dims, rhs.dims
        )));
    }
    let batch = lb.max(rb);
    let l_index = |b: usize, i: usize, c: usize| (if lb == 1 { 0 } else { b }) * m * k + i * k + c;
    let r_index = |b: usize, c: usize, j: usize| (if rb == 1 { 0 } else { b }) * k * n + c * n + j;
    let dims = vec![batch, m, n];
    let data = match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(w)) => {
            let mut out = vec![0.0f32; batch * m * n];
            for b in 0..batch {
                for i in 0..m {
                    for j in 0..n {
                        out[(b * m + i) * n + j] =
                            (0..k).map(|c| a[l_index(b, i, c)] * w[r_index(b, c, j)]).sum();
                    }
                }
            }
            TensorData::F32(out.into())
        }
        (TensorData::Int(a), TensorData::Int(w)) => {
            let mut out = vec![0i64; batch * m * n];
            for b in 0..batch {
                for i in 0..m {
                    for j in 0..n {
                        let acc = (0..k).fold(0i64, |acc, c| {
                            let x = a[l_index(b, i, c)] - spec.lhs_zero_point;
                            let y = w[r_index(b, c, j)] - spec.rhs_zero_point;
                            acc.wrapping_add(x.wrapping_mul(y))
                        });
                        out[(b * m + i) * n + j] = wrap_int(acc, dtype);
                    }
                }
            }
            TensorData::Int(out.into())
        }
        _ => {
            return Err(BackendError::execution(format!(
                "matmul operands disagree: {:?} and {:?}",
                lhs.dtype, rhs.dtype
            )))
        }
    };
    Ok(CpuTensor::with_data(dtype, dims, data))
}

fn window_extent(
    input: usize,
    pad: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> BackendResult<usize> {
    let span = dilation * (kernel.max(1) - 1) + 1;
    if stride == 0 || kernel == 0 || input + pad < span {
        return Err(BackendError::execution(format!(
            "window {kernel} (stride {stride}) does not fit extent {input} with padding {pad}"
        )));
    }
    Ok((input + pad - span) / stride + 1)
}

/// Input coordinate under a window tap, or `None` inside the padding.
fn tap(out: usize, stride: usize, offset: usize, pad_before: usize, extent: usize) -> Option<usize> {
    (out * stride + offset)
        .checked_sub(pad_before)
        .filter(|&coord| coord < extent)
}

/// NHWC input, OHWI weight, bias of length O.
fn op_conv2d(
    input: &CpuTensor,
    weight: &CpuTensor,
    bias: &CpuTensor,
    spec: &Conv2dSpec,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let (&[batch, h, w, c], &[o, kh, kw, wc]) = (input.dims.as_slice(), weight.dims.as_slice())
    else {
        return Err(BackendError::execution(format!(
            "conv2d expects rank-4 input and weight, got {:?} and {:?}",
            input.dims, weight.dims
        )));
    };
    if c != wc || bias.dims != [o] {
        return Err(BackendError::execution(format!(
            "conv2d input {:?}, weight {:?} and bias {:?} disagree",
            input.dims, weight.dims, bias.dims
        )));
    }
    let [top, bottom, left, right] = spec.padding;
    let oh = window_extent(h, top + bottom, kh, spec.stride[0], spec.dilation[0])?;
    let ow = window_extent(w, left + right, kw, spec.stride[1], spec.dilation[1])?;
    let dims = vec![batch, oh, ow, o];

    let mut taps = Vec::with_capacity(batch * oh * ow * o);
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                for f in 0..o {
                    let mut pairs = Vec::new();
                    for dy in 0..kh {
                        let Some(iy) = tap(y, spec.stride[0], dy * spec.dilation[0], top, h) else {
                            continue;
                        };
                        for dx in 0..kw {
                            let Some(ix) = tap(x, spec.stride[1], dx * spec.dilation[1], left, w)
                            else {
                                continue;
                            };
                            for ch in 0..c {
                                let in_pos = ((b * h + iy) * w + ix) * c + ch;
                                let w_pos = ((f * kh + dy) * kw + dx) * c + ch;
                                pairs.push((in_pos, w_pos));
                            }
                        }
                    }
                    taps.push((f, pairs));
                }
            }
        }
    }

    let data = match (&input.data, &weight.data, &bias.data) {
        (TensorData::F32(a), TensorData::F32(k), TensorData::F32(bias)) => TensorData::F32(
            taps.iter()
                .map(|(f, pairs)| bias[*f] + pairs.iter().map(|&(i, j)| a[i] * k[j]).sum::<f32>())
                .collect(),
        ),
        (TensorData::Int(a), TensorData::Int(k), TensorData::Int(bias)) => TensorData::Int(
            taps.iter()
                .map(|(f, pairs)| {
                    let acc = pairs.iter().fold(bias[*f], |acc, &(i, j)| {
                        let x = a[i] - spec.input_zero_point;
                        let y = k[j] - spec.weight_zero_point;
                        acc.wrapping_add(x.wrapping_mul(y))
                    });
                    wrap_int(acc, dtype)
                })
                .collect(),
        ),
        _ => {
            return Err(BackendError::execution(format!(
                "conv2d operands disagree: {:?}, {:?} and {:?}",
                input.dtype, weight.dtype, bias.dtype
            )))
        }
    };
    Ok(CpuTensor::with_data(dtype, dims, data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Max,
    Avg,
}

/// NHWC pooling. Padded positions never contribute: max ignores them and the average
/// divides by the number of real elements under the window.
fn op_pool(
    input: &CpuTensor,
    spec: &PoolSpec,
    kind: PoolKind,
    dtype: DType,
) -> BackendResult<CpuTensor> {
    let &[batch, h, w, c] = input.dims.as_slice() else {
        return Err(BackendError::execution(format!(
            "pooling expects an NHWC input, got {:?}",
            input.dims
        )));
    };
    let [top, bottom, left, right] = spec.padding;
    let oh = window_extent(h, top + bottom, spec.kernel[0], spec.stride[0], 1)?;
    let ow = window_extent(w, left + right, spec.kernel[1], spec.stride[1], 1)?;

    let mut windows = Vec::with_capacity(batch * oh * ow * c);
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                for ch in 0..c {
                    let mut positions = Vec::new();
                    for dy in 0..spec.kernel[0] {
                        let Some(iy) = tap(y, spec.stride[0], dy, top, h) else {
                            continue;
                        };
                        for dx in 0..spec.kernel[1] {
                            if let Some(ix) = tap(x, spec.stride[1], dx, left, w) {
                                positions.push(((b * h + iy) * w + ix) * c + ch);
                            }
                        }
                    }
                    if positions.is_empty() {
                        return Err(BackendError::execution("pooling window lies in padding"));
                    }
                    windows.push(positions);
                }
            }
        }
    }

    let data = match (&input.data, kind) {
        (TensorData::F32(values), PoolKind::Max) => TensorData::F32(
            windows
                .iter()
                .map(|ps| ps.iter().map(|&p| values[p]).fold(f32::NEG_INFINITY, f32::max))
                .collect(),
        ),
        (TensorData::F32(values), PoolKind::Avg) => TensorData::F32(
            windows
                .iter()
                .map(|ps| ps.iter().map(|&p| values[p]).sum::<f32>() / ps.len() as f32)
                .collect(),
        ),
        (TensorData::Int(values), PoolKind::Max) => TensorData::Int(
            windows
                .iter()
                .map(|ps| ps.iter().map(|&p| values[p]).fold(i64::MIN, i64::max))
                .collect(),
        ),
        _ => {
            return Err(BackendError::execution(format!(
                "{kind:?} pooling is not defined for {:?}",
                input.dtype
            )))
        }
    };
    Ok(CpuTensor::with_data(dtype, vec![batch, oh, ow, c], data))
}

/// Values `[N, K, C]` at `Si32` indices `[N, W]`, producing `[N, W, C]`.
fn op_gather(values: &CpuTensor, indices: &CpuTensor, dtype: DType) -> BackendResult<CpuTensor> {
    let (&[n, k, c], &[n2, width]) = (values.dims.as_slice(), indices.dims.as_slice()) else {
        return Err(BackendError::execution(format!(
            "gather expects [N, K, C] values and [N, W] indices, got {:?} and {:?}",
            values.dims, indices.dims
        )));
    };
    if n != n2 {
        return Err(BackendError::execution("gather batch mismatch"));
    }
    let rows = indices.as_int()?;
    let mut positions = Vec::with_capacity(n * width * c);
    for b in 0..n {
        for j in 0..width {
            let row = rows[b * width + j];
            let row = usize::try_from(row)
                .ok()
                .filter(|&row| row < k)
                .ok_or_else(|| {
                    BackendError::execution(format!("gather index {row} out of bounds for {k}"))
                })?;
            positions.extend((0..c).map(|ch| (b * k + row) * c + ch));
        }
    }
    Ok(CpuTensor::with_data(
        dtype,
        vec![n, width, c],
        values.data.take(&positions),
    ))
}

fn expect_single<'a>(inputs: &[&'a CpuTensor]) -> BackendResult<&'a CpuTensor> {
    let [input] = expect_n::<1>(inputs)?;
    Ok(input)
}

fn expect_n<'a, const N: usize>(inputs: &[&'a CpuTensor]) -> BackendResult<[&'a CpuTensor; N]> {
    <[&CpuTensor; N]>::try_from(inputs).map_err(|_| {
        BackendError::execution(format!(
            "operation expects {N} operand(s), got {}",
            inputs.len()
        ))
    })
}

/// Right-aligned broadcast of two static shapes.
fn broadcast_dims(lhs: &[usize], rhs: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut dims = vec![1; rank];
    for (axis, slot) in dims.iter_mut().enumerate() {
        let a = (axis + lhs.len()).checked_sub(rank).map_or(1, |i| lhs[i]);
        let b = (axis + rhs.len()).checked_sub(rank).map_or(1, |i| rhs[i]);
        *slot = match (a, b) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(BackendError::execution(format!(
                    "{lhs:?} does not broadcast with {rhs:?}"
                )))
            }
        };
    }
    Ok(dims)
}

/// For each element of `out_dims`, the flat position it reads from a `dims` tensor.
fn broadcast_positions(dims: &[usize], out_dims: &[usize]) -> Vec<usize> {
    let count: usize = out_dims.iter().product();
    if dims == out_dims {
        return (0..count).collect();
    }
    let offset = out_dims.len() - dims.len();
    let strides = compute_strides(dims);
    (0..count)
        .map(|idx| {
            unravel_index(idx, out_dims)
                .iter()
                .skip(offset)
                .enumerate()
                .map(|(axis, &coord)| if dims[axis] == 1 { 0 } else { coord * strides[axis] })
                .sum()
        })
        .collect()
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn int_range(dtype: DType) -> (i64, i64) {
    match dtype {
        DType::Ui8 => (0, 255),
        DType::I1 => (0, 1),
        other => {
            let bits = other.bitwidth().min(64) as u32;
            if bits >= 64 {
                (i64::MIN, i64::MAX)
            } else {
                (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
            }
        }
    }
}

/// Two's-complement wrap of `value` to the width of `dtype`.
fn wrap_int(value: i64, dtype: DType) -> i64 {
    match dtype {
        DType::Ui8 => value & 0xff,
        DType::I1 => value & 1,
        other => {
            let bits = other.bitwidth() as u32;
            if bits >= 64 {
                value
            } else {
                let shift = 64 - bits;
                (value << shift) >> shift
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{broadcast_dims, broadcast_positions, wrap_int};
    use tensor_legalize::ir::DType;

    #[test]
    fn broadcast_stretches_unit_axes() {
        assert_eq!(broadcast_dims(&[2, 1, 3], &[4, 1]).unwrap(), vec![2, 4, 3]);
        assert_eq!(broadcast_dims(&[], &[5]).unwrap(), vec![5]);
        assert!(broadcast_dims(&[2], &[3]).is_err());
        assert_eq!(broadcast_positions(&[1, 2], &[2, 2]), vec![0, 1, 0, 1]);
        assert_eq!(broadcast_positions(&[2, 1], &[2, 2]), vec![0, 0, 1, 1]);
    }

    #[test]
    fn integers_wrap_to_their_width() {
        assert_eq!(wrap_int(128, DType::Si8), -128);
        assert_eq!(wrap_int(-1, DType::Ui8), 255);
        assert_eq!(wrap_int(i64::from(i32::MAX) + 1, DType::Si32), i64::from(i32::MIN));
        assert_eq!(wrap_int(-5, DType::Si64), -5);
    }
}
