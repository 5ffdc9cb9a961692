use std::{collections::HashMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::source::SourceOp;
use crate::target::TargetOp;

/// Scalar element types understood by both the source and the target instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si8,
    Si16,
    Si32,
    Si64,
    Ui8,
    F16,
    Bf16,
    F32,
    F64,
    /// Signed 8-bit quantized storage; scale and zero point live on [`TensorType::quant`].
    Qi8,
}

impl DType {
    /// Returns `true` for plain (non-quantized) integers, including `I1`.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I1 | DType::Si8 | DType::Si16 | DType::Si32 | DType::Si64 | DType::Ui8
        )
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(self, DType::Si8 | DType::Si16 | DType::Si32 | DType::Si64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DType::Qi8)
    }

    /// Returns `true` when the dtype is a plain integer or floating-point type.
    pub fn is_int_or_float(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn bitwidth(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si8 | DType::Ui8 | DType::Qi8 => 8,
            DType::Si16 | DType::F16 | DType::Bf16 => 16,
            DType::Si32 | DType::F32 => 32,
            DType::Si64 | DType::F64 => 64,
        }
    }
}

/// Single axis extent. `Dynamic` is the "unknown size" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic,
}

impl Dimension {
    pub fn as_static(self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(value),
            Dimension::Dynamic => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dimension::Dynamic)
    }

    /// Returns `true` when the extent is statically known to be `value`.
    pub fn is(self, value: usize) -> bool {
        self == Dimension::Static(value)
    }

    /// Product of two extents; unknown if either side is unknown.
    pub fn mul(self, other: Dimension) -> Dimension {
        match (self, other) {
            (Dimension::Static(a), Dimension::Static(b)) => Dimension::Static(a * b),
            _ => Dimension::Dynamic,
        }
    }

    /// Two extents are compatible when equal or when either is unknown.
    pub fn is_compatible_with(self, other: Dimension) -> bool {
        match (self, other) {
            (Dimension::Static(a), Dimension::Static(b)) => a == b,
            _ => true,
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Dimension::Static(value)
    }
}

/// Ordered dimension list. The rank is always known even when extents are not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Dimension::Static).collect::<Vec<_>>())
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    /// Rank-`rank` shape of all ones, used for broadcastable constants.
    pub fn ones(rank: usize) -> Self {
        Self::from_static(&vec![1; rank])
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Dimension {
        self.dims[axis]
    }

    pub fn into_dims(self) -> Vec<Dimension> {
        self.dims
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|dim| !dim.is_dynamic())
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|dim| dim.as_static()).collect()
    }

    /// Returns the element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// Same rank and every pair of extents compatible.
    pub fn is_compatible_with(&self, other: &Shape) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.is_compatible_with(*b))
    }
}

/// Affine quantization parameters attached to `Qi8` tensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f64,
    pub zero_point: i64,
}

/// Element type plus shape of a tensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Shape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quant: Option<QuantParams>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self {
            dtype,
            shape,
            quant: None,
        }
    }

    pub fn from_static(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, Shape::from_static(dims))
    }

    pub fn quantized(shape: Shape, quant: QuantParams) -> Self {
        Self {
            dtype: DType::Qi8,
            shape,
            quant: Some(quant),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Same shape, different element type. Quantization parameters are dropped.
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self::new(dtype, self.shape.clone())
    }

    /// Same element type, different shape.
    pub fn with_shape(&self, shape: Shape) -> Self {
        Self {
            dtype: self.dtype,
            shape,
            quant: self.quant,
        }
    }

    /// Same dtype and rank with compatible extents.
    pub fn is_compatible_with(&self, other: &TensorType) -> bool {
        self.dtype == other.dtype && self.shape.is_compatible_with(&other.shape)
    }
}

/// Dense element payload of a literal tensor. Integer dtypes of every width share `Int`.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralData {
    Float(Arc<[f32]>),
    Int(Arc<[i64]>),
    Bool(Arc<[bool]>),
}

impl LiteralData {
    pub fn len(&self) -> usize {
        match self {
            LiteralData::Float(values) => values.len(),
            LiteralData::Int(values) => values.len(),
            LiteralData::Bool(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Literal tensor: a static type plus its elements in row-major order.
///
/// A payload of a single element is a splat and stands for every element of the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLiteral {
    pub ty: TensorType,
    pub data: LiteralData,
}

impl TensorLiteral {
    pub fn new(ty: TensorType, data: LiteralData) -> Self {
        Self { ty, data }
    }

    pub fn f32(dims: &[usize], values: Vec<f32>) -> Self {
        Self::new(
            TensorType::from_static(DType::F32, dims),
            LiteralData::Float(Arc::from(values)),
        )
    }

    pub fn int(dtype: DType, dims: &[usize], values: Vec<i64>) -> Self {
        Self::new(
            TensorType::from_static(dtype, dims),
            LiteralData::Int(Arc::from(values)),
        )
    }

    pub fn bool(dims: &[usize], values: Vec<bool>) -> Self {
        Self::new(
            TensorType::from_static(DType::I1, dims),
            LiteralData::Bool(Arc::from(values)),
        )
    }

    pub fn is_splat(&self) -> bool {
        self.data.len() == 1
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("ty", &self.ty)?;
        match &self.data {
            LiteralData::Float(values) => {
                state.serialize_field("data", &LiteralPayload::Float(values.to_vec()))?
            }
            LiteralData::Int(values) => {
                state.serialize_field("data", &LiteralPayload::Int(values.to_vec()))?
            }
            LiteralData::Bool(values) => {
                state.serialize_field("data", &LiteralPayload::Bool(values.to_vec()))?
            }
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            ty: TensorType,
            data: LiteralPayload,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        let data = match helper.data {
            LiteralPayload::Float(values) => LiteralData::Float(Arc::from(values)),
            LiteralPayload::Int(values) => LiteralData::Int(Arc::from(values)),
            LiteralPayload::Bool(values) => LiteralData::Bool(Arc::from(values)),
        };
        Ok(TensorLiteral { ty: helper.ty, data })
    }
}

#[derive(Serialize, Deserialize)]
enum LiteralPayload {
    Float(Vec<f32>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
}

/// Compile-time value produced by a `Constant` instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstantValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    None,
    Tensor(TensorLiteral),
}

impl ConstantValue {
    /// Type of the value this constant defines.
    pub fn value_type(&self) -> ValueType {
        match self {
            ConstantValue::Int(_) => ValueType::Int,
            ConstantValue::Float(_) => ValueType::Float,
            ConstantValue::Bool(_) => ValueType::Bool,
            ConstantValue::Str(_) => ValueType::Str,
            ConstantValue::None => ValueType::NoneType,
            ConstantValue::Tensor(literal) => ValueType::Tensor(literal.ty.clone()),
        }
    }
}

/// Unique identifier for SSA values in a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Typing information for SSA values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorType),
    Int,
    Float,
    Bool,
    Str,
    IntList,
    NoneType,
    Tuple(Vec<ValueType>),
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            ValueType::Tensor(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }
}

impl From<TensorType> for ValueType {
    fn from(ty: TensorType) -> Self {
        ValueType::Tensor(ty)
    }
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    /// Projection of one result out of a multi-result instruction.
    TupleElement { tuple: ValueId, index: usize },
}

impl Operand {
    /// The SSA value this operand reads (the tuple itself for projections).
    pub fn value(&self) -> ValueId {
        match self {
            Operand::Value(value) => *value,
            Operand::TupleElement { tuple, .. } => *tuple,
        }
    }
}

/// Instruction kinds of the host IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(ConstantValue),
    /// List of scalar operands, e.g. the `dims` argument of a permute.
    ListConstruct,
    Source(SourceOp),
    Target(TargetOp),
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: ValueType,
}

/// Straight-line function over SSA values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<ValueType>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<ValueType>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

#[derive(Debug, Error)]
pub enum IrSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Function {
    pub fn to_json_string(&self) -> Result<String, IrSerdeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, IrSerdeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the instruction defining `value`, if it is not a parameter.
    pub fn instruction(&self, value: ValueId) -> Option<&Instruction> {
        self.body.iter().find(|inst| inst.id == value)
    }

    /// Counts instructions whose operation satisfies `predicate`.
    pub fn count_ops(&self, predicate: impl Fn(&Operation) -> bool) -> usize {
        self.body.iter().filter(|inst| predicate(&inst.op)).count()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("func @{} {{", self.name))?;
        if !self.parameter_ids.is_empty() {
            write_line(f, 1, "params:")?;
            for (value_id, value_type) in self.parameter_ids.iter().zip(self.parameters.iter()) {
                write_line(
                    f,
                    2,
                    &format!("%{} : {}", value_id.0, format_value_type(value_type)),
                )?;
            }
        }
        if !self.body.is_empty() {
            write_line(f, 1, "body:")?;
            for instruction in &self.body {
                fmt_instruction(instruction, 2, f)?;
            }
        }
        if !self.result_ids.is_empty() {
            write_line(f, 1, "results:")?;
            for (value_id, value_type) in self.result_ids.iter().zip(self.results.iter()) {
                write_line(
                    f,
                    2,
                    &format!("%{} : {}", value_id.0, format_value_type(value_type)),
                )?;
            }
        }
        write_line(f, 0, "}")
    }
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(format_operand)
        .collect::<Vec<_>>()
        .join(", ");
    let op_repr = format_operation(&instruction.op);
    let line = if operands.is_empty() {
        format!(
            "%{} = {} -> {}",
            instruction.id.0,
            op_repr,
            format_value_type(&instruction.output)
        )
    } else {
        format!(
            "%{} = {}({}) -> {}",
            instruction.id.0,
            op_repr,
            operands,
            format_value_type(&instruction.output)
        )
    };
    write_line(f, indent, &line)
}

fn format_operation(op: &Operation) -> String {
    match op {
        Operation::Constant(ConstantValue::Int(v)) => format!("constant {v}"),
        Operation::Constant(ConstantValue::Float(v)) => format!("constant {v:?}"),
        Operation::Constant(ConstantValue::Bool(v)) => format!("constant {v}"),
        Operation::Constant(ConstantValue::Str(v)) => format!("constant {v:?}"),
        Operation::Constant(ConstantValue::None) => "constant none".to_string(),
        Operation::Constant(ConstantValue::Tensor(literal)) => format!(
            "literal<{} elems>",
            literal.data.len()
        ),
        Operation::ListConstruct => "list".to_string(),
        Operation::Source(op) => format!("source.{}", op.name()),
        Operation::Target(TargetOp::Const(literal)) => {
            format!("target.const<{} elems>", literal.data.len())
        }
        Operation::Target(op) => format!("target.{op:?}"),
    }
}

pub(crate) fn format_value_type(value_type: &ValueType) -> String {
    match value_type {
        ValueType::Tensor(ty) => match ty.quant {
            Some(quant) => format!(
                "tensor<{:?}[{}, {}] x {}>",
                ty.dtype,
                quant.scale,
                quant.zero_point,
                format_shape(&ty.shape)
            ),
            None => format!("tensor<{:?} x {}>", ty.dtype, format_shape(&ty.shape)),
        },
        ValueType::Int => "int".to_string(),
        ValueType::Float => "float".to_string(),
        ValueType::Bool => "bool".to_string(),
        ValueType::Str => "str".to_string(),
        ValueType::IntList => "list<int>".to_string(),
        ValueType::NoneType => "none".to_string(),
        ValueType::Tuple(elements) => {
            let inner = elements
                .iter()
                .map(format_value_type)
                .collect::<Vec<_>>()
                .join(", ");
            format!("tuple<{}>", inner)
        }
    }
}

pub(crate) fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic => "?".to_string(),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn format_operand(operand: &Operand) -> String {
    match operand {
        Operand::Value(id) => format!("%{}", id.0),
        Operand::TupleElement { tuple, index } => format!("%{}#{}", tuple.0, index),
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Builder for assembling source-level functions programmatically.
#[derive(Default)]
pub struct FunctionBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, ValueType)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, ValueType>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, ty: impl Into<ValueType>) -> ValueId {
        let ty = ty.into();
        let id = self.fresh_id();
        self.value_types.insert(id, ty.clone());
        self.parameters.push((id, ty));
        id
    }

    pub fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: ValueType) -> ValueId {
        let id = self.fresh_id();
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    /// Emits a source operator whose operands are plain values.
    pub fn source(
        &mut self,
        op: SourceOp,
        operands: &[ValueId],
        output: impl Into<ValueType>,
    ) -> ValueId {
        let operands = operands.iter().copied().map(Operand::Value).collect();
        self.emit(Operation::Source(op), operands, output.into())
    }

    pub fn constant(&mut self, value: ConstantValue) -> ValueId {
        let output = value.value_type();
        self.emit(Operation::Constant(value), Vec::new(), output)
    }

    pub fn int(&mut self, value: i64) -> ValueId {
        self.constant(ConstantValue::Int(value))
    }

    pub fn float(&mut self, value: f64) -> ValueId {
        self.constant(ConstantValue::Float(value))
    }

    pub fn bool(&mut self, value: bool) -> ValueId {
        self.constant(ConstantValue::Bool(value))
    }

    pub fn str(&mut self, value: impl Into<String>) -> ValueId {
        self.constant(ConstantValue::Str(value.into()))
    }

    pub fn none(&mut self) -> ValueId {
        self.constant(ConstantValue::None)
    }

    pub fn literal(&mut self, literal: TensorLiteral) -> ValueId {
        self.constant(ConstantValue::Tensor(literal))
    }

    /// Emits one integer constant per element plus the list gathering them.
    pub fn int_list(&mut self, values: &[i64]) -> ValueId {
        let operands = values
            .iter()
            .map(|value| Operand::Value(self.int(*value)))
            .collect();
        self.emit(Operation::ListConstruct, operands, ValueType::IntList)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&ValueType> {
        self.value_types.get(&id)
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> Function {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let ty = self
                .value_types
                .get(id)
                .expect("result value id must have a recorded type")
                .clone();
            results.push(ty);
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        }
    }

    fn fresh_id(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}
