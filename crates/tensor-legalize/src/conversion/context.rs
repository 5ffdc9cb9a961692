use std::collections::HashMap;

use tracing::trace;

use crate::error::{LegalizeError, LegalizeResult};
use crate::index::InstId;
use crate::ir::{
    DType, Dimension, Instruction, Operand, Operation, Shape, TensorLiteral, TensorType, ValueId,
    ValueType,
};
use crate::rewriter::ProgramRewriter;
use crate::shape_helpers::{is_monotonic, permute_shape};
use crate::source::SourceOp;
use crate::target::{CastSpec, ReshapeDim, ReshapeSpec, TargetOp, TransposeSpec};

/// Staging area handed to a rule while it rewrites one source operation.
///
/// Emitted instructions are buffered here and only reach the function once the rule
/// returns `Ok`; a rule that bails out leaves the graph untouched.
pub struct RuleContext<'r, 'f> {
    rewriter: &'r ProgramRewriter<'f>,
    root: InstId,
    op: SourceOp,
    staged: Vec<Instruction>,
    staged_types: HashMap<ValueId, ValueType>,
    next_value: u32,
    implicit_broadcast: bool,
}

impl<'r, 'f> RuleContext<'r, 'f> {
    /// Creates a context for `root`, which must be a source operation.
    pub fn new(rewriter: &'r ProgramRewriter<'f>, root: InstId) -> Self {
        let Operation::Source(op) = rewriter.op(root) else {
            panic!("rule context requires a source operation root");
        };
        Self {
            rewriter,
            root,
            op: *op,
            staged: Vec::new(),
            staged_types: HashMap::new(),
            next_value: rewriter.next_value_id().0,
            implicit_broadcast: false,
        }
    }

    pub fn op(&self) -> SourceOp {
        self.op
    }

    pub fn root(&self) -> InstId {
        self.root
    }

    pub fn rewriter(&self) -> &ProgramRewriter<'f> {
        self.rewriter
    }

    pub fn operand_count(&self) -> usize {
        self.rewriter.operands(self.root).len()
    }

    /// Returns the value feeding operand `index`.
    pub fn operand(&self, index: usize) -> LegalizeResult<ValueId> {
        match self.rewriter.operands(self.root).get(index) {
            Some(Operand::Value(value)) => Ok(*value),
            Some(Operand::TupleElement { tuple, index: element }) => Err(LegalizeError::operand(
                format!("operand {index} projects #{element} of unconverted %{}", tuple.0),
            )),
            None => Err(LegalizeError::operand(format!(
                "{} expects at least {} operand(s), got {}",
                self.op.name(),
                index + 1,
                self.operand_count()
            ))),
        }
    }

    /// Type of an existing or staged value.
    pub fn value_type(&self, value: ValueId) -> Option<&ValueType> {
        self.staged_types
            .get(&value)
            .or_else(|| self.rewriter.type_of(value))
    }

    pub fn tensor_type(&self, value: ValueId) -> LegalizeResult<TensorType> {
        match self.value_type(value) {
            Some(ValueType::Tensor(ty)) => Ok(ty.clone()),
            Some(other) => Err(LegalizeError::operand(format!(
                "%{} is not a tensor ({other:?})",
                value.0
            ))),
            None => Err(LegalizeError::operand(format!("%{} is undefined", value.0))),
        }
    }

    /// Operand `index` together with its tensor type.
    pub fn tensor_operand(&self, index: usize) -> LegalizeResult<(ValueId, TensorType)> {
        let value = self.operand(index)?;
        Ok((value, self.tensor_type(value)?))
    }

    /// Declared tensor type of a single-result root.
    pub fn result_type(&self) -> LegalizeResult<TensorType> {
        match &self.rewriter.instruction(self.root).output {
            ValueType::Tensor(ty) => Ok(ty.clone()),
            other => Err(LegalizeError::unsupported_type(format!(
                "{} must produce a tensor, declared {other:?}",
                self.op.name()
            ))),
        }
    }

    /// Declared tensor types of a multi-result root.
    pub fn result_types(&self) -> LegalizeResult<Vec<TensorType>> {
        match &self.rewriter.instruction(self.root).output {
            ValueType::Tuple(elements) => elements
                .iter()
                .map(|element| match element {
                    ValueType::Tensor(ty) => Ok(ty.clone()),
                    other => Err(LegalizeError::unsupported_type(format!(
                        "{} result must be a tensor, declared {other:?}",
                        self.op.name()
                    ))),
                })
                .collect(),
            ValueType::Tensor(ty) => Ok(vec![ty.clone()]),
            other => Err(LegalizeError::unsupported_type(format!(
                "{} must produce tensors, declared {other:?}",
                self.op.name()
            ))),
        }
    }

    /// Operation defining `value` in the existing graph; `None` for parameters and
    /// staged values.
    pub fn defining_op(&self, value: ValueId) -> Option<&Operation> {
        if self.staged_types.contains_key(&value) {
            return None;
        }
        self.rewriter.defining_op(value)
    }

    /// Operands of the instruction defining `value`, empty for parameters.
    pub fn defining_operands(&self, value: ValueId) -> &[Operand] {
        match self.rewriter.inst_of(value) {
            Some(inst) if !self.staged_types.contains_key(&value) => {
                self.rewriter.operands(inst)
            }
            _ => &[],
        }
    }

    /// Stages a target instruction and returns its provisional value id.
    pub fn emit(&mut self, op: TargetOp, operands: &[ValueId], ty: TensorType) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        let output = ValueType::Tensor(ty);
        self.staged_types.insert(id, output.clone());
        self.staged.push(Instruction {
            id,
            op: Operation::Target(op),
            operands: operands.iter().copied().map(Operand::Value).collect(),
            output,
        });
        id
    }

    pub fn constant(&mut self, literal: TensorLiteral) -> ValueId {
        let ty = literal.ty.clone();
        self.emit(TargetOp::Const(literal), &[], ty)
    }

    /// Rank-`rank` single-element f32 constant that broadcasts against anything.
    pub fn f32_splat(&mut self, value: f32, rank: usize) -> ValueId {
        self.constant(TensorLiteral::f32(&vec![1; rank], vec![value]))
    }

    /// Casts `value` to `dtype`, or returns it unchanged when it already has that type.
    pub fn cast(&mut self, value: ValueId, dtype: DType) -> LegalizeResult<ValueId> {
        let ty = self.tensor_type(value)?;
        if ty.dtype == dtype && ty.quant.is_none() {
            return Ok(value);
        }
        Ok(self.emit(TargetOp::Cast(CastSpec { dtype }), &[value], ty.with_dtype(dtype)))
    }

    /// Reshapes `value` to `dims`. At most one extent may be unknown.
    pub fn reshape(&mut self, value: ValueId, dims: &[Dimension]) -> LegalizeResult<ValueId> {
        let ty = self.tensor_type(value)?;
        if ty.shape.dims() == dims && ty.shape.is_static() {
            return Ok(value);
        }
        let new_shape = reshape_spec(dims)?;
        Ok(self.emit(
            TargetOp::Reshape(new_shape),
            &[value],
            ty.with_shape(Shape::new(dims.to_vec())),
        ))
    }

    /// Transposes `value` by `perm`, skipping the op when the permutation is monotonic.
    pub fn transpose(&mut self, value: ValueId, perm: &[usize]) -> LegalizeResult<ValueId> {
        let ty = self.tensor_type(value)?;
        if perm.len() != ty.rank() {
            return Err(LegalizeError::shape(format!(
                "permutation {perm:?} does not match rank {}",
                ty.rank()
            )));
        }
        if is_monotonic(perm) {
            trace!(?perm, "transpose skipped, permutation monotonic");
            return Ok(value);
        }
        let shape = permute_shape(&ty.shape, perm);
        Ok(self.emit(
            TargetOp::Transpose(TransposeSpec {
                perm: perm.to_vec(),
            }),
            &[value],
            ty.with_shape(shape),
        ))
    }

    /// Lets the replacement be any shape that broadcasts to the declared result.
    ///
    /// Used by `broadcast_to`, which forwards its input and leaves the stretch to the
    /// implicit broadcasting of the consumers. Every consumer must be an elementwise
    /// source operator that broadcasts, and the value must not leave the function.
    pub fn allow_implicit_broadcast(&mut self) -> LegalizeResult<()> {
        let value = self.rewriter.value_of(self.root);
        if self.rewriter.is_result(value) {
            return Err(LegalizeError::shape(format!(
                "{} result is returned unstretched",
                self.op.name()
            )));
        }
        for &user in self.rewriter.users_of(value) {
            match self.rewriter.op(user) {
                Operation::Source(op) if op.broadcasts_implicitly() => {}
                Operation::Source(op) => {
                    return Err(LegalizeError::shape(format!(
                        "{} feeds {op}, which does not broadcast its operands",
                        self.op.name()
                    )))
                }
                other => {
                    return Err(LegalizeError::shape(format!(
                        "{} feeds {other:?}, which does not broadcast its operands",
                        self.op.name()
                    )))
                }
            }
        }
        self.implicit_broadcast = true;
        Ok(())
    }

    pub fn allows_implicit_broadcast(&self) -> bool {
        self.implicit_broadcast
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn into_staged(self) -> Vec<Instruction> {
        self.staged
    }
}

/// Target reshape spec for `dims`; an unknown extent becomes the inferred slot.
pub fn reshape_spec(dims: &[Dimension]) -> LegalizeResult<ReshapeSpec> {
    let dynamic = dims.iter().filter(|dim| dim.is_dynamic()).count();
    if dynamic > 1 {
        return Err(LegalizeError::shape(format!(
            "reshape target has {dynamic} unknown extents, at most one is supported"
        )));
    }
    Ok(ReshapeSpec {
        new_shape: dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(value) => ReshapeDim::Fixed(*value),
                Dimension::Dynamic => ReshapeDim::Infer,
            })
            .collect(),
    })
}
