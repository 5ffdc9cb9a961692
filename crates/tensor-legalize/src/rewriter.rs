use crate::index::{DefId, FunctionIndexError, FunctionIndices, InstId};
use crate::ir::{Function, Instruction, Operand, Operation, ValueId, ValueType};

/// Mutable IR editor with stable instruction identifiers and SSA accounting.
pub struct ProgramRewriter<'a> {
    pub func: &'a mut Function,
    indices: FunctionIndices,
}

impl<'a> ProgramRewriter<'a> {
    /// Creates a rewriter for `func`, indexing its body.
    pub fn new(func: &'a mut Function) -> Result<Self, FunctionIndexError> {
        let indices = FunctionIndices::build(func)?;
        Ok(Self { func, indices })
    }

    fn pos(&self, inst: InstId) -> usize {
        self.indices
            .position(inst)
            .expect("instruction id must be valid")
    }

    /// Current index of `inst` within the function body.
    pub fn position(&self, inst: InstId) -> Option<usize> {
        self.indices.position(inst)
    }

    /// Returns the instruction referenced by `inst`.
    pub fn instruction(&self, inst: InstId) -> &Instruction {
        &self.func.body[self.pos(inst)]
    }

    pub fn op(&self, inst: InstId) -> &Operation {
        &self.instruction(inst).op
    }

    pub fn operands(&self, inst: InstId) -> &[Operand] {
        &self.instruction(inst).operands
    }

    /// Returns the SSA value produced by the instruction.
    pub fn value_of(&self, inst: InstId) -> ValueId {
        self.indices
            .value_of(inst)
            .expect("instruction must have a value")
    }

    pub fn type_of(&self, value: ValueId) -> Option<&ValueType> {
        self.indices.type_of(value)
    }

    pub fn inst_of(&self, value: ValueId) -> Option<InstId> {
        self.indices.inst_of(value)
    }

    pub fn def_of(&self, value: ValueId) -> Option<DefId> {
        self.indices.def_of(value)
    }

    /// Returns the operation defining `value`, or `None` for parameters.
    pub fn defining_op(&self, value: ValueId) -> Option<&Operation> {
        match self.def_of(value)? {
            DefId::Param { .. } => None,
            DefId::Inst(inst) => Some(self.op(inst)),
        }
    }

    pub fn users_of(&self, value: ValueId) -> &[InstId] {
        self.indices.users_of(value)
    }

    /// Returns `true` if `value` is read by an instruction or returned from the function.
    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.users_of(value).is_empty() || self.func.result_ids.contains(&value)
    }

    pub fn is_result(&self, value: ValueId) -> bool {
        self.func.result_ids.contains(&value)
    }

    pub fn contains(&self, inst: InstId) -> bool {
        self.indices.contains(inst)
    }

    /// Returns the current version counter for an instruction.
    pub fn version(&self, inst: InstId) -> Option<u32> {
        self.indices.version(inst)
    }

    /// First value id that a newly inserted instruction may claim.
    pub fn next_value_id(&self) -> ValueId {
        ValueId(self.indices.next_value())
    }

    pub fn insts_in_order(&self) -> Vec<InstId> {
        self.indices.ordered_inst_ids()
    }

    /// Replaces all uses of `from` with `to`, including function results.
    pub fn replace_all_uses(&mut self, from: ValueId, to: ValueId) -> Result<(), FunctionIndexError> {
        if from == to {
            return Ok(());
        }
        if self.type_of(to).is_none() {
            return Err(FunctionIndexError::MissingValueDefinition { value: to });
        }
        let consumers = self.indices.users_of(from).to_vec();
        for inst in consumers {
            let pos = self.pos(inst);
            let instruction = &mut self.func.body[pos];
            for operand in &mut instruction.operands {
                match operand {
                    Operand::Value(value) if *value == from => *value = to,
                    Operand::TupleElement { tuple, .. } if *tuple == from => *tuple = to,
                    _ => {}
                }
            }
            self.indices.update_operand_use(inst, from, to)?;
            self.bump_version(inst);
        }
        self.indices.clear_users(from);
        for result in &mut self.func.result_ids {
            if *result == from {
                *result = to;
            }
        }
        Ok(())
    }

    /// Erases `inst`. Fails if its value is still read or returned.
    pub fn erase_inst(&mut self, inst: InstId) -> Result<(), FunctionIndexError> {
        let value = self
            .indices
            .value_of(inst)
            .ok_or(FunctionIndexError::UnknownInstruction { inst })?;
        let uses = self.indices.users_of(value).len()
            + self.func.result_ids.iter().filter(|id| **id == value).count();
        if uses != 0 {
            return Err(FunctionIndexError::LiveUses { value, uses });
        }
        let pos = self.pos(inst);
        let instruction = self.func.body.remove(pos);
        self.indices.remove_instruction(inst, &instruction);
        Ok(())
    }

    /// Inserts a new instruction before `at` with a freshly allocated value id.
    pub fn insert_before(
        &mut self,
        at: InstId,
        op: Operation,
        operands: Vec<Operand>,
        output: ValueType,
    ) -> Result<(InstId, ValueId), FunctionIndexError> {
        let pos = self
            .indices
            .position(at)
            .ok_or(FunctionIndexError::UnknownInstruction { inst: at })?;
        let id = self.next_value_id();
        let inst = self.insert_at_pos(
            pos,
            Instruction {
                id,
                op,
                operands,
                output,
            },
        )?;
        Ok((inst, id))
    }

    /// Inserts pre-numbered instructions before `at`, preserving their order.
    pub fn insert_all_before(
        &mut self,
        at: InstId,
        instructions: Vec<Instruction>,
    ) -> Result<Vec<InstId>, FunctionIndexError> {
        let mut pos = self
            .indices
            .position(at)
            .ok_or(FunctionIndexError::UnknownInstruction { inst: at })?;
        let mut inserted = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            inserted.push(self.insert_at_pos(pos, instruction)?);
            pos += 1;
        }
        Ok(inserted)
    }

    /// Replaces `root` with `staged` instructions and the values in `replacements`.
    ///
    /// A single-result root has every use redirected to `replacements[0]`. A root
    /// producing a tuple has each projection `#i` redirected to `replacements[i]`. The
    /// function is left untouched when validation fails.
    pub fn replace_op(
        &mut self,
        root: InstId,
        staged: Vec<Instruction>,
        replacements: &[ValueId],
    ) -> Result<Vec<InstId>, FunctionIndexError> {
        let root_value = self
            .indices
            .value_of(root)
            .ok_or(FunctionIndexError::UnknownInstruction { inst: root })?;
        let tuple_arity = match &self.instruction(root).output {
            ValueType::Tuple(elements) => Some(elements.len()),
            _ => None,
        };
        let expected = tuple_arity.unwrap_or(1);
        if replacements.len() != expected {
            return Err(FunctionIndexError::ReplacementCount {
                expected,
                actual: replacements.len(),
            });
        }

        if tuple_arity.is_some() {
            if self.func.result_ids.contains(&root_value) {
                return Err(FunctionIndexError::UnresolvedTupleUse { value: root_value });
            }
            for user in self.indices.users_of(root_value) {
                for operand in self.operands(*user) {
                    match operand {
                        Operand::Value(value) if *value == root_value => {
                            return Err(FunctionIndexError::UnresolvedTupleUse {
                                value: root_value,
                            });
                        }
                        Operand::TupleElement { tuple, index }
                            if *tuple == root_value && *index >= expected =>
                        {
                            return Err(FunctionIndexError::ReplacementCount {
                                expected,
                                actual: index + 1,
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        let inserted = self.insert_all_before(root, staged)?;
        for value in replacements {
            if self.type_of(*value).is_none() {
                return Err(FunctionIndexError::MissingValueDefinition { value: *value });
            }
        }

        match tuple_arity {
            None => self.replace_all_uses(root_value, replacements[0])?,
            Some(_) => self.redirect_projections(root_value, replacements)?,
        }
        self.erase_inst(root)?;
        Ok(inserted)
    }

    fn redirect_projections(
        &mut self,
        tuple_value: ValueId,
        replacements: &[ValueId],
    ) -> Result<(), FunctionIndexError> {
        let consumers = self.indices.users_of(tuple_value).to_vec();
        for inst in consumers {
            let pos = self.pos(inst);
            let mut targets = Vec::new();
            for operand in &mut self.func.body[pos].operands {
                if let Operand::TupleElement { tuple, index } = *operand {
                    if tuple == tuple_value {
                        let target = replacements[index];
                        *operand = Operand::Value(target);
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
            }
            for target in targets {
                self.indices.update_operand_use(inst, tuple_value, target)?;
            }
            self.bump_version(inst);
        }
        self.indices.clear_users(tuple_value);
        Ok(())
    }

    /// Verifies basic SSA invariants after mutations.
    pub fn verify(&self) -> bool {
        FunctionIndices::build(self.func).is_ok()
    }

    /// Bumps the version counter for an instruction.
    pub fn bump_version(&mut self, inst: InstId) {
        if let Some(ver) = self.indices.version.get_mut(&inst) {
            *ver = ver.wrapping_add(1);
        }
    }

    fn insert_at_pos(
        &mut self,
        pos: usize,
        instruction: Instruction,
    ) -> Result<InstId, FunctionIndexError> {
        let inst_id = self.indices.allocate_inst();
        self.indices.insert_instruction(inst_id, pos, &instruction)?;
        self.func.body.insert(pos, instruction);
        Ok(inst_id)
    }
}
