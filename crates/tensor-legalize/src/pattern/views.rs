use super::{filters, OperationMatcher, OperationView};
use crate::{
    index::InstId,
    ir::{Operand, Operation, TensorType, ValueId, ValueType},
    rewriter::ProgramRewriter,
    target::{CastSpec, ReshapeSpec, TargetOp, TransposeSpec},
};

macro_rules! unary_target_view {
    ($(#[$meta:meta])* $name:ident, $spec:ty, $variant:ident, $matcher:path) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            pub root: InstId,
            pub input: ValueId,
            pub input_type: TensorType,
            pub result: ValueId,
            pub result_type: TensorType,
            pub spec: $spec,
        }

        impl $name {
            pub fn new(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                let Operation::Target(TargetOp::$variant(spec)) = rewriter.op(root) else {
                    return None;
                };
                let [Operand::Value(input)] = rewriter.operands(root) else {
                    return None;
                };
                let result = rewriter.value_of(root);
                let Some(ValueType::Tensor(input_type)) = rewriter.type_of(*input) else {
                    return None;
                };
                let Some(ValueType::Tensor(result_type)) = rewriter.type_of(result) else {
                    return None;
                };
                Some(Self {
                    root,
                    input: *input,
                    input_type: input_type.clone(),
                    result,
                    result_type: result_type.clone(),
                    spec: spec.clone(),
                })
            }
        }

        impl OperationView for $name {
            const MATCHER: OperationMatcher = $matcher;

            fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self> {
                Self::new(root, rewriter)
            }
        }
    };
}

unary_target_view!(
    /// Target `Reshape` with a single tensor operand.
    ReshapeOpView,
    ReshapeSpec,
    Reshape,
    filters::reshape
);
unary_target_view!(
    /// Target `Transpose` with a single tensor operand.
    TransposeOpView,
    TransposeSpec,
    Transpose,
    filters::transpose
);
unary_target_view!(CastOpView, CastSpec, Cast, filters::cast);
