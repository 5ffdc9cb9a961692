use serde::{Deserialize, Serialize};

/// Closed set of source-dialect operators the legalizer knows how to lower.
///
/// Operands are positional; see the rule for each operator for the layout it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceOp {
    // Elementwise unary.
    Log,
    Exp,
    Neg,
    Floor,
    Ceil,
    Rsqrt,
    Reciprocal,
    BitwiseNot,
    Tanh,
    Sigmoid,
    Relu,
    LeakyRelu,
    Log2,
    // Elementwise binary.
    Maximum,
    Minimum,
    AddTensor,
    AddScalar,
    SubTensor,
    SubScalar,
    RsubScalar,
    MulTensor,
    MulScalar,
    Square,
    DivTensor,
    DivScalar,
    PowTensorScalar,
    Threshold,
    Clamp,
    WhereSelf,
    // Comparison and bitwise.
    GtTensor,
    GtScalar,
    LtTensor,
    LtScalar,
    EqTensor,
    EqScalar,
    NeTensor,
    NeScalar,
    BitwiseAndTensor,
    BitwiseOrTensor,
    BitwiseXorTensor,
    // Reductions.
    MeanDim,
    SumDimIntList,
    AnyDim,
    All,
    Any,
    Sum,
    Argmax,
    MaxDim,
    // Linear algebra.
    Matmul,
    Mm,
    Bmm,
    Linear,
    Convolution,
    // Normalization and activations with closed-form expansions.
    BatchNorm,
    NativeLayerNorm,
    Gelu,
    GeluBackward,
    // Shape manipulation.
    Reshape,
    View,
    Flatten,
    Squeeze,
    SqueezeDim,
    Unsqueeze,
    Permute,
    TransposeInt,
    SliceTensor,
    BroadcastTo,
    // Indexing.
    Embedding,
    Gather,
    // Pooling.
    MaxPool2d,
    AvgPool2d,
    AdaptiveAvgPool2d,
    // Tensor creation.
    Ones,
    Zeros,
    FillScalar,
    MaskedFillScalar,
    MaskedFillTensor,
    ArangeStartStep,
    NumToTensor,
    // Identity-like.
    Contiguous,
    Dropout,
    Copy,
    ToDtype,
    Clone,
}

impl SourceOp {
    pub const ALL: &'static [SourceOp] = &[
        SourceOp::Log,
        SourceOp::Exp,
        SourceOp::Neg,
        SourceOp::Floor,
        SourceOp::Ceil,
        SourceOp::Rsqrt,
        SourceOp::Reciprocal,
        SourceOp::BitwiseNot,
        SourceOp::Tanh,
        SourceOp::Sigmoid,
        SourceOp::Relu,
        SourceOp::LeakyRelu,
        SourceOp::Log2,
        SourceOp::Maximum,
        SourceOp::Minimum,
        SourceOp::AddTensor,
        SourceOp::AddScalar,
        SourceOp::SubTensor,
        SourceOp::SubScalar,
        SourceOp::RsubScalar,
        SourceOp::MulTensor,
        SourceOp::MulScalar,
        SourceOp::Square,
        SourceOp::DivTensor,
        SourceOp::DivScalar,
        SourceOp::PowTensorScalar,
        SourceOp::Threshold,
        SourceOp::Clamp,
        SourceOp::WhereSelf,
        SourceOp::GtTensor,
        SourceOp::GtScalar,
        SourceOp::LtTensor,
        SourceOp::LtScalar,
        SourceOp::EqTensor,
        SourceOp::EqScalar,
        SourceOp::NeTensor,
        SourceOp::NeScalar,
        SourceOp::BitwiseAndTensor,
        SourceOp::BitwiseOrTensor,
        SourceOp::BitwiseXorTensor,
        SourceOp::MeanDim,
        SourceOp::SumDimIntList,
        SourceOp::AnyDim,
        SourceOp::All,
        SourceOp::Any,
        SourceOp::Sum,
        SourceOp::Argmax,
        SourceOp::MaxDim,
        SourceOp::Matmul,
        SourceOp::Mm,
        SourceOp::Bmm,
        SourceOp::Linear,
        SourceOp::Convolution,
        SourceOp::BatchNorm,
        SourceOp::NativeLayerNorm,
        SourceOp::Gelu,
        SourceOp::GeluBackward,
        SourceOp::Reshape,
        SourceOp::View,
        SourceOp::Flatten,
        SourceOp::Squeeze,
        SourceOp::SqueezeDim,
        SourceOp::Unsqueeze,
        SourceOp::Permute,
        SourceOp::TransposeInt,
        SourceOp::SliceTensor,
        SourceOp::BroadcastTo,
        SourceOp::Embedding,
        SourceOp::Gather,
        SourceOp::MaxPool2d,
        SourceOp::AvgPool2d,
        SourceOp::AdaptiveAvgPool2d,
        SourceOp::Ones,
        SourceOp::Zeros,
        SourceOp::FillScalar,
        SourceOp::MaskedFillScalar,
        SourceOp::MaskedFillTensor,
        SourceOp::ArangeStartStep,
        SourceOp::NumToTensor,
        SourceOp::Contiguous,
        SourceOp::Dropout,
        SourceOp::Copy,
        SourceOp::ToDtype,
        SourceOp::Clone,
    ];

    /// Dialect-qualified operator name used in diagnostics and textual dumps.
    pub fn name(self) -> &'static str {
        match self {
            SourceOp::Log => "aten.log",
            SourceOp::Exp => "aten.exp",
            SourceOp::Neg => "aten.neg",
            SourceOp::Floor => "aten.floor",
            SourceOp::Ceil => "aten.ceil",
            SourceOp::Rsqrt => "aten.rsqrt",
            SourceOp::Reciprocal => "aten.reciprocal",
            SourceOp::BitwiseNot => "aten.bitwise_not",
            SourceOp::Tanh => "aten.tanh",
            SourceOp::Sigmoid => "aten.sigmoid",
            SourceOp::Relu => "aten.relu",
            SourceOp::LeakyRelu => "aten.leaky_relu",
            SourceOp::Log2 => "aten.log2",
            SourceOp::Maximum => "aten.maximum",
            SourceOp::Minimum => "aten.minimum",
            SourceOp::AddTensor => "aten.add.Tensor",
            SourceOp::AddScalar => "aten.add.Scalar",
            SourceOp::SubTensor => "aten.sub.Tensor",
            SourceOp::SubScalar => "aten.sub.Scalar",
            SourceOp::RsubScalar => "aten.rsub.Scalar",
            SourceOp::MulTensor => "aten.mul.Tensor",
            SourceOp::MulScalar => "aten.mul.Scalar",
            SourceOp::Square => "aten.square",
            SourceOp::DivTensor => "aten.div.Tensor",
            SourceOp::DivScalar => "aten.div.Scalar",
            SourceOp::PowTensorScalar => "aten.pow.Tensor_Scalar",
            SourceOp::Threshold => "aten.threshold",
            SourceOp::Clamp => "aten.clamp",
            SourceOp::WhereSelf => "aten.where.self",
            SourceOp::GtTensor => "aten.gt.Tensor",
            SourceOp::GtScalar => "aten.gt.Scalar",
            SourceOp::LtTensor => "aten.lt.Tensor",
            SourceOp::LtScalar => "aten.lt.Scalar",
            SourceOp::EqTensor => "aten.eq.Tensor",
            SourceOp::EqScalar => "aten.eq.Scalar",
            SourceOp::NeTensor => "aten.ne.Tensor",
            SourceOp::NeScalar => "aten.ne.Scalar",
            SourceOp::BitwiseAndTensor => "aten.bitwise_and.Tensor",
            SourceOp::BitwiseOrTensor => "aten.bitwise_or.Tensor",
            SourceOp::BitwiseXorTensor => "aten.bitwise_xor.Tensor",
            SourceOp::MeanDim => "aten.mean.dim",
            SourceOp::SumDimIntList => "aten.sum.dim_IntList",
            SourceOp::AnyDim => "aten.any.dim",
            SourceOp::All => "aten.all",
            SourceOp::Any => "aten.any",
            SourceOp::Sum => "aten.sum",
            SourceOp::Argmax => "aten.argmax",
            SourceOp::MaxDim => "aten.max.dim",
            SourceOp::Matmul => "aten.matmul",
            SourceOp::Mm => "aten.mm",
            SourceOp::Bmm => "aten.bmm",
            SourceOp::Linear => "aten.linear",
            SourceOp::Convolution => "aten.convolution",
            SourceOp::BatchNorm => "aten.batch_norm",
            SourceOp::NativeLayerNorm => "aten.native_layer_norm",
            SourceOp::Gelu => "aten.gelu",
            SourceOp::GeluBackward => "aten.gelu_backward",
            SourceOp::Reshape => "aten.reshape",
            SourceOp::View => "aten.view",
            SourceOp::Flatten => "aten.flatten.using_ints",
            SourceOp::Squeeze => "aten.squeeze",
            SourceOp::SqueezeDim => "aten.squeeze.dim",
            SourceOp::Unsqueeze => "aten.unsqueeze",
            SourceOp::Permute => "aten.permute",
            SourceOp::TransposeInt => "aten.transpose.int",
            SourceOp::SliceTensor => "aten.slice.Tensor",
            SourceOp::BroadcastTo => "aten.broadcast_to",
            SourceOp::Embedding => "aten.embedding",
            SourceOp::Gather => "aten.gather",
            SourceOp::MaxPool2d => "aten.max_pool2d",
            SourceOp::AvgPool2d => "aten.avg_pool2d",
            SourceOp::AdaptiveAvgPool2d => "aten.adaptive_avg_pool2d",
            SourceOp::Ones => "aten.ones",
            SourceOp::Zeros => "aten.zeros",
            SourceOp::FillScalar => "aten.fill.Scalar",
            SourceOp::MaskedFillScalar => "aten.masked_fill.Scalar",
            SourceOp::MaskedFillTensor => "aten.masked_fill.Tensor",
            SourceOp::ArangeStartStep => "aten.arange.start_step",
            SourceOp::NumToTensor => "prim.NumToTensor.Scalar",
            SourceOp::Contiguous => "aten.contiguous",
            SourceOp::Dropout => "aten.dropout",
            SourceOp::Copy => "aten.copy",
            SourceOp::ToDtype => "aten.to.dtype",
            SourceOp::Clone => "aten.clone",
        }
    }

    /// Number of results the operator produces. Multi-result operators yield a tuple.
    pub fn result_count(self) -> usize {
        match self {
            SourceOp::MaxDim => 2,
            SourceOp::NativeLayerNorm => 3,
            _ => 1,
        }
    }

    /// Elementwise operators over two or more tensors whose lowering stretches
    /// unit-extent operands to the result shape.
    pub fn broadcasts_implicitly(self) -> bool {
        matches!(
            self,
            SourceOp::Maximum
                | SourceOp::Minimum
                | SourceOp::AddTensor
                | SourceOp::SubTensor
                | SourceOp::MulTensor
                | SourceOp::DivTensor
                | SourceOp::WhereSelf
                | SourceOp::GtTensor
                | SourceOp::LtTensor
                | SourceOp::EqTensor
                | SourceOp::NeTensor
                | SourceOp::BitwiseAndTensor
                | SourceOp::BitwiseOrTensor
                | SourceOp::BitwiseXorTensor
        )
    }
}

impl std::fmt::Display for SourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
