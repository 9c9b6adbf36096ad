//! Operation kinds and their attributes.
//!
//! An [`Op`] is a kind tag plus the kind-specific attribute payload. Rules
//! dispatch by matching on [`Op::kind`], which strips the payload.
//!
//! Operand conventions (index order):
//! - `Where`: condition, true branch, false branch. A branch replaced by a
//!   constant is fed by a `None` node.
//! - `MaskedFill`: condition, tensor branch.
//! - `MatMul`: left, right, optional bias.
//! - `Conv2d`: input, filter `[oc, ic / groups, kh, kw]`, optional bias.
//! - `GatherElements`: input, indices, optional index coefficients.
//! - `ScatterElements`: input, indices, updates, optional index coefficients.
//! - `Arg`: input; outputs are indices and an optional values tensor.

use std::fmt;

use crate::ElementKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceMode {
    #[default]
    Mean,
    Sum,
    Max,
    Min,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    #[default]
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Input {
        host: ElementKind,
    },
    Weight {
        data: Vec<f64>,
    },
    None,
    Return,

    Reshape,
    Permute {
        order: Vec<i64>,
    },
    Tile {
        tile: Vec<i64>,
    },
    Pad {
        #[serde(default)]
        paddings: Vec<i64>,
    },
    Slice {
        #[serde(default)]
        offset: Vec<i64>,
        #[serde(default)]
        steps: Vec<i64>,
    },
    Squeeze {
        #[serde(default)]
        axes: Vec<i64>,
    },
    Unsqueeze {
        #[serde(default)]
        axes: Vec<i64>,
    },
    Reverse {
        #[serde(default)]
        axis: i64,
    },
    Upsample {
        scale_h: i64,
        scale_w: i64,
    },
    #[serde(rename = "depth2space")]
    Depth2Space {
        block_h: i64,
        block_w: i64,
    },
    MaxUnpool,

    Relu,
    LeakyRelu {
        alpha: f64,
    },
    #[serde(rename = "prelu")]
    PRelu,
    Abs,
    Gelu,
    Softmax {
        axis: i64,
    },
    LayerNorm {
        #[serde(default)]
        axis: i64,
    },

    MaxPool,
    MaxPoolWithMask,
    AvgPool,

    Add {
        #[serde(default)]
        coeff: Vec<f64>,
        #[serde(default)]
        do_relu: bool,
    },
    Sub {
        #[serde(default)]
        coeff: Vec<f64>,
        #[serde(default)]
        do_relu: bool,
    },
    Mul {
        #[serde(default)]
        do_relu: bool,
    },
    MulConst {
        const_val: f64,
        #[serde(default)]
        do_relu: bool,
    },
    AddConst {
        const_val: f64,
        #[serde(default)]
        do_relu: bool,
    },
    SubConst {
        const_val: f64,
        #[serde(default)]
        reverse: bool,
    },
    MinConst {
        const_val: f64,
    },
    MaxConst {
        const_val: f64,
    },
    Min,
    Max,
    Concat {
        #[serde(default)]
        axis: i64,
    },
    Compare {
        #[serde(default)]
        mode: CompareMode,
    },
    Where {
        #[serde(default)]
        x_const: Option<f64>,
        #[serde(default)]
        y_const: Option<f64>,
    },
    MaskedFill {
        const_val: f64,
        #[serde(default)]
        inversed: bool,
    },

    #[serde(rename = "matmul")]
    MatMul {
        #[serde(default)]
        left_transpose: bool,
        #[serde(default)]
        right_transpose: bool,
        #[serde(default)]
        hdim_is_batch: bool,
        #[serde(default)]
        left_reuse: bool,
        #[serde(default)]
        do_relu: bool,
    },
    Conv2d {
        #[serde(default = "one")]
        groups: i64,
        #[serde(default)]
        kernel_zp: f64,
        #[serde(default)]
        do_relu: bool,
    },
    Reduce {
        #[serde(default)]
        mode: ReduceMode,
        #[serde(default)]
        axes: Vec<i64>,
    },
    Arg {
        #[serde(default)]
        axis: i64,
        #[serde(default)]
        select_max: bool,
    },
    ScatterNd,
    GatherElements {
        axis: i64,
    },
    ScatterElements {
        axis: i64,
    },
    Attention,

    Cast,
    RequantFp {
        scale: f64,
    },
    CpuQuant {
        scale: f64,
    },
}

fn one() -> i64 {
    1
}

/// Payload-free tag of an [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Input,
    Weight,
    None,
    Return,
    Reshape,
    Permute,
    Tile,
    Pad,
    Slice,
    Squeeze,
    Unsqueeze,
    Reverse,
    Upsample,
    Depth2Space,
    MaxUnpool,
    Relu,
    LeakyRelu,
    PRelu,
    Abs,
    Gelu,
    Softmax,
    LayerNorm,
    MaxPool,
    MaxPoolWithMask,
    AvgPool,
    Add,
    Sub,
    Mul,
    MulConst,
    AddConst,
    SubConst,
    MinConst,
    MaxConst,
    Min,
    Max,
    Concat,
    Compare,
    Where,
    MaskedFill,
    MatMul,
    Conv2d,
    Reduce,
    Arg,
    ScatterNd,
    GatherElements,
    ScatterElements,
    Attention,
    Cast,
    RequantFp,
    CpuQuant,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Input { .. } => OpKind::Input,
            Op::Weight { .. } => OpKind::Weight,
            Op::None => OpKind::None,
            Op::Return => OpKind::Return,
            Op::Reshape => OpKind::Reshape,
            Op::Permute { .. } => OpKind::Permute,
            Op::Tile { .. } => OpKind::Tile,
            Op::Pad { .. } => OpKind::Pad,
            Op::Slice { .. } => OpKind::Slice,
            Op::Squeeze { .. } => OpKind::Squeeze,
            Op::Unsqueeze { .. } => OpKind::Unsqueeze,
            Op::Reverse { .. } => OpKind::Reverse,
            Op::Upsample { .. } => OpKind::Upsample,
            Op::Depth2Space { .. } => OpKind::Depth2Space,
            Op::MaxUnpool => OpKind::MaxUnpool,
            Op::Relu => OpKind::Relu,
            Op::LeakyRelu { .. } => OpKind::LeakyRelu,
            Op::PRelu => OpKind::PRelu,
            Op::Abs => OpKind::Abs,
            Op::Gelu => OpKind::Gelu,
            Op::Softmax { .. } => OpKind::Softmax,
            Op::LayerNorm { .. } => OpKind::LayerNorm,
            Op::MaxPool => OpKind::MaxPool,
            Op::MaxPoolWithMask => OpKind::MaxPoolWithMask,
            Op::AvgPool => OpKind::AvgPool,
            Op::Add { .. } => OpKind::Add,
            Op::Sub { .. } => OpKind::Sub,
            Op::Mul { .. } => OpKind::Mul,
            Op::MulConst { .. } => OpKind::MulConst,
            Op::AddConst { .. } => OpKind::AddConst,
            Op::SubConst { .. } => OpKind::SubConst,
            Op::MinConst { .. } => OpKind::MinConst,
            Op::MaxConst { .. } => OpKind::MaxConst,
            Op::Min => OpKind::Min,
            Op::Max => OpKind::Max,
            Op::Concat { .. } => OpKind::Concat,
            Op::Compare { .. } => OpKind::Compare,
            Op::Where { .. } => OpKind::Where,
            Op::MaskedFill { .. } => OpKind::MaskedFill,
            Op::MatMul { .. } => OpKind::MatMul,
            Op::Conv2d { .. } => OpKind::Conv2d,
            Op::Reduce { .. } => OpKind::Reduce,
            Op::Arg { .. } => OpKind::Arg,
            Op::ScatterNd => OpKind::ScatterNd,
            Op::GatherElements { .. } => OpKind::GatherElements,
            Op::ScatterElements { .. } => OpKind::ScatterElements,
            Op::Attention => OpKind::Attention,
            Op::Cast => OpKind::Cast,
            Op::RequantFp { .. } => OpKind::RequantFp,
            Op::CpuQuant { .. } => OpKind::CpuQuant,
        }
    }

    pub fn matmul() -> Self {
        Op::MatMul {
            left_transpose: false,
            right_transpose: false,
            hdim_is_batch: false,
            left_reuse: false,
            do_relu: false,
        }
    }

    pub fn add() -> Self {
        Op::Add {
            coeff: Vec::new(),
            do_relu: false,
        }
    }

    /// Whether the op has a fused relu enabled.
    pub fn does_relu(&self) -> bool {
        match self {
            Op::Relu => true,
            Op::Add { do_relu, .. }
            | Op::Sub { do_relu, .. }
            | Op::Mul { do_relu }
            | Op::MulConst { do_relu, .. }
            | Op::AddConst { do_relu, .. }
            | Op::MatMul { do_relu, .. }
            | Op::Conv2d { do_relu, .. } => *do_relu,
            _ => false,
        }
    }
}

impl OpKind {
    /// Graph leaves that never get lowered.
    pub fn is_leaf(self) -> bool {
        matches!(self, Self::Input | Self::Weight | Self::None | Self::Return)
    }

    /// Fewest operands the rules read; optional trailing operands
    /// (bias, index coefficients) are not counted.
    pub fn min_operands(self) -> usize {
        match self {
            Self::Input | Self::Weight | Self::None | Self::Return => 0,
            Self::Where | Self::ScatterNd | Self::ScatterElements => 3,
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Min
            | Self::Max
            | Self::Compare
            | Self::MaskedFill
            | Self::MatMul
            | Self::Conv2d
            | Self::GatherElements
            | Self::PRelu
            | Self::MaxUnpool => 2,
            _ => 1,
        }
    }

    pub fn is_conversion(self) -> bool {
        matches!(self, Self::Cast | Self::RequantFp | Self::CpuQuant)
    }

    /// Ops that only move data around without touching values.
    pub fn is_shape_only(self) -> bool {
        matches!(
            self,
            Self::Reshape
                | Self::Permute
                | Self::Tile
                | Self::Pad
                | Self::Slice
                | Self::Squeeze
                | Self::Unsqueeze
                | Self::Reverse
                | Self::Upsample
                | Self::Depth2Space
        )
    }

    pub fn is_binary_elementwise(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Max | Self::Min | Self::Compare
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Weight => "weight",
            Self::None => "none",
            Self::Return => "return",
            Self::Reshape => "reshape",
            Self::Permute => "permute",
            Self::Tile => "tile",
            Self::Pad => "pad",
            Self::Slice => "slice",
            Self::Squeeze => "squeeze",
            Self::Unsqueeze => "unsqueeze",
            Self::Reverse => "reverse",
            Self::Upsample => "upsample",
            Self::Depth2Space => "depth2space",
            Self::MaxUnpool => "max_unpool",
            Self::Relu => "relu",
            Self::LeakyRelu => "leaky_relu",
            Self::PRelu => "prelu",
            Self::Abs => "abs",
            Self::Gelu => "gelu",
            Self::Softmax => "softmax",
            Self::LayerNorm => "layer_norm",
            Self::MaxPool => "max_pool",
            Self::MaxPoolWithMask => "max_pool_with_mask",
            Self::AvgPool => "avg_pool",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::MulConst => "mul_const",
            Self::AddConst => "add_const",
            Self::SubConst => "sub_const",
            Self::MinConst => "min_const",
            Self::MaxConst => "max_const",
            Self::Min => "min",
            Self::Max => "max",
            Self::Concat => "concat",
            Self::Compare => "compare",
            Self::Where => "where",
            Self::MaskedFill => "masked_fill",
            Self::MatMul => "matmul",
            Self::Conv2d => "conv2d",
            Self::Reduce => "reduce",
            Self::Arg => "arg",
            Self::ScatterNd => "scatter_nd",
            Self::GatherElements => "gather_elements",
            Self::ScatterElements => "scatter_elements",
            Self::Attention => "attention",
            Self::Cast => "cast",
            Self::RequantFp => "requant_fp",
            Self::CpuQuant => "cpu_quant",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
