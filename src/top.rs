//! The tensor-operator families: [`TOpEmbryo`] (pre-layout) and [`TOp`] (laid out).

use crate::layout::TensorLayout;
use crate::shape::Shape;

/// A constant plaintext tensor embedded in an `*CP` operator.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlaintextTensor {
    pub shape: Shape,
    pub values: Vec<f64>,
}

/// The closed family of shape-only tensor operators, before any layout is assigned.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TOpEmbryo {
    InputC { shape: Shape, name: String, log_scale: u32 },
    OutputC { shape: Shape, name: String },
    AddCC { shape: Shape },
    AddCP { shape: Shape, plaintext: PlaintextTensor },
    AddCS { shape: Shape, scalar: f64 },
    MulCC { shape: Shape },
    MulCP { shape: Shape, plaintext: PlaintextTensor },
    MulCS { shape: Shape, scalar: f64 },
    ReduceDimC { shape: Shape, dim: usize },
    ReplicateDimC { shape: Shape, dim: usize, multiple: u32 },
    ReorderDimsC { shape: Shape, permutation: Vec<usize> },
    ResizeDimC { shape: Shape, out_shape: Shape },
    DropDimC { shape: Shape, dim: usize },
    InsertDimC { shape: Shape, dim: usize },
    StrideC { shape: Shape, strides: Vec<u32> },
    MergedStrideC { shape: Shape, strides: Vec<u32> },
    CyclicShiftC { shape: Shape, offset: Vec<i64> },
    UnpaddedShiftC { shape: Shape, offset: Vec<i64> },
    RotateC { shape: Shape, shift: i64 },
    ChetRepackC { shape: Shape },
    BootstrapC { shape: Shape, usable_levels: u32 },
}

impl TOpEmbryo {
    /// The output shape every variant carries, regardless of operator kind.
    pub fn shape(&self) -> &Shape {
        match self {
            TOpEmbryo::InputC { shape, .. }
            | TOpEmbryo::OutputC { shape, .. }
            | TOpEmbryo::AddCC { shape }
            | TOpEmbryo::AddCP { shape, .. }
            | TOpEmbryo::AddCS { shape, .. }
            | TOpEmbryo::MulCC { shape }
            | TOpEmbryo::MulCP { shape, .. }
            | TOpEmbryo::MulCS { shape, .. }
            | TOpEmbryo::ReduceDimC { shape, .. }
            | TOpEmbryo::ReplicateDimC { shape, .. }
            | TOpEmbryo::ReorderDimsC { shape, .. }
            | TOpEmbryo::ResizeDimC { shape, .. }
            | TOpEmbryo::DropDimC { shape, .. }
            | TOpEmbryo::InsertDimC { shape, .. }
            | TOpEmbryo::StrideC { shape, .. }
            | TOpEmbryo::MergedStrideC { shape, .. }
            | TOpEmbryo::CyclicShiftC { shape, .. }
            | TOpEmbryo::UnpaddedShiftC { shape, .. }
            | TOpEmbryo::RotateC { shape, .. }
            | TOpEmbryo::ChetRepackC { shape }
            | TOpEmbryo::BootstrapC { shape, .. } => shape,
        }
    }

    /// Short tag used in diagnostics and serialisation.
    pub fn type_name(&self) -> &'static str {
        match self {
            TOpEmbryo::InputC { .. } => "InputC",
            TOpEmbryo::OutputC { .. } => "OutputC",
            TOpEmbryo::AddCC { .. } => "AddCC",
            TOpEmbryo::AddCP { .. } => "AddCP",
            TOpEmbryo::AddCS { .. } => "AddCS",
            TOpEmbryo::MulCC { .. } => "MulCC",
            TOpEmbryo::MulCP { .. } => "MulCP",
            TOpEmbryo::MulCS { .. } => "MulCS",
            TOpEmbryo::ReduceDimC { .. } => "ReduceDimC",
            TOpEmbryo::ReplicateDimC { .. } => "ReplicateDimC",
            TOpEmbryo::ReorderDimsC { .. } => "ReorderDimsC",
            TOpEmbryo::ResizeDimC { .. } => "ResizeDimC",
            TOpEmbryo::DropDimC { .. } => "DropDimC",
            TOpEmbryo::InsertDimC { .. } => "InsertDimC",
            TOpEmbryo::StrideC { .. } => "StrideC",
            TOpEmbryo::MergedStrideC { .. } => "MergedStrideC",
            TOpEmbryo::CyclicShiftC { .. } => "CyclicShiftC",
            TOpEmbryo::UnpaddedShiftC { .. } => "UnpaddedShiftC",
            TOpEmbryo::RotateC { .. } => "RotateC",
            TOpEmbryo::ChetRepackC { .. } => "ChetRepackC",
            TOpEmbryo::BootstrapC { .. } => "BootstrapC",
        }
    }

    /// Strides this node folds, if it is a (merged) stride operator.
    pub fn as_stride(&self) -> Option<&[u32]> {
        match self {
            TOpEmbryo::StrideC { strides, .. } | TOpEmbryo::MergedStrideC { strides, .. } => Some(strides),
            _ => None,
        }
    }
}

/// Same operator family as [`TOpEmbryo`], carrying explicit input/output layouts
/// once the layout pass has run. Element-wise binary operators (`AddCC`/`MulCC`)
/// require their two operands to already share a layout, so only one layout is
/// recorded for them (the shared input layout, which also names the output layout).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TOp {
    InputC { name: String, log_scale: u32, output_layout: TensorLayout },
    OutputC { name: String, input_layout: TensorLayout },
    AddCC { layout: TensorLayout },
    AddCP { layout: TensorLayout, plaintext: PlaintextTensor },
    AddCS { layout: TensorLayout, scalar: f64 },
    MulCC { layout: TensorLayout },
    MulCP { layout: TensorLayout, plaintext: PlaintextTensor },
    MulCS { layout: TensorLayout, scalar: f64 },
    ReduceDimC { dim: usize, input_layout: TensorLayout, output_layout: TensorLayout },
    ReplicateDimC { dim: usize, multiple: u32, input_layout: TensorLayout, output_layout: TensorLayout },
    ReorderDimsC { permutation: Vec<usize>, input_layout: TensorLayout, output_layout: TensorLayout },
    ResizeDimC { input_layout: TensorLayout, output_layout: TensorLayout },
    DropDimC { dim: usize, input_layout: TensorLayout, output_layout: TensorLayout },
    InsertDimC { dim: usize, input_layout: TensorLayout, output_layout: TensorLayout },
    StrideC { strides: Vec<u32>, input_layout: TensorLayout, output_layout: TensorLayout },
    MergedStrideC { strides: Vec<u32>, input_layout: TensorLayout, output_layout: TensorLayout },
    CyclicShiftC { offset: Vec<i64>, input_layout: TensorLayout, output_layout: TensorLayout },
    UnpaddedShiftC { offset: Vec<i64>, input_layout: TensorLayout, output_layout: TensorLayout },
    RotateC { shift: i64, input_layout: TensorLayout, output_layout: TensorLayout },
    ChetRepackC { input_layout: TensorLayout, output_layout: TensorLayout },
    /// Introduced only by the layout pass: realises a pure change of layout.
    LayoutConversionC { input_layout: TensorLayout, output_layout: TensorLayout },
    /// Introduced only by the rescaling pass: drops the operand's scale by
    /// `ct_log_scale`.
    RescaleC { ct_log_scale: u32, layout: TensorLayout },
    /// Introduced only by the leveling pass: resets the operand's level to
    /// the context's usable level count, preserving its scale.
    BootstrapC { usable_levels: u32, layout: TensorLayout },
}

impl TOp {
    /// Short tag used in diagnostics and serialisation, mirroring
    /// [`TOpEmbryo::type_name`].
    pub fn type_name(&self) -> &'static str {
        match self {
            TOp::InputC { .. } => "InputC",
            TOp::OutputC { .. } => "OutputC",
            TOp::AddCC { .. } => "AddCC",
            TOp::AddCP { .. } => "AddCP",
            TOp::AddCS { .. } => "AddCS",
            TOp::MulCC { .. } => "MulCC",
            TOp::MulCP { .. } => "MulCP",
            TOp::MulCS { .. } => "MulCS",
            TOp::ReduceDimC { .. } => "ReduceDimC",
            TOp::ReplicateDimC { .. } => "ReplicateDimC",
            TOp::ReorderDimsC { .. } => "ReorderDimsC",
            TOp::ResizeDimC { .. } => "ResizeDimC",
            TOp::DropDimC { .. } => "DropDimC",
            TOp::InsertDimC { .. } => "InsertDimC",
            TOp::StrideC { .. } => "StrideC",
            TOp::MergedStrideC { .. } => "MergedStrideC",
            TOp::CyclicShiftC { .. } => "CyclicShiftC",
            TOp::UnpaddedShiftC { .. } => "UnpaddedShiftC",
            TOp::RotateC { .. } => "RotateC",
            TOp::ChetRepackC { .. } => "ChetRepackC",
            TOp::LayoutConversionC { .. } => "LayoutConversionC",
            TOp::RescaleC { .. } => "RescaleC",
            TOp::BootstrapC { .. } => "BootstrapC",
        }
    }

    /// The layout of the value this node produces.
    pub fn output_layout(&self) -> &TensorLayout {
        match self {
            TOp::InputC { output_layout, .. } => output_layout,
            TOp::OutputC { input_layout, .. } => input_layout,
            TOp::AddCC { layout } | TOp::MulCC { layout } => layout,
            TOp::AddCP { layout, .. } | TOp::MulCP { layout, .. } => layout,
            TOp::AddCS { layout, .. } | TOp::MulCS { layout, .. } => layout,
            TOp::ReduceDimC { output_layout, .. }
            | TOp::ReplicateDimC { output_layout, .. }
            | TOp::ReorderDimsC { output_layout, .. }
            | TOp::ResizeDimC { output_layout, .. }
            | TOp::DropDimC { output_layout, .. }
            | TOp::InsertDimC { output_layout, .. }
            | TOp::StrideC { output_layout, .. }
            | TOp::MergedStrideC { output_layout, .. }
            | TOp::CyclicShiftC { output_layout, .. }
            | TOp::UnpaddedShiftC { output_layout, .. }
            | TOp::RotateC { output_layout, .. }
            | TOp::ChetRepackC { output_layout, .. }
            | TOp::LayoutConversionC { output_layout, .. } => output_layout,
            TOp::RescaleC { layout, .. } | TOp::BootstrapC { layout, .. } => layout,
        }
    }

    /// The layout every (single) operand of this node must already carry, if any.
    pub fn input_layout(&self) -> Option<&TensorLayout> {
        match self {
            TOp::InputC { .. } => None,
            TOp::OutputC { input_layout, .. } => Some(input_layout),
            TOp::AddCC { layout } | TOp::MulCC { layout } => Some(layout),
            TOp::AddCP { layout, .. } | TOp::MulCP { layout, .. } => Some(layout),
            TOp::AddCS { layout, .. } | TOp::MulCS { layout, .. } => Some(layout),
            TOp::ReduceDimC { input_layout, .. }
            | TOp::ReplicateDimC { input_layout, .. }
            | TOp::ReorderDimsC { input_layout, .. }
            | TOp::ResizeDimC { input_layout, .. }
            | TOp::DropDimC { input_layout, .. }
            | TOp::InsertDimC { input_layout, .. }
            | TOp::StrideC { input_layout, .. }
            | TOp::MergedStrideC { input_layout, .. }
            | TOp::CyclicShiftC { input_layout, .. }
            | TOp::UnpaddedShiftC { input_layout, .. }
            | TOp::RotateC { input_layout, .. }
            | TOp::ChetRepackC { input_layout, .. }
            | TOp::LayoutConversionC { input_layout, .. } => Some(input_layout),
            TOp::RescaleC { layout, .. } | TOp::BootstrapC { layout, .. } => Some(layout),
        }
    }

    /// `true` for the element-wise ciphertext-ciphertext/plaintext/scalar family,
    /// whose scale rule is special-cased directly in the rescaling pass rather
    /// than going through [`TOp::added_log_scale`].
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            TOp::AddCC { .. }
                | TOp::AddCP { .. }
                | TOp::AddCS { .. }
                | TOp::MulCC { .. }
                | TOp::MulCP { .. }
                | TOp::MulCS { .. }
        )
    }

    /// How much log scale one application of this op adds to its operand's
    /// scale, beyond what [`TOp::backend_mask_depth`] already accounts for.
    /// None of the re-addressing ops (reduce/replicate/reorder/resize/drop/
    /// insert/stride/shift/rotate/repack/conversion) perform a multiplication
    /// of their own, so this is uniformly zero; only `MulCC`/`MulCP`/`MulCS`
    /// add scale, and those are handled directly by the rescaling pass.
    pub fn added_log_scale(&self) -> u32 {
        0
    }

    /// `1` if this op applies a plaintext chunk mask as part of its ciphertext
    /// realisation (and therefore spends one level doing so), `0` otherwise.
    pub fn backend_mask_depth(&self) -> u32 {
        match self {
            TOp::ReduceDimC { .. }
            | TOp::ResizeDimC { .. }
            | TOp::StrideC { .. }
            | TOp::MergedStrideC { .. }
            | TOp::UnpaddedShiftC { .. }
            | TOp::ChetRepackC { .. }
            | TOp::LayoutConversionC { .. } => 1,
            _ => 0,
        }
    }
}
