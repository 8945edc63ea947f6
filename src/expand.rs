//! Tensor-to-ciphertext expansion: lowers a leveled `TOp` DAG (one node per
//! whole tensor) to a `CtOp` DAG (one node per chunk of one tensor), via the
//! same masked-rotate-and-sum technique [`LayoutConversion::realize`] uses for
//! pure layout changes, generalised to every re-addressing `TOp` variant.

use std::collections::HashMap;

use crate::context::ProgramContext;
use crate::ctop::{ChunkIr, CtOp, CtProgram, LeveledCtOp};
use crate::dag::NodeId;
use crate::error::{LowerError, Result};
use crate::layout::TensorLayout;
use crate::level::{Level, LevelInfo, LogScale};
use crate::leveling::LeveledDag;
use crate::shape::{DiffTensorIndex, Shape, TensorIndex};
use crate::top::{PlaintextTensor, TOp};

/// One leveled TOp node's realisation: the CtOp node id standing in for each
/// of its chunk offsets.
type ChunkMap = HashMap<u64, NodeId>;

struct Expander {
    program: CtProgram,
    by_node: HashMap<NodeId, ChunkMap>,
    current_ancestor: Option<NodeId>,
}

impl Expander {
    fn new(ctx: &ProgramContext) -> Self {
        Expander {
            program: CtProgram::new(*ctx, crate::ctop::CtOpDag::new()),
            by_node: HashMap::new(),
            current_ancestor: None,
        }
    }

    fn emit(&mut self, op: CtOp, parents: Vec<NodeId>, info: LevelInfo) -> Result<NodeId> {
        let ancestors = self.current_ancestor.into_iter().collect();
        self.program
            .dag_mut()
            .add_node(LeveledCtOp { op, info }, parents, ancestors)
    }

    /// Re-addressing ops share this shape: for every valid input index, map it
    /// through `forward` to zero or more output indices, then group the
    /// contributions to each output chunk by `(input_chunk_offset, rotation)`
    /// and realise each group as a rotate (if needed), an optional mask, and a
    /// final sum. `needs_mask` additionally forces masking even for a lone
    /// contributing group, matching [`TOp::backend_mask_depth`]'s accounting
    /// for ops whose backend realisation always spends a masking level.
    fn group_and_emit(
        &mut self,
        input: &ChunkMap,
        input_layout: &TensorLayout,
        output_layout: &TensorLayout,
        forward: &dyn Fn(&TensorIndex) -> Vec<TensorIndex>,
        needs_mask: bool,
        info: LevelInfo,
    ) -> Result<ChunkMap> {
        let chunk_size = output_layout.chunk_size();
        let mut out = ChunkMap::new();

        for oc in output_layout.chunk_offsets() {
            // (input_chunk_offset, rotation) -> output slots contributed to.
            let mut groups: HashMap<(u64, i64), Vec<u64>> = HashMap::new();
            for in_oc in input_layout.chunk_offsets() {
                for maybe_in_idx in input_layout.tensor_indices(in_oc) {
                    let Some(in_idx) = maybe_in_idx else { continue };
                    for out_idx in forward(&in_idx) {
                        if out_idx.shape() != output_layout.shape() {
                            continue;
                        }
                        let (out_chunk, out_slot) = output_layout.locate(&out_idx)?;
                        if out_chunk != oc {
                            continue;
                        }
                        let (in_chunk, in_slot) = input_layout.locate(&in_idx)?;
                        let n = chunk_size as i64;
                        let rotation = ((in_slot as i64 - out_slot as i64) % n + n) % n;
                        groups.entry((in_chunk, rotation)).or_default().push(out_slot);
                    }
                }
            }

            let mask_every_group = needs_mask || groups.len() > 1;
            let mut leg_ids = Vec::new();
            for ((in_chunk, rotation), slots) in groups {
                let Some(&input_node) = input.get(&in_chunk) else { continue };
                let mut current = input_node;
                if rotation != 0 {
                    current = self.emit(CtOp::RotateC { shift: rotation }, vec![current], info)?;
                }
                if mask_every_group {
                    let mut one_indices: Vec<u64> = slots;
                    one_indices.sort_unstable();
                    one_indices.dedup();
                    let chunk = ChunkIr::Mask {
                        size: chunk_size,
                        one_indices,
                    };
                    let handle = self.program.intern_chunk(chunk);
                    current = self.emit(CtOp::MulCP { chunk: handle }, vec![current], info)?;
                }
                leg_ids.push(current);
            }

            let summed = match leg_ids.as_slice() {
                [] => self.emit(CtOp::ZeroC, vec![], info)?,
                [only] => *only,
                [first, rest @ ..] => {
                    let mut acc = *first;
                    for &leg in rest {
                        acc = self.emit(CtOp::AddCC, vec![acc, leg], info)?;
                    }
                    acc
                }
            };
            out.insert(oc, summed);
        }
        Ok(out)
    }

    fn elementwise(&mut self, op_ctor: impl Fn() -> CtOp, lhs: &ChunkMap, rhs: &ChunkMap, info: LevelInfo) -> Result<ChunkMap> {
        let mut out = ChunkMap::new();
        for (&offset, &l) in lhs {
            let &r = rhs
                .get(&offset)
                .ok_or_else(|| LowerError::structural("expand::elementwise", [l], "operand chunk maps disagree on offsets"))?;
            out.insert(offset, self.emit(op_ctor(), vec![l, r], info)?);
        }
        Ok(out)
    }

    fn elementwise_scalar(&mut self, op_ctor: impl Fn() -> CtOp, input: &ChunkMap, info: LevelInfo) -> Result<ChunkMap> {
        let mut out = ChunkMap::new();
        for (&offset, &node) in input {
            out.insert(offset, self.emit(op_ctor(), vec![node], info)?);
        }
        Ok(out)
    }

    fn elementwise_cp(
        &mut self,
        layout: &TensorLayout,
        plaintext: &PlaintextTensor,
        input: &ChunkMap,
        is_mul: bool,
        info: LevelInfo,
    ) -> Result<ChunkMap> {
        let mut out = ChunkMap::new();
        for &offset in layout.chunk_offsets().iter() {
            let Some(&node) = input.get(&offset) else { continue };
            let values = sample_plaintext(layout, plaintext, offset);
            let handle = self.program.intern_constant(values);
            let op = if is_mul { CtOp::MulCP { chunk: handle } } else { CtOp::AddCP { chunk: handle } };
            out.insert(offset, self.emit(op, vec![node], info)?);
        }
        Ok(out)
    }

    fn passthrough(&mut self, op_ctor: impl Fn() -> CtOp, input: &ChunkMap, info: LevelInfo) -> Result<ChunkMap> {
        let mut out = ChunkMap::new();
        for (&offset, &node) in input {
            out.insert(offset, self.emit(op_ctor(), vec![node], info)?);
        }
        Ok(out)
    }
}

/// Sample `plaintext.values` at every slot of `layout`'s chunk `offset`,
/// reading zero for gap slots and for out-of-bounds positions the layout
/// otherwise thinks are real (can't happen for a well-formed layout, but the
/// guard keeps this from panicking on a malformed one).
fn sample_plaintext(layout: &TensorLayout, plaintext: &PlaintextTensor, offset: u64) -> Vec<f64> {
    layout
        .tensor_indices(offset)
        .into_iter()
        .map(|maybe_idx| match maybe_idx {
            Some(idx) => plaintext.values.get(idx.flat() as usize).copied().unwrap_or(0.0),
            None => 0.0,
        })
        .collect()
}

fn reduce_forward(dim: usize, in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut coords = in_idx.coords().to_vec();
    coords.remove(dim);
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn replicate_forward(dim: usize, multiple: u32, orig_size: u32, in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut produced = Vec::new();
    for rep in 0..multiple {
        let mut coords = in_idx.coords().to_vec();
        coords[dim] = in_idx.coords()[dim] + rep * orig_size;
        if let Ok(idx) = TensorIndex::new(out_shape.clone(), coords) {
            produced.push(idx);
        }
    }
    produced
}

fn reorder_forward(permutation: &[usize], in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let in_coords = in_idx.coords();
    let mut coords = vec![0u32; permutation.len()];
    for (out_dim, &in_dim) in permutation.iter().enumerate() {
        coords[out_dim] = in_coords[in_dim];
    }
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn resize_forward(in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let coords = in_idx.coords();
    if coords.iter().zip(out_shape.dims()).any(|(&c, &d)| c >= d) {
        return Vec::new();
    }
    TensorIndex::new(out_shape.clone(), coords.to_vec()).into_iter().collect()
}

fn drop_dim_forward(dim: usize, in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut coords = in_idx.coords().to_vec();
    coords.remove(dim);
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn insert_dim_forward(dim: usize, in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut coords = in_idx.coords().to_vec();
    coords.insert(dim, 0);
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn stride_forward(strides: &[u32], in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut coords = Vec::with_capacity(strides.len());
    for (&c, &s) in in_idx.coords().iter().zip(strides) {
        if c % s != 0 {
            return Vec::new();
        }
        coords.push(c / s);
    }
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn cyclic_shift_forward(diff: &DiffTensorIndex, in_idx: &TensorIndex) -> Vec<TensorIndex> {
    diff.apply(in_idx).into_iter().collect()
}

fn unpadded_shift_forward(offset: &[i64], in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let mut coords = Vec::with_capacity(offset.len());
    for ((&c, &o), &size) in in_idx.coords().iter().zip(offset).zip(out_shape.dims()) {
        let shifted = c as i64 + o;
        if shifted < 0 || shifted as u32 >= size {
            return Vec::new();
        }
        coords.push(shifted as u32);
    }
    TensorIndex::new(out_shape.clone(), coords).into_iter().collect()
}

fn rotate_forward(shift: i64, in_idx: &TensorIndex, out_shape: &Shape) -> Vec<TensorIndex> {
    let total = out_shape.value_count() as i64;
    let flat = in_idx.flat() as i64;
    let shifted = ((flat + shift) % total + total) % total;
    TensorIndex::from_flat(out_shape.clone(), shifted as u64).into_iter().collect()
}

fn identity_forward(in_idx: &TensorIndex) -> Vec<TensorIndex> {
    vec![in_idx.clone()]
}

/// Expand every node of `leveled` into its chunk-level `CtOp` realisation,
/// producing a complete [`CtProgram`].
pub fn expand_to_ctops(leveled: &LeveledDag, ctx: &ProgramContext) -> Result<CtProgram> {
    let mut expander = Expander::new(ctx);

    for id in leveled.topological_order() {
        let node = leveled
            .value(id)
            .expect("topological id always has a value");
        let info = node.info;
        let parents = leveled.parents(id);
        let parent_maps: Vec<ChunkMap> = parents
            .iter()
            .map(|p| expander.by_node.get(p).cloned().unwrap_or_default())
            .collect();
        expander.current_ancestor = Some(id);

        let produced = match &node.op {
            TOp::InputC { name, output_layout, .. } => {
                let mut map = ChunkMap::new();
                for &offset in output_layout.chunk_offsets().iter() {
                    let node_id = expander.emit(
                        CtOp::InputC {
                            name: name.clone(),
                            chunk_offset: offset,
                        },
                        vec![],
                        info,
                    )?;
                    map.insert(offset, node_id);
                }
                map
            }
            TOp::OutputC { name, input_layout } => {
                let input = &parent_maps[0];
                let mut map = ChunkMap::new();
                for &offset in input_layout.chunk_offsets().iter() {
                    let Some(&src) = input.get(&offset) else { continue };
                    let node_id = expander.emit(
                        CtOp::OutputC {
                            name: name.clone(),
                            chunk_offset: offset,
                        },
                        vec![src],
                        info,
                    )?;
                    map.insert(offset, node_id);
                }
                map
            }
            TOp::AddCC { .. } => expander.elementwise(|| CtOp::AddCC, &parent_maps[0], &parent_maps[1], info)?,
            TOp::MulCC { .. } => expander.elementwise(|| CtOp::MulCC, &parent_maps[0], &parent_maps[1], info)?,
            TOp::AddCS { scalar, .. } => expander.elementwise_scalar(|| CtOp::AddCS { scalar: *scalar }, &parent_maps[0], info)?,
            TOp::MulCS { scalar, .. } => expander.elementwise_scalar(|| CtOp::MulCS { scalar: *scalar }, &parent_maps[0], info)?,
            TOp::AddCP { layout, plaintext } => expander.elementwise_cp(layout, plaintext, &parent_maps[0], false, info)?,
            TOp::MulCP { layout, plaintext } => expander.elementwise_cp(layout, plaintext, &parent_maps[0], true, info)?,
            TOp::RescaleC { .. } => expander.passthrough(|| CtOp::RescaleC, &parent_maps[0], info)?,
            TOp::BootstrapC { .. } => expander.passthrough(|| CtOp::BootstrapC, &parent_maps[0], info)?,

            TOp::ReduceDimC { dim, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let dim = *dim;
                let forward = move |idx: &TensorIndex| reduce_forward(dim, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, true, info)?
            }
            TOp::ReplicateDimC { dim, multiple, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let orig_size = input_layout.shape().dims()[*dim];
                let (dim, multiple) = (*dim, *multiple);
                let forward = move |idx: &TensorIndex| replicate_forward(dim, multiple, orig_size, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::ReorderDimsC { permutation, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let permutation = permutation.clone();
                let forward = move |idx: &TensorIndex| reorder_forward(&permutation, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::ResizeDimC { input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let forward = move |idx: &TensorIndex| resize_forward(idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, true, info)?
            }
            TOp::DropDimC { dim, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let dim = *dim;
                let forward = move |idx: &TensorIndex| drop_dim_forward(dim, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::InsertDimC { dim, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let dim = *dim;
                let forward = move |idx: &TensorIndex| insert_dim_forward(dim, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::StrideC { strides, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let strides = strides.clone();
                let forward = move |idx: &TensorIndex| stride_forward(&strides, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, true, info)?
            }
            TOp::MergedStrideC { strides, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let strides = strides.clone();
                let forward = move |idx: &TensorIndex| stride_forward(&strides, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, true, info)?
            }
            TOp::CyclicShiftC { offset, input_layout, output_layout } => {
                let diff = DiffTensorIndex::new(input_layout.shape().clone(), offset.clone())?;
                let forward = move |idx: &TensorIndex| cyclic_shift_forward(&diff, idx);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::UnpaddedShiftC { offset, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let offset = offset.clone();
                let forward = move |idx: &TensorIndex| unpadded_shift_forward(&offset, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, true, info)?
            }
            TOp::RotateC { shift, input_layout, output_layout } => {
                let out_shape = output_layout.shape().clone();
                let shift = *shift;
                let forward = move |idx: &TensorIndex| rotate_forward(shift, idx, &out_shape);
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &forward, false, info)?
            }
            TOp::ChetRepackC { input_layout, output_layout } => {
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &identity_forward, true, info)?
            }
            TOp::LayoutConversionC { input_layout, output_layout } => {
                expander.group_and_emit(&parent_maps[0], input_layout, output_layout, &identity_forward, true, info)?
            }
        };

        expander.by_node.insert(id, produced);
    }

    Ok(expander.program)
}
