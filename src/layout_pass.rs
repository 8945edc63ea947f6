//! Assigns layouts to an embryo DAG, producing a TOp DAG with layout
//! conversions inserted wherever two operands of an element-wise binary op
//! disagree.

use std::collections::HashMap;

use crate::context::{LayoutPolicy, PassConfig, ProgramContext};
use crate::dag::{Dag, NodeId};
use crate::error::{LowerError, Result};
use crate::layout::{default_layout_chet, default_layout_fill_gaps, TensorLayout};
use crate::layout_conversion::LayoutConversion;
use crate::shape::Shape;
use crate::top::{TOp, TOpEmbryo};

pub type TOpDag = Dag<TOp>;

fn default_layout(shape: &Shape, ctx: &ProgramContext, policy: LayoutPolicy) -> Result<TensorLayout> {
    match policy {
        LayoutPolicy::FillGaps => default_layout_fill_gaps(shape.clone(), ctx.log_chunk_size()),
        LayoutPolicy::Chet { .. } => default_layout_chet(shape.clone(), ctx.log_chunk_size()),
    }
}

/// Insert whatever chain of `LayoutConversionC` nodes is needed to bring the
/// node `parent_new` (currently laid out as `parent_layout`) to `target`.
/// Returns the id of the final node, which is laid out exactly as `target`.
fn unify_to(
    out: &mut TOpDag,
    layout_of: &mut HashMap<NodeId, TensorLayout>,
    parent_new: NodeId,
    parent_layout: &TensorLayout,
    target: &TensorLayout,
    max_tentacles: u32,
    ancestor: NodeId,
) -> Result<NodeId> {
    if parent_layout == target {
        return Ok(parent_new);
    }
    let conversion = LayoutConversion::new(parent_layout.clone(), target.clone())?;
    let steps = conversion.decompose(max_tentacles)?;
    tracing::debug!(ancestor = %ancestor, steps = steps.len(), "conversion decomposed");
    let mut current = parent_new;
    for step in steps {
        let new_id = out.add_node(
            TOp::LayoutConversionC {
                input_layout: step.input().clone(),
                output_layout: step.output().clone(),
            },
            vec![current],
            vec![ancestor],
        )?;
        layout_of.insert(new_id, step.output().clone());
        current = new_id;
    }
    Ok(current)
}

/// Assign layouts across `embryo`, producing the corresponding `TOp` DAG.
pub fn assign_layouts(embryo: &crate::embryo::EmbryoDag, ctx: &ProgramContext, config: &PassConfig) -> Result<TOpDag> {
    let mut out = TOpDag::new();
    let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
    let mut layout_of: HashMap<NodeId, TensorLayout> = HashMap::new();

    for old_id in embryo.topological_order() {
        let value = embryo
            .value(old_id)
            .expect("topological id always has a value");
        let old_parents = embryo.parents(old_id);
        let parent_new: Vec<NodeId> = old_parents.iter().map(|p| old_to_new[p]).collect();
        let parent_layouts: Vec<TensorLayout> = parent_new.iter().map(|n| layout_of[n].clone()).collect();

        let (new_id, layout) = match value {
            TOpEmbryo::InputC { shape, name, log_scale } => {
                let layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::InputC {
                        name: name.clone(),
                        log_scale: *log_scale,
                        output_layout: layout.clone(),
                    },
                    vec![],
                    vec![old_id],
                )?;
                (id, layout)
            }
            TOpEmbryo::OutputC { name, .. } => {
                let input_layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::OutputC {
                        name: name.clone(),
                        input_layout: input_layout.clone(),
                    },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, input_layout)
            }
            TOpEmbryo::AddCC { .. } | TOpEmbryo::MulCC { .. } => {
                let target = parent_layouts[0].clone();
                let p0 = unify_to(
                    &mut out,
                    &mut layout_of,
                    parent_new[0],
                    &parent_layouts[0],
                    &target,
                    config.max_tentacles(),
                    old_id,
                )?;
                let p1 = unify_to(
                    &mut out,
                    &mut layout_of,
                    parent_new[1],
                    &parent_layouts[1],
                    &target,
                    config.max_tentacles(),
                    old_id,
                )?;
                let ctor = if matches!(value, TOpEmbryo::AddCC { .. }) {
                    TOp::AddCC { layout: target.clone() }
                } else {
                    TOp::MulCC { layout: target.clone() }
                };
                let id = out.add_node(ctor, vec![p0, p1], vec![old_id])?;
                (id, target)
            }
            TOpEmbryo::AddCP { plaintext, .. } => {
                let layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::AddCP { layout: layout.clone(), plaintext: plaintext.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, layout)
            }
            TOpEmbryo::MulCP { plaintext, .. } => {
                let layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::MulCP { layout: layout.clone(), plaintext: plaintext.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, layout)
            }
            TOpEmbryo::AddCS { scalar, .. } => {
                let layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::AddCS { layout: layout.clone(), scalar: *scalar },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, layout)
            }
            TOpEmbryo::MulCS { scalar, .. } => {
                let layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::MulCS { layout: layout.clone(), scalar: *scalar },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, layout)
            }
            TOpEmbryo::ReduceDimC { shape, dim } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::ReduceDimC { dim: *dim, input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::ReplicateDimC { shape, dim, multiple } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::ReplicateDimC { dim: *dim, multiple: *multiple, input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::ReorderDimsC { shape, permutation } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::ReorderDimsC { permutation: permutation.clone(), input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::ResizeDimC { out_shape, .. } => {
                let output_layout = default_layout(out_shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::ResizeDimC { input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::DropDimC { shape, dim } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::DropDimC { dim: *dim, input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::InsertDimC { shape, dim } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::InsertDimC { dim: *dim, input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::StrideC { shape, strides } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::StrideC { strides: strides.clone(), input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::MergedStrideC { shape, strides } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::MergedStrideC { strides: strides.clone(), input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::CyclicShiftC { shape, offset } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::CyclicShiftC { offset: offset.clone(), input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::UnpaddedShiftC { shape, offset } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::UnpaddedShiftC { offset: offset.clone(), input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::RotateC { shape, shift } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::RotateC { shift: *shift, input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::ChetRepackC { shape } => {
                let output_layout = default_layout(shape, ctx, config.layout_policy())?;
                let id = out.add_node(
                    TOp::ChetRepackC { input_layout: parent_layouts[0].clone(), output_layout: output_layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, output_layout)
            }
            TOpEmbryo::BootstrapC { usable_levels, .. } => {
                let layout = parent_layouts[0].clone();
                let id = out.add_node(
                    TOp::BootstrapC { usable_levels: *usable_levels, layout: layout.clone() },
                    vec![parent_new[0]],
                    vec![old_id],
                )?;
                (id, layout)
            }
        };

        old_to_new.insert(old_id, new_id);
        layout_of.insert(new_id, layout);
    }

    if old_to_new.is_empty() && !embryo.is_empty() {
        return Err(LowerError::structural("layout_pass::assign_layouts", [], "no nodes were laid out"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CtOpPolicy;
    use crate::context::LevelingPolicy;
    use crate::embryo::EmbryoDag;
    use crate::level::BootstrappingPrecision;
    use crate::shape::Shape;

    fn ctx() -> ProgramContext {
        ProgramContext::new(3, 30, 4, BootstrappingPrecision::P19).unwrap()
    }

    fn config() -> PassConfig {
        PassConfig::new(LayoutPolicy::FillGaps, LevelingPolicy::Dp, CtOpPolicy::Basic, false, 64).unwrap()
    }

    #[test]
    fn identical_lineage_operands_need_no_conversion() {
        let shape = Shape::new(vec![8]).unwrap();
        let mut embryo = EmbryoDag::new();
        let a = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "a".into(), log_scale: 30 });
        let b = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "b".into(), log_scale: 30 });
        let _sum = embryo.add_node(TOpEmbryo::AddCC { shape }, vec![a, b], vec![]).unwrap();

        let laid_out = assign_layouts(&embryo, &ctx(), &config()).unwrap();
        let has_conversion = laid_out
            .node_ids()
            .into_iter()
            .any(|id| matches!(laid_out.value(id), Some(TOp::LayoutConversionC { .. })));
        assert!(!has_conversion);
    }

    #[test]
    fn mismatched_reorders_trigger_a_conversion() {
        let shape = Shape::new(vec![4, 4]).unwrap();
        let mut embryo = EmbryoDag::new();
        let a = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "a".into(), log_scale: 30 });
        let b = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "b".into(), log_scale: 30 });
        let ra = embryo
            .add_node(TOpEmbryo::ReorderDimsC { shape: shape.clone(), permutation: vec![1, 0] }, vec![a], vec![])
            .unwrap();
        let _sum = embryo.add_node(TOpEmbryo::AddCC { shape }, vec![ra, b], vec![]).unwrap();

        let laid_out = assign_layouts(&embryo, &ctx(), &config()).unwrap();
        // The add's two operands must share a layout in the laid-out DAG.
        let add_id = laid_out
            .node_ids()
            .into_iter()
            .find(|&id| matches!(laid_out.value(id), Some(TOp::AddCC { .. })))
            .unwrap();
        let parents = laid_out.parents(add_id);
        let layouts: Vec<_> = parents
            .iter()
            .map(|&p| laid_out.value(p).unwrap().output_layout().clone())
            .collect();
        assert_eq!(layouts[0], layouts[1]);
    }
}
