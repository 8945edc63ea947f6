//! The waterline rescaling pass (§4.3): assigns each node a log scale and
//! inserts `RescaleC` children wherever the scale would otherwise reach the
//! backend's waterline.

use std::collections::HashMap;

use crate::context::ProgramContext;
use crate::dag::{Dag, NodeId};
use crate::error::{LowerError, Result};
use crate::top::TOp;

/// A `TOp` paired with the log scale of the value it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledTOp {
    pub op: TOp,
    pub log_scale: u32,
}

pub type ScaledDag = Dag<ScaledTOp>;

fn node_scale(op: &TOp, ctx: &ProgramContext, parent_scales: &[u32]) -> Result<u32> {
    let scale = match op {
        TOp::InputC { log_scale, .. } => *log_scale,
        TOp::AddCC { .. } => *parent_scales.iter().max().expect("AddCC has operands"),
        TOp::AddCP { .. } => parent_scales[0],
        TOp::AddCS { .. } => parent_scales[0],
        TOp::MulCC { .. } => parent_scales.iter().sum(),
        TOp::OutputC { .. } | TOp::BootstrapC { .. } => parent_scales[0],
        TOp::RescaleC { .. } => {
            return Err(LowerError::structural(
                "rescale::node_scale",
                [],
                "RescaleC nodes are inserted by this pass, never present in its input",
            ));
        }
        other => parent_scales[0] + other.added_log_scale() + other.backend_mask_depth() * ctx.ct_log_scale(),
    };
    Ok(scale)
}

/// Run the waterline pass over a leveled-TOp-free (layout-assigned) DAG,
/// producing a scaled DAG where every node's scale is strictly below
/// `2 * ctx.ct_log_scale()`.
pub fn assign_scales(dag: &crate::layout_pass::TOpDag, ctx: &ProgramContext) -> Result<ScaledDag> {
    let mut out = ScaledDag::new();
    let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
    let mut scale_of: HashMap<NodeId, u32> = HashMap::new();

    for old_id in dag.topological_order() {
        let op = dag.value(old_id).expect("topological id has a value").clone();
        let old_parents = dag.parents(old_id);
        let parent_new: Vec<NodeId> = old_parents.iter().map(|p| old_to_new[p]).collect();
        let parent_scales: Vec<u32> = parent_new.iter().map(|n| scale_of[n]).collect();

        let mut scale = node_scale(&op, ctx, &parent_scales)?;
        let mut current = out.add_node(ScaledTOp { op, log_scale: scale }, parent_new, vec![old_id])?;

        let waterline = ctx.scale_waterline();
        while scale >= waterline {
            scale -= ctx.ct_log_scale();
            tracing::debug!(node = %old_id, new_scale = scale, "rescale inserted");
            let layout = out.value(current).expect("just inserted").op.output_layout().clone();
            current = out.add_node(
                ScaledTOp {
                    op: TOp::RescaleC { ct_log_scale: ctx.ct_log_scale(), layout },
                    log_scale: scale,
                },
                vec![current],
                vec![old_id],
            )?;
        }

        old_to_new.insert(old_id, current);
        scale_of.insert(current, scale);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CtOpPolicy, LayoutPolicy, LevelingPolicy, PassConfig};
    use crate::embryo::EmbryoDag;
    use crate::layout_pass::assign_layouts;
    use crate::level::BootstrappingPrecision;
    use crate::shape::Shape;
    use crate::top::TOpEmbryo;

    fn ctx() -> ProgramContext {
        ProgramContext::new(2, 20, 6, BootstrappingPrecision::P19).unwrap()
    }

    fn config() -> PassConfig {
        PassConfig::new(LayoutPolicy::FillGaps, LevelingPolicy::Dp, CtOpPolicy::Basic, false, 64).unwrap()
    }

    #[test]
    fn scalar_multiply_chain_never_leaves_a_node_at_or_above_the_waterline() {
        // y = ((x*x)*x)*x, log_scale=20, ct_log_scale=20 -> waterline 40.
        // Every MulCC pushes a parent back up to the waterline, so every one
        // triggers a rescale back down.
        let shape = Shape::new(vec![4]).unwrap();
        let mut embryo = EmbryoDag::new();
        let x = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
        let m1 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![x, x], vec![]).unwrap();
        let m2 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![m1, x], vec![]).unwrap();
        let _m3 = embryo.add_node(TOpEmbryo::MulCC { shape }, vec![m2, x], vec![]).unwrap();

        let laid_out = assign_layouts(&embryo, &ctx(), &config()).unwrap();
        let scaled = assign_scales(&laid_out, &ctx()).unwrap();

        let rescale_count = scaled
            .node_ids()
            .into_iter()
            .filter(|&id| matches!(scaled.value(id).unwrap().op, TOp::RescaleC { .. }))
            .count();
        assert_eq!(rescale_count, 3);

        for id in scaled.node_ids() {
            assert!(scaled.value(id).unwrap().log_scale < ctx().scale_waterline());
        }
    }

    #[test]
    fn elementwise_add_of_equal_scale_inputs_needs_no_rescale() {
        let shape = Shape::new(vec![8]).unwrap();
        let mut embryo = EmbryoDag::new();
        let a = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "a".into(), log_scale: 30 });
        let b = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "b".into(), log_scale: 30 });
        let _sum = embryo.add_node(TOpEmbryo::AddCC { shape }, vec![a, b], vec![]).unwrap();

        let ctx = ProgramContext::new(3, 30, 4, BootstrappingPrecision::P19).unwrap();
        let cfg = PassConfig::new(LayoutPolicy::FillGaps, LevelingPolicy::Dp, CtOpPolicy::Basic, false, 64).unwrap();
        let laid_out = assign_layouts(&embryo, &ctx, &cfg).unwrap();
        let scaled = assign_scales(&laid_out, &ctx).unwrap();

        let has_rescale = scaled
            .node_ids()
            .into_iter()
            .any(|id| matches!(scaled.value(id).unwrap().op, TOp::RescaleC { .. }));
        assert!(!has_rescale);
    }
}
