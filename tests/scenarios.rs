//! End-to-end scenarios exercising the full pipeline, one module at a time,
//! plus the cross-cutting invariants the unit tests don't reach because they
//! only hold once every pass has run.

use ctlower::*;
use std::collections::HashMap;

fn ctx(log_chunk_size: u32, ct_log_scale: u32, usable_levels: u32) -> ProgramContext {
    ProgramContext::new(log_chunk_size, ct_log_scale, usable_levels, BootstrappingPrecision::P19).unwrap()
}

fn config(leveling_policy: LevelingPolicy) -> PassConfig {
    PassConfig::new(LayoutPolicy::FillGaps, leveling_policy, CtOpPolicy::Basic, false, 64).unwrap()
}

fn ctop_counts(program: &CtProgram) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for id in program.dag().node_ids() {
        *counts.entry(program.dag().value(id).unwrap().op.type_name()).or_insert(0) += 1;
    }
    counts
}

/// S1: element-wise add of two 1-D tensors that divide the chunk size evenly.
/// No layout conversion, no rescale, no bootstrap, exactly one chunk.
#[test]
fn s1_elementwise_add_needs_no_conversion_rescale_or_bootstrap() {
    let shape = Shape::new(vec![8]).unwrap();
    let ctx = ctx(3, 30, 4);
    let mut embryo = EmbryoDag::new();
    let a = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "a".into(), log_scale: 30 });
    let b = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "b".into(), log_scale: 30 });
    let sum = embryo.add_node(TOpEmbryo::AddCC { shape: shape.clone() }, vec![a, b], vec![]).unwrap();
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![sum], vec![]).unwrap();

    let program = compile(&embryo, &ctx, &config(LevelingPolicy::Dp)).unwrap();

    let has_rescale = program
        .dag()
        .node_ids()
        .into_iter()
        .any(|id| program.dag().value(id).unwrap().op.type_name() == "RescaleC");
    let has_bootstrap = program
        .dag()
        .node_ids()
        .into_iter()
        .any(|id| program.dag().value(id).unwrap().op.type_name() == "BootstrapC");
    assert!(!has_rescale);
    assert!(!has_bootstrap);

    let counts = ctop_counts(&program);
    assert_eq!(counts.get("AddCC").copied().unwrap_or(0), 1);
    assert_eq!(counts.get("OutputC").copied().unwrap_or(0), 1);
}

/// S2: a multiply chain long enough to cross the waterline repeatedly, but
/// shallow enough relative to `usable_levels` that no bootstrap is needed.
/// Mirrors `rescale::tests::scalar_multiply_chain_never_leaves_a_node_at_or_above_the_waterline`.
#[test]
fn s2_multiply_chain_rescales_without_bootstrapping() {
    let shape = Shape::new(vec![4]).unwrap();
    let ctx = ctx(2, 20, 6);
    let mut embryo = EmbryoDag::new();
    let x = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
    let m1 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![x, x], vec![]).unwrap();
    let m2 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![m1, x], vec![]).unwrap();
    let m3 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![m2, x], vec![]).unwrap();
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![m3], vec![]).unwrap();

    let merged = merge_strides(&embryo).unwrap();
    let laid_out = assign_layouts(&merged, &ctx, &config(LevelingPolicy::Dp)).unwrap();
    let hoisted = hoist_conversions(&laid_out).unwrap();
    let numbered = value_number(&hoisted).unwrap();
    let rewritten = rewrite_input_layouts(&numbered).unwrap();
    let scaled = assign_scales(&rewritten, &ctx).unwrap();

    for id in scaled.node_ids() {
        assert!(scaled.value(id).unwrap().log_scale < ctx.scale_waterline());
    }
    let rescale_count = scaled
        .node_ids()
        .into_iter()
        .filter(|&id| matches!(scaled.value(id).unwrap().op, TOp::RescaleC { .. }))
        .count();
    assert_eq!(rescale_count, 3);

    let frontiers = bootstrap_frontiers(&scaled, &ctx).unwrap();
    let leveled = assign_levels(&scaled, &ctx, &frontiers).unwrap();
    let has_bootstrap = leveled
        .node_ids()
        .into_iter()
        .any(|id| matches!(leveled.value(id).unwrap().op, TOp::BootstrapC { .. }));
    assert!(!has_bootstrap);
    for id in leveled.node_ids() {
        assert!(leveled.value(id).unwrap().info.level.0 >= 1);
    }
}

/// S3: the same chain, but with a level budget too small to survive without
/// a bootstrap. The DP must place at least one, and its output level is a
/// fresh `usable_levels`.
#[test]
fn s3_deep_multiply_forces_a_bootstrap() {
    let shape = Shape::new(vec![4]).unwrap();
    let ctx = ctx(2, 20, 2);
    let mut embryo = EmbryoDag::new();
    let x = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
    let m1 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![x, x], vec![]).unwrap();
    let m2 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![m1, x], vec![]).unwrap();
    let m3 = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![m2, x], vec![]).unwrap();
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![m3], vec![]).unwrap();

    let merged = merge_strides(&embryo).unwrap();
    let laid_out = assign_layouts(&merged, &ctx, &config(LevelingPolicy::Dp)).unwrap();
    let hoisted = hoist_conversions(&laid_out).unwrap();
    let numbered = value_number(&hoisted).unwrap();
    let rewritten = rewrite_input_layouts(&numbered).unwrap();
    let scaled = assign_scales(&rewritten, &ctx).unwrap();

    let frontiers = bootstrap_frontiers(&scaled, &ctx).unwrap();
    assert!(!frontiers.is_empty(), "a two-level budget cannot survive this chain without a bootstrap");

    let leveled = assign_levels(&scaled, &ctx, &frontiers).unwrap();
    let bootstrap_outputs: Vec<_> = leveled
        .node_ids()
        .into_iter()
        .filter(|&id| matches!(leveled.value(id).unwrap().op, TOp::BootstrapC { .. }))
        .collect();
    assert!(!bootstrap_outputs.is_empty());
    for id in bootstrap_outputs {
        assert_eq!(leveled.value(id).unwrap().info.level.0, ctx.usable_levels());
    }
}

/// S4: two independently-reordered operands feeding the same element-wise op
/// must end up sharing a layout, since `MulCC` requires its operands to agree.
#[test]
fn s4_reordered_operands_unify_to_the_same_layout() {
    let shape = Shape::new(vec![4, 4]).unwrap();
    let ctx = ctx(4, 20, 4);
    let mut embryo = EmbryoDag::new();
    let a = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "a".into(), log_scale: 20 });
    let b = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "b".into(), log_scale: 20 });
    let ra = embryo
        .add_node(TOpEmbryo::ReorderDimsC { shape: shape.clone(), permutation: vec![1, 0] }, vec![a], vec![])
        .unwrap();
    let rb = embryo
        .add_node(TOpEmbryo::ReorderDimsC { shape: shape.clone(), permutation: vec![1, 0] }, vec![b], vec![])
        .unwrap();
    let prod = embryo.add_node(TOpEmbryo::MulCC { shape: shape.clone() }, vec![ra, rb], vec![]).unwrap();
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![prod], vec![]).unwrap();

    let laid_out = assign_layouts(&embryo, &ctx, &config(LevelingPolicy::Dp)).unwrap();
    let hoisted = hoist_conversions(&laid_out).unwrap();
    let numbered = value_number(&hoisted).unwrap();

    let mul_node = numbered
        .node_ids()
        .into_iter()
        .find(|&id| matches!(numbered.value(id).unwrap(), TOp::MulCC { .. }))
        .expect("a MulCC node survives layout assignment");
    // MulCC only carries one layout field precisely because its two operands
    // were unified onto it; reaching this node at all proves unification held.
    match numbered.value(mul_node).unwrap() {
        TOp::MulCC { layout } => {
            assert_eq!(layout.shape().dims(), shape.dims());
        }
        other => panic!("expected MulCC, got {other:?}"),
    }
}

/// S5: a stride reduces the tensor shape before an unpadded shift is applied.
#[test]
fn s5_stride_reduces_shape_before_the_shift() {
    let ctx = ctx(6, 20, 4);
    let in_shape = Shape::new(vec![8, 8]).unwrap();
    let strided_shape = Shape::new(vec![4, 8]).unwrap();
    let mut embryo = EmbryoDag::new();
    let x = embryo.add_input(TOpEmbryo::InputC { shape: in_shape, name: "x".into(), log_scale: 20 });
    let strided = embryo
        .add_node(TOpEmbryo::StrideC { shape: strided_shape.clone(), strides: vec![2, 1] }, vec![x], vec![])
        .unwrap();
    let shifted = embryo
        .add_node(
            TOpEmbryo::UnpaddedShiftC { shape: strided_shape.clone(), offset: vec![0, 1] },
            vec![strided],
            vec![],
        )
        .unwrap();
    embryo
        .add_node(TOpEmbryo::OutputC { shape: strided_shape.clone(), name: "y".into() }, vec![shifted], vec![])
        .unwrap();

    let laid_out = assign_layouts(&embryo, &ctx, &config(LevelingPolicy::Dp)).unwrap();

    let stride_node = laid_out
        .node_ids()
        .into_iter()
        .find(|&id| matches!(laid_out.value(id).unwrap(), TOp::StrideC { .. }))
        .unwrap();
    match laid_out.value(stride_node).unwrap() {
        TOp::StrideC { output_layout, .. } => assert_eq!(output_layout.shape().dims(), strided_shape.dims()),
        other => panic!("expected StrideC, got {other:?}"),
    }

    let shift_node = laid_out
        .node_ids()
        .into_iter()
        .find(|&id| matches!(laid_out.value(id).unwrap(), TOp::UnpaddedShiftC { .. }))
        .unwrap();
    match laid_out.value(shift_node).unwrap() {
        TOp::UnpaddedShiftC { output_layout, .. } => assert_eq!(output_layout.shape().dims(), strided_shape.dims()),
        other => panic!("expected UnpaddedShiftC, got {other:?}"),
    }
}

/// S6: a bootstrap that adds nothing (placed right after an input, which is
/// already at a fresh level) is pruned away.
#[test]
fn s6_redundant_bootstrap_right_after_an_input_is_pruned() {
    let shape = Shape::new(vec![4]).unwrap();
    let ctx = ctx(2, 20, 4);
    let mut embryo = EmbryoDag::new();
    let x = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
    let boot = embryo
        .add_node(TOpEmbryo::BootstrapC { shape: shape.clone(), usable_levels: ctx.usable_levels() }, vec![x], vec![])
        .unwrap();
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![boot], vec![]).unwrap();

    let laid_out = assign_layouts(&embryo, &ctx, &config(LevelingPolicy::Dp)).unwrap();
    let hoisted = hoist_conversions(&laid_out).unwrap();
    let numbered = value_number(&hoisted).unwrap();
    let rewritten = rewrite_input_layouts(&numbered).unwrap();
    let scaled = assign_scales(&rewritten, &ctx).unwrap();
    let frontiers = bootstrap_frontiers(&scaled, &ctx).unwrap();
    let leveled = assign_levels(&scaled, &ctx, &frontiers).unwrap();
    let pruned = prune_bootstraps(&leveled, &ctx).unwrap();

    let bootstraps_before: Vec<NodeId> = leveled
        .node_ids()
        .into_iter()
        .filter(|&id| matches!(leveled.value(id).unwrap().op, TOp::BootstrapC { .. }))
        .collect();
    assert_eq!(bootstraps_before.len(), 1, "test expects exactly one injected bootstrap");
    let injected_bootstrap = bootstraps_before[0];

    let bootstrap_count_before = bootstraps_before.len();
    let bootstrap_count_after = pruned
        .node_ids()
        .into_iter()
        .filter(|&id| matches!(pruned.value(id).unwrap().op, TOp::BootstrapC { .. }))
        .count();
    assert_eq!(
        bootstrap_count_after,
        bootstrap_count_before - 1,
        "the redundant bootstrap right after an input must actually be pruned, not left in place"
    );

    let injected_still_present =
        pruned.contains(injected_bootstrap) && matches!(pruned.value(injected_bootstrap).unwrap().op, TOp::BootstrapC { .. });
    assert!(!injected_still_present, "the specific injected BootstrapC node must be gone, not just uncounted");

    for id in pruned.node_ids() {
        assert!(pruned.value(id).unwrap().info.level.0 >= 1, "every remaining node's level must be >= 1 after pruning");
    }
}

/// Provenance is the one resource `compile` keeps alive past every other
/// pass's input DAG; every ctop node must trace back to at least one embryo
/// node that is actually reachable in the original graph.
#[test]
fn provenance_traces_every_output_back_to_the_embryo_dag() {
    let shape = Shape::new(vec![4]).unwrap();
    let ctx = ctx(2, 20, 4);
    let mut embryo = EmbryoDag::new();
    let x = embryo.add_input(TOpEmbryo::InputC { shape: shape.clone(), name: "x".into(), log_scale: 20 });
    embryo.add_node(TOpEmbryo::OutputC { shape, name: "y".into() }, vec![x], vec![]).unwrap();

    let embryo_ids: std::collections::HashSet<_> = embryo.node_ids().into_iter().collect();
    let program = compile(&embryo, &ctx, &config(LevelingPolicy::Dp)).unwrap();

    for id in program.dag().node_ids() {
        let traced = program.provenance().trace(id);
        assert!(!traced.is_empty());
        assert!(traced.iter().all(|t| embryo_ids.contains(t)));
    }
}
