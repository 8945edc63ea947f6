//! Bootstrap pruning (§4.4.4): removes `BootstrapC` nodes that are provably
//! redundant, via an all-or-nothing speculative overlay rather than committing
//! partial level changes before a violation is discovered.

use std::collections::{HashMap, HashSet};

use crate::context::ProgramContext;
use crate::dag::NodeId;
use crate::error::Result;
use crate::leveling::LeveledDag;
use crate::top::TOp;

/// Hypothesise removing `bootstrap`, propagating the resulting level change to
/// every descendant until either a violation is found (returns `None`) or
/// every reachable path is absorbed by a leaf or another `BootstrapC` (returns
/// the overlay of changed levels, keyed by node id, ready to commit).
fn attempt_removal(dag: &LeveledDag, bootstrap: NodeId, ctx: &ProgramContext) -> Option<HashMap<NodeId, u32>> {
    let parents = dag.parents(bootstrap);
    let &parent = parents.first().expect("BootstrapC always has exactly one operand");
    let parent_level = dag.value(parent).expect("parent exists").info.level.0;

    let mut overlay: HashMap<NodeId, u32> = HashMap::new();
    overlay.insert(parent, parent_level);
    // Children of `bootstrap` reparent onto `parent` once it is removed, so a
    // lookup that still names `bootstrap` must resolve to `parent`'s level.
    overlay.insert(bootstrap, parent_level);

    let mut stack = dag.children(bootstrap);
    let mut visited: HashSet<NodeId> = HashSet::new();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let node = dag.value(id).expect("child id exists in dag");
        let parent_levels: Vec<u32> = dag
            .parents(id)
            .iter()
            .map(|p| overlay.get(p).copied().unwrap_or_else(|| dag.value(*p).expect("parent exists").info.level.0))
            .collect();
        let min_parent = *parent_levels.iter().min().expect("node has at least one operand");

        if matches!(node.op, TOp::BootstrapC { .. }) {
            // Absorbs whatever level arrives; its own output is unaffected.
            overlay.insert(id, ctx.usable_levels());
            continue;
        }

        let is_rescale = matches!(node.op, TOp::RescaleC { .. });
        let new_level = if is_rescale { min_parent.checked_sub(1) } else { Some(min_parent) };
        let Some(new_level) = new_level.filter(|&l| l >= 1) else {
            return None;
        };
        overlay.insert(id, new_level);
        stack.extend(dag.children(id));
    }

    Some(overlay)
}

fn commit_removal(dag: &mut LeveledDag, bootstrap: NodeId, overlay: HashMap<NodeId, u32>) -> Result<()> {
    for (id, level) in overlay {
        if id == bootstrap {
            continue;
        }
        let mut node = dag.value(id).expect("overlay id exists in dag").clone();
        node.info.level.0 = level;
        dag.set_value(id, node)?;
    }
    dag.remove_node(bootstrap)
}

/// Repeatedly remove provably-redundant bootstraps until no more can be
/// pruned. Candidates are tried in topological order each pass; the spec's
/// shortcut/non-shortcut/undesignated ordering doesn't apply here since this
/// leveling pass inserts only frontier bootstraps and never distinguishes
/// them by provenance.
pub fn prune_bootstraps(dag: &LeveledDag, ctx: &ProgramContext) -> Result<LeveledDag> {
    let mut out = dag.clone_from_ancestor();
    loop {
        let candidates: Vec<NodeId> = out
            .topological_order()
            .into_iter()
            .filter(|&id| matches!(out.value(id), Some(node) if matches!(node.op, TOp::BootstrapC { .. })))
            .collect();

        let mut pruned_any = false;
        for id in candidates {
            if !out.contains(id) {
                continue;
            }
            if let Some(overlay) = attempt_removal(&out, id, ctx) {
                commit_removal(&mut out, id, overlay)?;
                pruned_any = true;
            }
        }
        if !pruned_any {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::default_layout_fill_gaps;
    use crate::level::{BootstrappingPrecision, Level, LevelInfo, LogScale};
    use crate::leveling::LeveledTOp;
    use crate::shape::Shape;

    fn layout() -> crate::layout::TensorLayout {
        default_layout_fill_gaps(Shape::new(vec![4]).unwrap(), 2).unwrap()
    }

    fn ctx() -> ProgramContext {
        ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap()
    }

    #[test]
    fn an_unneeded_bootstrap_right_before_the_output_is_removed() {
        let mut dag = LeveledDag::new();
        let x = dag.add_input(LeveledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            info: LevelInfo::new(Level(4), LogScale(20)),
        });
        let boot = dag
            .add_node(
                LeveledTOp {
                    op: TOp::BootstrapC { usable_levels: 4, layout: layout() },
                    info: LevelInfo::new(Level(4), LogScale(20)),
                },
                vec![x],
                vec![],
            )
            .unwrap();
        let _out = dag
            .add_node(
                LeveledTOp { op: TOp::OutputC { name: "o".into(), input_layout: layout() }, info: LevelInfo::new(Level(4), LogScale(20)) },
                vec![boot],
                vec![],
            )
            .unwrap();

        let pruned = prune_bootstraps(&dag, &ctx()).unwrap();
        let has_bootstrap = pruned
            .node_ids()
            .into_iter()
            .any(|id| matches!(pruned.value(id).unwrap().op, TOp::BootstrapC { .. }));
        assert!(!has_bootstrap);
    }

    #[test]
    fn a_bootstrap_that_prevents_underflow_is_kept() {
        let mut dag = LeveledDag::new();
        let x = dag.add_input(LeveledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            info: LevelInfo::new(Level(1), LogScale(20)),
        });
        let boot = dag
            .add_node(
                LeveledTOp {
                    op: TOp::BootstrapC { usable_levels: 4, layout: layout() },
                    info: LevelInfo::new(Level(4), LogScale(20)),
                },
                vec![x],
                vec![],
            )
            .unwrap();
        let _rescale = dag
            .add_node(
                LeveledTOp {
                    op: TOp::RescaleC { ct_log_scale: 20, layout: layout() },
                    info: LevelInfo::new(Level(3), LogScale(0)),
                },
                vec![boot],
                vec![],
            )
            .unwrap();

        let pruned = prune_bootstraps(&dag, &ctx()).unwrap();
        let has_bootstrap = pruned
            .node_ids()
            .into_iter()
            .any(|id| matches!(pruned.value(id).unwrap().op, TOp::BootstrapC { .. }));
        assert!(has_bootstrap);
    }
}
