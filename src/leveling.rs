//! Leveling and bootstrap placement (§4.4): the cost DP that chooses
//! bootstrap frontiers, and lowering the scaled DAG to a leveled one with
//! `BootstrapC` nodes inserted at the chosen depths.

use std::collections::HashMap;

use crate::context::ProgramContext;
use crate::dag::{Dag, NodeId};
use crate::depth::{compute_depth, compute_frontiers, compute_shortcuts, Shortcut};
use crate::error::{LowerError, Result};
use crate::level::{Level, LevelInfo, LogScale};
use crate::rescale::ScaledDag;
use crate::top::TOp;

/// A `TOp` carrying the level/scale pair it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct LeveledTOp {
    pub op: TOp,
    pub info: LevelInfo,
}

pub type LeveledDag = Dag<LeveledTOp>;

/// One DP cell: the cheapest cost to cover depths `0..=d` along with the prior
/// depth `j` that achieved it. `None` means depth `d` is unreachable within
/// the usable-level budget — this is the explicit replacement for the
/// original's sentinel cost constant.
#[derive(Debug, Clone, Copy)]
struct DpCell {
    cost: u64,
    from: Option<u32>,
}

fn shortcuts_not_bootstrapped_later(
    shortcuts: &std::collections::BTreeMap<(u32, u32), Vec<Shortcut>>,
    j: u32,
    d: u32,
) -> u64 {
    shortcuts
        .iter()
        .filter(|&(&(from_depth, to_depth), _)| from_depth <= j && to_depth >= d)
        .map(|(_, v)| v.len() as u64)
        .sum()
}

/// Run the cost DP (§4.4.2) and backtrack to the chosen bootstrap frontiers:
/// the ordered set of depths at which a bootstrap should be inserted.
pub fn bootstrap_frontiers(dag: &ScaledDag, ctx: &ProgramContext) -> Result<Vec<u32>> {
    let depths = compute_depth(dag);
    let dag_depth = depths.values().copied().max().unwrap_or(0);
    if dag_depth == 0 {
        return Ok(Vec::new());
    }
    let frontiers = compute_frontiers(dag, &depths);
    let shortcuts = compute_shortcuts(dag, &depths);
    let usable_levels = ctx.usable_levels();

    let mut dp: HashMap<u32, DpCell> = HashMap::new();
    dp.insert(0, DpCell { cost: 0, from: None });

    for d in 1..=dag_depth {
        let lo = d.saturating_sub(usable_levels - 1);
        let mut best: Option<(u64, u32, u64)> = None; // (cost, j, shortcut_pain)
        for j in lo..d {
            let Some(prior) = dp.get(&j) else { continue };
            let frontier_size = frontiers.get(&j).map(|f| f.len()).unwrap_or(0) as u64;
            let pain = shortcuts_not_bootstrapped_later(&shortcuts, j, d);
            let cost = prior.cost + frontier_size + pain;
            let better = match best {
                None => true,
                Some((best_cost, _, best_pain)) => cost < best_cost || (cost == best_cost && pain > best_pain),
            };
            if better {
                best = Some((cost, j, pain));
            }
        }
        let Some((cost, j, _)) = best else {
            return Err(LowerError::level_underflow(
                "leveling::bootstrap_frontiers",
                [],
                format!("no reachable prior depth covers depth {d} within {usable_levels} usable levels"),
            ));
        };
        dp.insert(d, DpCell { cost, from: Some(j) });
    }

    let mut chosen = Vec::new();
    let mut cursor = dag_depth;
    while let Some(cell) = dp.get(&cursor) {
        match cell.from {
            Some(j) => {
                chosen.push(j);
                cursor = j;
            }
            None => break,
        }
    }
    chosen.sort_unstable();
    chosen.dedup();
    Ok(chosen)
}

/// Lower a scaled DAG to a leveled one, inserting `BootstrapC` children at
/// every node that lies on a selected frontier depth (§4.4.3).
pub fn assign_levels(dag: &ScaledDag, ctx: &ProgramContext, frontiers_selected: &[u32]) -> Result<LeveledDag> {
    let depths = compute_depth(dag);
    let frontiers = compute_frontiers(dag, &depths);
    let mut frontier_nodes: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
    for &d in frontiers_selected {
        if let Some(nodes) = frontiers.get(&d) {
            frontier_nodes.extend(nodes.iter().copied());
        }
    }

    let mut out = LeveledDag::new();
    let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
    let mut info_of: HashMap<NodeId, LevelInfo> = HashMap::new();

    for old_id in dag.topological_order() {
        let scaled = dag.value(old_id).expect("topological id has a value").clone();
        let old_parents = dag.parents(old_id);
        let parent_new: Vec<NodeId> = old_parents.iter().map(|p| old_to_new[p]).collect();
        let parent_infos: Vec<LevelInfo> = parent_new.iter().map(|n| info_of[n]).collect();

        let is_rescale = matches!(scaled.op, TOp::RescaleC { .. });
        let level = if parent_infos.is_empty() {
            ctx.usable_levels()
        } else {
            let min_level = parent_infos.iter().map(|i| i.level.0).min().expect("non-empty");
            if is_rescale {
                min_level.saturating_sub(1)
            } else {
                min_level
            }
        };
        if level == 0 {
            return Err(LowerError::level_underflow(
                "leveling::assign_levels",
                [old_id],
                "node level fell to 0 with no bootstrap selected to cover it",
            ));
        }

        let info = LevelInfo::new(Level(level), LogScale(scaled.log_scale));
        let mut current = out.add_node(LeveledTOp { op: scaled.op, info }, parent_new, vec![old_id])?;
        info_of.insert(current, info);

        if frontier_nodes.contains(&old_id) {
            tracing::debug!(node = %old_id, "bootstrap placed");
            let layout = out.value(current).expect("just inserted").op.output_layout().clone();
            let bootstrap_info = LevelInfo::new(Level(ctx.usable_levels()), info.log_scale);
            current = out.add_node(
                LeveledTOp {
                    op: TOp::BootstrapC { usable_levels: ctx.usable_levels(), layout },
                    info: bootstrap_info,
                },
                vec![current],
                vec![old_id],
            )?;
            info_of.insert(current, bootstrap_info);
        }

        old_to_new.insert(old_id, current);
    }

    Ok(out)
}

/// `LevelingPolicy::Noop`: never bootstrap. Underflow surfaces as the same
/// `LevelUnderflow` error [`assign_levels`] raises for an unselected frontier.
pub fn assign_levels_noop(dag: &ScaledDag, ctx: &ProgramContext) -> Result<LeveledDag> {
    assign_levels(dag, ctx, &[])
}

/// `LevelingPolicy::Lazy`: bootstrap a node's own output the moment its
/// natural level would hit zero, rather than selecting frontiers up front via
/// the DP. The underflowing node itself is never stored at level 0 — its
/// (unused outside its own bootstrap) level is clamped to 1 as a placeholder.
pub fn assign_levels_lazy(dag: &ScaledDag, ctx: &ProgramContext) -> Result<LeveledDag> {
    let mut out = LeveledDag::new();
    let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
    let mut info_of: HashMap<NodeId, LevelInfo> = HashMap::new();

    for old_id in dag.topological_order() {
        let scaled = dag.value(old_id).expect("topological id has a value").clone();
        let old_parents = dag.parents(old_id);
        let parent_new: Vec<NodeId> = old_parents.iter().map(|p| old_to_new[p]).collect();
        let parent_infos: Vec<LevelInfo> = parent_new.iter().map(|n| info_of[n]).collect();

        let is_rescale = matches!(scaled.op, TOp::RescaleC { .. });
        let natural_level = if parent_infos.is_empty() {
            ctx.usable_levels()
        } else {
            let min_level = parent_infos.iter().map(|i| i.level.0).min().expect("non-empty");
            if is_rescale {
                min_level.saturating_sub(1)
            } else {
                min_level
            }
        };

        let underflowed = natural_level == 0;
        let stored_level = natural_level.max(1);
        let info = LevelInfo::new(Level(stored_level), LogScale(scaled.log_scale));
        let mut current = out.add_node(LeveledTOp { op: scaled.op, info }, parent_new, vec![old_id])?;
        info_of.insert(current, info);

        if underflowed {
            let layout = out.value(current).expect("just inserted").op.output_layout().clone();
            let bootstrap_info = LevelInfo::new(Level(ctx.usable_levels()), info.log_scale);
            current = out.add_node(
                LeveledTOp {
                    op: TOp::BootstrapC { usable_levels: ctx.usable_levels(), layout },
                    info: bootstrap_info,
                },
                vec![current],
                vec![old_id],
            )?;
            info_of.insert(current, bootstrap_info);
        }

        old_to_new.insert(old_id, current);
    }

    Ok(out)
}

/// `LevelingPolicy::ChetLazy`: CHET's own lazy variant. Rather than the DP's
/// cost-optimal frontier selection, bootstraps are placed periodically every
/// `usable_levels - 1` depths — the deepest point still guaranteed safe below
/// the next underflow, i.e. the chokepoint immediately below where a plain
/// walk would hit level zero.
pub fn chet_lazy_frontiers(dag: &ScaledDag, ctx: &ProgramContext) -> Vec<u32> {
    let depths = compute_depth(dag);
    let dag_depth = depths.values().copied().max().unwrap_or(0);
    let span = ctx.usable_levels().saturating_sub(1).max(1);

    let mut chosen = Vec::new();
    let mut d = span;
    while d < dag_depth {
        chosen.push(d);
        d += span;
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::default_layout_fill_gaps;
    use crate::level::BootstrappingPrecision;
    use crate::shape::Shape;

    fn layout() -> crate::layout::TensorLayout {
        default_layout_fill_gaps(Shape::new(vec![4]).unwrap(), 2).unwrap()
    }

    #[test]
    fn a_single_depth_chain_needs_no_bootstrap() {
        let mut dag = ScaledDag::new();
        let x = dag.add_input(crate::rescale::ScaledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            log_scale: 20,
        });
        let _add = dag
            .add_node(
                crate::rescale::ScaledTOp { op: TOp::AddCS { layout: layout(), scalar: 1.0 }, log_scale: 20 },
                vec![x],
                vec![],
            )
            .unwrap();

        let ctx = ProgramContext::new(2, 20, 4, BootstrappingPrecision::P19).unwrap();
        let frontiers = bootstrap_frontiers(&dag, &ctx).unwrap();
        assert!(frontiers.is_empty());

        let leveled = assign_levels(&dag, &ctx, &frontiers).unwrap();
        for id in leveled.node_ids() {
            assert!(leveled.value(id).unwrap().info.level.0 >= 1);
        }
    }

    #[test]
    fn a_chain_deeper_than_the_level_budget_forces_a_bootstrap() {
        let mut dag = ScaledDag::new();
        let mut prev = dag.add_input(crate::rescale::ScaledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            log_scale: 20,
        });
        for _ in 0..5 {
            prev = dag
                .add_node(
                    crate::rescale::ScaledTOp { op: TOp::RescaleC { ct_log_scale: 20, layout: layout() }, log_scale: 0 },
                    vec![prev],
                    vec![],
                )
                .unwrap();
        }

        let ctx = ProgramContext::new(2, 20, 2, BootstrappingPrecision::P19).unwrap();
        let frontiers = bootstrap_frontiers(&dag, &ctx).unwrap();
        assert!(!frontiers.is_empty());

        let leveled = assign_levels(&dag, &ctx, &frontiers).unwrap();
        let has_bootstrap = leveled
            .node_ids()
            .into_iter()
            .any(|id| matches!(leveled.value(id).unwrap().op, TOp::BootstrapC { .. }));
        assert!(has_bootstrap);
        for id in leveled.node_ids() {
            assert!(leveled.value(id).unwrap().info.level.0 >= 1);
        }
    }
}
