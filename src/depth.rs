//! The depth model underlying bootstrap placement (§4.4.1): depth, per-depth
//! frontiers (chokepoints), and cross-depth shortcut edges.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::dominators;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::NodeId;
use crate::rescale::{ScaledDag, ScaledTOp};
use crate::top::TOp;

/// `depth(node) = 0` for source nodes, otherwise `max(depth(parent)) +
/// [node is a RescaleC]`.
pub fn compute_depth(dag: &ScaledDag) -> HashMap<NodeId, u32> {
    let mut depth = HashMap::new();
    for id in dag.topological_order() {
        let parents = dag.parents(id);
        let base = parents.iter().map(|p| depth[p]).max().unwrap_or(0);
        let is_rescale = matches!(dag.value(id).map(|n| &n.op), Some(TOp::RescaleC { .. }));
        depth.insert(id, base + u32::from(is_rescale));
    }
    depth
}

fn is_rescale(dag: &ScaledDag, id: NodeId) -> bool {
    matches!(dag.value(id), Some(ScaledTOp { op: TOp::RescaleC { .. }, .. }))
}

/// Find the chokepoint of one connected component at a fixed depth: the node
/// that every path from a component entry to a component sink passes through,
/// via dominator analysis with a synthetic root. Falls back to `None` (caller
/// substitutes the RescaleC fallback) when no unique chokepoint exists.
fn chokepoint_of_component(dag: &ScaledDag, component: &[NodeId]) -> Option<NodeId> {
    let member: HashSet<NodeId> = component.iter().copied().collect();
    let mut graph = DiGraph::<NodeId, ()>::new();
    let mut index_of: HashMap<NodeId, NodeIndex> = HashMap::new();
    for &id in component {
        index_of.insert(id, graph.add_node(id));
    }
    for &id in component {
        for child in dag.children(id) {
            if member.contains(&child) {
                graph.add_edge(index_of[&id], index_of[&child], ());
            }
        }
    }

    let root = graph.add_node(NodeId(u32::MAX));
    let mut entries = Vec::new();
    let mut sinks = Vec::new();
    for &id in component {
        let has_internal_parent = dag.parents(id).iter().any(|p| member.contains(p));
        if !has_internal_parent {
            entries.push(index_of[&id]);
        }
        let has_internal_child = dag.children(id).iter().any(|c| member.contains(c));
        if !has_internal_child {
            sinks.push(index_of[&id]);
        }
    }
    for &e in &entries {
        graph.add_edge(root, e, ());
    }
    if sinks.is_empty() {
        return None;
    }

    let doms = dominators::simple_fast(&graph, root);
    let mut common: Option<HashSet<NodeIndex>> = None;
    for &sink in &sinks {
        let chain: HashSet<NodeIndex> = doms.dominators(sink)?.filter(|&n| n != root).collect();
        common = Some(match common {
            None => chain,
            Some(prev) => prev.intersection(&chain).copied().collect(),
        });
    }
    let common = common?;
    if common.is_empty() {
        return None;
    }

    // The chokepoint is the candidate closest to the sinks: the one that is
    // itself dominated by every other candidate.
    let candidates: Vec<NodeIndex> = common.into_iter().collect();
    let best = candidates.iter().copied().find(|&cand| {
        candidates.iter().all(|&other| {
            other == cand || doms.dominators(cand).map(|mut it| it.any(|n| n == other)).unwrap_or(false)
        })
    })?;
    Some(graph[best])
}

/// The frontier at each depth present in `depths`: one chokepoint per
/// connected component of that depth's induced sub-DAG, or (if no unique
/// chokepoint exists for a component) every RescaleC node of that depth.
pub fn compute_frontiers(dag: &ScaledDag, depths: &HashMap<NodeId, u32>) -> BTreeMap<u32, Vec<NodeId>> {
    let mut by_depth: BTreeMap<u32, Vec<NodeId>> = BTreeMap::new();
    for (&id, &d) in depths {
        by_depth.entry(d).or_default().push(id);
    }
    for nodes in by_depth.values_mut() {
        nodes.sort();
    }

    let mut frontiers = BTreeMap::new();
    for (&d, nodes) in &by_depth {
        let member: HashSet<NodeId> = nodes.iter().copied().collect();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut depth_frontier = Vec::new();

        for &start in nodes {
            if visited.contains(&start) {
                continue;
            }
            // Collect the connected component (undirected) of `start` within this depth.
            let mut component = Vec::new();
            let mut stack = vec![start];
            visited.insert(start);
            while let Some(cur) = stack.pop() {
                component.push(cur);
                for neighbor in dag.children(cur).into_iter().chain(dag.parents(cur)) {
                    if member.contains(&neighbor) && visited.insert(neighbor) {
                        stack.push(neighbor);
                    }
                }
            }
            component.sort();

            match chokepoint_of_component(dag, &component) {
                Some(choke) => depth_frontier.push(choke),
                None => {
                    for &id in &component {
                        if is_rescale(dag, id) {
                            depth_frontier.push(id);
                        }
                    }
                }
            }
        }
        depth_frontier.sort();
        depth_frontier.dedup();
        frontiers.insert(d, depth_frontier);
    }
    frontiers
}

/// A shortcut edge: a direct DAG edge whose endpoints sit at non-adjacent
/// depths, meaning the value crosses intervening frontiers without being
/// refreshed at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Shortcut {
    pub from: NodeId,
    pub to: NodeId,
    pub from_depth: u32,
    pub to_depth: u32,
}

/// Every shortcut edge in the DAG, keyed by `(from_depth, to_depth)`.
pub fn compute_shortcuts(dag: &ScaledDag, depths: &HashMap<NodeId, u32>) -> BTreeMap<(u32, u32), Vec<Shortcut>> {
    let mut out: BTreeMap<(u32, u32), Vec<Shortcut>> = BTreeMap::new();
    for id in dag.node_ids() {
        let to_depth = depths[&id];
        for parent in dag.parents(id) {
            let from_depth = depths[&parent];
            if to_depth > from_depth + 1 {
                out.entry((from_depth, to_depth)).or_default().push(Shortcut {
                    from: parent,
                    to: id,
                    from_depth,
                    to_depth,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::default_layout_fill_gaps;
    use crate::shape::Shape;

    fn layout() -> crate::layout::TensorLayout {
        default_layout_fill_gaps(Shape::new(vec![4]).unwrap(), 2).unwrap()
    }

    #[test]
    fn depth_increments_only_across_rescale() {
        let mut dag = ScaledDag::new();
        let x = dag.add_input(ScaledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            log_scale: 20,
        });
        let add = dag
            .add_node(
                ScaledTOp { op: TOp::AddCS { layout: layout(), scalar: 1.0 }, log_scale: 20 },
                vec![x],
                vec![],
            )
            .unwrap();
        let rescale = dag
            .add_node(
                ScaledTOp { op: TOp::RescaleC { ct_log_scale: 20, layout: layout() }, log_scale: 0 },
                vec![add],
                vec![],
            )
            .unwrap();

        let depths = compute_depth(&dag);
        assert_eq!(depths[&x], 0);
        assert_eq!(depths[&add], 0);
        assert_eq!(depths[&rescale], 1);
    }

    #[test]
    fn a_direct_edge_skipping_a_depth_is_reported_as_a_shortcut() {
        let mut dag = ScaledDag::new();
        let x = dag.add_input(ScaledTOp {
            op: TOp::InputC { name: "x".into(), log_scale: 20, output_layout: layout() },
            log_scale: 20,
        });
        let r1 = dag
            .add_node(
                ScaledTOp { op: TOp::RescaleC { ct_log_scale: 20, layout: layout() }, log_scale: 0 },
                vec![x],
                vec![],
            )
            .unwrap();
        let r2 = dag
            .add_node(
                ScaledTOp { op: TOp::RescaleC { ct_log_scale: 20, layout: layout() }, log_scale: 0 },
                vec![r1],
                vec![],
            )
            .unwrap();
        // A direct edge from the depth-0 source straight to the depth-2 node.
        let shortcut_user = dag
            .add_node(
                ScaledTOp { op: TOp::AddCC { layout: layout() }, log_scale: 20 },
                vec![r2, x],
                vec![],
            )
            .unwrap();

        let depths = compute_depth(&dag);
        let shortcuts = compute_shortcuts(&dag, &depths);
        let found = shortcuts.values().flatten().any(|s| s.from == x && s.to == shortcut_user);
        assert!(found);
    }
}
