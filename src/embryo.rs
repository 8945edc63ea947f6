//! The embryo DAG (shape-only tensor ops) and its pre-layout optimisations.

use std::collections::{HashMap, HashSet};

use crate::dag::{Dag, NodeId};
use crate::error::Result;
use crate::top::TOpEmbryo;

pub type EmbryoDag = Dag<TOpEmbryo>;

/// Fold adjacent `StrideC`/`MergedStrideC` chains into a single `MergedStrideC`
/// node per maximal chain. A node is eligible to fold into its child when it has
/// exactly one distinct parent-reference from that child (i.e. the child uses it
/// nowhere else) and the child is itself stride-like.
pub fn merge_strides(dag: &EmbryoDag) -> Result<EmbryoDag> {
    let order = dag.topological_order();

    // A node absorbs into its child iff it is stride-like, has exactly one
    // child, and that child is stride-like and has this node as its sole
    // distinct parent.
    let mut absorbed: HashSet<NodeId> = HashSet::new();
    for &id in &order {
        let Some(value) = dag.value(id) else { continue };
        if value.as_stride().is_none() {
            continue;
        }
        let children = dag.children(id);
        if children.len() != 1 {
            continue;
        }
        let child = children[0];
        let Some(child_value) = dag.value(child) else { continue };
        if child_value.as_stride().is_none() {
            continue;
        }
        let child_parents: HashSet<NodeId> = dag.parents(child).into_iter().collect();
        if child_parents.len() == 1 && child_parents.contains(&id) {
            absorbed.insert(id);
        }
    }

    let mut out = EmbryoDag::new();
    let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();

    for id in order {
        if absorbed.contains(&id) {
            continue;
        }
        let value = dag.value(id).expect("topological id has a value").clone();
        let old_parents = dag.parents(id);

        if let Some(strides) = value.as_stride() {
            // Walk upward through the absorbed chain feeding this node,
            // composing strides as we go.
            let mut composed = strides.to_vec();
            let mut ancestors = vec![id];
            let mut cursor = old_parents.clone();
            while cursor.len() == 1 && absorbed.contains(&cursor[0]) {
                let p = cursor[0];
                let p_strides = dag
                    .value(p)
                    .and_then(|v| v.as_stride())
                    .expect("absorbed node is stride-like by construction");
                for (c, s) in composed.iter_mut().zip(p_strides) {
                    *c = c.checked_mul(*s).expect("stride composition overflow");
                }
                ancestors.push(p);
                cursor = dag.parents(p);
            }
            let new_parents: Vec<NodeId> = cursor.iter().map(|p| old_to_new[p]).collect();
            let merged = TOpEmbryo::MergedStrideC {
                shape: value.shape().clone(),
                strides: composed,
            };
            let new_id = out.add_node(merged, new_parents, ancestors)?;
            old_to_new.insert(id, new_id);
        } else {
            let new_parents: Vec<NodeId> = old_parents.iter().map(|p| old_to_new[p]).collect();
            let new_id = out.add_node(value, new_parents, vec![id])?;
            old_to_new.insert(id, new_id);
        }
    }

    Ok(out)
}

/// "Shower" a `ChetRepackC` node earlier in the graph by duplicating it onto
/// each input of its shape-preserving parent, when the parent has exactly one
/// child (this repack) so there is no risk of showering work other consumers
/// don't want.
pub fn repack_shower(dag: &EmbryoDag) -> Result<EmbryoDag> {
    let mut out = dag.clone_from_ancestor();

    for id in dag.topological_order() {
        let Some(TOpEmbryo::ChetRepackC { shape }) = dag.value(id) else {
            continue;
        };
        let parents = dag.parents(id);
        let [parent] = parents.as_slice() else { continue };
        let Some(parent_value) = dag.value(*parent) else { continue };
        if parent_value.shape() != shape {
            continue; // not shape-preserving; showering would change semantics
        }
        if dag.children(*parent).len() != 1 {
            continue; // parent has other consumers that don't want the repack
        }

        let grandparents = dag.parents(*parent);
        if grandparents.is_empty() {
            continue;
        }

        // Find the corresponding nodes in `out` (clone_from_ancestor preserves
        // the original ids as single-element ancestor lists, one-to-one).
        let find_new = |old: NodeId| -> Option<NodeId> {
            out.node_ids().into_iter().find(|&n| out.ancestors(n) == [old])
        };
        let Some(new_repack_id) = find_new(id) else { continue };
        let Some(new_parent_id) = find_new(*parent) else { continue };

        for &gp in &grandparents {
            let Some(new_gp) = find_new(gp) else { continue };
            let showered = out.add_node_on_edge(new_gp, new_parent_id, TOpEmbryo::ChetRepackC { shape: shape.clone() });
            debug_assert!(showered.is_ok(), "repack shower: edge must exist by construction");
        }
        let _ = new_repack_id; // the original repack is left in place; removal is a later cleanup concern
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    fn stride_chain() -> (EmbryoDag, NodeId) {
        let shape = Shape::new(vec![16]).unwrap();
        let mut dag = EmbryoDag::new();
        let input = dag.add_input(TOpEmbryo::InputC {
            shape: shape.clone(),
            name: "x".into(),
            log_scale: 30,
        });
        let s1 = dag
            .add_node(
                TOpEmbryo::StrideC {
                    shape: Shape::new(vec![8]).unwrap(),
                    strides: vec![2],
                },
                vec![input],
                vec![],
            )
            .unwrap();
        let s2 = dag
            .add_node(
                TOpEmbryo::StrideC {
                    shape: Shape::new(vec![4]).unwrap(),
                    strides: vec![2],
                },
                vec![s1],
                vec![],
            )
            .unwrap();
        (dag, s2)
    }

    #[test]
    fn merge_strides_folds_a_two_node_chain() {
        let (dag, s2) = stride_chain();
        let merged = merge_strides(&dag).unwrap();
        let ids = merged.node_ids();
        // input + one merged stride node = 2 live (non-sentinel) nodes.
        assert_eq!(ids.len(), 2);
        let merged_node = ids
            .iter()
            .copied()
            .find(|&id| matches!(merged.value(id), Some(TOpEmbryo::MergedStrideC { .. })))
            .expect("a merged stride node must exist");
        match merged.value(merged_node).unwrap() {
            TOpEmbryo::MergedStrideC { strides, .. } => assert_eq!(strides, &vec![4]),
            _ => unreachable!(),
        }
        assert!(merged.ancestors(merged_node).contains(&s2));
    }

    #[test]
    fn merge_strides_leaves_unrelated_chains_alone() {
        let shape = Shape::new(vec![4]).unwrap();
        let mut dag = EmbryoDag::new();
        let a = dag.add_input(TOpEmbryo::InputC {
            shape: shape.clone(),
            name: "a".into(),
            log_scale: 20,
        });
        let b = dag.add_input(TOpEmbryo::InputC {
            shape: shape.clone(),
            name: "b".into(),
            log_scale: 20,
        });
        let _sum = dag.add_node(TOpEmbryo::AddCC { shape }, vec![a, b], vec![]).unwrap();
        let merged = merge_strides(&dag).unwrap();
        assert_eq!(merged.len(), dag.len());
    }
}
