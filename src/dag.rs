//! The shared-node DAG that every IR level in this crate is built from.
//!
//! Nodes live in an arena owned by the [`Dag`] rather than behind `Rc`/`Weak`
//! (see the design notes on strategy (b) for shared DAG nodes): every node has a
//! stable, monotonically increasing [`NodeId`], parent/child adjacency is kept as
//! plain id lists, and there is a single sentinel id (`NodeId(0)`) that owns every
//! source node as a child and itself has no parent.

use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;

use crate::error::{LowerError, Result};

/// A stable identifier for a node within a single [`Dag`]. Ids are assigned in
/// increasing order and never reused, even across `remove_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    /// The id of the sentinel node every [`Dag`] is rooted at.
    pub const SENTINEL: NodeId = NodeId(0);
}

#[derive(Debug, Clone)]
struct NodeSlot<T> {
    id: NodeId,
    value: Option<T>,
    /// Operand-order parent list; duplicates preserved (e.g. `x * x`).
    parents: Vec<NodeId>,
    /// Deterministic child set (no multiplicity needed: children are a set of
    /// node ids that must be revisited, not operand positions).
    children: BTreeSet<NodeId>,
    /// Ids of the nodes in the previous pass that produced this node.
    ancestors: Vec<NodeId>,
}

/// A mutable-until-committed DAG of `T` payloads, indexed by [`NodeId`].
///
/// A `Dag` owns every node reachable from its sentinel. Passes are expected to
/// build a fresh `Dag` (typically via [`Dag::clone_from_ancestor`]) rather than
/// mutate their input in place, though in-place restructuring primitives are
/// provided for optimiser passes that genuinely need them (hoisting, pruning).
#[derive(Debug, Clone)]
pub struct Dag<T> {
    nodes: HashMap<NodeId, NodeSlot<T>>,
    next_id: u32,
}

impl<T> Default for Dag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dag<T> {
    /// Create an empty DAG containing only the sentinel.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::SENTINEL,
            NodeSlot {
                id: NodeId::SENTINEL,
                value: None,
                parents: Vec::new(),
                children: BTreeSet::new(),
                ancestors: Vec::new(),
            },
        );
        Dag { nodes, next_id: 1 }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Attach a new source node as a child of the sentinel.
    pub fn add_input(&mut self, value: T) -> NodeId {
        self.add_input_with_ancestors(value, Vec::new())
    }

    /// Like [`Dag::add_input`], additionally recording provenance.
    pub fn add_input_with_ancestors(&mut self, value: T, ancestors: Vec<NodeId>) -> NodeId {
        let id = self.fresh_id();
        self.nodes.insert(
            id,
            NodeSlot {
                id,
                value: Some(value),
                parents: vec![NodeId::SENTINEL],
                children: BTreeSet::new(),
                ancestors,
            },
        );
        self.nodes
            .get_mut(&NodeId::SENTINEL)
            .expect("sentinel always present")
            .children
            .insert(id);
        id
    }

    /// Create a new node. If `parents` is empty this is equivalent to
    /// [`Dag::add_input_with_ancestors`]; otherwise the new node's parent list is
    /// exactly `parents`, in operand order, with duplicates preserved.
    pub fn add_node(&mut self, value: T, parents: Vec<NodeId>, ancestors: Vec<NodeId>) -> Result<NodeId> {
        if parents.is_empty() {
            return Ok(self.add_input_with_ancestors(value, ancestors));
        }
        for p in &parents {
            if !self.nodes.contains_key(p) {
                return Err(LowerError::structural(
                    "dag::add_node",
                    [*p],
                    "parent does not exist in this dag",
                ));
            }
        }
        let id = self.fresh_id();
        let distinct: BTreeSet<NodeId> = parents.iter().copied().collect();
        self.nodes.insert(
            id,
            NodeSlot {
                id,
                value: Some(value),
                parents,
                children: BTreeSet::new(),
                ancestors,
            },
        );
        for p in distinct {
            self.nodes.get_mut(&p).expect("checked above").children.insert(id);
        }
        Ok(id)
    }

    /// Like [`Dag::add_node`], but the caller supplies the exact id to use
    /// instead of drawing a fresh one, bumping the id generator past it. Used
    /// by deserializers restoring a dump that named its nodes by their
    /// original ids, so that reading back a serialised DAG reproduces the
    /// same `NodeId`s rather than a structurally-isomorphic relabelling.
    pub fn add_node_with_id(&mut self, id: NodeId, value: T, parents: Vec<NodeId>, ancestors: Vec<NodeId>) -> Result<NodeId> {
        if id == NodeId::SENTINEL || self.nodes.contains_key(&id) {
            return Err(LowerError::structural("dag::add_node_with_id", [id], "id already in use"));
        }
        let actual_parents = if parents.is_empty() { vec![NodeId::SENTINEL] } else { parents };
        for p in &actual_parents {
            if !self.nodes.contains_key(p) {
                return Err(LowerError::structural(
                    "dag::add_node_with_id",
                    [*p],
                    "parent does not exist in this dag",
                ));
            }
        }
        let distinct: BTreeSet<NodeId> = actual_parents.iter().copied().collect();
        self.nodes.insert(
            id,
            NodeSlot {
                id,
                value: Some(value),
                parents: actual_parents,
                children: BTreeSet::new(),
                ancestors,
            },
        );
        for p in distinct {
            self.nodes.get_mut(&p).expect("checked above").children.insert(id);
        }
        self.next_id = self.next_id.max(id.0 + 1);
        Ok(id)
    }

    /// Number of live nodes, including the sentinel.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if only the sentinel remains.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Whether `id` currently names a live node (sentinel included).
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Borrow a node's payload. Returns `None` for the sentinel or an id that
    /// does not exist.
    pub fn value(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(&id).and_then(|n| n.value.as_ref())
    }

    /// Mutably borrow a node's payload.
    pub fn value_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(&id).and_then(|n| n.value.as_mut())
    }

    /// Replace a node's payload in place (used by speculative overlays and
    /// in-place optimisers such as level minimisation).
    pub fn set_value(&mut self, id: NodeId, value: T) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| LowerError::structural("dag::set_value", [id], "node does not exist"))?;
        if slot.value.is_none() {
            return Err(LowerError::structural("dag::set_value", [id], "cannot set sentinel's value"));
        }
        slot.value = Some(value);
        Ok(())
    }

    /// Operand-ordered parent list (duplicates preserved). Empty for the sentinel
    /// and for source nodes (whose sole parent, the sentinel, is never exposed).
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|n| {
                n.parents
                    .iter()
                    .copied()
                    .filter(|&p| p != NodeId::SENTINEL)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The distinct set of children of `id`.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|n| n.children.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Provenance: the ids of the nodes in the previous pass that produced `id`.
    pub fn ancestors(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(&id).map(|n| n.ancestors.as_slice()).unwrap_or(&[])
    }

    /// Every live node id except the sentinel, in unspecified order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().filter(|&id| id != NodeId::SENTINEL).collect()
    }

    /// A sequence starting after the sentinel such that every node appears
    /// strictly after all of its parents. Ties are broken by smallest id first.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        for (&id, slot) in &self.nodes {
            if id == NodeId::SENTINEL {
                continue;
            }
            remaining.insert(id, slot.parents.iter().filter(|&&p| p != NodeId::SENTINEL).count());
        }

        let mut ready: BinaryHeap<std::cmp::Reverse<NodeId>> = BinaryHeap::new();
        for (&id, &pending) in &remaining {
            if pending == 0 {
                ready.push(std::cmp::Reverse(id));
            }
        }

        let mut order = Vec::with_capacity(remaining.len());
        while let Some(std::cmp::Reverse(id)) = ready.pop() {
            order.push(id);
            for child in self.nodes[&id].children.iter().copied() {
                let occurrences = self.nodes[&child].parents.iter().filter(|&&p| p == id).count();
                if let Some(count) = remaining.get_mut(&child) {
                    *count = count.saturating_sub(occurrences);
                    if *count == 0 {
                        ready.push(std::cmp::Reverse(child));
                    }
                }
            }
        }

        debug_assert_eq!(
            order.len(),
            remaining.len(),
            "topological_order visited a different node count than exists; the dag has a cycle"
        );

        order
    }

    /// The reverse of [`Dag::topological_order`].
    pub fn reverse_topological_order(&self) -> Vec<NodeId> {
        let mut order = self.topological_order();
        order.reverse();
        order
    }

    /// Remove `id`, which must have exactly one *distinct* parent `p`. Every
    /// child of `id` has `p` substituted for `id` (multiplicity in the child's
    /// parent list is preserved), and the edge `p -> id` is removed.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let distinct_parents: BTreeSet<NodeId> = self
            .nodes
            .get(&id)
            .ok_or_else(|| LowerError::structural("dag::remove_node", [id], "node does not exist"))?
            .parents
            .iter()
            .copied()
            .collect();
        if distinct_parents.len() != 1 {
            return Err(LowerError::structural(
                "dag::remove_node",
                [id],
                format!("node has {} distinct parents, expected exactly 1", distinct_parents.len()),
            ));
        }
        let p = *distinct_parents.iter().next().unwrap();
        let children: Vec<NodeId> = self.nodes[&id].children.iter().copied().collect();

        for child in &children {
            let slot = self.nodes.get_mut(child).expect("child must exist");
            for parent_ref in slot.parents.iter_mut() {
                if *parent_ref == id {
                    *parent_ref = p;
                }
            }
        }

        {
            let p_slot = self.nodes.get_mut(&p).expect("parent must exist");
            p_slot.children.remove(&id);
            for child in &children {
                p_slot.children.insert(*child);
            }
        }

        self.nodes.remove(&id);
        Ok(())
    }

    /// Insert `new_value` as a fresh node between `p` and `c`, replacing every
    /// occurrence of `p` in `c`'s parent list with the new node.
    pub fn add_node_on_edge(&mut self, p: NodeId, c: NodeId, new_value: T) -> Result<NodeId> {
        if !self.nodes.get(&c).map(|s| s.parents.contains(&p)).unwrap_or(false) {
            return Err(LowerError::structural(
                "dag::add_node_on_edge",
                [p, c],
                "no edge from p to c",
            ));
        }
        let new_id = self.fresh_id();
        self.nodes.insert(
            new_id,
            NodeSlot {
                id: new_id,
                value: Some(new_value),
                parents: vec![p],
                children: BTreeSet::new(),
                ancestors: Vec::new(),
            },
        );

        let slot = self.nodes.get_mut(&c).expect("checked above");
        for parent_ref in slot.parents.iter_mut() {
            if *parent_ref == p {
                *parent_ref = new_id;
            }
        }
        self.nodes.get_mut(&new_id).unwrap().children.insert(c);

        let p_slot = self.nodes.get_mut(&p).expect("checked above");
        if !self.nodes[&c].parents.contains(&p) {
            p_slot.children.remove(&c);
        }
        p_slot.children.insert(new_id);

        Ok(new_id)
    }

    /// Swap the positions of `p` and its sole child `c`. Precondition: `p` has
    /// exactly one distinct parent and `c` is its only child; `c` has `p` as its
    /// only distinct parent. After the swap, `c` occupies `p`'s old position and
    /// `p` becomes `c`'s sole child.
    pub fn swap_parent_and_child(&mut self, p: NodeId, c: NodeId) -> Result<()> {
        {
            let p_slot = self
                .nodes
                .get(&p)
                .ok_or_else(|| LowerError::structural("dag::swap_parent_and_child", [p], "p does not exist"))?;
            if p_slot.children.len() != 1 || !p_slot.children.contains(&c) {
                return Err(LowerError::structural(
                    "dag::swap_parent_and_child",
                    [p, c],
                    "p must have c as its sole child",
                ));
            }
            let p_distinct: BTreeSet<NodeId> = p_slot.parents.iter().copied().collect();
            if p_distinct.len() != 1 {
                return Err(LowerError::structural(
                    "dag::swap_parent_and_child",
                    [p],
                    "p must have exactly one distinct parent",
                ));
            }
            let c_slot = self
                .nodes
                .get(&c)
                .ok_or_else(|| LowerError::structural("dag::swap_parent_and_child", [c], "c does not exist"))?;
            let c_distinct: BTreeSet<NodeId> = c_slot.parents.iter().copied().collect();
            if c_distinct.len() != 1 || !c_distinct.contains(&p) {
                return Err(LowerError::structural(
                    "dag::swap_parent_and_child",
                    [p, c],
                    "c must have p as its sole distinct parent",
                ));
            }
        }

        let p_parents = self.nodes[&p].parents.clone();
        let c_children: Vec<NodeId> = self.nodes[&c].children.iter().copied().collect();

        for gp in p_parents.iter().copied().collect::<BTreeSet<_>>() {
            if gp != NodeId::SENTINEL {
                let gp_slot = self.nodes.get_mut(&gp).expect("grandparent must exist");
                gp_slot.children.remove(&p);
                gp_slot.children.insert(c);
            } else {
                self.nodes
                    .get_mut(&NodeId::SENTINEL)
                    .unwrap()
                    .children
                    .remove(&p);
                self.nodes.get_mut(&NodeId::SENTINEL).unwrap().children.insert(c);
            }
        }
        for cc in &c_children {
            let slot = self.nodes.get_mut(cc).expect("c's child must exist");
            for parent_ref in slot.parents.iter_mut() {
                if *parent_ref == c {
                    *parent_ref = p;
                }
            }
        }

        {
            let c_slot = self.nodes.get_mut(&c).unwrap();
            c_slot.parents = p_parents;
            c_slot.children = [p].into_iter().collect();
        }
        {
            let p_slot = self.nodes.get_mut(&p).unwrap();
            p_slot.parents = vec![c];
            p_slot.children = c_children.into_iter().collect();
        }

        Ok(())
    }

    /// Merge `duplicate` into `survivor`: every child of `duplicate` has
    /// `duplicate` replaced by `survivor` in its parent list (multiplicity
    /// preserved), `survivor` inherits the union of both nodes' ancestor ids,
    /// and `duplicate` is deleted. Unlike [`Dag::remove_node`], this has no
    /// single-parent precondition — it is the primitive the value-numbering
    /// pass uses to collapse sibling nodes that may each have several parents.
    pub fn merge_duplicate(&mut self, survivor: NodeId, duplicate: NodeId) -> Result<()> {
        if survivor == duplicate {
            return Ok(());
        }
        if !self.nodes.contains_key(&survivor) {
            return Err(LowerError::structural("dag::merge_duplicate", [survivor], "survivor does not exist"));
        }
        let dup_slot = self
            .nodes
            .remove(&duplicate)
            .ok_or_else(|| LowerError::structural("dag::merge_duplicate", [duplicate], "duplicate does not exist"))?;

        for parent in dup_slot.parents.iter().copied().collect::<BTreeSet<_>>() {
            if let Some(p_slot) = self.nodes.get_mut(&parent) {
                p_slot.children.remove(&duplicate);
            }
        }

        for child in &dup_slot.children {
            let slot = self.nodes.get_mut(child).expect("child must exist");
            for parent_ref in slot.parents.iter_mut() {
                if *parent_ref == duplicate {
                    *parent_ref = survivor;
                }
            }
        }

        let survivor_slot = self.nodes.get_mut(&survivor).expect("checked above");
        for child in dup_slot.children {
            survivor_slot.children.insert(child);
        }
        for ancestor in dup_slot.ancestors {
            if !survivor_slot.ancestors.contains(&ancestor) {
                survivor_slot.ancestors.push(ancestor);
            }
        }

        Ok(())
    }

    /// Produce an isomorphic DAG with fresh ids where `T: Clone`; every new node
    /// carries a single ancestor id equal to the original node's id. This is the
    /// canonical entry point for a pass that wants to mutate without disturbing
    /// its input.
    pub fn clone_from_ancestor(&self) -> Dag<T>
    where
        T: Clone,
    {
        let mut out = Dag::new();
        let mut old_to_new: HashMap<NodeId, NodeId> = HashMap::new();
        old_to_new.insert(NodeId::SENTINEL, NodeId::SENTINEL);

        for old_id in self.topological_order() {
            let old_slot = &self.nodes[&old_id];
            let new_parents: Vec<NodeId> = old_slot
                .parents
                .iter()
                .filter(|&&p| p != NodeId::SENTINEL)
                .map(|p| old_to_new[p])
                .collect();
            let value = old_slot.value.clone().expect("non-sentinel node has a value");
            let new_id = out
                .add_node(value, new_parents, vec![old_id])
                .expect("clone_from_ancestor: freshly built parent list is always valid");
            old_to_new.insert(old_id, new_id);
        }

        out
    }

    /// Iterate all live (non-sentinel) node ids together with a reference to
    /// their payload, in topological order.
    pub fn iter_topological(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.topological_order()
            .into_iter()
            .map(move |id| (id, self.value(id).expect("topological id always has a value")))
    }
}
