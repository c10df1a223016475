//! Defines the core data structures for the unit-clustering CART: the node
//! sum type (decision vs. leaf), the predicates labelling each branch, and the
//! arena that owns every node and links children to parents by index.
//!
//! Node 0 is always the root. Splicing replaces a leaf *in place* (the leaf's
//! slot becomes the root of the inserted subtree), so ids handed out earlier
//! stay valid and the parent's branch never has to be rewritten.

use std::fmt::Write as _;

use crate::features::{FeatureSchema, FeatureValue, FeatureVector};

/// Type alias for a node identifier within the `Arena`.
pub type NodeId = usize;

/// Id of the root node of every non-empty arena.
pub const ROOT: NodeId = 0;

/// Test attached to one branch of a decision node. A unit follows the first
/// branch whose predicate holds for its value of the node's feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    /// Discrete value equals the given value index.
    Is(u16),
    /// Discrete value differs from the given value index.
    IsNot(u16),
    /// Continuous value is below the threshold.
    Below(f32),
    /// Continuous value is not below the threshold.
    AtLeast(f32),
}

impl Predicate {
    #[inline]
    pub fn holds(&self, value: Option<&FeatureValue>) -> bool {
        match (self, value) {
            (Predicate::Is(v), Some(FeatureValue::Discrete(x))) => x == v,
            (Predicate::IsNot(v), Some(FeatureValue::Discrete(x))) => x != v,
            (Predicate::Below(t), Some(FeatureValue::Continuous(x))) => x < t,
            (Predicate::AtLeast(t), Some(FeatureValue::Continuous(x))) => !(x < t),
            _ => false,
        }
    }

    /// Human-readable form used in decision paths, e.g. `phone==a` or `dur<0.1`.
    pub fn describe(&self, schema: &FeatureSchema, feature: usize) -> String {
        let name = schema.name(feature);
        let value = |v: &u16| schema.value_name(feature, *v).map(str::to_string).unwrap_or_else(|| v.to_string());
        match self {
            Predicate::Is(v) => format!("{}=={}", name, value(v)),
            Predicate::IsNot(v) => format!("{}!={}", name, value(v)),
            Predicate::Below(t) => format!("{}<{}", name, t),
            Predicate::AtLeast(t) => format!("{}>={}", name, t),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub predicate: Predicate,
    pub child: NodeId,
}

/// A tree node: either a decision on one feature or a leaf holding units.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Decision { feature: usize, branches: Vec<Branch> },
    /// Global unit indices of the units clustered in this leaf, in a fixed order.
    Leaf { members: Vec<usize> },
}

/// Arena holding the nodes of one tree plus a parent link per node.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    nodes: Vec<Node>,
    parents: Vec<Option<NodeId>>,
}

impl Arena {
    pub fn new() -> Self {
        Arena::default()
    }

    /// Creates a tree consisting of a single root leaf.
    pub fn single_leaf(members: Vec<usize>) -> Self {
        let mut arena = Arena::new();
        arena.push_node(Node::Leaf { members }, None);
        arena
    }

    /// Creates a tree whose root is a decision node without branches yet.
    pub fn with_decision_root(feature: usize) -> Self {
        let mut arena = Arena::new();
        arena.push_node(Node::Decision { feature, branches: Vec::new() }, None);
        arena
    }

    /// Appends `node` as a new child of the decision node `parent`, reached
    /// through `predicate`.
    ///
    /// # Panics
    /// Panics if `parent` is out of bounds or is a leaf.
    pub fn add_child(&mut self, parent: NodeId, predicate: Predicate, node: Node) -> NodeId {
        let id = self.push_node(node, Some(parent));
        match &mut self.nodes[parent] {
            Node::Decision { branches, .. } => branches.push(Branch { predicate, child: id }),
            Node::Leaf { .. } => panic!("add_child called on leaf node {}", parent),
        }
        id
    }

    pub(crate) fn push_node(&mut self, node: Node, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.parents.push(parent);
        id
    }

    pub(crate) fn set_node(&mut self, id: NodeId, node: Node) {
        self.nodes[id] = node;
    }

    pub(crate) fn members_mut(&mut self, id: NodeId) -> Option<&mut Vec<usize>> {
        match &mut self.nodes[id] {
            Node::Leaf { members } => Some(members),
            Node::Decision { .. } => None,
        }
    }

    // --- Accessors ---

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() { None } else { Some(ROOT) }
    }

    /// # Panics
    /// Panics if the `id` is out of bounds.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    #[inline]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents[id]
    }

    /// Members of a leaf, `None` for decision nodes.
    pub fn members(&self, id: NodeId) -> Option<&[usize]> {
        match &self.nodes[id] {
            Node::Leaf { members } => Some(members),
            Node::Decision { .. } => None,
        }
    }

    /// Branches of a decision node, empty for leaves.
    pub fn branches(&self, id: NodeId) -> &[Branch] {
        match &self.nodes[id] {
            Node::Decision { branches, .. } => branches,
            Node::Leaf { .. } => &[],
        }
    }

    pub fn depth(&self, mut id: NodeId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.parents[id] {
            id = parent;
            depth += 1;
        }
        depth
    }

    /// Number of nodes stored in the arena. Every stored node is reachable.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    /// Leaves reachable from the root, depth-first in branch order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let Some(root) = self.root() else { return leaves };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id] {
                Node::Leaf { .. } => leaves.push(id),
                // Reverse so the first branch is visited first.
                Node::Decision { branches, .. } => stack.extend(branches.iter().rev().map(|b| b.child)),
            }
        }
        leaves
    }

    /// Height of the tree (a single leaf has height 0).
    pub fn height(&self) -> usize {
        self.leaves().into_iter().map(|leaf| self.depth(leaf)).max().unwrap_or(0)
    }

    /// Concatenation of all leaf members in leaf order.
    pub fn all_members(&self) -> Vec<usize> {
        self.leaves().into_iter().flat_map(|leaf| self.members(leaf).unwrap_or(&[]).iter().copied()).collect()
    }

    /// The predicate on the branch leading from `id`'s parent to `id`.
    pub fn incoming(&self, id: NodeId) -> Option<(usize, Predicate)> {
        let parent = self.parents[id]?;
        match &self.nodes[parent] {
            Node::Decision { feature, branches } => {
                branches.iter().find(|b| b.child == id).map(|b| (*feature, b.predicate))
            }
            Node::Leaf { .. } => None,
        }
    }

    /// Trace of predicates from the root to `id`, joined by ` - `.
    /// The root itself has an empty path.
    pub fn decision_path(&self, id: NodeId, schema: &FeatureSchema) -> String {
        let mut steps = Vec::new();
        let mut current = id;
        while let Some((feature, predicate)) = self.incoming(current) {
            steps.push(predicate.describe(schema, feature));
            current = self.parents[current].unwrap_or(ROOT);
        }
        steps.reverse();
        steps.join(" - ")
    }

    /// Walks the tree with `vector` and returns the leaf it reaches, or `None`
    /// if some decision node has no branch whose predicate holds.
    pub fn descend(&self, vector: &FeatureVector) -> Option<NodeId> {
        let mut id = self.root()?;
        loop {
            match &self.nodes[id] {
                Node::Leaf { .. } => return Some(id),
                Node::Decision { feature, branches } => {
                    let value = vector.value(*feature);
                    id = branches.iter().find(|b| b.predicate.holds(value))?.child;
                }
            }
        }
    }
}

/// Renders the tree structure, one node per line.
pub fn format_tree(arena: &Arena, schema: &FeatureSchema) -> String {
    let mut out = String::new();
    if let Some(root) = arena.root() {
        format_node_recursive(arena, schema, root, "", &mut out);
    }
    out
}

fn format_node_recursive(arena: &Arena, schema: &FeatureSchema, id: NodeId, prefix: &str, out: &mut String) {
    match arena.node(id) {
        Node::Leaf { members } => {
            let _ = writeln!(out, "{}Leaf({} units) [ID: {}]", prefix, members.len(), id);
        }
        Node::Decision { feature, branches } => {
            let _ = writeln!(out, "{}Node({}) [ID: {}]", prefix, schema.name(*feature), id);
            for (i, branch) in branches.iter().enumerate() {
                // Use backtick for the last child
                let connector = if i + 1 == branches.len() { "`--" } else { "|--" };
                let child_prefix = format!("{}  {} {}: ", prefix, connector, branch.predicate.describe(schema, *feature));
                format_node_recursive(arena, schema, branch.child, &child_prefix, out);
            }
        }
    }
}
