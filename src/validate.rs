//! Leaf population diagnostics.
//!
//! Reports leaves that hold implausibly few or implausibly many units. The
//! tree is never modified here; the "too big" list is what the refinement
//! pass works on.

use serde::{Deserialize, Serialize};

use crate::features::FeatureSchema;
use crate::tree::{Arena, NodeId};

/// Decision-path pattern under which a small leaf is expected and not
/// reported. Matches when the rendered path contains every fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmallLeafExemption {
    pub all_of: Vec<String>,
}

impl SmallLeafExemption {
    pub fn new(fragments: &[&str]) -> Self {
        SmallLeafExemption { all_of: fragments.iter().map(|f| f.to_string()).collect() }
    }

    /// Edge placeholders, non-segments and contradictory consonant contexts.
    pub fn defaults() -> Vec<Self> {
        vec![
            SmallLeafExemption::new(&["phone==0"]),
            SmallLeafExemption::new(&["vc==0"]),
            SmallLeafExemption::new(&["prev_vc==+", "prev_c"]),
            SmallLeafExemption::new(&["prev_vc==-", "prev_vheight"]),
        ]
    }

    #[inline]
    pub fn matches(&self, path: &str) -> bool {
        !self.all_of.is_empty() && self.all_of.iter().all(|fragment| path.contains(fragment.as_str()))
    }
}

/// A leaf flagged by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafFinding {
    pub leaf: NodeId,
    pub size: usize,
    pub path: String,
}

/// Result of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafReport {
    /// Number of leaves inspected.
    pub leaves: usize,
    pub too_small: Vec<LeafFinding>,
    pub too_big: Vec<LeafFinding>,
}

impl LeafReport {
    pub fn too_big_ids(&self) -> Vec<NodeId> {
        self.too_big.iter().map(|f| f.leaf).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LeafValidator {
    min_size: usize,
    max_size: usize,
    exemptions: Vec<SmallLeafExemption>,
}

impl LeafValidator {
    pub fn new(min_size: usize, max_size: usize, exemptions: Vec<SmallLeafExemption>) -> Self {
        LeafValidator { min_size, max_size, exemptions }
    }

    /// Inspects every leaf, in depth-first branch order.
    ///
    /// A leaf is too small if `size < min_size` and its path matches no
    /// exemption, and too big if `size > max_size`. A leaf that is too small
    /// is never checked for being too big.
    pub fn validate(&self, arena: &Arena, schema: &FeatureSchema) -> LeafReport {
        let mut report = LeafReport::default();
        for leaf in arena.leaves() {
            report.leaves += 1;
            let size = arena.members(leaf).map_or(0, <[usize]>::len);
            if size < self.min_size {
                let path = arena.decision_path(leaf, schema);
                if self.exemptions.iter().any(|e| e.matches(&path)) {
                    continue;
                }
                tracing::warn!(leaf, size, path = %path, "leaf is too small");
                report.too_small.push(LeafFinding { leaf, size, path });
            } else if size > self.max_size {
                let path = arena.decision_path(leaf, schema);
                tracing::warn!(leaf, size, path = %path, "leaf is too big");
                report.too_big.push(LeafFinding { leaf, size, path });
            }
        }
        tracing::info!(
            leaves = report.leaves,
            too_small = report.too_small.len(),
            too_big = report.too_big.len(),
            "validated leaves"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDescriptor;
    use crate::tree::{Node, Predicate, ROOT};

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            FeatureDescriptor::discrete("phone", &["0", "a", "b", "c"]),
            FeatureDescriptor::discrete("prev_vc", &["0", "+", "-"]),
            FeatureDescriptor::discrete("prev_cplace", &["0", "l"]),
        ])
        .unwrap()
    }

    fn leaf(n: usize) -> Node {
        Node::Leaf { members: (0..n).collect() }
    }

    #[test]
    fn test_small_and_big_leaves() {
        let mut arena = Arena::with_decision_root(0);
        arena.add_child(ROOT, Predicate::Is(1), leaf(2));
        arena.add_child(ROOT, Predicate::Is(2), leaf(7));
        arena.add_child(ROOT, Predicate::Is(3), leaf(12));
        arena.add_child(ROOT, Predicate::Is(0), leaf(1));
        let report = LeafValidator::new(5, 10, SmallLeafExemption::defaults()).validate(&arena, &schema());

        assert_eq!(report.leaves, 4);
        assert_eq!(report.too_small, vec![LeafFinding { leaf: 1, size: 2, path: "phone==a".to_string() }]);
        assert_eq!(report.too_big_ids(), vec![3]);
    }

    #[test]
    fn test_exemption_needs_every_fragment() {
        let mut arena = Arena::with_decision_root(1);
        let plus = arena.add_child(ROOT, Predicate::Is(1), Node::Decision { feature: 2, branches: vec![] });
        arena.add_child(plus, Predicate::Is(1), leaf(1));
        arena.add_child(ROOT, Predicate::Is(2), leaf(1));
        let report = LeafValidator::new(5, 100, SmallLeafExemption::defaults()).validate(&arena, &schema());
        // "prev_vc==+ - prev_cplace==l" is exempt, "prev_vc==-" alone is not.
        assert_eq!(report.too_small.len(), 1);
        assert_eq!(report.too_small[0].path, "prev_vc==-");
    }

    #[test]
    fn test_too_small_is_not_checked_for_too_big() {
        let arena = Arena::single_leaf(vec![0, 1]);
        let report = LeafValidator::new(5, 1, Vec::new()).validate(&arena, &schema());
        assert_eq!(report.too_small.len(), 1);
        assert!(report.too_big.is_empty());
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let arena = Arena::single_leaf((0..20).collect());
        let before = arena.all_members();
        LeafValidator::new(5, 10, Vec::new()).validate(&arena, &schema());
        assert_eq!(arena.all_members(), before);
    }
}
