//! Sequence-driven construction: one multi-way split per feature, in the
//! order given, with one branch per value actually present.

use crate::error::{CartError, Result};
use crate::features::{Corpus, FeatureSchema, FeatureVector};
use crate::tree::{Arena, Node, NodeId, Predicate, ROOT};

use super::TopLevelBuilder;

#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    features: Vec<String>,
}

impl SequenceBuilder {
    pub fn new(features: Vec<String>) -> Self {
        SequenceBuilder { features }
    }

    /// Maps feature names to indices; only discrete features can split.
    fn resolve(&self, schema: &FeatureSchema) -> Result<Vec<usize>> {
        self.features
            .iter()
            .map(|name| {
                let feature = schema.require(name)?;
                if !schema.is_discrete(feature) {
                    return Err(CartError::SchemaMismatch(format!(
                        "continuous feature '{}' cannot be used in a feature sequence",
                        name
                    )));
                }
                Ok(feature)
            })
            .collect()
    }
}

impl TopLevelBuilder for SequenceBuilder {
    /// Builds the tree. Branches of a node follow ascending value index and
    /// leaf members keep corpus order, so the result is identical on every
    /// run. An empty sequence gives a single leaf holding every unit; an
    /// empty corpus gives a root decision without branches, as no value
    /// combination occurs.
    fn build(&self, corpus: &Corpus) -> Result<Arena> {
        let features = self.resolve(corpus.schema())?;
        let members: Vec<&FeatureVector> = corpus.vectors().iter().collect();

        let Some((&first, rest)) = features.split_first() else {
            return Ok(Arena::single_leaf(unit_indices(&members)));
        };
        let mut arena = Arena::with_decision_root(first);
        if members.is_empty() {
            return Ok(arena);
        }
        split_recursive(&mut arena, corpus.schema(), ROOT, first, &members, rest);
        Ok(arena)
    }
}

fn unit_indices(members: &[&FeatureVector]) -> Vec<usize> {
    members.iter().map(|v| v.unit_index()).collect()
}

/// Groups `members` by their value of `feature`, in ascending value order.
/// Empty groups are dropped.
fn group_by_value<'c>(
    schema: &FeatureSchema,
    feature: usize,
    members: &[&'c FeatureVector],
) -> Vec<(u16, Vec<&'c FeatureVector>)> {
    let mut buckets: Vec<Vec<&'c FeatureVector>> = vec![Vec::new(); schema.num_values(feature)];
    for &vector in members {
        if let Some(bucket) = vector.discrete(feature).and_then(|v| buckets.get_mut(v as usize)) {
            bucket.push(vector);
        }
    }
    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, group)| !group.is_empty())
        .map(|(value, group)| (value as u16, group))
        .collect()
}

fn split_recursive(
    arena: &mut Arena,
    schema: &FeatureSchema,
    node: NodeId,
    feature: usize,
    members: &[&FeatureVector],
    rest: &[usize],
) {
    for (value, group) in group_by_value(schema, feature, members) {
        match rest.split_first() {
            None => {
                arena.add_child(node, Predicate::Is(value), Node::Leaf { members: unit_indices(&group) });
            }
            Some((&next, tail)) => {
                let child = arena.add_child(node, Predicate::Is(value), Node::Decision { feature: next, branches: Vec::new() });
                split_recursive(arena, schema, child, next, &group, tail);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureDescriptor, FeatureValue};

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![
            FeatureDescriptor::discrete("phone", &["0", "a", "b", "c"]),
            FeatureDescriptor::discrete("vc", &["0", "+", "-"]),
            FeatureDescriptor::continuous("unit_duration"),
        ])
        .unwrap()
    }

    fn corpus(rows: &[(usize, u16, u16)]) -> Corpus {
        let vectors = rows
            .iter()
            .map(|&(idx, phone, vc)| {
                FeatureVector::new(idx, vec![FeatureValue::Discrete(phone), FeatureValue::Discrete(vc), FeatureValue::Continuous(0.1)])
            })
            .collect();
        Corpus::new(schema(), vectors).unwrap()
    }

    fn build(features: &[&str], corpus: &Corpus) -> Result<Arena> {
        SequenceBuilder::new(features.iter().map(|f| f.to_string()).collect()).build(corpus)
    }

    #[test]
    fn test_two_phone_leaves() {
        let c = corpus(&[(0, 1, 0), (1, 1, 0), (2, 2, 0), (3, 2, 0), (4, 2, 0), (5, 2, 0)]);
        let arena = build(&["phone"], &c).unwrap();
        let leaves = arena.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(arena.members(leaves[0]), Some(&[0, 1][..]));
        assert_eq!(arena.members(leaves[1]), Some(&[2, 3, 4, 5][..]));
        assert_eq!(arena.decision_path(leaves[0], c.schema()), "phone==a");
        assert_eq!(arena.decision_path(leaves[1], c.schema()), "phone==b");
    }

    #[test]
    fn test_nested_sequence_partitions_corpus() {
        let rows = [(10, 3, 1), (11, 1, 2), (12, 3, 2), (13, 1, 2), (14, 3, 1), (15, 0, 0)];
        let c = corpus(&rows);
        let arena = build(&["phone", "vc"], &c).unwrap();
        let paths: Vec<String> = arena.leaves().iter().map(|&l| arena.decision_path(l, c.schema())).collect();
        assert_eq!(paths, vec!["phone==0 - vc==0", "phone==a - vc==-", "phone==c - vc==+", "phone==c - vc==-"]);

        let mut all = arena.all_members();
        all.sort_unstable();
        assert_eq!(all, vec![10, 11, 12, 13, 14, 15]);
        // Corpus order inside a leaf.
        assert_eq!(arena.members(arena.leaves()[1]), Some(&[11, 13][..]));
    }

    #[test]
    fn test_deterministic() {
        let c = corpus(&[(5, 2, 1), (1, 1, 2), (3, 2, 1), (0, 1, 1)]);
        let a = build(&["phone", "vc"], &c).unwrap();
        let b = build(&["phone", "vc"], &c).unwrap();
        assert_eq!(a.all_members(), b.all_members());
        assert_eq!(a.leaves(), b.leaves());
    }

    #[test]
    fn test_degenerate_inputs() {
        let c = corpus(&[(0, 1, 1), (1, 2, 2)]);
        let no_features = build(&[], &c).unwrap();
        assert_eq!(no_features.node_count(), 1);
        assert_eq!(no_features.all_members(), vec![0, 1]);

        let empty = build(&["phone"], &corpus(&[])).unwrap();
        assert_eq!(empty.node_count(), 1);
        assert_eq!(empty.leaf_count(), 0);
        assert!(empty.leaves().is_empty());
        assert!(empty.branches(ROOT).is_empty());
    }

    #[test]
    fn test_bad_features_rejected() {
        let c = corpus(&[(0, 1, 1)]);
        assert!(matches!(build(&["stress"], &c), Err(CartError::SchemaMismatch(_))));
        assert!(matches!(build(&["phone", "unit_duration"], &c), Err(CartError::SchemaMismatch(_))));
    }
}
