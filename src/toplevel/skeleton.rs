//! Skeleton-driven construction.

use crate::error::{CartError, Result};
use crate::features::Corpus;
use crate::tree::Arena;

use super::TopLevelBuilder;

/// Fills a hand-written tree, whose leaves are all empty, with the corpus.
#[derive(Debug, Clone)]
pub struct SkeletonBuilder {
    skeleton: Arena,
}

impl SkeletonBuilder {
    pub fn new(skeleton: Arena) -> Self {
        SkeletonBuilder { skeleton }
    }
}

impl TopLevelBuilder for SkeletonBuilder {
    /// Drops every unit down the skeleton in one pass over the corpus; leaf
    /// members keep corpus order.
    ///
    /// # Errors
    /// `SchemaMismatch` if the skeleton is empty or a unit reaches no leaf.
    fn build(&self, corpus: &Corpus) -> Result<Arena> {
        if self.skeleton.is_empty() {
            return Err(CartError::SchemaMismatch("skeleton tree has no nodes".to_string()));
        }
        let mut arena = self.skeleton.clone();
        for vector in corpus.vectors() {
            let leaf = arena.descend(vector).ok_or_else(|| {
                CartError::SchemaMismatch(format!("unit {} reaches no leaf of the skeleton tree", vector.unit_index()))
            })?;
            if let Some(members) = arena.members_mut(leaf) {
                members.push(vector.unit_index());
            }
        }
        Ok(arena)
    }
}
