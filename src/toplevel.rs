//! Construction of the top-level tree over the whole corpus.
//!
//! Two interchangeable builders sit behind the `TopLevelBuilder` trait:
//! 1. `SequenceBuilder`: splits the corpus recursively on an ordered list of
//!    discrete features.
//! 2. `SkeletonBuilder`: takes a hand-written tree with empty leaves and
//!    drops every unit into the leaf it reaches.
//!
//! Either way the result partitions the corpus: every unit ends up in
//! exactly one leaf.

mod sequence;
mod skeleton;

pub use sequence::SequenceBuilder;
pub use skeleton::SkeletonBuilder;

use crate::config::{read_feature_sequence, TopLevelSource};
use crate::error::Result;
use crate::features::Corpus;
use crate::tree::Arena;
use crate::wagon::read_skeleton_file;

/// Builds a tree whose leaves partition a corpus.
pub trait TopLevelBuilder {
    fn build(&self, corpus: &Corpus) -> Result<Arena>;
}

/// Resolves a configured source into its builder, reading the feature
/// sequence or skeleton file it names.
pub fn builder_for(source: &TopLevelSource, corpus: &Corpus) -> Result<Box<dyn TopLevelBuilder>> {
    let builder: Box<dyn TopLevelBuilder> = match source {
        TopLevelSource::Sequence { features } => Box::new(SequenceBuilder::new(features.clone())),
        TopLevelSource::SequenceFile { path } => Box::new(SequenceBuilder::new(read_feature_sequence(path)?)),
        TopLevelSource::Skeleton { path } => {
            tracing::info!(path = %path.display(), "reading skeleton tree");
            Box::new(SkeletonBuilder::new(read_skeleton_file(path, corpus.schema())?))
        }
    };
    Ok(builder)
}

/// Builds the top-level tree for `corpus` as configured.
pub fn build_top_level(source: &TopLevelSource, corpus: &Corpus) -> Result<Arena> {
    let arena = builder_for(source, corpus)?.build(corpus)?;
    tracing::info!(nodes = arena.node_count(), leaves = arena.leaf_count(), "built top-level tree");
    Ok(arena)
}
