//! Interchange with the external wagon CART trainer.
//!
//! The trainer reads a feature description, a feature dump and a distance
//! matrix for one leaf, and writes back a tree in a line-oriented bracketed
//! format. The same tree format is used for hand-written skeleton trees.

mod export;
mod reader;

pub use export::{write_description, write_distance_matrix, write_feature_vectors};
pub use reader::{parse_tree, LeafContent, ParseError};

use std::fs;
use std::path::Path;

use crate::error::{CartError, Result};
use crate::features::FeatureSchema;
use crate::tree::Arena;

/// Parses a skeleton tree. Skeleton leaves must be empty.
///
/// # Errors
/// Unknown features or values are a `SchemaMismatch`; any other problem with
/// the text is a `MalformedSkeleton`.
pub fn read_skeleton(text: &str, schema: &FeatureSchema) -> Result<Arena> {
    parse_tree(text, schema, LeafContent::Empty).map_err(|e| match e {
        ParseError::Syntax { line, reason } => CartError::MalformedSkeleton { line, reason },
        other => CartError::SchemaMismatch(other.to_string()),
    })
}

pub fn read_skeleton_file(path: &Path, schema: &FeatureSchema) -> Result<Arena> {
    let text = fs::read_to_string(path)?;
    read_skeleton(&text, schema)
}

/// Parses the tree the trainer wrote for job `job`. Leaves hold job-local
/// unit indices.
///
/// # Errors
/// Every parse failure is a `MalformedTrainerOutput` for `job`.
pub fn read_trainer_tree(text: &str, schema: &FeatureSchema, job: usize) -> Result<Arena> {
    parse_tree(text, schema, LeafContent::Indices)
        .map_err(|e| CartError::MalformedTrainerOutput { job, reason: e.to_string() })
}

pub fn read_trainer_tree_file(path: &Path, schema: &FeatureSchema, job: usize) -> Result<Arena> {
    let text = fs::read_to_string(path).map_err(|e| CartError::MalformedTrainerOutput {
        job,
        reason: format!("cannot read {}: {}", path.display(), e),
    })?;
    read_trainer_tree(&text, schema, job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDescriptor;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(vec![FeatureDescriptor::discrete("phone", &["0", "a", "b"])]).unwrap()
    }

    #[test]
    fn test_skeleton_errors_are_classified() {
        let unknown = read_skeleton("((vowel is a)\n((() 0))\n((() 0)))\n", &schema());
        assert!(matches!(unknown, Err(CartError::SchemaMismatch(_))));

        let unbalanced = read_skeleton("((phone is a)\n((() 0))\n", &schema());
        assert!(matches!(unbalanced, Err(CartError::MalformedSkeleton { .. })));

        let filled = read_skeleton("((((1 0) (2 0)) 0))\n", &schema());
        assert!(matches!(filled, Err(CartError::MalformedSkeleton { line: 1, .. })));
    }

    #[test]
    fn test_trainer_errors_carry_job() {
        let err = read_trainer_tree("((phone foo a)\n", &schema(), 7).unwrap_err();
        assert_eq!(err.job(), Some(7));
        assert!(matches!(err, CartError::MalformedTrainerOutput { .. }));
    }

    #[test]
    fn test_missing_trainer_output_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_trainer_tree_file(&dir.path().join("wagon.cart3"), &schema(), 3).unwrap_err();
        assert!(matches!(err, CartError::MalformedTrainerOutput { job: 3, .. }));
    }
}
