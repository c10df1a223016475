//! Replaces a leaf of the main tree with a subtree returned by the trainer.
//!
//! The trainer numbers the units of a job 0..n in the order they were
//! exported. Those local indices are first mapped back to global unit
//! indices, then the subtree is copied node by node into the main arena with
//! its root written into the leaf's own slot. The leaf's parent, its
//! incoming predicate and every other node id stay untouched.

use crate::error::{CartError, Result};
use crate::tree::{Arena, Node, NodeId};

/// Node counts around one splice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub nodes_before: usize,
    pub nodes_added: usize,
    pub nodes_after: usize,
    pub leaves_added: usize,
}

/// Rewrites every leaf index of `subtree` from job-local to global using
/// `local_to_global`.
///
/// # Errors
/// `MalformedTrainerOutput` if a local index is out of range.
pub fn remap_local_indices(subtree: &mut Arena, local_to_global: &[usize], job: usize) -> Result<()> {
    for leaf in subtree.leaves() {
        let Some(members) = subtree.members_mut(leaf) else { continue };
        for index in members.iter_mut() {
            let local = *index;
            *index = *local_to_global.get(local).ok_or_else(|| CartError::MalformedTrainerOutput {
                job,
                reason: format!("local unit index {} out of range for {} units", local, local_to_global.len()),
            })?;
        }
    }
    Ok(())
}

/// Replaces `leaf` in `main` with the already remapped `subtree`.
///
/// # Errors
/// `MalformedTrainerOutput` if `subtree` is empty, if `leaf` is not a leaf,
/// or if the subtree's members are not exactly the leaf's members.
pub fn splice_subtree(main: &mut Arena, leaf: NodeId, subtree: &Arena, job: usize) -> Result<SpliceOutcome> {
    let malformed = |reason: String| CartError::MalformedTrainerOutput { job, reason };
    let Some(root) = subtree.root() else {
        return Err(malformed("trainer returned an empty tree".to_string()));
    };
    let Some(expected) = main.members(leaf) else {
        return Err(malformed(format!("target node {} is not a leaf", leaf)));
    };

    let mut expected = expected.to_vec();
    let mut found = subtree.all_members();
    expected.sort_unstable();
    found.sort_unstable();
    if expected != found {
        return Err(malformed(format!(
            "subtree holds {} units, leaf {} holds {} different or duplicated ones",
            found.len(),
            leaf,
            expected.len()
        )));
    }

    let nodes_before = main.node_count();
    copy_nodes_recursive(subtree, root, main, leaf);
    let nodes_after = main.node_count();
    Ok(SpliceOutcome {
        nodes_before,
        nodes_added: nodes_after - nodes_before,
        nodes_after,
        leaves_added: subtree.leaf_count().saturating_sub(1),
    })
}

/// Copies the subtree rooted at `source` into the slot `target` of `main`.
/// Children get fresh ids at the end of the arena.
fn copy_nodes_recursive(subtree: &Arena, source: NodeId, main: &mut Arena, target: NodeId) {
    match subtree.node(source) {
        Node::Leaf { members } => main.set_node(target, Node::Leaf { members: members.clone() }),
        Node::Decision { feature, branches } => {
            main.set_node(target, Node::Decision { feature: *feature, branches: Vec::new() });
            for branch in branches {
                // Placeholder, overwritten by the recursive call.
                let child = main.add_child(target, branch.predicate, Node::Leaf { members: Vec::new() });
                copy_nodes_recursive(subtree, branch.child, main, child);
            }
        }
    }
}
