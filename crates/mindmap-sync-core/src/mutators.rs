//! Tree mutators shared by local edits and remote-applied operations.
//!
//! Mutators work on a caller-owned working copy of the root node; the copy a
//! reader or an undo history still holds is never touched. All searches are
//! depth-first with children visited in order.

use crate::model::{Node, NodePatch, ROOT_ALIAS};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("The root node cannot be deleted")]
    RootNotDeletable,

    #[error("The root node cannot be moved")]
    RootNotMovable,

    #[error("Moving {node_id} under {new_parent_id} would create a cycle")]
    CycleDetected {
        node_id: String,
        new_parent_id: String,
    },

    #[error("Duplicate node id: {0}")]
    DuplicateId(String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

fn resolve<'a>(root: &'a Node, id: &'a str) -> &'a str {
    if id == ROOT_ALIAS { &root.id } else { id }
}

/// Depth-first search for `node_id`.
pub fn find_node<'a>(root: &'a Node, node_id: &str) -> Option<&'a Node> {
    if root.id == node_id {
        return Some(root);
    }
    root.children
        .iter()
        .find_map(|child| find_node(child, node_id))
}

pub fn find_node_mut<'a>(root: &'a mut Node, node_id: &str) -> Option<&'a mut Node> {
    if root.id == node_id {
        return Some(root);
    }
    root.children
        .iter_mut()
        .find_map(|child| find_node_mut(child, node_id))
}

/// Parent of `node_id`, or `None` for the root and for unknown ids.
pub fn find_parent<'a>(root: &'a Node, node_id: &str) -> Option<&'a Node> {
    if root.children.iter().any(|c| c.id == node_id) {
        return Some(root);
    }
    root.children
        .iter()
        .find_map(|child| find_parent(child, node_id))
}

/// All node ids in depth-first order.
pub fn node_ids(root: &Node) -> Vec<String> {
    let mut ids = Vec::with_capacity(root.subtree_len());
    collect_ids(root, &mut ids);
    ids
}

fn collect_ids(node: &Node, ids: &mut Vec<String>) {
    ids.push(node.id.clone());
    for child in &node.children {
        collect_ids(child, ids);
    }
}

/// Check that no id appears twice in the tree.
pub fn validate(root: &Node) -> Result<()> {
    let mut seen = HashSet::new();
    for id in node_ids(root) {
        if !seen.insert(id.clone()) {
            return Err(TreeError::DuplicateId(id));
        }
    }
    Ok(())
}

/// Append `node` to the children of `parent_id`.
///
/// `"root"` targets the actual root. Returns `Ok(false)` without changing the
/// tree when the parent does not exist.
pub fn insert_node(root: &mut Node, parent_id: &str, node: Node) -> Result<bool> {
    validate(&node)?;
    for id in node_ids(&node) {
        if find_node(root, &id).is_some() {
            return Err(TreeError::DuplicateId(id));
        }
    }

    let parent_id = resolve(root, parent_id).to_string();
    match find_node_mut(root, &parent_id) {
        Some(parent) => {
            parent.children.push(node);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Merge `patch` into the first node matching `node_id`. Returns whether a
/// node was found.
pub fn update_node(root: &mut Node, node_id: &str, patch: &NodePatch) -> bool {
    let node_id = resolve(root, node_id).to_string();
    match find_node_mut(root, &node_id) {
        Some(node) => {
            patch.apply_to(node);
            true
        }
        None => false,
    }
}

/// Remove `node_id` and its subtree, returning the removed subtree.
///
/// Unknown ids are `Ok(None)`; the root is an error.
pub fn delete_node(root: &mut Node, node_id: &str) -> Result<Option<Node>> {
    if node_id == ROOT_ALIAS || node_id == root.id {
        return Err(TreeError::RootNotDeletable);
    }
    Ok(detach(root, node_id))
}

fn detach(node: &mut Node, node_id: &str) -> Option<Node> {
    if let Some(index) = node.children.iter().position(|c| c.id == node_id) {
        return Some(node.children.remove(index));
    }
    node.children
        .iter_mut()
        .find_map(|child| detach(child, node_id))
}

/// Move `node_id` (with its subtree) to the end of `new_parent_id`'s
/// children.
///
/// Returns `Ok(false)` with the tree untouched when either id is unknown.
/// Moving a node under itself or one of its descendants is rejected.
pub fn move_node(root: &mut Node, node_id: &str, new_parent_id: &str) -> Result<bool> {
    if node_id == ROOT_ALIAS || node_id == root.id {
        return Err(TreeError::RootNotMovable);
    }
    let new_parent_id = resolve(root, new_parent_id).to_string();

    let Some(node) = find_node(root, node_id) else {
        return Ok(false);
    };
    if find_node(node, &new_parent_id).is_some() {
        return Err(TreeError::CycleDetected {
            node_id: node_id.to_string(),
            new_parent_id,
        });
    }
    if find_node(root, &new_parent_id).is_none() {
        return Ok(false);
    }

    let Some(subtree) = detach(root, node_id) else {
        return Ok(false);
    };
    match find_node_mut(root, &new_parent_id) {
        Some(parent) => {
            parent.children.push(subtree);
            Ok(true)
        }
        // Checked above; unreachable while the tree is owned here.
        None => Ok(false),
    }
}

/// Rename a node in place. Used when the remote rejects a client-generated
/// id and a replacement has to be adopted.
pub fn replace_node_id(root: &mut Node, old_id: &str, new_id: &str) -> Result<bool> {
    if find_node(root, new_id).is_some() {
        return Err(TreeError::DuplicateId(new_id.to_string()));
    }
    match find_node_mut(root, old_id) {
        Some(node) => {
            node.id = new_id.to_string();
            Ok(true)
        }
        None => Ok(false),
    }
}
