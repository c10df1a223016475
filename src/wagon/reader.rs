//! Reader for the bracketed tree format.
//!
//! One node per line, in depth-first order:
//!
//! ```text
//! ;; comment
//! ((phone is a)
//! ((((0 0.1) (3 0.2)) 0.15))
//! ((unit_duration < 0.12)
//! ((((1 0)) 0))
//! ((() 0))))
//! ```
//!
//! A decision line opens a node; every `)` after the leaf's own two closes the
//! innermost open decision node.

use thiserror::Error;

use crate::features::FeatureSchema;
use crate::tree::{Arena, Node, NodeId, Predicate};

/// What the leaves of a parsed tree may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafContent {
    /// Leaves must be empty (skeleton trees).
    Empty,
    /// Leaves list unit indices with scores.
    Indices,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("line {line}: unknown feature '{feature}'")]
    UnknownFeature { line: usize, feature: String },

    #[error("line {line}: feature '{feature}' has no value '{value}'")]
    UnknownValue { line: usize, feature: String, value: String },

    #[error("line {line}: operator '{op}' does not apply to feature '{feature}'")]
    Incompatible { line: usize, feature: String, op: String },
}

fn syntax(line: usize, reason: impl Into<String>) -> ParseError {
    ParseError::Syntax { line, reason: reason.into() }
}

#[derive(Debug, Clone, Copy)]
enum Split {
    /// Two daughters: predicate holds, predicate fails.
    Binary { yes: Predicate, no: Predicate },
    /// Daughter `k` is taken for value index `k`.
    Multi { arity: usize },
}

impl Split {
    fn arity(&self) -> usize {
        match self {
            Split::Binary { .. } => 2,
            Split::Multi { arity } => *arity,
        }
    }

    fn predicate(&self, daughter: usize) -> Predicate {
        match self {
            Split::Binary { yes, no } => {
                if daughter == 0 { *yes } else { *no }
            }
            Split::Multi { .. } => Predicate::Is(daughter as u16),
        }
    }
}

/// A decision node still receiving daughters.
struct OpenNode {
    id: NodeId,
    split: Split,
}

struct TreeParser<'a> {
    schema: &'a FeatureSchema,
    leaves: LeafContent,
    arena: Arena,
    open: Vec<OpenNode>,
    complete: bool,
}

/// Parses a whole tree.
///
/// # Errors
/// Returns the first problem found: malformed lines, unknown operators,
/// bracket mismatches, wrong daughter counts, non-numeric unit indices, or
/// features and values the schema does not define.
pub fn parse_tree(text: &str, schema: &FeatureSchema, leaves: LeafContent) -> Result<Arena, ParseError> {
    let mut parser = TreeParser { schema, leaves, arena: Arena::new(), open: Vec::new(), complete: false };
    let mut last_line = 0;
    for (i, raw) in text.lines().enumerate() {
        last_line = i + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with(";;") {
            continue;
        }
        parser.parse_line(line, last_line)?;
    }
    if parser.arena.is_empty() {
        return Err(syntax(last_line, "no tree found"));
    }
    if !parser.open.is_empty() {
        return Err(syntax(last_line, format!("bracket mismatch: {} decision node(s) left open", parser.open.len())));
    }
    Ok(parser.arena)
}

impl<'a> TreeParser<'a> {
    fn parse_line(&mut self, line: &str, n: usize) -> Result<(), ParseError> {
        let Some(body) = line.strip_prefix("((") else {
            return Err(syntax(n, format!("expected a node starting with '((', found '{}'", line)));
        };
        if self.complete {
            return Err(syntax(n, "content after the end of the tree"));
        }
        let is_decision = body.starts_with(|c: char| c.is_alphabetic()) && !body.starts_with("nan ");
        if is_decision { self.decision(line, n) } else { self.leaf(line, n) }
    }

    fn decision(&mut self, line: &str, n: usize) -> Result<(), ParseError> {
        let mut parts = line[2..].splitn(3, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let op = parts.next().ok_or_else(|| syntax(n, "decision without operator"))?;
        let value = parts
            .next()
            .map(str::trim)
            .and_then(|v| v.strip_suffix(')'))
            .ok_or_else(|| syntax(n, "decision must end with '<value>)'"))?;
        let value = unquote(value);

        let feature = self
            .schema
            .index_of(name)
            .ok_or_else(|| ParseError::UnknownFeature { line: n, feature: name.to_string() })?;
        let incompatible = || ParseError::Incompatible { line: n, feature: name.to_string(), op: op.to_string() };
        let unknown_value = || ParseError::UnknownValue { line: n, feature: name.to_string(), value: value.clone() };

        let split = match op {
            "is" => {
                if !self.schema.is_discrete(feature) {
                    return Err(incompatible());
                }
                let v = self.schema.value_index(feature, &value).ok_or_else(unknown_value)?;
                Split::Binary { yes: Predicate::Is(v), no: Predicate::IsNot(v) }
            }
            "<" => {
                if self.schema.is_discrete(feature) {
                    return Err(incompatible());
                }
                let t: f32 = value.parse().map_err(|_| syntax(n, format!("bad threshold '{}'", value)))?;
                Split::Binary { yes: Predicate::Below(t), no: Predicate::AtLeast(t) }
            }
            "isByteOf" | "isShortOf" => {
                if !self.schema.is_discrete(feature) {
                    return Err(incompatible());
                }
                let arity: usize = value.parse().map_err(|_| syntax(n, format!("bad daughter count '{}'", value)))?;
                if arity == 0 {
                    return Err(syntax(n, "decision node with zero daughters"));
                }
                if arity > self.schema.num_values(feature) {
                    return Err(unknown_value());
                }
                Split::Multi { arity }
            }
            other => return Err(syntax(n, format!("unknown node type '{}'", other))),
        };

        let id = self.attach(Node::Decision { feature, branches: Vec::new() }, n)?;
        self.open.push(OpenNode { id, split });
        Ok(())
    }

    fn leaf(&mut self, line: &str, n: usize) -> Result<(), ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let members = leaf_members(&tokens, n)?;
        if self.leaves == LeafContent::Empty && !members.is_empty() {
            return Err(syntax(n, format!("skeleton leaf holds {} units, expected none", members.len())));
        }
        self.attach(Node::Leaf { members }, n)?;
        if self.open.is_empty() {
            // A single-leaf tree.
            self.complete = true;
        }

        let last = tokens.last().copied().unwrap_or_default();
        let extra = last
            .find(')')
            .and_then(|pos| last[pos..].strip_prefix("))"))
            .ok_or_else(|| syntax(n, "leaf must end with '))'"))?;
        for c in extra.chars() {
            if c != ')' {
                return Err(syntax(n, format!("expected closing bracket, found '{}'", c)));
            }
            self.close_decision(n)?;
        }
        Ok(())
    }

    /// Adds `node` as the next daughter of the innermost open decision node,
    /// or as the root.
    fn attach(&mut self, node: Node, n: usize) -> Result<NodeId, ParseError> {
        let Some(top) = self.open.last() else {
            return Ok(self.arena.push_node(node, None));
        };
        let (parent, split) = (top.id, top.split);
        let daughter = self.arena.branches(parent).len();
        if daughter >= split.arity() {
            return Err(syntax(n, format!("decision node already has {} daughters", split.arity())));
        }
        Ok(self.arena.add_child(parent, split.predicate(daughter), node))
    }

    fn close_decision(&mut self, n: usize) -> Result<(), ParseError> {
        let node = self.open.pop().ok_or_else(|| syntax(n, "too many closing brackets"))?;
        let found = self.arena.branches(node.id).len();
        if found != node.split.arity() {
            return Err(syntax(n, format!("decision node closed with {} of {} daughters", found, node.split.arity())));
        }
        if self.open.is_empty() {
            self.complete = true;
        }
        Ok(())
    }
}

/// Unit indices of a leaf line: `((((i1 s1) (i2 s2)) m))`, or `((() m))`
/// for an empty leaf. Scores are not interpreted.
fn leaf_members(tokens: &[&str], n: usize) -> Result<Vec<usize>, ParseError> {
    if tokens.len() == 2 {
        return match tokens[0] {
            "((()" => Ok(Vec::new()),
            other => Err(syntax(n, format!("expected '((()' for an empty leaf, found '{}'", other))),
        };
    }
    if tokens.len() < 2 || tokens.len() % 2 == 0 {
        return Err(syntax(n, "leaf must list (index score) pairs followed by a score"));
    }
    let pairs = (tokens.len() - 1) / 2;
    let mut members = Vec::with_capacity(pairs);
    for k in 0..pairs {
        let token = tokens[2 * k];
        let prefix = if k == 0 { "((((" } else { "(" };
        let index = token
            .strip_prefix(prefix)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| syntax(n, format!("bad unit index '{}'", token)))?;
        members.push(index);
    }
    Ok(members)
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) if value.len() > 2 => inner.replace("\\\"", "\""),
        _ => value.to_string(),
    }
}
