//! Operation model: the edit kinds and their grouping into transactions.
//!
//! ```text
//! Transaction
//!   ├── TransactionEntry { target: "",      operations: [Splice, Splice] }
//!   └── TransactionEntry { target: "a",     operations: [Toggle] }
//! ```
//!
//! A [`Target`] addresses a node inside the materialized value. Operations of
//! one entry apply in array order, each against the state left by the
//! previous one. Applying an operation yields its exact inverse, which is
//! what undo tracking records. Splice and toggle are the edit kinds; replace
//! only appears as the inverse of an edit that turned a `null` node into a
//! container.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// `/`-separated path into a materialized value. The empty path is the root.
///
/// Each segment selects, inside an array, the element whose `"id"` equals the
/// segment and, inside an object, the field with that name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.segments().next().is_none()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Child path `self/segment`.
    pub fn join(&self, segment: &str) -> Self {
        if self.is_root() {
            Self(segment.to_string())
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }
}

impl From<&str> for Target {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for Target {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Ordered-sequence edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Splice {
    pub index: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub remove: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insert: Vec<Value>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Named property assignment. A `null` value clears the property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toggle {
    pub name: String,
    pub value: Value,
}

/// Whole-node assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replace {
    pub value: Value,
}

/// One edit against a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Splice(Splice),
    Toggle(Toggle),
    Replace(Replace),
}

impl Operation {
    pub fn splice(index: usize, remove: usize, insert: Vec<Value>) -> Self {
        Self::Splice(Splice {
            index,
            remove,
            insert,
        })
    }

    pub fn insert(index: usize, items: Vec<Value>) -> Self {
        Self::splice(index, 0, items)
    }

    pub fn remove(index: usize, count: usize) -> Self {
        Self::splice(index, count, Vec::new())
    }

    pub fn toggle(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Toggle(Toggle {
            name: name.into(),
            value: value.into(),
        })
    }

    pub fn replace(value: impl Into<Value>) -> Self {
        Self::Replace(Replace {
            value: value.into(),
        })
    }

    /// Splices that neither remove nor insert leave every state unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Splice(s) => s.remove == 0 && s.insert.is_empty(),
            Self::Toggle(_) | Self::Replace(_) => false,
        }
    }

    /// Apply to `node` in place and return the operation that reverts it.
    ///
    /// Splice indices are clamped to the sequence length. `None` means the
    /// node has the wrong shape and nothing was applied. When a `null` node
    /// becomes a container, the inverse puts the `null` back.
    pub fn apply(&self, node: &mut Value) -> Option<Operation> {
        let was_null = node.is_null();
        let inverse = self.apply_in_place(node)?;
        if was_null && !node.is_null() {
            return Some(Self::replace(Value::Null));
        }
        Some(inverse)
    }

    fn apply_in_place(&self, node: &mut Value) -> Option<Operation> {
        match self {
            Self::Splice(splice) => {
                if node.is_null() {
                    *node = Value::Array(Vec::new());
                }
                let Value::Array(items) = node else {
                    log::warn!("splice applied to a non-sequence node, skipping");
                    return None;
                };
                let index = splice.index.min(items.len());
                let remove = splice.remove.min(items.len() - index);
                let removed: Vec<Value> = items
                    .splice(index..index + remove, splice.insert.iter().cloned())
                    .collect();
                Some(Self::splice(index, splice.insert.len(), removed))
            }
            Self::Toggle(toggle) => {
                if node.is_null() {
                    *node = Value::Object(Map::new());
                }
                let Value::Object(fields) = node else {
                    log::warn!("toggle '{}' applied to a non-object node, skipping", toggle.name);
                    return None;
                };
                let previous = if toggle.value.is_null() {
                    fields.remove(&toggle.name)
                } else {
                    fields.insert(toggle.name.clone(), toggle.value.clone())
                };
                Some(Self::toggle(toggle.name.clone(), previous.unwrap_or(Value::Null)))
            }
            Self::Replace(replace) => {
                let previous = std::mem::replace(node, replace.value.clone());
                Some(Self::replace(previous))
            }
        }
    }
}

/// Operations scoped to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub target: Target,
    pub operations: Vec<Operation>,
}

impl TransactionEntry {
    pub fn new(target: impl Into<Target>, operations: Vec<Operation>) -> Self {
        Self {
            target: target.into(),
            operations,
        }
    }
}

/// Atomic unit exchanged with the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transaction {
    pub entries: Vec<TransactionEntry>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction holding a single operation.
    pub fn single(target: impl Into<Target>, operation: Operation) -> Self {
        Self::new().with(target, operation)
    }

    /// Builder: append `operation` for `target`, extending the last entry when
    /// it addresses the same target.
    pub fn with(mut self, target: impl Into<Target>, operation: Operation) -> Self {
        self.append(TransactionEntry::new(target, vec![operation]));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.operations.is_empty())
    }

    pub fn operation_count(&self) -> usize {
        self.entries.iter().map(|e| e.operations.len()).sum()
    }

    /// The target shared by every entry, if there is exactly one.
    pub fn single_target(&self) -> Option<&Target> {
        let first = &self.entries.first()?.target;
        self.entries
            .iter()
            .all(|e| &e.target == first)
            .then_some(first)
    }

    /// Strip no-op operations and empty entries.
    pub fn normalized(mut self) -> Self {
        for entry in &mut self.entries {
            entry.operations.retain(|op| !op.is_noop());
        }
        self.entries.retain(|e| !e.operations.is_empty());
        self
    }

    /// Append one entry, folding it into the last entry when targets match.
    pub fn append(&mut self, entry: TransactionEntry) {
        match self.entries.last_mut() {
            Some(last) if last.target == entry.target => last.operations.extend(entry.operations),
            _ => self.entries.push(entry),
        }
    }

    /// Append every entry of `other` after this transaction's entries.
    pub fn merge(&mut self, other: Transaction) {
        for entry in other.entries {
            self.append(entry);
        }
    }

    /// Apply to `state` and return the inverse transaction.
    ///
    /// Entries whose target cannot be resolved are skipped.
    pub fn apply(&self, state: &mut Value) -> Transaction {
        let mut inverse = Vec::new();
        for entry in &self.entries {
            let mut undo = Vec::new();
            for op in &entry.operations {
                let Some(node) = resolve_mut(state, &entry.target) else {
                    log::warn!("target {} not found, skipping operation", entry.target);
                    continue;
                };
                if let Some(reverse) = op.apply(node) {
                    undo.push(reverse);
                }
            }
            if !undo.is_empty() {
                undo.reverse();
                inverse.push(TransactionEntry::new(entry.target.clone(), undo));
            }
        }
        inverse.reverse();
        Transaction { entries: inverse }
    }
}

fn id_matches(item: &Value, segment: &str) -> bool {
    match item.get("id") {
        Some(Value::String(id)) => id == segment,
        Some(Value::Number(id)) => id.to_string() == segment,
        _ => false,
    }
}

/// Walk `target` from `root`.
pub fn resolve_mut<'a>(root: &'a mut Value, target: &Target) -> Option<&'a mut Value> {
    let mut node = root;
    for segment in target.segments() {
        let current = node;
        node = match current {
            Value::Array(items) => items.iter_mut().find(|item| id_matches(item, segment))?,
            Value::Object(fields) => fields.get_mut(segment)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Read-only counterpart of [`resolve_mut`].
pub fn resolve<'a>(root: &'a Value, target: &Target) -> Option<&'a Value> {
    let mut node = root;
    for segment in target.segments() {
        node = match node {
            Value::Array(items) => items.iter().find(|item| id_matches(item, segment))?,
            Value::Object(fields) => fields.get(segment)?,
            _ => return None,
        };
    }
    Some(node)
}
