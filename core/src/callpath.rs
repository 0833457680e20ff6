use crate::error::{IngestError, StoreError};
use crate::event::CALLPATH_ROOT;
use crate::storage::{Quark, StateSystem, StateValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node of the static call tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallpathNode {
    /// Trace-local id, unrelated to the quark.
    pub id: i64,
    /// `0` for roots.
    pub parent_id: i64,
    pub name: String,
    pub quark: Quark,
}

impl CallpathNode {
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}

/// Bijection between trace-local callpath ids and store quarks.
///
/// Each resolved node owns `callpath/<root>/.../<name>` and the node's id is
/// written as that attribute's value at the store start time, so the table
/// can be rebuilt from the store alone.
#[derive(Debug, Default)]
pub struct CallpathResolver {
    nodes: Vec<CallpathNode>,
    by_id: HashMap<i64, usize>,
    by_quark: HashMap<Quark, i64>,
}

impl CallpathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &mut self,
        store: &dyn StateSystem,
        id: i64,
        parent_id: i64,
        name: &str,
    ) -> Result<Quark, IngestError> {
        if let Some(existing) = self.node(id) {
            if existing.parent_id == parent_id && existing.name == name {
                return Ok(existing.quark);
            }
            return Err(IngestError::CallpathConflict {
                id,
                reason: format!(
                    "already defined as '{}' under {}, redefined as '{}' under {}",
                    existing.name, existing.parent_id, name, parent_id
                ),
            });
        }

        let quark = if parent_id == 0 {
            store.quark_absolute_and_add(&[CALLPATH_ROOT, name])
        } else {
            let parent = self
                .quark_of(parent_id)
                .ok_or(IngestError::MissingParent { id, parent: parent_id })?;
            store.quark_relative_and_add(parent, name)?
        };

        if let Some(owner) = self.by_quark.get(&quark) {
            return Err(IngestError::CallpathConflict {
                id,
                reason: format!("path already claimed by callpath {}", owner),
            });
        }

        store.modify_attribute(store.start_time(), StateValue::Long(id), quark)?;
        self.insert(CallpathNode {
            id,
            parent_id,
            name: name.to_string(),
            quark,
        });
        Ok(quark)
    }

    fn insert(&mut self, node: CallpathNode) {
        self.by_id.insert(node.id, self.nodes.len());
        self.by_quark.insert(node.quark, node.id);
        self.nodes.push(node);
    }

    pub fn node(&self, id: i64) -> Option<&CallpathNode> {
        self.by_id.get(&id).and_then(|&i| self.nodes.get(i))
    }

    pub fn quark_of(&self, id: i64) -> Option<Quark> {
        self.node(id).map(|n| n.quark)
    }

    pub fn id_of(&self, quark: Quark) -> Option<i64> {
        self.by_quark.get(&quark).copied()
    }

    /// Nodes in resolution order; parents always precede children.
    pub fn nodes(&self) -> &[CallpathNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_id.clear();
        self.by_quark.clear();
    }

    /// Rebuild the table by walking `callpath/**` and reading back each
    /// attribute's stored id. Attributes without an id are skipped along
    /// with their subtree.
    pub fn rehydrate(&mut self, store: &dyn StateSystem) -> Result<usize, StoreError> {
        self.clear();
        let Ok(root) = store.quark_absolute(&[CALLPATH_ROOT]) else {
            return Ok(0);
        };
        let mut stack: Vec<(Quark, i64)> = store
            .sub_attributes(root, false)?
            .into_iter()
            .rev()
            .map(|q| (q, 0))
            .collect();
        let at = store.start_time();

        while let Some((quark, parent_id)) = stack.pop() {
            let id = match store.query_single_state(at, quark)?.value {
                StateValue::Null => continue,
                value => match value.unbox_long() {
                    Ok(id) => id,
                    Err(_) => continue,
                },
            };
            self.insert(CallpathNode {
                id,
                parent_id,
                name: store.attribute_name(quark)?,
                quark,
            });
            stack.extend(
                store
                    .sub_attributes(quark, false)?
                    .into_iter()
                    .rev()
                    .map(|q| (q, id)),
            );
        }
        Ok(self.nodes.len())
    }
}
