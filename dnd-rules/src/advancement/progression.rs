//! Per-character advancement bookkeeping.

use super::{AdvancementId, AdvancementValue};
use crate::character::{CharacterDiff, ItemId};
use crate::error::RulesError;
use serde::{Deserialize, Serialize};

/// Identifies one advancement at one level of one owning item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub item: ItemId,
    pub advancement: AdvancementId,
    pub level: u8,
}

impl NodeKey {
    pub fn new(item: ItemId, advancement: AdvancementId, level: u8) -> Self {
        Self {
            item,
            advancement,
            level,
        }
    }
}

/// Lifecycle of a node. `Reversed` nodes keep their value and may be
/// applied again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdvancementStatus {
    #[default]
    Unconfigured,
    Configured,
    Applied,
    Reversed,
}

/// Exactly what applying a node did, so it can be undone without
/// recomputing anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub changes: CharacterDiff,
    pub added_items: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub key: NodeKey,
    pub status: AdvancementStatus,
    pub value: Option<AdvancementValue>,
    pub applied: Option<AppliedRecord>,
}

/// Advancement state for one character, ordered by node key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressionState {
    nodes: Vec<NodeState>,
}

impl ProgressionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&NodeState> {
        self.nodes
            .binary_search_by(|n| n.key.cmp(key))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn status(&self, key: &NodeKey) -> AdvancementStatus {
        self.get(key).map(|n| n.status).unwrap_or_default()
    }

    pub fn value(&self, key: &NodeKey) -> Option<&AdvancementValue> {
        self.get(key).and_then(|n| n.value.as_ref())
    }

    fn node_mut(&mut self, key: &NodeKey) -> &mut NodeState {
        let index = match self.nodes.binary_search_by(|n| n.key.cmp(key)) {
            Ok(index) => index,
            Err(index) => {
                self.nodes.insert(
                    index,
                    NodeState {
                        key: key.clone(),
                        status: AdvancementStatus::Unconfigured,
                        value: None,
                        applied: None,
                    },
                );
                index
            }
        };
        &mut self.nodes[index]
    }

    /// Store a value. Applied nodes must be reversed first.
    pub fn configure(&mut self, key: &NodeKey, value: AdvancementValue) -> Result<(), RulesError> {
        if self.status(key) == AdvancementStatus::Applied {
            return Err(RulesError::invalid(format!(
                "advancement {} at level {} is applied; reverse it before reconfiguring",
                key.advancement, key.level
            )));
        }
        let node = self.node_mut(key);
        node.status = AdvancementStatus::Configured;
        node.value = Some(value);
        Ok(())
    }

    pub fn mark_applied(&mut self, key: &NodeKey, value: AdvancementValue, record: AppliedRecord) {
        let node = self.node_mut(key);
        node.status = AdvancementStatus::Applied;
        node.value = Some(value);
        node.applied = Some(record);
    }

    /// Mark a node reversed and hand back its record.
    pub fn mark_reversed(&mut self, key: &NodeKey) -> Option<AppliedRecord> {
        let node = self.node_mut(key);
        node.status = AdvancementStatus::Reversed;
        node.applied.take()
    }

    /// Applied nodes of `item`.
    pub fn applied(&self, item: ItemId) -> impl Iterator<Item = &NodeState> {
        self.nodes
            .iter()
            .filter(move |n| n.key.item == item && n.status == AdvancementStatus::Applied)
    }

    /// Highest level of `item` with an applied node.
    pub fn highest_applied_level(&self, item: ItemId) -> Option<u8> {
        self.applied(item).map(|n| n.key.level).max()
    }
}
