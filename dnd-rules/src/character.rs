//! Character records and partial updates.
//!
//! A character's stats live in a JSON `system` document addressed by dotted
//! paths (`abilities.str.value`, `attributes.hp.max`, `details.level`). Updates
//! are ordered lists of [`StatChange`]s. Each one can be inverted, and numbers
//! and lists change by delta rather than by overwrite.

use crate::dice::lookup_path;
use crate::rules_table::RulesTable;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacterId(pub Uuid);

impl CharacterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CharacterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for items, owned or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Proficiency
// ============================================================================

/// Proficiency level for skills/tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProficiencyLevel {
    #[default]
    None,
    Half,
    Proficient,
    Expertise,
}

impl ProficiencyLevel {
    pub fn bonus(&self, proficiency_bonus: i64) -> i64 {
        match self {
            ProficiencyLevel::None => 0,
            ProficiencyLevel::Half => proficiency_bonus / 2,
            ProficiencyLevel::Proficient => proficiency_bonus,
            ProficiencyLevel::Expertise => proficiency_bonus * 2,
        }
    }

    /// Numeric multiplier as stored in character data.
    pub fn multiplier(&self) -> f64 {
        match self {
            ProficiencyLevel::None => 0.0,
            ProficiencyLevel::Half => 0.5,
            ProficiencyLevel::Proficient => 1.0,
            ProficiencyLevel::Expertise => 2.0,
        }
    }

    pub fn from_multiplier(value: f64) -> Self {
        if value >= 2.0 {
            ProficiencyLevel::Expertise
        } else if value >= 1.0 {
            ProficiencyLevel::Proficient
        } else if value > 0.0 {
            ProficiencyLevel::Half
        } else {
            ProficiencyLevel::None
        }
    }

    fn to_value(self) -> Value {
        match self {
            ProficiencyLevel::Half => json!(0.5),
            other => json!(other.multiplier() as i64),
        }
    }
}

// ============================================================================
// Character
// ============================================================================

/// An item owned by a character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedItem {
    pub id: ItemId,
    pub name: String,
    /// Uuid of the entry this item was created from.
    pub source: Option<String>,
}

/// A character record as held by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub name: String,
    pub system: Value,
    pub items: Vec<OwnedItem>,
}

impl Character {
    /// Create a level 0 character with every ability at 10 and the skill
    /// entries of `rules`.
    pub fn new(name: impl Into<String>, rules: &RulesTable) -> Self {
        let abilities: Map<String, Value> = rules
            .abilities
            .iter()
            .map(|a| (a.key.clone(), json!({ "value": 10, "proficient": 0 })))
            .collect();
        let skills: Map<String, Value> = rules
            .skills
            .iter()
            .map(|s| (s.key.clone(), json!({ "value": 0 })))
            .collect();

        Self {
            id: CharacterId::new(),
            name: name.into(),
            system: json!({
                "abilities": abilities,
                "attributes": { "hp": { "value": 0, "max": 0 } },
                "details": { "level": 0 },
                "skills": skills,
                "tools": {},
                "traits": {
                    "languages": [],
                    "armor": [],
                    "weapons": [],
                    "di": [],
                    "dr": [],
                    "dv": []
                },
                "flags": {}
            }),
            items: Vec::new(),
        }
    }

    /// Builders for assembling records. A key that does not form a valid
    /// path is logged and leaves the record unchanged.
    pub fn with_ability(self, ability: &str, score: i64) -> Self {
        self.with_value(&format!("abilities.{ability}.value"), json!(score))
    }

    pub fn with_level(self, level: u8) -> Self {
        self.with_value("details.level", json!(level))
    }

    pub fn with_skill(self, skill: &str, level: ProficiencyLevel) -> Self {
        self.with_value(&format!("skills.{skill}.value"), level.to_value())
    }

    pub fn with_tool(self, tool: &str, level: ProficiencyLevel) -> Self {
        self.with_value(&format!("tools.{tool}.value"), level.to_value())
    }

    pub fn with_save_proficiency(self, ability: &str) -> Self {
        self.with_value(&format!("abilities.{ability}.proficient"), json!(1))
    }

    pub fn with_flag(self, flag: &str, value: Value) -> Self {
        self.with_value(&format!("flags.{flag}"), value)
    }

    /// Set any field of the system document by dotted path.
    pub fn with_value(mut self, path: &str, value: Value) -> Self {
        if let Err(e) = set_path(&mut self.system, path, Some(value)) {
            warn!(character = %self.name, error = %e, "ignoring invalid character field");
        }
        self
    }

    /// Read a value from the system document.
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.system, path)
    }

    pub fn level(&self) -> u8 {
        self.get("details.level")
            .and_then(Value::as_u64)
            .map(|l| l.min(u8::MAX as u64) as u8)
            .unwrap_or(0)
    }

    pub fn ability_score(&self, ability: &str) -> Option<i64> {
        self.get(&format!("abilities.{ability}.value"))
            .and_then(Value::as_i64)
    }

    pub fn ability_modifier(&self, ability: &str) -> Option<i64> {
        // Floor division: score 8-9 = -1, 10-11 = 0, 12-13 = +1.
        self.ability_score(ability).map(|s| (s - 10).div_euclid(2))
    }

    /// Proficiency bonus by total level (+2 at levels 1-4, +6 at 17-20).
    pub fn proficiency_bonus(&self) -> i64 {
        let level = self.level().max(1) as i64;
        (level + 7) / 4
    }

    pub fn skill_proficiency(&self, skill: &str) -> ProficiencyLevel {
        self.proficiency_at(&format!("skills.{skill}.value"))
    }

    pub fn tool_proficiency(&self, tool: &str) -> ProficiencyLevel {
        self.proficiency_at(&format!("tools.{tool}.value"))
    }

    pub fn save_proficiency(&self, ability: &str) -> ProficiencyLevel {
        self.proficiency_at(&format!("abilities.{ability}.proficient"))
    }

    fn proficiency_at(&self, path: &str) -> ProficiencyLevel {
        self.get(path)
            .and_then(Value::as_f64)
            .map(ProficiencyLevel::from_multiplier)
            .unwrap_or_default()
    }

    pub fn flag(&self, flag: &str) -> bool {
        self.get(&format!("flags.{flag}"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Roll data: the system document plus derived values (`prof`,
    /// `abilities.<key>.mod`, `abilities.<key>.dc`, `abilities.<key>.save`).
    pub fn roll_data(&self, rules: &RulesTable) -> Value {
        let mut data = self.system.clone();
        let prof = self.proficiency_bonus();

        for ability in &rules.abilities {
            let Some(modifier) = self.ability_modifier(&ability.key) else {
                continue;
            };
            let save = modifier + self.save_proficiency(&ability.key).bonus(prof);
            if let Some(entry) = data
                .get_mut("abilities")
                .and_then(|a| a.get_mut(&ability.key))
                .and_then(Value::as_object_mut)
            {
                entry.insert("mod".to_string(), json!(modifier));
                entry.insert("dc".to_string(), json!(8 + modifier + prof));
                entry.insert("save".to_string(), json!(save));
            }
        }

        if let Some(root) = data.as_object_mut() {
            root.insert("prof".to_string(), json!(prof));
        }
        if let Some(attributes) = data.get_mut("attributes").and_then(Value::as_object_mut) {
            attributes.insert("prof".to_string(), json!(prof));
        }
        data
    }

    /// Apply a partial update in order.
    pub fn apply_diff(&mut self, diff: &CharacterDiff) -> Result<(), StoreError> {
        diff.apply_to(&mut self.system)
    }
}

// ============================================================================
// Partial updates
// ============================================================================

/// What a [`StatChange`] does at its path.
///
/// Numbers and lists are changed relative to what is stored, so undoing one
/// update leaves changes made by others at the same path in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Replace the value (`None` means the key is absent). Skipped when the
    /// path no longer holds `before`.
    Set {
        before: Option<Value>,
        after: Option<Value>,
    },
    /// Add to an integer.
    Add { delta: i64 },
    /// Append an element to a list that lacks it.
    Insert { value: Value },
    /// Drop an element from a list.
    Remove { value: Value },
}

impl ChangeOp {
    fn inverse(&self) -> ChangeOp {
        match self {
            ChangeOp::Set { before, after } => ChangeOp::Set {
                before: after.clone(),
                after: before.clone(),
            },
            ChangeOp::Add { delta } => ChangeOp::Add {
                delta: delta.saturating_neg(),
            },
            ChangeOp::Insert { value } => ChangeOp::Remove {
                value: value.clone(),
            },
            ChangeOp::Remove { value } => ChangeOp::Insert {
                value: value.clone(),
            },
        }
    }
}

/// One change at one dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatChange {
    pub path: String,
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl StatChange {
    pub fn inverse(&self) -> StatChange {
        StatChange {
            path: self.path.clone(),
            op: self.op.inverse(),
        }
    }

    pub fn apply_to(&self, system: &mut Value) -> Result<(), StoreError> {
        let invalid = || StoreError::InvalidPath(self.path.clone());
        match &self.op {
            ChangeOp::Set { before, after } => {
                if lookup_path(system, &self.path) != before.as_ref() {
                    return Ok(());
                }
                set_path(system, &self.path, after.clone())
            }
            ChangeOp::Add { delta } => {
                let current = match lookup_path(system, &self.path) {
                    Some(value) => value.as_i64().ok_or_else(invalid)?,
                    None => 0,
                };
                let total = current.checked_add(*delta).ok_or_else(invalid)?;
                set_path(system, &self.path, Some(json!(total)))
            }
            ChangeOp::Insert { value } => {
                let mut entries = match lookup_path(system, &self.path) {
                    Some(list) => list.as_array().cloned().ok_or_else(invalid)?,
                    None => Vec::new(),
                };
                if entries.contains(value) {
                    return Ok(());
                }
                entries.push(value.clone());
                set_path(system, &self.path, Some(Value::Array(entries)))
            }
            ChangeOp::Remove { value } => {
                let Some(list) = lookup_path(system, &self.path) else {
                    return Ok(());
                };
                let mut entries = list.as_array().cloned().ok_or_else(invalid)?;
                entries.retain(|e| e != value);
                set_path(system, &self.path, Some(Value::Array(entries)))
            }
        }
    }
}

/// An ordered set of changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterDiff {
    pub changes: Vec<StatChange>,
}

impl CharacterDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The update that undoes this one when applied after it.
    pub fn inverse(&self) -> CharacterDiff {
        CharacterDiff {
            changes: self.changes.iter().rev().map(StatChange::inverse).collect(),
        }
    }

    pub fn apply_to(&self, system: &mut Value) -> Result<(), StoreError> {
        self.changes.iter().try_for_each(|c| c.apply_to(system))
    }
}

/// Records changes against a scratch copy of a system document so later
/// changes see earlier ones.
pub struct DiffBuilder {
    scratch: Value,
    diff: CharacterDiff,
}

impl DiffBuilder {
    pub fn new(system: &Value) -> Self {
        Self {
            scratch: system.clone(),
            diff: CharacterDiff::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.scratch, path)
    }

    fn record(&mut self, path: &str, op: ChangeOp) -> Result<(), StoreError> {
        let change = StatChange {
            path: path.to_string(),
            op,
        };
        change.apply_to(&mut self.scratch)?;
        self.diff.changes.push(change);
        Ok(())
    }

    /// Set `path` to `value`. Each missing parent object is created by its
    /// own change, so undoing it only removes the parent once it is empty.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), StoreError> {
        let segments: Vec<&str> = path.split('.').collect();
        for depth in 1..segments.len() {
            let parent = segments[..depth].join(".");
            if self.get(&parent).is_none() {
                self.record(
                    &parent,
                    ChangeOp::Set {
                        before: None,
                        after: Some(Value::Object(Map::new())),
                    },
                )?;
            }
        }

        let before = self.get(path).cloned();
        if before.as_ref() == Some(&value) {
            return Ok(());
        }
        self.record(
            path,
            ChangeOp::Set {
                before,
                after: Some(value),
            },
        )
    }

    /// Add `delta` to the integer at `path`, creating it when absent.
    pub fn add(&mut self, path: &str, delta: i64) -> Result<(), StoreError> {
        match self.get(path).map(Value::is_i64) {
            None => self.set(path, json!(delta)),
            Some(true) if delta == 0 => Ok(()),
            Some(true) => self.record(path, ChangeOp::Add { delta }),
            Some(false) => Err(StoreError::InvalidPath(path.to_string())),
        }
    }

    /// Append `value` to the list at `path` unless it is already there.
    pub fn insert(&mut self, path: &str, value: Value) -> Result<(), StoreError> {
        let present = match self.get(path) {
            None => return self.set(path, Value::Array(vec![value])),
            Some(list) => list
                .as_array()
                .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?
                .contains(&value),
        };
        if present {
            return Ok(());
        }
        self.record(path, ChangeOp::Insert { value })
    }

    pub fn finish(self) -> CharacterDiff {
        self.diff
    }
}

/// Write (`Some`) or remove (`None`) the value at a dotted path, creating
/// intermediate objects as needed.
pub fn set_path(root: &mut Value, path: &str, value: Option<Value>) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
    if last.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let mut node = root;
    for key in parents {
        let object = node
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        if value.is_none() && !object.contains_key(*key) {
            return Ok(());
        }
        node = object
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let object = node
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
    match value {
        Some(value) => {
            object.insert(last.to_string(), value);
        }
        None => {
            object.remove(*last);
        }
    }
    Ok(())
}
