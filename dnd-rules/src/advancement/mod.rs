//! Level-gated character advancement.
//!
//! An owning item (usually a class) carries a list of [`Advancement`]s. Each
//! one applies at one or more levels, and a character's choices for it live in
//! its [`ProgressionState`]. [`Advancement::compute_updates`] is pure: it turns
//! a character, a level and a value into the stat changes and item operations
//! that the [`AdvancementEngine`] then carries out.

pub mod engine;
pub mod progression;

pub use engine::{AdvancementEngine, AdvancementPrompt};
pub use progression::{AdvancementStatus, AppliedRecord, NodeKey, NodeState, ProgressionState};

use crate::character::{Character, CharacterDiff, DiffBuilder, ItemId};
use crate::dice::DieType;
use crate::error::{LookupKind, RulesError};
use crate::rules_table::RulesTable;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Highest character level an advancement can target.
pub const MAX_LEVEL: u8 = 20;

/// Identifier of an advancement, unique within its owning item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdvancementId(pub String);

impl AdvancementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AdvancementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether updates are computed for applying or reversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Reverse,
}

/// How hit points are gained at a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitPointsChoice {
    /// The die's maximum.
    Max,
    /// The die's fixed average (d8 = 5).
    Average,
    /// Roll the die when the advancement is applied.
    Roll,
    /// An already rolled result.
    Rolled(u32),
}

/// A character's choice for one advancement at one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvancementValue {
    HitPoints(HitPointsChoice),
    /// Points assigned per ability key.
    AbilityScores(BTreeMap<String, i64>),
    /// Source uuids of the granted items.
    Items(Vec<String>),
    /// Chosen trait grants (`skills:acr`).
    Traits(Vec<String>),
    /// Nothing to choose.
    Empty,
}

/// An item granted by an advancement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGrantEntry {
    pub uuid: String,
    #[serde(default)]
    pub optional: bool,
}

impl ItemGrantEntry {
    pub fn required(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            optional: false,
        }
    }

    pub fn optional(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            optional: true,
        }
    }
}

/// Typed configuration of an advancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdvancementKind {
    /// Hit points gained at every level.
    HitPoints { hit_die: DieType },
    AbilityScoreImprovement {
        level: u8,
        points: i64,
        /// No score may be raised above this.
        cap: i64,
        /// Increases applied regardless of the choice.
        #[serde(default)]
        fixed: BTreeMap<String, i64>,
    },
    ItemGrant {
        level: u8,
        items: Vec<ItemGrantEntry>,
    },
    /// Proficiencies, languages and damage traits. `grants` always apply;
    /// `choose` more are picked from `choices`.
    Trait {
        level: u8,
        #[serde(default)]
        grants: Vec<String>,
        #[serde(default)]
        choices: Vec<String>,
        #[serde(default)]
        choose: usize,
    },
    /// A value that changes with level, exposed as
    /// `scale.<item identifier>.<identifier>` in roll data.
    ScaleValue {
        identifier: String,
        scale: BTreeMap<u8, String>,
    },
}

/// One advancement of an owning item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advancement {
    pub id: AdvancementId,
    pub title: String,
    pub kind: AdvancementKind,
}

/// Everything an advancement does at one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancementUpdates {
    pub changes: CharacterDiff,
    /// Source uuids of items to create.
    pub items_to_add: Vec<String>,
    /// Source uuids of items a forward update created. The engine deletes
    /// the owned items it recorded for them, never a search by source.
    pub items_to_remove: Vec<String>,
}

impl Advancement {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: AdvancementKind) -> Self {
        Self {
            id: AdvancementId::new(id),
            title: title.into(),
            kind,
        }
    }

    /// Levels this advancement applies at, ascending.
    pub fn levels(&self) -> Vec<u8> {
        match &self.kind {
            AdvancementKind::HitPoints { .. } => (1..=MAX_LEVEL).collect(),
            AdvancementKind::AbilityScoreImprovement { level, .. }
            | AdvancementKind::ItemGrant { level, .. }
            | AdvancementKind::Trait { level, .. } => vec![*level],
            AdvancementKind::ScaleValue { scale, .. } => scale.keys().copied().collect(),
        }
    }

    pub fn applies_at(&self, level: u8) -> bool {
        self.levels().contains(&level)
    }

    /// The value used when no choice is needed at `level`.
    pub fn default_value(&self, level: u8) -> Option<AdvancementValue> {
        match &self.kind {
            AdvancementKind::HitPoints { .. } if level == 1 => {
                Some(AdvancementValue::HitPoints(HitPointsChoice::Max))
            }
            AdvancementKind::HitPoints { .. } => None,
            AdvancementKind::AbilityScoreImprovement { points, .. } if *points == 0 => {
                Some(AdvancementValue::AbilityScores(BTreeMap::new()))
            }
            AdvancementKind::AbilityScoreImprovement { .. } => None,
            AdvancementKind::ItemGrant { items, .. } if items.iter().all(|i| !i.optional) => {
                Some(AdvancementValue::Items(
                    items.iter().map(|i| i.uuid.clone()).collect(),
                ))
            }
            AdvancementKind::ItemGrant { .. } => None,
            AdvancementKind::Trait { choose, .. } if *choose == 0 => {
                Some(AdvancementValue::Traits(Vec::new()))
            }
            AdvancementKind::Trait { .. } => None,
            AdvancementKind::ScaleValue { .. } => Some(AdvancementValue::Empty),
        }
    }

    /// Check a value against this advancement's configuration.
    pub fn validate(
        &self,
        level: u8,
        value: &AdvancementValue,
        rules: &RulesTable,
    ) -> Result<(), RulesError> {
        if !self.applies_at(level) {
            return Err(RulesError::invalid(format!(
                "advancement {} does not apply at level {}",
                self.id, level
            )));
        }

        match (&self.kind, value) {
            (AdvancementKind::HitPoints { hit_die }, AdvancementValue::HitPoints(choice)) => {
                if let HitPointsChoice::Rolled(n) = choice {
                    if *n < 1 || *n > hit_die.sides() {
                        return Err(RulesError::invalid(format!(
                            "rolled {} on a {}",
                            n, hit_die
                        )));
                    }
                }
                Ok(())
            }
            (
                AdvancementKind::AbilityScoreImprovement { points, fixed, .. },
                AdvancementValue::AbilityScores(assigned),
            ) => {
                for (ability, delta) in assigned.iter().chain(fixed.iter()) {
                    rules.require_ability(ability)?;
                    if *delta < 0 {
                        return Err(RulesError::invalid(format!(
                            "cannot assign {} points to {}",
                            delta, ability
                        )));
                    }
                }
                let spent: i64 = assigned.values().sum();
                if spent != *points {
                    return Err(RulesError::invalid(format!(
                        "{} of {} ability points assigned",
                        spent, points
                    )));
                }
                Ok(())
            }
            (AdvancementKind::ItemGrant { items, .. }, AdvancementValue::Items(selected)) => {
                let unique: BTreeSet<&String> = selected.iter().collect();
                if unique.len() != selected.len() {
                    return Err(RulesError::invalid("an item was selected twice"));
                }
                for uuid in selected {
                    if !items.iter().any(|i| &i.uuid == uuid) {
                        return Err(RulesError::not_found(LookupKind::Item, uuid.clone()));
                    }
                }
                if let Some(missing) = items
                    .iter()
                    .find(|i| !i.optional && !selected.contains(&i.uuid))
                {
                    return Err(RulesError::invalid(format!(
                        "required item {} was not selected",
                        missing.uuid
                    )));
                }
                Ok(())
            }
            (
                AdvancementKind::Trait {
                    grants,
                    choices,
                    choose,
                    ..
                },
                AdvancementValue::Traits(chosen),
            ) => {
                if chosen.len() != *choose {
                    return Err(RulesError::invalid(format!(
                        "{} of {} traits chosen",
                        chosen.len(),
                        choose
                    )));
                }
                for choice in chosen {
                    if !choices.contains(choice) {
                        return Err(RulesError::invalid(format!(
                            "'{}' is not one of the offered traits",
                            choice
                        )));
                    }
                }
                for grant in grants.iter().chain(chosen) {
                    TraitGrant::parse(grant, rules)?;
                }
                Ok(())
            }
            (AdvancementKind::ScaleValue { .. }, AdvancementValue::Empty) => Ok(()),
            _ => Err(RulesError::invalid(format!(
                "value does not match advancement {}",
                self.id
            ))),
        }
    }

    /// Compute the updates applying this advancement at `level` makes to
    /// `character`. `item_identifier` names the owning item in roll data.
    ///
    /// `Direction::Reverse` gives the exact inverse of the forward updates for
    /// the same character, level and value, so `character` is the state the
    /// advancement was applied to.
    pub fn compute_updates(
        &self,
        item_identifier: &str,
        character: &Character,
        level: u8,
        value: &AdvancementValue,
        direction: Direction,
    ) -> Result<AdvancementUpdates, RulesError> {
        let forward = self.forward_updates(item_identifier, character, level, value)?;
        Ok(match direction {
            Direction::Forward => forward,
            Direction::Reverse => AdvancementUpdates {
                changes: forward.changes.inverse(),
                items_to_add: Vec::new(),
                items_to_remove: forward.items_to_add,
            },
        })
    }

    fn forward_updates(
        &self,
        item_identifier: &str,
        character: &Character,
        level: u8,
        value: &AdvancementValue,
    ) -> Result<AdvancementUpdates, RulesError> {
        let mut builder = DiffBuilder::new(&character.system);
        let mut updates = AdvancementUpdates::default();

        match (&self.kind, value) {
            (AdvancementKind::HitPoints { hit_die }, AdvancementValue::HitPoints(choice)) => {
                let die = match choice {
                    HitPointsChoice::Max => hit_die.sides(),
                    HitPointsChoice::Average => hit_die.fixed_average(),
                    HitPointsChoice::Rolled(n) => *n,
                    HitPointsChoice::Roll => {
                        return Err(RulesError::invalid(
                            "hit points must be rolled before they are applied",
                        ))
                    }
                };
                let con = character.ability_modifier("con").unwrap_or(0);
                let gain = (die as i64 + con).max(1);
                builder.add("attributes.hp.max", gain)?;
                builder.add("attributes.hp.value", gain)?;
            }
            (
                AdvancementKind::AbilityScoreImprovement { cap, fixed, .. },
                AdvancementValue::AbilityScores(assigned),
            ) => {
                let mut totals: BTreeMap<&String, i64> = BTreeMap::new();
                for (ability, delta) in fixed.iter().chain(assigned.iter()) {
                    let total = totals.entry(ability).or_default();
                    *total = total.saturating_add(*delta);
                }
                for (ability, delta) in totals {
                    let path = format!("abilities.{ability}.value");
                    let current = builder.get(&path).and_then(Value::as_i64);
                    let score = current.unwrap_or(10).saturating_add(delta);
                    if score > *cap {
                        return Err(RulesError::invalid(format!(
                            "{} would rise to {}, above the cap of {}",
                            ability, score, cap
                        )));
                    }
                    match current {
                        Some(_) => builder.add(&path, delta)?,
                        None => builder.set(&path, json!(score))?,
                    }
                }
            }
            (AdvancementKind::ItemGrant { .. }, AdvancementValue::Items(selected)) => {
                updates.items_to_add = selected.clone();
            }
            (AdvancementKind::Trait { grants, .. }, AdvancementValue::Traits(chosen)) => {
                for grant in grants.iter().chain(chosen) {
                    TraitGrant::parse_unchecked(grant)?.apply(&mut builder)?;
                }
            }
            (AdvancementKind::ScaleValue { identifier, scale }, AdvancementValue::Empty) => {
                if let Some(entry) = scale.get(&level) {
                    builder.set(&format!("scale.{item_identifier}.{identifier}"), json!(entry))?;
                }
            }
            _ => {
                return Err(RulesError::invalid(format!(
                    "value does not match advancement {}",
                    self.id
                )))
            }
        }

        updates.changes = builder.finish();
        Ok(updates)
    }
}

/// Where a trait grant lands on the character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraitCategory {
    Skills,
    Saves,
    Tools,
    /// A list under `traits.<key>`.
    List(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TraitGrant {
    category: TraitCategory,
    key: String,
}

impl TraitGrant {
    fn parse_unchecked(grant: &str) -> Result<Self, RulesError> {
        let (category, key) = grant
            .split_once(':')
            .filter(|(_, key)| !key.is_empty())
            .ok_or_else(|| RulesError::invalid(format!("malformed trait '{}'", grant)))?;
        let category = match category {
            "skills" => TraitCategory::Skills,
            "saves" => TraitCategory::Saves,
            "tools" => TraitCategory::Tools,
            "languages" => TraitCategory::List("languages"),
            "armor" => TraitCategory::List("armor"),
            "weapons" => TraitCategory::List("weapons"),
            "di" => TraitCategory::List("di"),
            "dr" => TraitCategory::List("dr"),
            "dv" => TraitCategory::List("dv"),
            other => {
                return Err(RulesError::invalid(format!(
                    "unknown trait category '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            category,
            key: key.to_string(),
        })
    }

    /// Parse and resolve the key against the rules table.
    fn parse(grant: &str, rules: &RulesTable) -> Result<Self, RulesError> {
        let mut parsed = Self::parse_unchecked(grant)?;
        let key = match parsed.category {
            TraitCategory::Skills => rules.require_skill(&parsed.key)?.key.clone(),
            TraitCategory::Saves => rules.require_ability(&parsed.key)?.key.clone(),
            TraitCategory::Tools => rules.require_tool(&parsed.key)?.key.clone(),
            TraitCategory::List("di" | "dr" | "dv") => {
                rules.require_damage_type(&parsed.key)?.key.clone()
            }
            TraitCategory::List(_) => return Ok(parsed),
        };
        parsed.key = key;
        Ok(parsed)
    }

    fn apply(&self, builder: &mut DiffBuilder) -> Result<(), RulesError> {
        let path = match self.category {
            TraitCategory::Skills => format!("skills.{}.value", self.key),
            TraitCategory::Tools => format!("tools.{}.value", self.key),
            TraitCategory::Saves => format!("abilities.{}.proficient", self.key),
            TraitCategory::List(list) => {
                builder.insert(&format!("traits.{list}"), json!(self.key))?;
                return Ok(());
            }
        };
        // Never lowers an existing expertise.
        if builder.get(&path).and_then(Value::as_f64).unwrap_or(0.0) < 1.0 {
            builder.set(&path, json!(1))?;
        }
        Ok(())
    }
}

/// An item that owns advancements, such as a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesItem {
    pub id: ItemId,
    /// Slug used in roll data (`fighter`).
    pub identifier: String,
    pub name: String,
    advancements: Vec<Advancement>,
}

impl RulesItem {
    /// Build an item, rejecting duplicate advancement ids.
    pub fn new(
        identifier: impl Into<String>,
        name: impl Into<String>,
        advancements: Vec<Advancement>,
    ) -> Result<Self, RulesError> {
        let mut seen = BTreeSet::new();
        for advancement in &advancements {
            if !seen.insert(&advancement.id) {
                return Err(RulesError::invalid(format!(
                    "duplicate advancement id {}",
                    advancement.id
                )));
            }
        }
        Ok(Self {
            id: ItemId::new(),
            identifier: identifier.into(),
            name: name.into(),
            advancements,
        })
    }

    pub fn advancements(&self) -> &[Advancement] {
        &self.advancements
    }

    pub fn advancement(&self, id: &AdvancementId) -> Result<&Advancement, RulesError> {
        self.advancements
            .iter()
            .find(|a| &a.id == id)
            .ok_or_else(|| RulesError::not_found(LookupKind::Advancement, id.0.clone()))
    }

    /// Advancements that apply at `level`, in declaration order.
    pub fn advancements_at(&self, level: u8) -> impl Iterator<Item = &Advancement> {
        self.advancements.iter().filter(move |a| a.applies_at(level))
    }
}
