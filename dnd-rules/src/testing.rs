//! Testing utilities for the rules engine.
//!
//! This module provides in-memory collaborators for integration tests:
//! - `MemoryStore` as a `DocumentStore` with failure injection
//! - `ScriptedDialog` and `ScriptedPrompt` returning queued answers
//! - Sample characters and class items

use crate::advancement::{
    Advancement, AdvancementKind, AdvancementPrompt, AdvancementValue, ItemGrantEntry,
    ProgressionState, RulesItem,
};
use crate::character::{Character, CharacterDiff, CharacterId, ItemId, OwnedItem, ProficiencyLevel};
use crate::dice::DieType;
use crate::error::{Outcome, RulesError};
use crate::roll_config::{D20DialogChoice, D20Roll, DamageDialogChoice, DamageRoll, RollDialog};
use crate::rules_table::RulesTable;
use crate::store::{DocumentStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
struct StoreState {
    characters: HashMap<CharacterId, Character>,
    progression: HashMap<CharacterId, ProgressionState>,
    /// Source uuid to item name.
    compendium: HashMap<String, String>,
    /// Number of item creations that succeed before the rest are rejected.
    create_budget: Option<usize>,
    reject_updates: bool,
    reject_deletes: bool,
    reject_progression_saves: bool,
}

/// An in-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_character(mut self, character: Character) -> Self {
        self.state
            .get_mut()
            .characters
            .insert(character.id, character);
        self
    }

    /// Register an entry that items can be created from.
    pub fn with_source(mut self, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        self.state
            .get_mut()
            .compendium
            .insert(uuid.into(), name.into());
        self
    }

    /// Let `count` item creations succeed, then reject the rest.
    pub fn fail_item_creation_after(mut self, count: usize) -> Self {
        self.state.get_mut().create_budget = Some(count);
        self
    }

    /// Reject every character update.
    pub async fn reject_updates(&self, reject: bool) {
        self.state.lock().await.reject_updates = reject;
    }

    /// Reject every item deletion.
    pub async fn reject_deletes(&self, reject: bool) {
        self.state.lock().await.reject_deletes = reject;
    }

    /// Reject every progression save.
    pub async fn reject_progression_saves(&self, reject: bool) {
        self.state.lock().await.reject_progression_saves = reject;
    }

    pub async fn insert_character(&self, character: Character) {
        self.state
            .lock()
            .await
            .characters
            .insert(character.id, character);
    }

    /// Serialized snapshot of a stored character, for byte comparisons.
    pub async fn snapshot(&self, id: CharacterId) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .characters
            .get(&id)
            .and_then(|c| serde_json::to_vec(c).ok())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn character(&self, id: CharacterId) -> Result<Character, StoreError> {
        self.state
            .lock()
            .await
            .characters
            .get(&id)
            .cloned()
            .ok_or(StoreError::CharacterNotFound(id))
    }

    async fn update_character(
        &self,
        id: CharacterId,
        diff: &CharacterDiff,
    ) -> Result<Character, StoreError> {
        let mut state = self.state.lock().await;
        if state.reject_updates {
            return Err(StoreError::Rejected("updates are disabled".to_string()));
        }
        let stored = state
            .characters
            .get_mut(&id)
            .ok_or(StoreError::CharacterNotFound(id))?;

        // Apply to a copy so a bad path leaves the record untouched.
        let mut updated = stored.clone();
        updated.apply_diff(diff)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn create_item(&self, owner: CharacterId, source: &str) -> Result<OwnedItem, StoreError> {
        let mut state = self.state.lock().await;
        let name = state
            .compendium
            .get(source)
            .cloned()
            .ok_or_else(|| StoreError::SourceNotFound(source.to_string()))?;
        if !state.characters.contains_key(&owner) {
            return Err(StoreError::CharacterNotFound(owner));
        }
        if let Some(remaining) = state.create_budget.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::Rejected(format!(
                    "item creation failed for {}",
                    source
                )));
            }
            *remaining -= 1;
        }

        let item = OwnedItem {
            id: ItemId::new(),
            name,
            source: Some(source.to_string()),
        };
        if let Some(character) = state.characters.get_mut(&owner) {
            character.items.push(item.clone());
        }
        Ok(item)
    }

    async fn delete_items(
        &self,
        owner: CharacterId,
        ids: &[ItemId],
    ) -> Result<Vec<ItemId>, StoreError> {
        let mut state = self.state.lock().await;
        if state.reject_deletes {
            return Err(StoreError::Rejected("deletes are disabled".to_string()));
        }
        let character = state
            .characters
            .get_mut(&owner)
            .ok_or(StoreError::CharacterNotFound(owner))?;
        let mut removed = Vec::new();
        character.items.retain(|item| {
            if ids.contains(&item.id) {
                removed.push(item.id);
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn progression(&self, id: CharacterId) -> Result<ProgressionState, StoreError> {
        let state = self.state.lock().await;
        if !state.characters.contains_key(&id) {
            return Err(StoreError::CharacterNotFound(id));
        }
        Ok(state.progression.get(&id).cloned().unwrap_or_default())
    }

    async fn save_progression(
        &self,
        id: CharacterId,
        progression: &ProgressionState,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.reject_progression_saves {
            return Err(StoreError::Rejected("progression saves are disabled".to_string()));
        }
        state.progression.insert(id, progression.clone());
        Ok(())
    }
}

// ============================================================================
// Scripted collaborators
// ============================================================================

/// A roll dialog that returns queued answers. An empty queue cancels.
#[derive(Default)]
pub struct ScriptedDialog {
    d20: Mutex<VecDeque<Outcome<D20DialogChoice>>>,
    damage: Mutex<VecDeque<Outcome<DamageDialogChoice>>>,
    shown: AtomicUsize,
}

impl ScriptedDialog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_d20(mut self, answer: Outcome<D20DialogChoice>) -> Self {
        self.d20.get_mut().push_back(answer);
        self
    }

    pub fn then_damage(mut self, answer: Outcome<DamageDialogChoice>) -> Self {
        self.damage.get_mut().push_back(answer);
        self
    }

    /// How many times a dialog was shown.
    pub fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RollDialog for ScriptedDialog {
    async fn configure_d20(&self, _roll: &D20Roll) -> Outcome<D20DialogChoice> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.d20.lock().await.pop_front().unwrap_or(Outcome::Cancelled)
    }

    async fn configure_damage(&self, _roll: &DamageRoll) -> Outcome<DamageDialogChoice> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.damage
            .lock()
            .await
            .pop_front()
            .unwrap_or(Outcome::Cancelled)
    }
}

/// An advancement prompt that returns queued answers. An empty queue cancels.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<Outcome<AdvancementValue>>>,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, answer: Outcome<AdvancementValue>) -> Self {
        self.answers.get_mut().push_back(answer);
        self
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvancementPrompt for ScriptedPrompt {
    async fn choose(
        &self,
        _character: &Character,
        _item: &RulesItem,
        _advancement: &Advancement,
        _level: u8,
    ) -> Outcome<AdvancementValue> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .await
            .pop_front()
            .unwrap_or(Outcome::Cancelled)
    }
}

// ============================================================================
// Samples
// ============================================================================

/// Compendium uuid of the sample fighting style feature.
pub const FIGHTING_STYLE: &str = "Compendium.classfeatures.fighting-style";
/// Compendium uuid of the sample second wind feature.
pub const SECOND_WIND: &str = "Compendium.classfeatures.second-wind";
/// Compendium uuid of the sample action surge feature.
pub const ACTION_SURGE: &str = "Compendium.classfeatures.action-surge";

/// A level 0 fighter-to-be with standard array scores.
pub fn sample_fighter(rules: &RulesTable) -> Character {
    Character::new("Roderick", rules)
        .with_ability("str", 16)
        .with_ability("dex", 14)
        .with_ability("con", 15)
        .with_ability("int", 8)
        .with_ability("wis", 12)
        .with_ability("cha", 10)
        .with_skill("ath", ProficiencyLevel::Proficient)
}

/// A store holding `character` and the sample compendium entries.
pub fn sample_store(character: Character) -> MemoryStore {
    MemoryStore::new()
        .with_character(character)
        .with_source(FIGHTING_STYLE, "Fighting Style")
        .with_source(SECOND_WIND, "Second Wind")
        .with_source(ACTION_SURGE, "Action Surge")
}

/// A fighter class with hit points, saves, features and an improvement.
pub fn sample_fighter_class() -> Result<RulesItem, RulesError> {
    RulesItem::new(
        "fighter",
        "Fighter",
        vec![
            Advancement::new(
                "hit-points",
                "Hit Points",
                AdvancementKind::HitPoints {
                    hit_die: DieType::D10,
                },
            ),
            Advancement::new(
                "saves",
                "Saving Throws",
                AdvancementKind::Trait {
                    level: 1,
                    grants: vec!["saves:str".into(), "saves:con".into()],
                    choices: Vec::new(),
                    choose: 0,
                },
            ),
            Advancement::new(
                "features-1",
                "Features",
                AdvancementKind::ItemGrant {
                    level: 1,
                    items: vec![
                        ItemGrantEntry::required(FIGHTING_STYLE),
                        ItemGrantEntry::required(SECOND_WIND),
                    ],
                },
            ),
            Advancement::new(
                "second-wind",
                "Second Wind",
                AdvancementKind::ScaleValue {
                    identifier: "second-wind".into(),
                    scale: [(1, "1d10".to_string()), (2, "1d10 + 1".to_string())].into(),
                },
            ),
            Advancement::new(
                "features-2",
                "Features",
                AdvancementKind::ItemGrant {
                    level: 2,
                    items: vec![ItemGrantEntry::required(ACTION_SURGE)],
                },
            ),
            Advancement::new(
                "asi-4",
                "Ability Score Improvement",
                AdvancementKind::AbilityScoreImprovement {
                    level: 4,
                    points: 2,
                    cap: 20,
                    fixed: Default::default(),
                },
            ),
        ],
    )
}
