//! Applying and reversing advancements against a document store.
//!
//! Every mutation goes through the [`DocumentStore`]. An apply that fails
//! after its updates were computed undoes whatever already reached the store
//! (created items, stat changes) before reporting
//! [`RulesError::PartialApplyFailure`].

use super::{
    Advancement, AdvancementId, AdvancementKind, AdvancementStatus, AdvancementUpdates,
    AdvancementValue, AppliedRecord, Direction, HitPointsChoice, NodeKey, ProgressionState, RulesItem,
};
use crate::character::{Character, CharacterDiff, CharacterId, DiffBuilder, ItemId};
use crate::config::AdvancementSettings;
use crate::dice::{EvaluationMode, FormulaEvaluator};
use crate::error::{Outcome, RulesError};
use crate::rules_table::RulesTable;
use crate::store::DocumentStore;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

/// Asks the user for an advancement's value.
#[async_trait]
pub trait AdvancementPrompt: Send + Sync {
    async fn choose(
        &self,
        character: &Character,
        item: &RulesItem,
        advancement: &Advancement,
        level: u8,
    ) -> Outcome<AdvancementValue>;
}

/// Applies advancements through a document store.
pub struct AdvancementEngine<'a> {
    store: &'a dyn DocumentStore,
    evaluator: &'a dyn FormulaEvaluator,
    rules: &'a RulesTable,
    settings: &'a AdvancementSettings,
    prompt: Option<&'a dyn AdvancementPrompt>,
}

impl<'a> AdvancementEngine<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        evaluator: &'a dyn FormulaEvaluator,
        rules: &'a RulesTable,
        settings: &'a AdvancementSettings,
    ) -> Self {
        Self {
            store,
            evaluator,
            rules,
            settings,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: &'a dyn AdvancementPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Validate `value` and store it on the node.
    pub fn configure(
        &self,
        progression: &mut ProgressionState,
        item: &RulesItem,
        advancement: &AdvancementId,
        level: u8,
        value: AdvancementValue,
    ) -> Result<(), RulesError> {
        let node = item.advancement(advancement)?;
        node.validate(level, &value, self.rules)?;
        progression.configure(&NodeKey::new(item.id, advancement.clone(), level), value)
    }

    /// [`configure`](Self::configure) against the stored progression.
    pub async fn configure_stored(
        &self,
        character: CharacterId,
        item: &RulesItem,
        advancement: &AdvancementId,
        level: u8,
        value: AdvancementValue,
    ) -> Result<(), RulesError> {
        let mut progression = self.store.progression(character).await?;
        self.configure(&mut progression, item, advancement, level, value)?;
        self.store.save_progression(character, &progression).await?;
        Ok(())
    }

    /// Apply one advancement at one level.
    ///
    /// Unconfigured nodes with a real choice go to the prompt; a dismissed
    /// prompt yields `Outcome::Cancelled` and changes nothing.
    pub async fn apply(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
        advancement_id: &AdvancementId,
        level: u8,
    ) -> Result<Outcome<Character>, RulesError> {
        let character = self.store.character(character_id).await?;
        let mut progression = self.store.progression(character_id).await?;
        let advancement = item.advancement(advancement_id)?;
        let key = NodeKey::new(item.id, advancement_id.clone(), level);

        if !advancement.applies_at(level) {
            return Err(RulesError::invalid(format!(
                "advancement {} does not apply at level {}",
                advancement_id, level
            )));
        }
        if progression.status(&key) == AdvancementStatus::Applied {
            return Err(RulesError::invalid(format!(
                "advancement {} is already applied at level {}",
                advancement_id, level
            )));
        }
        self.check_apply_order(&character, &progression, item, advancement, level)?;

        let value = match progression.value(&key).cloned() {
            Some(value) => value,
            None => match self.choose_value(&character, item, advancement, level).await? {
                Outcome::Completed(value) => value,
                Outcome::Cancelled => {
                    debug!(advancement = %advancement_id, level, "advancement prompt cancelled");
                    return Ok(Outcome::Cancelled);
                }
            },
        };
        let value = self.resolve_value(advancement, level, value)?;
        advancement.validate(level, &value, self.rules)?;

        let updates = advancement.compute_updates(
            &item.identifier,
            &character,
            level,
            &value,
            Direction::Forward,
        )?;

        let updated = self
            .commit(character_id, &mut progression, &key, value, updates)
            .await?;
        info!(
            character = %character_id,
            advancement = %advancement_id,
            level,
            "applied advancement"
        );
        Ok(Outcome::Completed(updated))
    }

    /// Undo one applied node using only its recorded changes and items.
    pub async fn reverse(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
        advancement_id: &AdvancementId,
        level: u8,
    ) -> Result<Character, RulesError> {
        let mut progression = self.store.progression(character_id).await?;
        let key = NodeKey::new(item.id, advancement_id.clone(), level);

        if progression.status(&key) != AdvancementStatus::Applied {
            return Err(RulesError::invalid(format!(
                "advancement {} is not applied at level {}",
                advancement_id, level
            )));
        }
        if let Some(higher) = progression
            .highest_applied_level(item.id)
            .filter(|l| *l > level)
        {
            return Err(RulesError::LevelOrder {
                advancement: advancement_id.clone(),
                level,
                reason: format!("level {} of {} is still applied", higher, item.name),
            });
        }

        // Items are deleted last. A failed step restores the earlier ones.
        let before = progression.clone();
        let record = progression.mark_reversed(&key).unwrap_or_default();
        self.store
            .update_character(character_id, &record.changes.inverse())
            .await?;
        if let Err(e) = self
            .store
            .save_progression(character_id, &progression)
            .await
        {
            self.restore(character_id, &record.changes, None).await;
            return Err(e.into());
        }
        if !record.added_items.is_empty() {
            if let Err(e) = self
                .store
                .delete_items(character_id, &record.added_items)
                .await
            {
                self.restore(character_id, &record.changes, Some(&before))
                    .await;
                return Err(e.into());
            }
        }

        info!(
            character = %character_id,
            advancement = %advancement_id,
            level,
            "reversed advancement"
        );
        Ok(self.store.character(character_id).await?)
    }

    /// Apply every advancement of `item` at the next character level, then
    /// raise `details.level`. Either all of them apply or none do.
    pub async fn level_up(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
    ) -> Result<Outcome<Character>, RulesError> {
        let character = self.store.character(character_id).await?;
        let level = character.level() + 1;
        if level > self.settings.max_level {
            return Err(RulesError::invalid(format!(
                "{} is already at the maximum level {}",
                character.name, self.settings.max_level
            )));
        }

        let mut applied: Vec<&AdvancementId> = Vec::new();
        for advancement in item.advancements_at(level) {
            let result = self.apply(character_id, item, &advancement.id, level).await;
            match result {
                Ok(Outcome::Completed(_)) => applied.push(&advancement.id),
                Ok(Outcome::Cancelled) => {
                    self.unwind(character_id, item, &applied, level).await;
                    return Ok(Outcome::Cancelled);
                }
                Err(e) => {
                    self.unwind(character_id, item, &applied, level).await;
                    return Err(e);
                }
            }
        }

        let updated = match self.set_level(character_id, level).await {
            Ok(updated) => updated,
            Err(e) => {
                self.unwind(character_id, item, &applied, level).await;
                return Err(e);
            }
        };
        info!(character = %character_id, level, "level up complete");
        Ok(Outcome::Completed(updated))
    }

    /// Reverse every applied advancement of `item` at the current character
    /// level, then lower `details.level`. Either all of them reverse or none
    /// do.
    pub async fn level_down(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
    ) -> Result<Character, RulesError> {
        let character = self.store.character(character_id).await?;
        let level = character.level();
        if level == 0 {
            return Err(RulesError::invalid(format!(
                "{} has no level to remove",
                character.name
            )));
        }
        let progression = self.store.progression(character_id).await?;

        let applied: Vec<&AdvancementId> = item
            .advancements_at(level)
            .filter(|a| {
                progression.status(&NodeKey::new(item.id, a.id.clone(), level))
                    == AdvancementStatus::Applied
            })
            .map(|a| &a.id)
            .collect();

        let mut reversed: Vec<&AdvancementId> = Vec::new();
        for advancement in applied.iter().rev() {
            if let Err(e) = self.reverse(character_id, item, advancement, level).await {
                self.rewind(character_id, item, &reversed, level).await;
                return Err(e);
            }
            reversed.push(*advancement);
        }

        match self.set_level(character_id, level - 1).await {
            Ok(updated) => {
                info!(character = %character_id, level = level - 1, "level down complete");
                Ok(updated)
            }
            Err(e) => {
                self.rewind(character_id, item, &reversed, level).await;
                Err(e)
            }
        }
    }

    fn check_apply_order(
        &self,
        character: &Character,
        progression: &ProgressionState,
        item: &RulesItem,
        advancement: &Advancement,
        level: u8,
    ) -> Result<(), RulesError> {
        let order_error = |reason: String| RulesError::LevelOrder {
            advancement: advancement.id.clone(),
            level,
            reason,
        };

        if level > character.level().saturating_add(1) {
            return Err(order_error(format!(
                "{} is level {}",
                character.name,
                character.level()
            )));
        }
        for other in item.advancements() {
            for lower in other.levels().into_iter().filter(|l| *l < level) {
                let key = NodeKey::new(item.id, other.id.clone(), lower);
                if progression.status(&key) != AdvancementStatus::Applied {
                    return Err(order_error(format!(
                        "{} at level {} has not been applied",
                        other.id, lower
                    )));
                }
            }
        }
        Ok(())
    }

    async fn choose_value(
        &self,
        character: &Character,
        item: &RulesItem,
        advancement: &Advancement,
        level: u8,
    ) -> Result<Outcome<AdvancementValue>, RulesError> {
        if let Some(value) = advancement.default_value(level) {
            return Ok(Outcome::Completed(value));
        }
        let prompt = self.prompt.ok_or_else(|| {
            RulesError::invalid(format!(
                "advancement {} at level {} needs a choice and no prompt is available",
                advancement.id, level
            ))
        })?;
        Ok(prompt.choose(character, item, advancement, level).await)
    }

    /// Pin hit points down to a number: first level takes the maximum when
    /// configured, and `Roll` is rolled now so the result can be recorded.
    fn resolve_value(
        &self,
        advancement: &Advancement,
        level: u8,
        value: AdvancementValue,
    ) -> Result<AdvancementValue, RulesError> {
        let AdvancementKind::HitPoints { hit_die } = &advancement.kind else {
            return Ok(value);
        };
        if level == 1 && self.settings.max_hp_at_first_level {
            return Ok(AdvancementValue::HitPoints(HitPointsChoice::Max));
        }
        match value {
            AdvancementValue::HitPoints(HitPointsChoice::Roll) => {
                let formula = format!("1{}", hit_die);
                let result =
                    self.evaluator
                        .evaluate(&formula, &serde_json::Value::Null, EvaluationMode::Random)?;
                let rolled = u32::try_from(result.total).map_err(|_| {
                    RulesError::invalid(format!("{} rolled {}", formula, result.total))
                })?;
                debug!(%formula, rolled, "rolled hit points");
                Ok(AdvancementValue::HitPoints(HitPointsChoice::Rolled(rolled)))
            }
            other => Ok(other),
        }
    }

    /// Push computed updates to the store, undoing them on any failure.
    async fn commit(
        &self,
        character_id: CharacterId,
        progression: &mut ProgressionState,
        key: &NodeKey,
        value: AdvancementValue,
        updates: AdvancementUpdates,
    ) -> Result<Character, RulesError> {
        let failure = |reason: String| RulesError::PartialApplyFailure {
            advancement: key.advancement.clone(),
            level: key.level,
            reason,
        };

        let mut created: Vec<ItemId> = Vec::new();
        for source in &updates.items_to_add {
            match self.store.create_item(character_id, source).await {
                Ok(item) => created.push(item.id),
                Err(e) => {
                    self.rollback(character_id, &created, None).await;
                    return Err(failure(format!("creating {}: {}", source, e)));
                }
            }
        }

        let updated = match self
            .store
            .update_character(character_id, &updates.changes)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                self.rollback(character_id, &created, None).await;
                return Err(failure(format!("updating character: {}", e)));
            }
        };

        progression.mark_applied(
            key,
            value,
            AppliedRecord {
                changes: updates.changes.clone(),
                added_items: created.clone(),
            },
        );
        if let Err(e) = self
            .store
            .save_progression(character_id, progression)
            .await
        {
            self.rollback(character_id, &created, Some(&updates)).await;
            return Err(failure(format!("saving progression: {}", e)));
        }

        Ok(updated)
    }

    /// Best-effort cleanup after a failed apply.
    async fn rollback(
        &self,
        character_id: CharacterId,
        created: &[ItemId],
        applied: Option<&AdvancementUpdates>,
    ) {
        if !created.is_empty() {
            if let Err(e) = self.store.delete_items(character_id, created).await {
                warn!(character = %character_id, error = %e, "failed to delete items during rollback");
            }
        }
        if let Some(updates) = applied {
            if let Err(e) = self
                .store
                .update_character(character_id, &updates.changes.inverse())
                .await
            {
                warn!(character = %character_id, error = %e, "failed to revert stats during rollback");
            }
        }
    }

    /// Best-effort cleanup after a failed reverse: re-apply the node's
    /// changes and, when given, the progression it had before.
    async fn restore(
        &self,
        character_id: CharacterId,
        changes: &CharacterDiff,
        progression: Option<&ProgressionState>,
    ) {
        if let Err(e) = self.store.update_character(character_id, changes).await {
            warn!(character = %character_id, error = %e, "failed to restore stats after a failed reverse");
        }
        if let Some(progression) = progression {
            if let Err(e) = self.store.save_progression(character_id, progression).await {
                warn!(character = %character_id, error = %e, "failed to restore progression after a failed reverse");
            }
        }
    }

    /// Reverse nodes applied earlier in a failed level up, newest first.
    async fn unwind(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
        applied: &[&AdvancementId],
        level: u8,
    ) {
        for advancement in applied.iter().rev() {
            if let Err(e) = self.reverse(character_id, item, advancement, level).await {
                warn!(advancement = %advancement, level, error = %e, "failed to unwind advancement");
            }
        }
    }

    /// Re-apply nodes reversed earlier in a failed level down, oldest first.
    async fn rewind(
        &self,
        character_id: CharacterId,
        item: &RulesItem,
        reversed: &[&AdvancementId],
        level: u8,
    ) {
        for advancement in reversed.iter().rev() {
            if let Err(e) = self.apply(character_id, item, advancement, level).await {
                warn!(advancement = %advancement, level, error = %e, "failed to restore advancement");
            }
        }
    }

    async fn set_level(&self, character_id: CharacterId, level: u8) -> Result<Character, RulesError> {
        let character = self.store.character(character_id).await?;
        let mut builder = DiffBuilder::new(&character.system);
        builder.set("details.level", json!(level))?;
        Ok(self
            .store
            .update_character(character_id, &builder.finish())
            .await?)
    }
}
