//! Roll configuration.
//!
//! Turns a roll request plus situational modifiers into a fully specified
//! formula and metadata:
//! 1. Decide whether the configuration dialog is skipped (fast-forward)
//! 2. Resolve the advantage mode (explicit flags win over held keys)
//! 3. Build the d20 term (`1d20`, `2d20kh`, `3d20kh`, `r1`, `min10`)
//! 4. Append bonus terms
//!
//! When the dialog is not skipped, a [`RollDialog`] collaborator finishes the
//! configuration or cancels it.

use crate::config::DiceSettings;
use crate::dice::{DiceExpression, DieModifier, DiceTerm};
use crate::error::{Outcome, RulesError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

// ============================================================================
// Advantage
// ============================================================================

/// Advantage state for d20 rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AdvantageMode {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl AdvantageMode {
    /// Combine two advantage states (advantage + disadvantage = normal).
    pub fn combine(self, other: AdvantageMode) -> AdvantageMode {
        match (self, other) {
            (AdvantageMode::Normal, x) | (x, AdvantageMode::Normal) => x,
            (AdvantageMode::Advantage, AdvantageMode::Disadvantage) => AdvantageMode::Normal,
            (AdvantageMode::Disadvantage, AdvantageMode::Advantage) => AdvantageMode::Normal,
            (AdvantageMode::Advantage, AdvantageMode::Advantage) => AdvantageMode::Advantage,
            (AdvantageMode::Disadvantage, AdvantageMode::Disadvantage) => {
                AdvantageMode::Disadvantage
            }
        }
    }
}

impl fmt::Display for AdvantageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvantageMode::Normal => write!(f, "normal"),
            AdvantageMode::Advantage => write!(f, "advantage"),
            AdvantageMode::Disadvantage => write!(f, "disadvantage"),
        }
    }
}

// ============================================================================
// Keybindings
// ============================================================================

/// Modifier keys that can be held while triggering a roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModifierKey {
    Shift,
    Alt,
    Control,
    Meta,
}

/// The input event that triggered a roll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub held: BTreeSet<ModifierKey>,
}

impl InputEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: ModifierKey) -> Self {
        self.held.insert(key);
        self
    }

    pub fn is_held(&self, key: ModifierKey) -> bool {
        self.held.contains(&key)
    }
}

/// Keys that must all be held for a binding to fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCombo {
    pub keys: Vec<ModifierKey>,
}

impl KeyCombo {
    pub fn single(key: ModifierKey) -> Self {
        Self { keys: vec![key] }
    }

    pub fn is_pressed(&self, event: &InputEvent) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(|k| event.is_held(*k))
    }
}

/// Named actions that decide fast-forward behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RollAction {
    SkipDialogNormal,
    SkipDialogAdvantage,
    SkipDialogDisadvantage,
}

/// Lookup of the key combinations bound to an action.
pub trait KeybindingRegistry: Send + Sync {
    fn bindings(&self, action: RollAction) -> Vec<KeyCombo>;

    fn is_pressed(&self, action: RollAction, event: &InputEvent) -> bool {
        self.bindings(action).iter().any(|b| b.is_pressed(event))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A request for a d20 roll (check, save or attack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct D20RollRequest {
    /// Bonus terms appended to the d20 (`@mod`, `@prof`, `2`).
    pub parts: Vec<String>,
    /// Roll data used to resolve `@` references.
    pub data: Value,
    pub advantage: Option<bool>,
    pub disadvantage: Option<bool>,
    pub fast_forward: Option<bool>,
    pub event: Option<InputEvent>,
    /// Natural result at or above which the roll is a critical.
    pub critical: Option<u8>,
    /// Natural result at or below which the roll is a fumble.
    pub fumble: Option<u8>,
    pub target_value: Option<i64>,
    pub halfling_lucky: bool,
    pub reliable_talent: bool,
    pub elven_accuracy: bool,
    pub chat_message: Option<bool>,
    pub flavor: String,
}

impl D20RollRequest {
    pub fn new(flavor: impl Into<String>) -> Self {
        Self {
            parts: Vec::new(),
            data: Value::Object(Default::default()),
            advantage: None,
            disadvantage: None,
            fast_forward: None,
            event: None,
            critical: None,
            fumble: None,
            target_value: None,
            halfling_lucky: false,
            reliable_talent: false,
            elven_accuracy: false,
            chat_message: None,
            flavor: flavor.into(),
        }
    }

    pub fn with_part(mut self, part: impl ToString) -> Self {
        self.parts.push(part.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_advantage(mut self, advantage: bool) -> Self {
        self.advantage = Some(advantage);
        self
    }

    pub fn with_disadvantage(mut self, disadvantage: bool) -> Self {
        self.disadvantage = Some(disadvantage);
        self
    }

    pub fn with_fast_forward(mut self, fast_forward: bool) -> Self {
        self.fast_forward = Some(fast_forward);
        self
    }

    pub fn with_event(mut self, event: InputEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_thresholds(mut self, critical: u8, fumble: u8) -> Self {
        self.critical = Some(critical);
        self.fumble = Some(fumble);
        self
    }

    pub fn with_target(mut self, target: i64) -> Self {
        self.target_value = Some(target);
        self
    }

    pub fn with_chat_message(mut self, chat: bool) -> Self {
        self.chat_message = Some(chat);
        self
    }
}

/// A request for a damage roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRequest {
    pub parts: Vec<String>,
    pub data: Value,
    pub damage_type: Option<String>,
    /// Explicit critical flag. Falls back to the advantage binding.
    pub critical: Option<bool>,
    /// When false the roll is never critical.
    pub allow_critical: bool,
    pub critical_multiplier: Option<u32>,
    /// Extra dice added to the first dice term on a critical.
    pub critical_bonus_dice: u32,
    /// Extra formula appended on a critical.
    pub critical_bonus_damage: Option<String>,
    pub multiply_numeric: Option<bool>,
    pub powerful_critical: Option<bool>,
    pub fast_forward: Option<bool>,
    pub event: Option<InputEvent>,
    pub chat_message: Option<bool>,
    pub flavor: String,
}

impl DamageRequest {
    pub fn new(flavor: impl Into<String>) -> Self {
        Self {
            parts: Vec::new(),
            data: Value::Object(Default::default()),
            damage_type: None,
            critical: None,
            allow_critical: true,
            critical_multiplier: None,
            critical_bonus_dice: 0,
            critical_bonus_damage: None,
            multiply_numeric: None,
            powerful_critical: None,
            fast_forward: None,
            event: None,
            chat_message: None,
            flavor: flavor.into(),
        }
    }

    pub fn with_part(mut self, part: impl ToString) -> Self {
        self.parts.push(part.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_damage_type(mut self, damage_type: impl Into<String>) -> Self {
        self.damage_type = Some(damage_type.into());
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    pub fn with_allow_critical(mut self, allow: bool) -> Self {
        self.allow_critical = allow;
        self
    }

    pub fn with_powerful_critical(mut self, powerful: bool) -> Self {
        self.powerful_critical = Some(powerful);
        self
    }

    pub fn with_critical_bonus_dice(mut self, dice: u32) -> Self {
        self.critical_bonus_dice = dice;
        self
    }

    pub fn with_critical_bonus_damage(mut self, formula: impl Into<String>) -> Self {
        self.critical_bonus_damage = Some(formula.into());
        self
    }

    pub fn with_fast_forward(mut self, fast_forward: bool) -> Self {
        self.fast_forward = Some(fast_forward);
        self
    }

    pub fn with_event(mut self, event: InputEvent) -> Self {
        self.event = Some(event);
        self
    }
}

// ============================================================================
// Configured rolls
// ============================================================================

/// A fully configured d20 roll, ready for evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct D20Roll {
    pub formula: String,
    pub data: Value,
    pub mode: AdvantageMode,
    pub fast_forward: bool,
    pub critical: u8,
    pub fumble: u8,
    pub target_value: Option<i64>,
    pub chat_message: bool,
    pub flavor: String,
}

/// A fully configured damage roll, ready for evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRoll {
    /// Base formula, before critical alteration.
    pub formula: String,
    pub data: Value,
    pub damage_type: Option<String>,
    pub critical: bool,
    pub critical_multiplier: u32,
    pub critical_bonus_dice: u32,
    pub critical_bonus_damage: Option<String>,
    pub multiply_numeric: bool,
    pub powerful_critical: bool,
    pub fast_forward: bool,
    pub chat_message: bool,
    pub flavor: String,
}

// ============================================================================
// Dialog collaborator
// ============================================================================

/// Choices submitted from the d20 configuration dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct D20DialogChoice {
    pub mode: AdvantageMode,
    /// Situational bonus formula typed by the user.
    pub bonus: Option<String>,
}

/// Choices submitted from the damage configuration dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageDialogChoice {
    pub critical: bool,
    pub bonus: Option<String>,
}

/// Interactive roll configuration, shown only when not fast-forwarded.
#[async_trait]
pub trait RollDialog: Send + Sync {
    async fn configure_d20(&self, roll: &D20Roll) -> Outcome<D20DialogChoice>;

    async fn configure_damage(&self, roll: &DamageRoll) -> Outcome<DamageDialogChoice>;
}

// ============================================================================
// Configurator
// ============================================================================

/// Builds formulas and roll metadata from requests.
pub struct RollConfigurator<'a> {
    settings: &'a DiceSettings,
    keybindings: &'a dyn KeybindingRegistry,
}

impl<'a> RollConfigurator<'a> {
    pub fn new(settings: &'a DiceSettings, keybindings: &'a dyn KeybindingRegistry) -> Self {
        Self {
            settings,
            keybindings,
        }
    }

    /// Whether the configuration dialog is skipped.
    ///
    /// An explicit flag wins; otherwise any of the skip bindings being held
    /// fast-forwards.
    pub fn resolve_fast_forward(&self, fast_forward: Option<bool>, event: Option<&InputEvent>) -> bool {
        if let Some(ff) = fast_forward {
            return ff;
        }
        let Some(event) = event else {
            return false;
        };
        [
            RollAction::SkipDialogNormal,
            RollAction::SkipDialogAdvantage,
            RollAction::SkipDialogDisadvantage,
        ]
        .into_iter()
        .any(|action| self.keybindings.is_pressed(action, event))
    }

    /// Resolve the advantage mode.
    ///
    /// Explicit flags win over held keys. Both flags explicitly set is an
    /// error. Both bindings held cancel out.
    pub fn resolve_advantage(
        &self,
        advantage: Option<bool>,
        disadvantage: Option<bool>,
        event: Option<&InputEvent>,
    ) -> Result<AdvantageMode, RulesError> {
        match (advantage, disadvantage) {
            (Some(true), Some(true)) => Err(RulesError::invalid(
                "advantage and disadvantage cannot both be requested",
            )),
            (Some(true), _) => Ok(AdvantageMode::Advantage),
            (_, Some(true)) => Ok(AdvantageMode::Disadvantage),
            (Some(false), _) | (_, Some(false)) => Ok(AdvantageMode::Normal),
            (None, None) => {
                let Some(event) = event else {
                    return Ok(AdvantageMode::Normal);
                };
                let mut mode = AdvantageMode::Normal;
                if self
                    .keybindings
                    .is_pressed(RollAction::SkipDialogAdvantage, event)
                {
                    mode = mode.combine(AdvantageMode::Advantage);
                }
                if self
                    .keybindings
                    .is_pressed(RollAction::SkipDialogDisadvantage, event)
                {
                    mode = mode.combine(AdvantageMode::Disadvantage);
                }
                Ok(mode)
            }
        }
    }

    /// Configure a d20 roll without any dialog.
    pub fn configure_d20(&self, request: &D20RollRequest) -> Result<D20Roll, RulesError> {
        let fast_forward = self.resolve_fast_forward(request.fast_forward, request.event.as_ref());
        let mode = self.resolve_advantage(
            request.advantage,
            request.disadvantage,
            request.event.as_ref(),
        )?;
        self.build_d20(request, mode, fast_forward, None)
    }

    /// Configure a d20 roll, presenting the dialog unless fast-forwarded.
    pub async fn prompt_d20(
        &self,
        request: &D20RollRequest,
        dialog: &dyn RollDialog,
    ) -> Result<Outcome<D20Roll>, RulesError> {
        let roll = self.configure_d20(request)?;
        if roll.fast_forward {
            return Ok(Outcome::Completed(roll));
        }
        match dialog.configure_d20(&roll).await {
            Outcome::Cancelled => {
                debug!(flavor = %roll.flavor, "d20 roll dialog cancelled");
                Ok(Outcome::Cancelled)
            }
            Outcome::Completed(choice) => self
                .build_d20(request, choice.mode, false, choice.bonus.as_deref())
                .map(Outcome::Completed),
        }
    }

    fn build_d20(
        &self,
        request: &D20RollRequest,
        mode: AdvantageMode,
        fast_forward: bool,
        bonus: Option<&str>,
    ) -> Result<D20Roll, RulesError> {
        let critical = request.critical.unwrap_or(self.settings.critical_threshold);
        let fumble = request.fumble.unwrap_or(self.settings.fumble_threshold);
        if !(1..=20).contains(&critical) || fumble < 1 || fumble >= critical {
            return Err(RulesError::invalid(format!(
                "thresholds must satisfy 1 <= fumble < critical <= 20 (fumble {fumble}, critical {critical})"
            )));
        }

        let mut d20 = DiceTerm::new(1, 20);
        if request.halfling_lucky {
            d20 = d20.with_modifier(DieModifier::Reroll(1));
        }
        if request.reliable_talent {
            d20 = d20.with_modifier(DieModifier::Minimum(10));
        }
        match mode {
            AdvantageMode::Advantage => {
                d20.number = if request.elven_accuracy { 3 } else { 2 };
                d20 = d20.with_modifier(DieModifier::KeepHighest(1));
            }
            AdvantageMode::Disadvantage => {
                d20.number = 2;
                d20 = d20.with_modifier(DieModifier::KeepLowest(1));
            }
            AdvantageMode::Normal => {}
        }

        let formula = join_parts(
            std::iter::once(d20.to_string())
                .chain(request.parts.iter().cloned())
                .chain(bonus.map(str::to_string)),
        );
        DiceExpression::parse(&formula)?;
        debug!(%formula, %mode, fast_forward, "configured d20 roll");

        Ok(D20Roll {
            formula,
            data: request.data.clone(),
            mode,
            fast_forward,
            critical,
            fumble,
            target_value: request.target_value,
            chat_message: request.chat_message.unwrap_or(self.settings.chat_messages),
            flavor: request.flavor.clone(),
        })
    }

    /// Configure a damage roll without any dialog.
    pub fn configure_damage(&self, request: &DamageRequest) -> Result<DamageRoll, RulesError> {
        let fast_forward = self.resolve_fast_forward(request.fast_forward, request.event.as_ref());
        let critical = request.critical.unwrap_or_else(|| {
            request.event.as_ref().is_some_and(|event| {
                self.keybindings
                    .is_pressed(RollAction::SkipDialogAdvantage, event)
            })
        });
        self.build_damage(request, critical, fast_forward, None)
    }

    /// Configure a damage roll, presenting the dialog unless fast-forwarded.
    pub async fn prompt_damage(
        &self,
        request: &DamageRequest,
        dialog: &dyn RollDialog,
    ) -> Result<Outcome<DamageRoll>, RulesError> {
        let roll = self.configure_damage(request)?;
        if roll.fast_forward {
            return Ok(Outcome::Completed(roll));
        }
        match dialog.configure_damage(&roll).await {
            Outcome::Cancelled => {
                debug!(flavor = %roll.flavor, "damage roll dialog cancelled");
                Ok(Outcome::Cancelled)
            }
            Outcome::Completed(choice) => self
                .build_damage(request, choice.critical, false, choice.bonus.as_deref())
                .map(Outcome::Completed),
        }
    }

    fn build_damage(
        &self,
        request: &DamageRequest,
        critical: bool,
        fast_forward: bool,
        bonus: Option<&str>,
    ) -> Result<DamageRoll, RulesError> {
        let formula = join_parts(
            request
                .parts
                .iter()
                .cloned()
                .chain(bonus.map(str::to_string)),
        );
        if formula.is_empty() {
            return Err(RulesError::invalid("damage roll has no formula parts"));
        }
        DiceExpression::parse(&formula)?;
        if let Some(extra) = &request.critical_bonus_damage {
            DiceExpression::parse(extra)?;
        }

        let critical_multiplier = request
            .critical_multiplier
            .unwrap_or(self.settings.critical_multiplier);
        if critical_multiplier == 0 {
            return Err(RulesError::invalid("critical multiplier must be at least 1"));
        }

        let critical = critical && request.allow_critical;
        debug!(%formula, critical, fast_forward, "configured damage roll");

        Ok(DamageRoll {
            formula,
            data: request.data.clone(),
            damage_type: request.damage_type.clone(),
            critical,
            critical_multiplier,
            critical_bonus_dice: request.critical_bonus_dice,
            critical_bonus_damage: request.critical_bonus_damage.clone(),
            multiply_numeric: request
                .multiply_numeric
                .unwrap_or(self.settings.multiply_numeric),
            powerful_critical: request
                .powerful_critical
                .unwrap_or(self.settings.powerful_critical),
            fast_forward,
            chat_message: request.chat_message.unwrap_or(self.settings.chat_messages),
            flavor: request.flavor.clone(),
        })
    }
}

/// Join formula parts with `+`, skipping blank ones.
fn join_parts(parts: impl IntoIterator<Item = String>) -> String {
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" + ")
}
