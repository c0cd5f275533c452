//! D&D 5e roll resolution and character advancement engine.
//!
//! This crate provides:
//! - Roll configuration from requests, held keys and dialog choices
//! - Roll evaluation with critical hit rules and averages
//! - Level-gated advancement that can be applied and reversed exactly
//! - Inline roll links resolved into plain-text labels
//!
//! Persistence, dialogs and key bindings are collaborators supplied by the
//! host through the traits in [`store`], [`roll_config`] and [`advancement`].
//!
//! # Quick Start
//!
//! ```ignore
//! use dnd_rules::{DiceRoller, D20RollRequest, KeybindingConfig, RollConfigurator, RollEvaluator, RulesConfig};
//!
//! let config = RulesConfig::default();
//! let configurator = RollConfigurator::new(&config.dice, &config.keybindings);
//! let roll = configurator.configure_d20(&D20RollRequest::new("Attack").with_part(5).with_advantage(true))?;
//!
//! let roller = DiceRoller::new();
//! let result = RollEvaluator::new(&roller).evaluate_d20(&roll)?;
//! println!("{}", result.roll);
//! ```

pub mod advancement;
pub mod character;
pub mod checks;
pub mod config;
pub mod dice;
pub mod enricher;
pub mod error;
pub mod roll_config;
pub mod roll_eval;
pub mod rules_table;
pub mod store;
pub mod testing;

// Primary public API
pub use advancement::{
    Advancement, AdvancementEngine, AdvancementId, AdvancementKind, AdvancementPrompt,
    AdvancementStatus, AdvancementUpdates, AdvancementValue, Direction, HitPointsChoice,
    ProgressionState, RulesItem,
};
pub use character::{
    ChangeOp, Character, CharacterDiff, CharacterId, ItemId, OwnedItem, StatChange,
};
pub use config::{ConfigError, DiceSettings, KeybindingConfig, RulesConfig};
pub use dice::{DiceError, DiceExpression, DiceRoller, EvaluationMode, FormulaEvaluator, RollResult};
pub use enricher::{EnrichedText, Enricher, InlineLink};
pub use error::{Outcome, RulesError};
pub use roll_config::{
    AdvantageMode, D20Roll, D20RollRequest, DamageRequest, DamageRoll, InputEvent,
    KeybindingRegistry, ModifierKey, RollConfigurator, RollDialog,
};
pub use roll_eval::{D20RollResult, DamageRollResult, RollEvaluator};
pub use rules_table::{RulesTable, SRD};
pub use store::{DocumentStore, StoreError};
