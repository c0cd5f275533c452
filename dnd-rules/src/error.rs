//! Error taxonomy shared by roll resolution and advancement.

use crate::advancement::AdvancementId;
use crate::dice::DiceError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What kind of rules entry a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupKind {
    Ability,
    Skill,
    Tool,
    DamageType,
    Advancement,
    Item,
}

impl LookupKind {
    pub fn name(&self) -> &'static str {
        match self {
            LookupKind::Ability => "ability",
            LookupKind::Skill => "skill",
            LookupKind::Tool => "tool",
            LookupKind::DamageType => "damage type",
            LookupKind::Advancement => "advancement",
            LookupKind::Item => "item",
        }
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Errors from roll configuration, evaluation and advancement.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown {kind} '{key}'")]
    NotFound { kind: LookupKind, key: String },

    #[error("Advancement {advancement} could not be applied at level {level}: {reason}")]
    PartialApplyFailure {
        advancement: AdvancementId,
        level: u8,
        reason: String,
    },

    #[error("Advancement {advancement} at level {level} is out of order: {reason}")]
    LevelOrder {
        advancement: AdvancementId,
        level: u8,
        reason: String,
    },

    #[error("Dice error: {0}")]
    Dice(#[from] DiceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RulesError {
    pub fn invalid(message: impl Into<String>) -> Self {
        RulesError::InvalidConfiguration(message.into())
    }

    pub fn not_found(kind: LookupKind, key: impl Into<String>) -> Self {
        RulesError::NotFound {
            kind,
            key: key.into(),
        }
    }
}

/// Result of an operation that may be dismissed by the user.
///
/// `Cancelled` means nothing was rolled or applied, which is different from a
/// roll that came up zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}
