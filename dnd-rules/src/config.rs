//! Rules engine configuration.
//!
//! Every section has defaults matching the 5e rules as written, so a config
//! file only needs the keys it changes.

use crate::roll_config::{KeyCombo, KeybindingRegistry, ModifierKey, RollAction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Dice and critical-hit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiceSettings {
    /// Natural d20 result at or above which a roll is critical.
    pub critical_threshold: u8,
    /// Natural d20 result at or below which a roll is a fumble.
    pub fumble_threshold: u8,
    /// How many times dice are multiplied on a critical.
    pub critical_multiplier: u32,
    /// Whether numeric damage terms are multiplied on a critical too.
    pub multiply_numeric: bool,
    /// Maximize critical dice instead of rolling them.
    pub powerful_critical: bool,
    /// Whether rolls request a chat message by default.
    pub chat_messages: bool,
}

impl Default for DiceSettings {
    fn default() -> Self {
        Self {
            critical_threshold: 20,
            fumble_threshold: 1,
            critical_multiplier: 2,
            multiply_numeric: false,
            powerful_critical: false,
            chat_messages: true,
        }
    }
}

/// Key combinations for the fast-forward actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeybindingConfig {
    pub skip_normal: Vec<KeyCombo>,
    pub skip_advantage: Vec<KeyCombo>,
    pub skip_disadvantage: Vec<KeyCombo>,
}

impl Default for KeybindingConfig {
    fn default() -> Self {
        Self {
            skip_normal: vec![KeyCombo::single(ModifierKey::Shift)],
            skip_advantage: vec![KeyCombo::single(ModifierKey::Alt)],
            skip_disadvantage: vec![
                KeyCombo::single(ModifierKey::Control),
                KeyCombo::single(ModifierKey::Meta),
            ],
        }
    }
}

impl KeybindingRegistry for KeybindingConfig {
    fn bindings(&self, action: RollAction) -> Vec<KeyCombo> {
        match action {
            RollAction::SkipDialogNormal => self.skip_normal.clone(),
            RollAction::SkipDialogAdvantage => self.skip_advantage.clone(),
            RollAction::SkipDialogDisadvantage => self.skip_disadvantage.clone(),
        }
    }
}

/// Advancement settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancementSettings {
    pub max_level: u8,
    /// Hit points at the first level always take the maximum die value.
    pub max_hp_at_first_level: bool,
}

impl Default for AdvancementSettings {
    fn default() -> Self {
        Self {
            max_level: 20,
            max_hp_at_first_level: true,
        }
    }
}

/// Complete rules engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub dice: DiceSettings,
    pub keybindings: KeybindingConfig,
    pub advancement: AdvancementSettings,
}

impl RulesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dice(mut self, dice: DiceSettings) -> Self {
        self.dice = dice;
        self
    }

    pub fn with_keybindings(mut self, keybindings: KeybindingConfig) -> Self {
        self.keybindings = keybindings;
        self
    }

    pub fn with_advancement(mut self, advancement: AdvancementSettings) -> Self {
        self.advancement = advancement;
        self
    }

    pub fn with_powerful_critical(mut self, enabled: bool) -> Self {
        self.dice.powerful_critical = enabled;
        self
    }

    pub fn with_critical_threshold(mut self, threshold: u8) -> Self {
        self.dice.critical_threshold = threshold;
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dice = &self.dice;
        if !(1..=20).contains(&dice.critical_threshold) {
            return Err(ConfigError::Invalid(format!(
                "critical threshold {} is outside 1-20",
                dice.critical_threshold
            )));
        }
        if dice.fumble_threshold < 1 || dice.fumble_threshold >= dice.critical_threshold {
            return Err(ConfigError::Invalid(format!(
                "fumble threshold {} must be at least 1 and below the critical threshold",
                dice.fumble_threshold
            )));
        }
        if dice.critical_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "critical multiplier must be at least 1".to_string(),
            ));
        }
        if self.advancement.max_level == 0 {
            return Err(ConfigError::Invalid(
                "max level must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON file. Missing keys take their defaults.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RulesConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RulesConfig =
            serde_json::from_str(r#"{ "dice": { "powerful_critical": true } }"#).unwrap();
        assert!(config.dice.powerful_critical);
        assert_eq!(config.dice.critical_threshold, 20);
        assert_eq!(config.advancement.max_level, 20);
        assert_eq!(config.keybindings, KeybindingConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let config = RulesConfig::new().with_critical_threshold(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RulesConfig::new().with_critical_threshold(19);
        config.dice.fumble_threshold = 19;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");

        let config = RulesConfig::new()
            .with_powerful_critical(true)
            .with_critical_threshold(19);
        config.save_json(&path).await.unwrap();

        let loaded = RulesConfig::load_json(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"{ "dice": { "critical_multiplier": 0 } }"#)
            .await
            .unwrap();
        assert!(matches!(
            RulesConfig::load_json(&path).await,
            Err(ConfigError::Invalid(_))
        ));
    }
}
