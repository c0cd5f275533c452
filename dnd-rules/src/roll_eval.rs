//! Roll evaluation.
//!
//! Evaluates configured rolls through a [`FormulaEvaluator`] and applies the
//! critical-hit rules. Nothing here posts chat messages; results only carry
//! whether a message was requested.

use crate::dice::{
    DiceError, DiceExpression, EvaluationMode, FormulaEvaluator, RollResult, Term, TermKind, MAX_DICE,
};
use crate::error::RulesError;
use crate::roll_config::{AdvantageMode, D20Roll, DamageRoll};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Flavor attached to the maximized dice of a powerful critical.
pub const POWERFUL_CRITICAL_FLAVOR: &str = "powerful critical";

/// Result of a d20 roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct D20RollResult {
    pub roll: RollResult,
    pub total: i64,
    /// The kept d20 result.
    pub natural: u32,
    pub mode: AdvantageMode,
    pub is_critical: bool,
    pub is_fumble: bool,
    /// Whether the total met the target, when one was set.
    pub success: Option<bool>,
    /// Whether the caller asked for the result to be posted to chat.
    pub post_to_chat: bool,
    pub flavor: String,
}

/// Result of a damage roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageRollResult {
    pub roll: RollResult,
    pub total: i64,
    pub critical: bool,
    pub damage_type: Option<String>,
    pub post_to_chat: bool,
    pub flavor: String,
}

/// Evaluates configured rolls.
pub struct RollEvaluator<'a> {
    evaluator: &'a dyn FormulaEvaluator,
}

impl<'a> RollEvaluator<'a> {
    pub fn new(evaluator: &'a dyn FormulaEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluate_d20(&self, roll: &D20Roll) -> Result<D20RollResult, RulesError> {
        let result = self
            .evaluator
            .evaluate(&roll.formula, &roll.data, EvaluationMode::Random)?;
        let natural = result
            .first_die()
            .ok_or_else(|| RulesError::invalid(format!("'{}' has no d20 term", roll.formula)))?;

        let is_critical = natural >= roll.critical as u32;
        let is_fumble = natural <= roll.fumble as u32;
        let success = roll.target_value.map(|target| result.total >= target);
        debug!(
            formula = %result.formula,
            total = result.total,
            natural,
            is_critical,
            is_fumble,
            "evaluated d20 roll"
        );

        Ok(D20RollResult {
            total: result.total,
            roll: result,
            natural,
            mode: roll.mode,
            is_critical,
            is_fumble,
            success,
            post_to_chat: roll.chat_message,
            flavor: roll.flavor.clone(),
        })
    }

    /// The formula actually rolled for a damage roll.
    ///
    /// On a critical each dice term is multiplied by the critical multiplier
    /// and the first one gains the bonus dice. With a powerful critical the
    /// extra dice are not rolled: their maximum is appended as a flat term.
    /// Numeric terms are multiplied when `multiply_numeric` is set, and the
    /// critical bonus damage is appended last.
    pub fn critical_formula(roll: &DamageRoll) -> Result<String, RulesError> {
        let mut expr = DiceExpression::parse(&roll.formula)?.resolve(&roll.data)?;
        if !roll.critical {
            return Ok(expr.to_string());
        }

        let multiplier = roll.critical_multiplier.max(1);
        let out_of_range = || {
            RulesError::invalid(format!(
                "critical damage for '{}' is out of range (multiplier {}, {} bonus dice)",
                roll.formula, multiplier, roll.critical_bonus_dice
            ))
        };
        let mut flat_bonus: i64 = 0;
        let mut first_dice = true;

        for term in expr.terms.iter_mut() {
            match &mut term.kind {
                TermKind::Dice(dice) => {
                    let bonus = if first_dice { roll.critical_bonus_dice } else { 0 };
                    first_dice = false;
                    let extra = dice
                        .number
                        .checked_mul(multiplier - 1)
                        .and_then(|n| n.checked_add(bonus))
                        .ok_or_else(out_of_range)?;
                    if roll.powerful_critical {
                        let maximum = (extra as i64)
                            .checked_mul(dice.faces as i64)
                            .ok_or_else(out_of_range)?;
                        flat_bonus = flat_bonus
                            .checked_add(term.sign.apply(maximum))
                            .ok_or_else(out_of_range)?;
                    } else {
                        dice.number = dice
                            .number
                            .checked_add(extra)
                            .filter(|n| *n <= MAX_DICE)
                            .ok_or_else(out_of_range)?;
                    }
                }
                TermKind::Number(value) if roll.multiply_numeric => {
                    *value = value
                        .checked_mul(multiplier as i64)
                        .ok_or_else(out_of_range)?;
                }
                _ => {}
            }
        }

        if flat_bonus != 0 {
            expr.terms
                .push(Term::number(flat_bonus).with_flavor(POWERFUL_CRITICAL_FLAVOR));
        }

        if let Some(extra) = &roll.critical_bonus_damage {
            let extra = DiceExpression::parse(extra)?.resolve(&roll.data)?;
            expr.terms.extend(extra.terms);
        }

        Ok(expr.to_string())
    }

    pub fn evaluate_damage(&self, roll: &DamageRoll) -> Result<DamageRollResult, RulesError> {
        let formula = Self::critical_formula(roll)?;
        let result = self
            .evaluator
            .evaluate(&formula, &roll.data, EvaluationMode::Random)?;
        debug!(
            formula = %result.formula,
            total = result.total,
            critical = roll.critical,
            "evaluated damage roll"
        );

        Ok(DamageRollResult {
            total: result.total,
            roll: result,
            critical: roll.critical,
            damage_type: roll.damage_type.clone(),
            post_to_chat: roll.chat_message,
            flavor: roll.flavor.clone(),
        })
    }

    /// Average of a formula: `floor((min + max) / 2)`.
    pub fn average(&self, formula: &str, data: &Value) -> Result<i64, RulesError> {
        let min = self
            .evaluator
            .evaluate(formula, data, EvaluationMode::Minimize)?;
        let max = self
            .evaluator
            .evaluate(formula, data, EvaluationMode::Maximize)?;
        let sum = min
            .total
            .checked_add(max.total)
            .ok_or_else(|| DiceError::Overflow(formula.to_string()))?;
        Ok(sum.div_euclid(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiceSettings, KeybindingConfig};
    use crate::dice::{DiceRoller, TermResult};
    use crate::roll_config::{D20RollRequest, DamageRequest, RollConfigurator};
    use serde_json::json;

    /// Evaluator that always uses one mode.
    struct FixedMode(EvaluationMode);

    impl FormulaEvaluator for FixedMode {
        fn evaluate(
            &self,
            formula: &str,
            data: &Value,
            _mode: EvaluationMode,
        ) -> Result<RollResult, DiceError> {
            DiceRoller::seeded(0).evaluate(formula, data, self.0)
        }
    }

    fn damage_roll(request: DamageRequest) -> DamageRoll {
        let settings = DiceSettings::default();
        let keys = KeybindingConfig::default();
        RollConfigurator::new(&settings, &keys)
            .configure_damage(&request)
            .unwrap()
    }

    fn d20_roll(request: D20RollRequest) -> D20Roll {
        let settings = DiceSettings::default();
        let keys = KeybindingConfig::default();
        RollConfigurator::new(&settings, &keys)
            .configure_d20(&request)
            .unwrap()
    }

    #[test]
    fn test_critical_doubles_dice_not_total() {
        let roll = damage_roll(
            DamageRequest::new("Longsword")
                .with_part("1d8 + @mod")
                .with_data(json!({ "mod": 3 }))
                .with_critical(true),
        );
        assert_eq!(RollEvaluator::critical_formula(&roll).unwrap(), "2d8 + 3");
    }

    #[test]
    fn test_critical_bonus_dice_and_damage() {
        let roll = damage_roll(
            DamageRequest::new("Greataxe")
                .with_part("1d12 + 2d6[fire] + 4")
                .with_critical(true)
                .with_critical_bonus_dice(1)
                .with_critical_bonus_damage("1d6[necrotic]"),
        );
        assert_eq!(
            RollEvaluator::critical_formula(&roll).unwrap(),
            "3d12 + 4d6[fire] + 4 + 1d6[necrotic]"
        );
    }

    #[test]
    fn test_multiply_numeric() {
        let mut roll = damage_roll(
            DamageRequest::new("Dagger")
                .with_part("1d4 + 3")
                .with_critical(true),
        );
        roll.multiply_numeric = true;
        assert_eq!(RollEvaluator::critical_formula(&roll).unwrap(), "2d4 + 6");
    }

    #[test]
    fn test_powerful_critical_maximizes_extra_dice() {
        let roll = damage_roll(
            DamageRequest::new("Longsword")
                .with_part("1d8 + 3")
                .with_critical(true)
                .with_powerful_critical(true)
                .with_critical_bonus_dice(1),
        );
        assert_eq!(
            RollEvaluator::critical_formula(&roll).unwrap(),
            "1d8 + 3 + 16[powerful critical]"
        );

        let roller = DiceRoller::seeded(11);
        let evaluator = RollEvaluator::new(&roller);
        for _ in 0..50 {
            let result = evaluator.evaluate_damage(&roll).unwrap();
            let bonus = result
                .roll
                .terms
                .iter()
                .find(|t| t.flavor() == Some(POWERFUL_CRITICAL_FLAVOR))
                .unwrap();
            assert!(matches!(bonus, TermResult::Number { value: 16, .. }));
            assert!(result.total >= 1 + 3 + 16 && result.total <= 8 + 3 + 16);
        }
    }

    #[test]
    fn test_non_critical_formula_is_resolved_base() {
        let roll = damage_roll(
            DamageRequest::new("Sneak Attack")
                .with_part("@scale.rogue.sneak-attack")
                .with_data(json!({ "scale": { "rogue": { "sneak-attack": "3d6" } } })),
        );
        assert_eq!(RollEvaluator::critical_formula(&roll).unwrap(), "3d6");
    }

    #[test]
    fn test_natural_twenty_and_one() {
        let roll = d20_roll(
            D20RollRequest::new("Attack")
                .with_part(5)
                .with_target(15)
                .with_chat_message(false),
        );

        let high = FixedMode(EvaluationMode::Maximize);
        let result = RollEvaluator::new(&high).evaluate_d20(&roll).unwrap();
        assert_eq!(result.natural, 20);
        assert_eq!(result.total, 25);
        assert!(result.is_critical);
        assert_eq!(result.success, Some(true));
        assert!(!result.post_to_chat);

        let low = FixedMode(EvaluationMode::Minimize);
        let result = RollEvaluator::new(&low).evaluate_d20(&roll).unwrap();
        assert_eq!(result.natural, 1);
        assert!(result.is_fumble);
        assert_eq!(result.success, Some(false));
    }

    #[test]
    fn test_lowered_critical_threshold() {
        let roll = d20_roll(D20RollRequest::new("Attack").with_thresholds(19, 1));
        let roller = DiceRoller::seeded(5);
        let evaluator = RollEvaluator::new(&roller);
        for _ in 0..100 {
            let result = evaluator.evaluate_d20(&roll).unwrap();
            assert_eq!(result.is_critical, result.natural >= 19);
        }
    }

    #[test]
    fn test_average() {
        let roller = DiceRoller::new();
        let evaluator = RollEvaluator::new(&roller);
        assert_eq!(evaluator.average("2d6", &Value::Null).unwrap(), 7);
        assert_eq!(evaluator.average("1d8 + 2", &Value::Null).unwrap(), 6);
        assert_eq!(
            evaluator
                .average("@dice", &json!({ "dice": "3d6" }))
                .unwrap(),
            10
        );
    }

    #[test]
    fn test_oversized_critical_is_rejected() {
        let mut roll = damage_roll(
            DamageRequest::new("Smite")
                .with_part("2d6")
                .with_critical(true),
        );
        roll.critical_multiplier = u32::MAX;
        assert!(matches!(
            RollEvaluator::critical_formula(&roll),
            Err(RulesError::InvalidConfiguration(_))
        ));

        roll.critical_multiplier = 2;
        roll.critical_bonus_dice = u32::MAX;
        assert!(matches!(
            RollEvaluator::critical_formula(&roll),
            Err(RulesError::InvalidConfiguration(_))
        ));

        roll.powerful_critical = true;
        assert!(matches!(
            RollEvaluator::critical_formula(&roll),
            Err(RulesError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_multiplied_number_overflow_is_rejected() {
        let mut roll = damage_roll(
            DamageRequest::new("Bolt")
                .with_part("1d4 + 9223372036854775807")
                .with_critical(true),
        );
        roll.multiply_numeric = true;
        assert!(matches!(
            RollEvaluator::critical_formula(&roll),
            Err(RulesError::InvalidConfiguration(_))
        ));
    }
}
