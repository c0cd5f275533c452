//! D&D dice formula engine.
//!
//! Supports sums of dice terms (`2d6`, `2d20kh`, `1d20r1min10`), integer
//! terms, `@path` references into a roll data context, and flavor
//! annotations such as `2d6[fire]`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Error type for dice parsing and rolling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("Invalid dice notation: {0}")]
    InvalidNotation(String),
    #[error("Invalid die size: {0}")]
    InvalidDieSize(u32),
    #[error("No dice specified")]
    NoDice,
    #[error("Cannot keep {keep} dice when only rolling {count} (in {notation})")]
    InvalidKeepCount {
        keep: u32,
        count: u32,
        notation: String,
    },
    #[error("Unresolved formula variable: @{0}")]
    UnresolvedVariable(String),
    #[error("Formula variable refers back to itself or nests too deeply: @{0}")]
    CircularVariable(String),
    #[error("Too many dice: {0} (at most {MAX_DICE} per term)")]
    TooManyDice(u32),
    #[error("Formula total is out of range: {0}")]
    Overflow(String),
}

/// Most dice a single term may roll.
pub const MAX_DICE: u32 = 1000;

/// Deepest chain of formula-valued variables that is followed.
const MAX_VARIABLE_DEPTH: usize = 16;

/// Standard D&D die types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DieType {
    D4,
    D6,
    D8,
    D10,
    D12,
    D20,
    D100,
}

impl DieType {
    pub fn sides(&self) -> u32 {
        match self {
            DieType::D4 => 4,
            DieType::D6 => 6,
            DieType::D8 => 8,
            DieType::D10 => 10,
            DieType::D12 => 12,
            DieType::D20 => 20,
            DieType::D100 => 100,
        }
    }

    /// Fixed value taken instead of rolling (half the die, rounded up, plus one
    /// for even dice: d6 = 4, d8 = 5, d10 = 6, d12 = 7).
    pub fn fixed_average(&self) -> u32 {
        self.sides() / 2 + 1
    }
}

impl fmt::Display for DieType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.sides())
    }
}

/// Whether a term is added to or subtracted from the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Sign {
    #[default]
    Plus,
    Minus,
}

impl Sign {
    pub fn flip(self) -> Sign {
        match self {
            Sign::Plus => Sign::Minus,
            Sign::Minus => Sign::Plus,
        }
    }

    pub fn combine(self, other: Sign) -> Sign {
        if self == other {
            Sign::Plus
        } else {
            Sign::Minus
        }
    }

    pub fn apply(self, value: i64) -> i64 {
        match self {
            Sign::Plus => value,
            Sign::Minus => -value,
        }
    }
}

/// A modifier attached to a dice term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DieModifier {
    /// `kh[n]`: keep the n highest results.
    KeepHighest(u32),
    /// `kl[n]`: keep the n lowest results.
    KeepLowest(u32),
    /// `min<n>`: results below n count as n.
    Minimum(u32),
    /// `r[n]`: reroll once any result equal to n.
    Reroll(u32),
}

impl fmt::Display for DieModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DieModifier::KeepHighest(1) => write!(f, "kh"),
            DieModifier::KeepHighest(n) => write!(f, "kh{n}"),
            DieModifier::KeepLowest(1) => write!(f, "kl"),
            DieModifier::KeepLowest(n) => write!(f, "kl{n}"),
            DieModifier::Minimum(n) => write!(f, "min{n}"),
            DieModifier::Reroll(n) => write!(f, "r{n}"),
        }
    }
}

/// A pool of identical dice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceTerm {
    pub number: u32,
    pub faces: u32,
    pub modifiers: Vec<DieModifier>,
}

impl DiceTerm {
    pub fn new(number: u32, faces: u32) -> Self {
        Self {
            number,
            faces,
            modifiers: Vec::new(),
        }
    }

    pub fn with_modifier(mut self, modifier: DieModifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// Highest total this pool can produce.
    pub fn maximum(&self) -> i64 {
        let counted = self
            .modifiers
            .iter()
            .find_map(|m| match m {
                DieModifier::KeepHighest(k) | DieModifier::KeepLowest(k) => Some(*k),
                _ => None,
            })
            .unwrap_or(self.number)
            .min(self.number);
        counted as i64 * self.faces as i64
    }
}

impl fmt::Display for DiceTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d{}", self.number, self.faces)?;
        for modifier in &self.modifiers {
            write!(f, "{modifier}")?;
        }
        Ok(())
    }
}

/// What a single term of a formula is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermKind {
    Dice(DiceTerm),
    Number(i64),
    /// `@path` reference, replaced from roll data before rolling.
    Variable(String),
}

/// One signed term of a dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub sign: Sign,
    pub kind: TermKind,
    pub flavor: Option<String>,
}

impl Term {
    pub fn dice(dice: DiceTerm) -> Self {
        Self {
            sign: Sign::Plus,
            kind: TermKind::Dice(dice),
            flavor: None,
        }
    }

    pub fn number(value: i64) -> Self {
        let sign = if value < 0 { Sign::Minus } else { Sign::Plus };
        Self {
            sign,
            kind: TermKind::Number(value.saturating_abs()),
            flavor: None,
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = Some(flavor.into());
        self
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TermKind::Dice(dice) => write!(f, "{dice}")?,
            TermKind::Number(n) => write!(f, "{n}")?,
            TermKind::Variable(path) => write!(f, "@{path}")?,
        }
        if let Some(flavor) = &self.flavor {
            write!(f, "[{flavor}]")?;
        }
        Ok(())
    }
}

/// A complete dice expression (e.g., `2d6 + @mod + 3`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    pub terms: Vec<Term>,
}

impl DiceExpression {
    /// Parse a dice formula.
    pub fn parse(formula: &str) -> Result<Self, DiceError> {
        let formula = formula.trim();
        if formula.is_empty() {
            return Err(DiceError::NoDice);
        }

        let bytes = formula.as_bytes();
        let mut pos = 0;
        let mut terms = Vec::new();

        loop {
            let mut sign = Sign::Plus;
            let mut saw_operator = false;
            loop {
                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                match bytes.get(pos) {
                    Some(b'+') => {
                        saw_operator = true;
                        pos += 1;
                    }
                    Some(b'-') => {
                        saw_operator = true;
                        sign = sign.flip();
                        pos += 1;
                    }
                    _ => break,
                }
            }
            if pos >= bytes.len() {
                if saw_operator || terms.is_empty() {
                    return Err(DiceError::InvalidNotation(formula.to_string()));
                }
                break;
            }
            if !terms.is_empty() && !saw_operator {
                return Err(DiceError::InvalidNotation(formula.to_string()));
            }

            let start = pos;
            while pos < bytes.len()
                && !matches!(bytes[pos], b'+' | b'-' | b'[')
                && !bytes[pos].is_ascii_whitespace()
            {
                pos += 1;
            }
            // Hyphenated variable names such as `@scale.rogue.sneak-attack`.
            while bytes[start] == b'@'
                && pos + 1 < bytes.len()
                && bytes[pos] == b'-'
                && bytes[pos + 1].is_ascii_alphabetic()
            {
                pos += 1;
                while pos < bytes.len()
                    && !matches!(bytes[pos], b'+' | b'-' | b'[')
                    && !bytes[pos].is_ascii_whitespace()
                {
                    pos += 1;
                }
            }
            let token = &formula[start..pos];
            let kind = Self::parse_term(token)?;

            let flavor = if bytes.get(pos) == Some(&b'[') {
                let close = formula[pos..]
                    .find(']')
                    .ok_or_else(|| DiceError::InvalidNotation(formula.to_string()))?;
                let flavor = formula[pos + 1..pos + close].trim().to_string();
                pos += close + 1;
                Some(flavor)
            } else {
                None
            };

            terms.push(Term { sign, kind, flavor });

            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }
        }

        Ok(DiceExpression { terms })
    }

    fn parse_term(token: &str) -> Result<TermKind, DiceError> {
        if let Some(path) = token.strip_prefix('@') {
            let path = path.trim_end_matches('.');
            if path.is_empty() {
                return Err(DiceError::InvalidNotation(token.to_string()));
            }
            return Ok(TermKind::Variable(path.to_string()));
        }

        let lower = token.to_lowercase();
        if lower.chars().all(|c| c.is_ascii_digit()) {
            let value: i64 = lower
                .parse()
                .map_err(|_| DiceError::InvalidNotation(token.to_string()))?;
            return Ok(TermKind::Number(value));
        }

        let d_pos = lower
            .find('d')
            .ok_or_else(|| DiceError::InvalidNotation(token.to_string()))?;
        let count_str = &lower[..d_pos];
        let rest = &lower[d_pos + 1..];

        let number: u32 = if count_str.is_empty() {
            1
        } else {
            count_str
                .parse()
                .map_err(|_| DiceError::InvalidNotation(token.to_string()))?
        };
        if number == 0 {
            return Err(DiceError::InvalidNotation(token.to_string()));
        }
        if number > MAX_DICE {
            return Err(DiceError::TooManyDice(number));
        }

        let faces_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if faces_len == 0 {
            return Err(DiceError::InvalidNotation(token.to_string()));
        }
        let faces: u32 = rest[..faces_len]
            .parse()
            .map_err(|_| DiceError::InvalidNotation(token.to_string()))?;
        if faces == 0 {
            return Err(DiceError::InvalidDieSize(faces));
        }

        let mut modifiers = Vec::new();
        let mut remaining = &rest[faces_len..];
        while !remaining.is_empty() {
            let (modifier, tail) = if let Some(tail) = remaining.strip_prefix("kh") {
                let (n, tail) = take_number(tail);
                (DieModifier::KeepHighest(n.unwrap_or(1)), tail)
            } else if let Some(tail) = remaining.strip_prefix("kl") {
                let (n, tail) = take_number(tail);
                (DieModifier::KeepLowest(n.unwrap_or(1)), tail)
            } else if let Some(tail) = remaining.strip_prefix("min") {
                let (n, tail) = take_number(tail);
                let n = n.ok_or_else(|| DiceError::InvalidNotation(token.to_string()))?;
                (DieModifier::Minimum(n), tail)
            } else if let Some(tail) = remaining.strip_prefix('r') {
                let tail = tail.strip_prefix('=').unwrap_or(tail);
                let (n, tail) = take_number(tail);
                (DieModifier::Reroll(n.unwrap_or(1)), tail)
            } else {
                return Err(DiceError::InvalidNotation(token.to_string()));
            };
            if let DieModifier::KeepHighest(keep) | DieModifier::KeepLowest(keep) = modifier {
                if keep > number {
                    return Err(DiceError::InvalidKeepCount {
                        keep,
                        count: number,
                        notation: token.to_string(),
                    });
                }
            }
            modifiers.push(modifier);
            remaining = tail;
        }

        Ok(TermKind::Dice(DiceTerm {
            number,
            faces,
            modifiers,
        }))
    }

    /// Replace every `@path` term with the matching value from `data`.
    ///
    /// String values are parsed as formulas and spliced in with the sign of
    /// the variable distributed over them. A variable that leads back to
    /// itself is a [`DiceError::CircularVariable`].
    pub fn resolve(&self, data: &Value) -> Result<DiceExpression, DiceError> {
        self.resolve_within(data, &mut Vec::new())
    }

    fn resolve_within(
        &self,
        data: &Value,
        resolving: &mut Vec<String>,
    ) -> Result<DiceExpression, DiceError> {
        let mut terms = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let TermKind::Variable(path) = &term.kind else {
                terms.push(term.clone());
                continue;
            };
            if resolving.contains(path) || resolving.len() >= MAX_VARIABLE_DEPTH {
                return Err(DiceError::CircularVariable(path.clone()));
            }
            let value =
                lookup_path(data, path).ok_or_else(|| DiceError::UnresolvedVariable(path.clone()))?;
            let inner = match value {
                Value::Number(n) => {
                    let n = n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f.floor() as i64))
                        .ok_or_else(|| DiceError::UnresolvedVariable(path.clone()))?;
                    DiceExpression {
                        terms: vec![Term::number(n)],
                    }
                }
                Value::String(s) if s.trim().is_empty() => DiceExpression {
                    terms: vec![Term::number(0)],
                },
                Value::String(s) => {
                    resolving.push(path.clone());
                    let inner = DiceExpression::parse(s)?.resolve_within(data, resolving);
                    resolving.pop();
                    inner?
                }
                _ => return Err(DiceError::UnresolvedVariable(path.clone())),
            };
            for mut inner_term in inner.terms {
                inner_term.sign = term.sign.combine(inner_term.sign);
                if inner_term.flavor.is_none() {
                    inner_term.flavor = term.flavor.clone();
                }
                terms.push(inner_term);
            }
        }
        Ok(DiceExpression { terms })
    }

    /// Iterate over the dice pools in this expression.
    pub fn dice_terms(&self) -> impl Iterator<Item = &DiceTerm> {
        self.terms.iter().filter_map(|t| match &t.kind {
            TermKind::Dice(d) => Some(d),
            _ => None,
        })
    }

    /// Roll the expression with a specific RNG (useful for testing).
    pub fn roll_with_rng<R: Rng>(
        &self,
        rng: &mut R,
        mode: EvaluationMode,
    ) -> Result<RollResult, DiceError> {
        let mut results = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let result = match &term.kind {
                TermKind::Dice(dice) if dice.number > MAX_DICE => {
                    return Err(DiceError::TooManyDice(dice.number))
                }
                TermKind::Dice(dice) => roll_term(dice, term.sign, term.flavor.clone(), rng, mode),
                TermKind::Number(value) => TermResult::Number {
                    sign: term.sign,
                    value: *value,
                    flavor: term.flavor.clone(),
                },
                TermKind::Variable(path) => return Err(DiceError::UnresolvedVariable(path.clone())),
            };
            results.push(result);
        }

        let total = results
            .iter()
            .try_fold(0i64, |sum, term| sum.checked_add(term.signed_total()))
            .ok_or_else(|| DiceError::Overflow(self.to_string()))?;
        Ok(RollResult {
            formula: self.to_string(),
            terms: results,
            total,
        })
    }
}

fn take_number(s: &str) -> (Option<u32>, &str) {
    let len = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if len == 0 {
        (None, s)
    } else {
        (s[..len].parse().ok(), &s[len..])
    }
}

fn roll_die<R: Rng>(faces: u32, rng: &mut R, mode: EvaluationMode) -> u32 {
    match mode {
        EvaluationMode::Random => rng.gen_range(1..=faces),
        EvaluationMode::Minimize => 1,
        EvaluationMode::Maximize => faces,
    }
}

fn roll_term<R: Rng>(
    dice: &DiceTerm,
    sign: Sign,
    flavor: Option<String>,
    rng: &mut R,
    mode: EvaluationMode,
) -> TermResult {
    let mut results = Vec::with_capacity(dice.number as usize);

    for _ in 0..dice.number {
        let mut value = roll_die(dice.faces, rng, mode);
        for modifier in &dice.modifiers {
            if let DieModifier::Reroll(target) = modifier {
                if mode == EvaluationMode::Random && value == *target {
                    results.push(DieResult {
                        value,
                        active: false,
                        rerolled: true,
                    });
                    value = roll_die(dice.faces, rng, mode);
                }
            }
        }
        for modifier in &dice.modifiers {
            if let DieModifier::Minimum(floor) = modifier {
                value = value.max((*floor).min(dice.faces));
            }
        }
        results.push(DieResult {
            value,
            active: true,
            rerolled: false,
        });
    }

    for modifier in &dice.modifiers {
        let (keep, highest) = match modifier {
            DieModifier::KeepHighest(k) => (*k as usize, true),
            DieModifier::KeepLowest(k) => (*k as usize, false),
            _ => continue,
        };
        let mut active: Vec<usize> = (0..results.len()).filter(|&i| results[i].active).collect();
        // Stable sort keeps the earliest die among equal values.
        if highest {
            active.sort_by(|&a, &b| results[b].value.cmp(&results[a].value));
        } else {
            active.sort_by(|&a, &b| results[a].value.cmp(&results[b].value));
        }
        for &dropped in active.iter().skip(keep) {
            results[dropped].active = false;
        }
    }

    let total = results
        .iter()
        .filter(|r| r.active)
        .map(|r| r.value as i64)
        .sum();

    TermResult::Dice {
        sign,
        number: dice.number,
        faces: dice.faces,
        results,
        total,
        flavor,
    }
}

/// Look up a dotted path such as `abilities.dex.mod` in a JSON document.
pub fn lookup_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(data, |value, key| value.as_object()?.get(key))
        .filter(|v| !v.is_null())
}

impl FromStr for DiceExpression {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiceExpression::parse(s)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            match (i, term.sign) {
                (0, Sign::Plus) => {}
                (0, Sign::Minus) => write!(f, "-")?,
                (_, Sign::Plus) => write!(f, " + ")?,
                (_, Sign::Minus) => write!(f, " - ")?,
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

/// How dice faces are chosen during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvaluationMode {
    #[default]
    Random,
    /// Every die shows 1.
    Minimize,
    /// Every die shows its highest face.
    Maximize,
}

/// A single die result inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DieResult {
    pub value: u32,
    /// Whether the die counts toward the total.
    pub active: bool,
    /// Whether the die was replaced by a reroll.
    pub rerolled: bool,
}

/// Result of evaluating one term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermResult {
    Dice {
        sign: Sign,
        number: u32,
        faces: u32,
        results: Vec<DieResult>,
        total: i64,
        flavor: Option<String>,
    },
    Number {
        sign: Sign,
        value: i64,
        flavor: Option<String>,
    },
}

impl TermResult {
    pub fn signed_total(&self) -> i64 {
        match self {
            TermResult::Dice { sign, total, .. } => sign.apply(*total),
            TermResult::Number { sign, value, .. } => sign.apply(*value),
        }
    }

    pub fn flavor(&self) -> Option<&str> {
        match self {
            TermResult::Dice { flavor, .. } | TermResult::Number { flavor, .. } => {
                flavor.as_deref()
            }
        }
    }
}

/// Complete result of a formula evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    /// The resolved formula that was rolled.
    pub formula: String,
    pub terms: Vec<TermResult>,
    pub total: i64,
}

impl RollResult {
    /// Active value of the first die of the first dice term.
    pub fn first_die(&self) -> Option<u32> {
        self.terms.iter().find_map(|t| match t {
            TermResult::Dice { results, .. } => results.iter().find(|r| r.active).map(|r| r.value),
            TermResult::Number { .. } => None,
        })
    }

    /// Format the individual dice results for display.
    ///
    /// Dropped and rerolled dice are shown in parentheses.
    pub fn dice_display(&self) -> String {
        let mut out = String::new();
        for (i, term) in self.terms.iter().enumerate() {
            let sign = match term {
                TermResult::Dice { sign, .. } | TermResult::Number { sign, .. } => *sign,
            };
            match (i, sign) {
                (0, Sign::Plus) => {}
                (0, Sign::Minus) => out.push('-'),
                (_, Sign::Plus) => out.push_str(" + "),
                (_, Sign::Minus) => out.push_str(" - "),
            }
            match term {
                TermResult::Dice { results, .. } => {
                    let shown: Vec<String> = results
                        .iter()
                        .map(|r| {
                            if r.active {
                                r.value.to_string()
                            } else {
                                format!("({})", r.value)
                            }
                        })
                        .collect();
                    out.push_str(&format!("[{}]", shown.join(", ")));
                }
                TermResult::Number { value, .. } => out.push_str(&value.to_string()),
            }
        }
        out
    }
}

impl fmt::Display for RollResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.dice_display(), self.total)
    }
}

/// Evaluates dice formulas against a roll data context.
pub trait FormulaEvaluator: Send + Sync {
    fn evaluate(
        &self,
        formula: &str,
        data: &Value,
        mode: EvaluationMode,
    ) -> Result<RollResult, DiceError>;
}

/// Default formula evaluator backed by the expression parser above.
pub struct DiceRoller {
    rng: Mutex<StdRng>,
}

impl DiceRoller {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic roller (useful for testing).
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for DiceRoller {
    fn default() -> Self {
        Self::new()
    }
}

impl FormulaEvaluator for DiceRoller {
    fn evaluate(
        &self,
        formula: &str,
        data: &Value,
        mode: EvaluationMode,
    ) -> Result<RollResult, DiceError> {
        let expr = DiceExpression::parse(formula)?.resolve(data)?;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        expr.roll_with_rng(&mut *rng, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple() {
        let expr = DiceExpression::parse("1d20").unwrap();
        assert_eq!(expr.terms.len(), 1);
        assert_eq!(expr.terms[0].kind, TermKind::Dice(DiceTerm::new(1, 20)));
    }

    #[test]
    fn test_parse_with_modifier() {
        let expr = DiceExpression::parse("2d6 - 2").unwrap();
        assert_eq!(expr.terms.len(), 2);
        assert_eq!(expr.terms[1].sign, Sign::Minus);
        assert_eq!(expr.terms[1].kind, TermKind::Number(2));
        assert_eq!(expr.to_string(), "2d6 - 2");
    }

    #[test]
    fn test_parse_die_modifiers() {
        let expr = DiceExpression::parse("2d20r1min10kh").unwrap();
        let TermKind::Dice(dice) = &expr.terms[0].kind else {
            panic!("expected dice term");
        };
        assert_eq!(
            dice.modifiers,
            vec![
                DieModifier::Reroll(1),
                DieModifier::Minimum(10),
                DieModifier::KeepHighest(1)
            ]
        );
        assert_eq!(expr.to_string(), "2d20r1min10kh");
    }

    #[test]
    fn test_parse_flavor_and_variables() {
        let expr = DiceExpression::parse("2d6[fire] + @abilities.str.mod").unwrap();
        assert_eq!(expr.terms[0].flavor.as_deref(), Some("fire"));
        assert_eq!(
            expr.terms[1].kind,
            TermKind::Variable("abilities.str.mod".to_string())
        );
    }

    #[test]
    fn test_parse_hyphenated_variable() {
        let expr = DiceExpression::parse("@scale.rogue.sneak-attack - 1").unwrap();
        assert_eq!(
            expr.terms[0].kind,
            TermKind::Variable("scale.rogue.sneak-attack".to_string())
        );
        assert_eq!(expr.terms[1].sign, Sign::Minus);
    }

    #[test]
    fn test_invalid_notation() {
        assert_eq!(DiceExpression::parse("  "), Err(DiceError::NoDice));
        assert!(DiceExpression::parse("2d6 +").is_err());
        assert!(DiceExpression::parse("2d6 3").is_err());
        assert!(DiceExpression::parse("2dx").is_err());
        assert!(DiceExpression::parse("1d20kx").is_err());
        assert!(matches!(
            DiceExpression::parse("4d6kh5"),
            Err(DiceError::InvalidKeepCount { keep: 5, count: 4, .. })
        ));
    }

    #[test]
    fn test_resolve_negative_and_formula_values() {
        let data = json!({ "mod": -1, "bonus": "1d4 + 2" });
        let expr = DiceExpression::parse("1d20 + @mod - @bonus")
            .unwrap()
            .resolve(&data)
            .unwrap();
        assert_eq!(expr.to_string(), "1d20 - 1 - 1d4 - 2");
    }

    #[test]
    fn test_resolve_missing_variable() {
        let expr = DiceExpression::parse("1d20 + @prof").unwrap();
        assert_eq!(
            expr.resolve(&json!({})),
            Err(DiceError::UnresolvedVariable("prof".to_string()))
        );
    }

    #[test]
    fn test_self_referencing_variable_is_an_error() {
        let roller = DiceRoller::seeded(1);
        assert_eq!(
            roller.evaluate("@a", &json!({ "a": "@a" }), EvaluationMode::Random),
            Err(DiceError::CircularVariable("a".to_string()))
        );

        let cycle = json!({ "a": "1 + @b", "b": "@c", "c": "2d6 + @a" });
        assert!(matches!(
            roller.evaluate("1d20 + @a", &cycle, EvaluationMode::Random),
            Err(DiceError::CircularVariable(_))
        ));
    }

    #[test]
    fn test_repeated_variable_is_not_a_cycle() {
        let data = json!({ "bonus": "@mod + @mod", "mod": 2 });
        let expr = DiceExpression::parse("@bonus + @bonus")
            .unwrap()
            .resolve(&data)
            .unwrap();
        assert_eq!(expr.to_string(), "2 + 2 + 2 + 2");
    }

    #[test]
    fn test_dice_count_is_capped() {
        assert_eq!(
            DiceExpression::parse("4000000000d6"),
            Err(DiceError::TooManyDice(4_000_000_000))
        );
        assert!(DiceExpression::parse("1000d6").is_ok());

        let mut huge = DiceTerm::new(1, 6);
        huge.number = MAX_DICE + 1;
        let expr = DiceExpression {
            terms: vec![Term::dice(huge)],
        };
        assert_eq!(
            expr.roll_with_rng(&mut StdRng::seed_from_u64(1), EvaluationMode::Random),
            Err(DiceError::TooManyDice(MAX_DICE + 1))
        );
    }

    #[test]
    fn test_total_overflow_is_an_error() {
        let roller = DiceRoller::seeded(1);
        let result = roller.evaluate(
            "9223372036854775807 + 1",
            &Value::Null,
            EvaluationMode::Random,
        );
        assert!(matches!(result, Err(DiceError::Overflow(_))));
    }

    #[test]
    fn test_minimize_and_maximize() {
        let roller = DiceRoller::seeded(1);
        let min = roller
            .evaluate("2d6 + 1", &Value::Null, EvaluationMode::Minimize)
            .unwrap();
        let max = roller
            .evaluate("2d6 + 1", &Value::Null, EvaluationMode::Maximize)
            .unwrap();
        assert_eq!(min.total, 3);
        assert_eq!(max.total, 13);
    }

    #[test]
    fn test_minimum_modifier_floors_results() {
        let roller = DiceRoller::seeded(7);
        let result = roller
            .evaluate("1d20min10", &Value::Null, EvaluationMode::Minimize)
            .unwrap();
        assert_eq!(result.total, 10);
    }

    #[test]
    fn test_keep_highest_marks_dropped_dice() {
        let roller = DiceRoller::seeded(42);
        for _ in 0..50 {
            let result = roller
                .evaluate("2d20kh", &Value::Null, EvaluationMode::Random)
                .unwrap();
            let TermResult::Dice { results, .. } = &result.terms[0] else {
                panic!("expected dice");
            };
            assert_eq!(results.len(), 2);
            assert_eq!(results.iter().filter(|r| r.active).count(), 1);
            let best = results.iter().map(|r| r.value).max().unwrap();
            assert_eq!(result.total, best as i64);
        }
    }

    #[test]
    fn test_reroll_records_replaced_die() {
        let roller = DiceRoller::seeded(3);
        for _ in 0..200 {
            let result = roller
                .evaluate("1d4r1", &Value::Null, EvaluationMode::Random)
                .unwrap();
            let TermResult::Dice { results, .. } = &result.terms[0] else {
                panic!("expected dice");
            };
            if results.len() == 2 {
                assert!(results[0].rerolled && !results[0].active);
                assert_eq!(results[0].value, 1);
            }
        }
    }

    #[test]
    fn test_roll_range() {
        let roller = DiceRoller::new();
        for _ in 0..100 {
            let result = roller
                .evaluate("1d20+5", &Value::Null, EvaluationMode::Random)
                .unwrap();
            assert!(result.total >= 6 && result.total <= 25);
        }
    }

    #[test]
    fn test_dice_display() {
        let roller = DiceRoller::seeded(9);
        let result = roller
            .evaluate("2d6 + 3", &Value::Null, EvaluationMode::Maximize)
            .unwrap();
        assert_eq!(result.dice_display(), "[6, 6] + 3");
        assert_eq!(result.to_string(), "[6, 6] + 3 = 15");
    }

    #[test]
    fn test_fixed_average() {
        assert_eq!(DieType::D6.fixed_average(), 4);
        assert_eq!(DieType::D12.fixed_average(), 7);
    }
}
