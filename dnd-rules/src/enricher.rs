//! Inline roll links in text.
//!
//! Links look like `[[/skill skill=acr dc=20]]` or
//! `[[/damage formula=2d6 type=fire average=true]]{Fire Bolt}`. Each link is
//! parsed into a typed configuration with a fixed set of keys per kind and
//! resolved into a plain-text label. A link that fails to parse or resolve is
//! logged and left in the text unchanged.

use crate::character::Character;
use crate::checks;
use crate::dice::{DiceExpression, EvaluationMode, FormulaEvaluator};
use crate::error::RulesError;
use crate::roll_config::{D20RollRequest, DamageRequest};
use crate::roll_eval::RollEvaluator;
use crate::rules_table::RulesTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// The roll a link asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckKind {
    /// `/check`: an ability, skill or tool check.
    Check,
    Skill,
    Tool,
    Save,
}

impl CheckKind {
    fn command(&self) -> &'static str {
        match self {
            CheckKind::Check => "check",
            CheckKind::Skill => "skill",
            CheckKind::Tool => "tool",
            CheckKind::Save => "save",
        }
    }

    fn allowed_keys(&self) -> &'static [&'static str] {
        match self {
            CheckKind::Check => &["ability", "skill", "tool", "dc", "passive", "format"],
            CheckKind::Skill => &["skill", "ability", "dc", "passive", "format"],
            CheckKind::Tool => &["tool", "ability", "dc", "format"],
            CheckKind::Save => &["ability", "dc", "format"],
        }
    }
}

/// Label style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelFormat {
    /// "DC 15 Dexterity (Acrobatics) check"
    #[default]
    Long,
    /// "DC 15 Acrobatics"
    Short,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub kind: CheckKind,
    pub ability: Option<String>,
    pub skill: Option<String>,
    pub tool: Option<String>,
    /// DC formula, resolved against roll data.
    pub dc: Option<String>,
    pub passive: bool,
    pub format: LabelFormat,
}

/// How a damage link shows its average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AverageSpec {
    /// `average=true`: computed from the formula.
    Computed,
    /// `average=N`: shown as given.
    Fixed(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageConfig {
    pub formula: String,
    pub damage_type: Option<String>,
    pub average: Option<AverageSpec>,
    pub dc: Option<String>,
    pub format: LabelFormat,
}

/// A parsed inline link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineLink {
    Check(CheckConfig),
    Damage(DamageConfig),
}

/// A link with its rules entries looked up and its label built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub link: InlineLink,
    pub label: String,
    /// Resolved DC, if any.
    pub dc: Option<i64>,
    /// The link text as written.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    Text(String),
    Link(ResolvedLink),
}

/// Text with its links resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedText {
    pub segments: Vec<Segment>,
}

impl EnrichedText {
    pub fn links(&self) -> impl Iterator<Item = &ResolvedLink> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Link(link) => Some(link),
            Segment::Text(_) => None,
        })
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }
}

impl fmt::Display for EnrichedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => write!(f, "{}", text)?,
                Segment::Link(link) => write!(f, "{}", link.label)?,
            }
        }
        Ok(())
    }
}

impl CheckConfig {
    /// Build the roll request this link triggers for `character`.
    pub fn to_request(
        &self,
        rules: &RulesTable,
        character: &Character,
        dc: Option<i64>,
    ) -> Result<D20RollRequest, RulesError> {
        let ability = self.ability.as_deref();
        let request = match (&self.skill, &self.tool) {
            (Some(skill), _) => checks::skill_check(rules, character, skill, ability)?,
            (None, Some(tool)) => checks::tool_check(rules, character, tool, ability)?,
            (None, None) => {
                let ability = ability.ok_or_else(|| {
                    RulesError::invalid(format!("/{} link needs an ability", self.kind.command()))
                })?;
                match self.kind {
                    CheckKind::Save => checks::saving_throw(rules, character, ability)?,
                    _ => checks::ability_check(rules, character, ability)?,
                }
            }
        };
        Ok(match dc {
            Some(dc) => request.with_target(dc),
            None => request,
        })
    }
}

impl DamageConfig {
    pub fn to_request(&self, data: Value) -> DamageRequest {
        let request = DamageRequest::new(format!("{} damage", self.formula))
            .with_part(&self.formula)
            .with_data(data);
        match &self.damage_type {
            Some(damage_type) => request.with_damage_type(damage_type),
            None => request,
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Split link arguments on whitespace, keeping double-quoted values whole.
fn tokenize(args: &str) -> Result<Vec<String>, RulesError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in args.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err(RulesError::invalid("unterminated quote in link"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn key_values(args: &str, allowed: &[&str]) -> Result<Vec<(String, String)>, RulesError> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for token in tokenize(args)? {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| RulesError::invalid(format!("'{}' is not a key=value pair", token)))?;
        let key = key.to_ascii_lowercase();
        if !allowed.contains(&key.as_str()) {
            return Err(RulesError::invalid(format!("unknown key '{}'", key)));
        }
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(RulesError::invalid(format!("key '{}' given twice", key)));
        }
        if value.is_empty() {
            return Err(RulesError::invalid(format!("key '{}' has no value", key)));
        }
        pairs.push((key, value.to_string()));
    }
    Ok(pairs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, RulesError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(RulesError::invalid(format!(
            "'{}' expects true or false, got '{}'",
            key, other
        ))),
    }
}

fn parse_format(value: &str) -> Result<LabelFormat, RulesError> {
    match value {
        "long" => Ok(LabelFormat::Long),
        "short" => Ok(LabelFormat::Short),
        other => Err(RulesError::invalid(format!("unknown format '{}'", other))),
    }
}

/// Parse the inside of a link (`/skill skill=acr dc=15`).
pub fn parse_link(body: &str) -> Result<InlineLink, RulesError> {
    let body = body.trim();
    let rest = body
        .strip_prefix('/')
        .ok_or_else(|| RulesError::invalid(format!("'{}' is not a roll link", body)))?;
    let (command, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));

    let kind = match command.to_ascii_lowercase().as_str() {
        "check" => CheckKind::Check,
        "skill" => CheckKind::Skill,
        "tool" => CheckKind::Tool,
        "save" => CheckKind::Save,
        "damage" => return parse_damage(args).map(InlineLink::Damage),
        other => return Err(RulesError::invalid(format!("unknown link kind '/{}'", other))),
    };

    let mut config = CheckConfig {
        kind,
        ability: None,
        skill: None,
        tool: None,
        dc: None,
        passive: false,
        format: LabelFormat::default(),
    };
    for (key, value) in key_values(args, kind.allowed_keys())? {
        match key.as_str() {
            "ability" => config.ability = Some(value),
            "skill" => config.skill = Some(value),
            "tool" => config.tool = Some(value),
            "dc" => config.dc = Some(value),
            "passive" => config.passive = parse_bool(&key, &value)?,
            "format" => config.format = parse_format(&value)?,
            _ => {}
        }
    }

    let missing = match kind {
        CheckKind::Skill if config.skill.is_none() => Some("skill"),
        CheckKind::Tool if config.tool.is_none() => Some("tool"),
        CheckKind::Save if config.ability.is_none() => Some("ability"),
        CheckKind::Check
            if config.ability.is_none() && config.skill.is_none() && config.tool.is_none() =>
        {
            Some("ability, skill or tool")
        }
        _ => None,
    };
    if let Some(missing) = missing {
        return Err(RulesError::invalid(format!(
            "/{} link needs {}",
            kind.command(),
            missing
        )));
    }
    if config.skill.is_some() && config.tool.is_some() {
        return Err(RulesError::invalid("a check cannot name both a skill and a tool"));
    }
    Ok(InlineLink::Check(config))
}

fn parse_damage(args: &str) -> Result<DamageConfig, RulesError> {
    let mut config = DamageConfig {
        formula: String::new(),
        damage_type: None,
        average: None,
        dc: None,
        format: LabelFormat::default(),
    };
    for (key, value) in key_values(args, &["formula", "type", "average", "dc", "format"])? {
        match key.as_str() {
            "formula" => config.formula = value,
            "type" => config.damage_type = Some(value),
            "average" => {
                config.average = match value.as_str() {
                    "true" => Some(AverageSpec::Computed),
                    "false" => None,
                    number => Some(AverageSpec::Fixed(number.parse().map_err(|_| {
                        RulesError::invalid(format!(
                            "average expects true, false or a number, got '{}'",
                            number
                        ))
                    })?)),
                }
            }
            "dc" => config.dc = Some(value),
            "format" => config.format = parse_format(&value)?,
            _ => {}
        }
    }
    if config.formula.is_empty() {
        return Err(RulesError::invalid("/damage link needs formula"));
    }
    Ok(config)
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves inline links against a rules table and optional roll data.
pub struct Enricher<'a> {
    rules: &'a RulesTable,
    evaluator: &'a dyn FormulaEvaluator,
    data: Value,
}

impl<'a> Enricher<'a> {
    pub fn new(rules: &'a RulesTable, evaluator: &'a dyn FormulaEvaluator) -> Self {
        Self {
            rules,
            evaluator,
            data: Value::Null,
        }
    }

    /// Roll data used for `@` references in formulas and DCs.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Replace every recognized link in `text`.
    pub fn enrich(&self, text: &str) -> EnrichedText {
        let mut out = EnrichedText::default();
        let mut rest = text;

        while let Some(start) = rest.find("[[/") {
            let Some(close) = rest[start..].find("]]") else {
                break;
            };
            let body_end = start + close;
            let mut end = body_end + 2;
            let mut label = None;
            if rest[end..].starts_with('{') {
                if let Some(label_close) = rest[end..].find('}') {
                    label = Some(&rest[end + 1..end + label_close]);
                    end += label_close + 1;
                }
            }

            out.push_text(&rest[..start]);
            let source = &rest[start..end];
            match self.resolve_link(&rest[start + 2..body_end], label, source) {
                Ok(link) => out.segments.push(Segment::Link(link)),
                Err(e) => {
                    warn!(link = %source, error = %e, "leaving inline roll link unresolved");
                    out.push_text(source);
                }
            }
            rest = &rest[end..];
        }

        out.push_text(rest);
        out
    }

    /// Parse and resolve a single link body. `label` overrides the
    /// generated label.
    pub fn resolve_link(
        &self,
        body: &str,
        label: Option<&str>,
        source: &str,
    ) -> Result<ResolvedLink, RulesError> {
        let link = parse_link(body)?;
        let (generated, dc) = match &link {
            InlineLink::Check(config) => {
                let dc = self.resolve_dc(config.dc.as_deref())?;
                (self.check_label(config, dc)?, dc)
            }
            InlineLink::Damage(config) => {
                let dc = self.resolve_dc(config.dc.as_deref())?;
                (self.damage_label(config)?, dc)
            }
        };
        Ok(ResolvedLink {
            link,
            label: label.map(str::to_string).unwrap_or(generated),
            dc,
            source: source.to_string(),
        })
    }

    fn resolve_dc(&self, dc: Option<&str>) -> Result<Option<i64>, RulesError> {
        let Some(formula) = dc else {
            return Ok(None);
        };
        let expr = DiceExpression::parse(formula)?.resolve(&self.data)?;
        if expr.dice_terms().next().is_some() {
            return Err(RulesError::invalid(format!(
                "DC '{}' must not contain dice",
                formula
            )));
        }
        let result = self
            .evaluator
            .evaluate(&expr.to_string(), &self.data, EvaluationMode::Minimize)?;
        Ok(Some(result.total))
    }

    fn check_label(&self, config: &CheckConfig, dc: Option<i64>) -> Result<String, RulesError> {
        let rules = self.rules;
        let skill = config
            .skill
            .as_deref()
            .map(|s| rules.require_skill(s))
            .transpose()?;
        let tool = config
            .tool
            .as_deref()
            .map(|t| rules.require_tool(t))
            .transpose()?;
        let default_ability = skill
            .map(|s| s.ability.as_str())
            .or(tool.map(|t| t.ability.as_str()));
        let ability = match (config.ability.as_deref(), default_ability) {
            (Some(ability), _) | (None, Some(ability)) => rules.require_ability(ability)?,
            (None, None) => {
                return Err(RulesError::invalid(format!(
                    "/{} link needs an ability",
                    config.kind.command()
                )))
            }
        };

        let subject = skill.map(|s| s.name.as_str()).or(tool.map(|t| t.name.as_str()));
        let mut label = match (config.format, subject) {
            (LabelFormat::Short, Some(subject)) => subject.to_string(),
            (LabelFormat::Short, None) if config.kind == CheckKind::Save => {
                format!("{} save", ability.name)
            }
            (LabelFormat::Short, None) => ability.name.clone(),
            (LabelFormat::Long, Some(subject)) => format!("{} ({})", ability.name, subject),
            (LabelFormat::Long, None) => ability.name.clone(),
        };
        if config.format == LabelFormat::Long {
            label.push_str(if config.kind == CheckKind::Save {
                " saving throw"
            } else {
                " check"
            });
        }
        if config.passive {
            label = format!("passive {}", label);
        }
        if let Some(dc) = dc {
            label = format!("DC {} {}", dc, label);
        }
        Ok(label)
    }

    fn damage_label(&self, config: &DamageConfig) -> Result<String, RulesError> {
        let formula = DiceExpression::parse(&config.formula)?
            .resolve(&self.data)?
            .to_string();
        let damage_type = config
            .damage_type
            .as_deref()
            .map(|t| self.rules.require_damage_type(t))
            .transpose()?
            .map(|t| t.key.clone());

        let average = match config.average {
            Some(AverageSpec::Fixed(value)) => Some(value),
            Some(AverageSpec::Computed) => {
                Some(RollEvaluator::new(self.evaluator).average(&formula, &self.data)?)
            }
            None => None,
        };

        let mut label = match average {
            Some(average) => format!("{} ({})", average, formula),
            None => formula,
        };
        if let Some(damage_type) = damage_type {
            label.push(' ');
            label.push_str(&damage_type);
        }
        if config.format == LabelFormat::Long {
            label.push_str(" damage");
        }
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::DiceRoller;
    use crate::rules_table::SRD;
    use serde_json::json;

    fn enrich(text: &str) -> String {
        let roller = DiceRoller::seeded(1);
        Enricher::new(&SRD, &roller).enrich(text).to_string()
    }

    #[test]
    fn test_skill_link_label() {
        assert_eq!(
            enrich("Make a [[/skill skill=acr dc=20]] or fall."),
            "Make a DC 20 Dexterity (Acrobatics) check or fall."
        );
    }

    #[test]
    fn test_save_and_tool_labels() {
        assert_eq!(
            enrich("[[/save ability=con dc=15]]"),
            "DC 15 Constitution saving throw"
        );
        assert_eq!(
            enrich("[[/tool tool=thief ability=int]]"),
            "Intelligence (Thieves' Tools) check"
        );
        assert_eq!(
            enrich("[[/check skill=prc passive=true dc=14 format=short]]"),
            "DC 14 passive Perception"
        );
    }

    #[test]
    fn test_damage_average() {
        assert_eq!(
            enrich("[[/damage formula=2d6 type=fire average=true]]"),
            "7 (2d6) fire damage"
        );
        assert_eq!(
            enrich("[[/damage formula=2d6 type=fire average=666 dc=20]]"),
            "666 (2d6) fire damage"
        );
        assert_eq!(enrich("[[/damage formula=1d4]]"), "1d4 damage");
    }

    #[test]
    fn test_custom_label() {
        let roller = DiceRoller::seeded(1);
        let enriched = Enricher::new(&SRD, &roller).enrich("[[/skill skill=ste]]{Sneak past}");
        assert_eq!(enriched.to_string(), "Sneak past");
        let link = enriched.links().next().unwrap();
        assert_eq!(link.source, "[[/skill skill=ste]]{Sneak past}");
    }

    #[test]
    fn test_dc_formula_uses_roll_data() {
        let roller = DiceRoller::seeded(1);
        let enricher = Enricher::new(&SRD, &roller)
            .with_data(json!({ "abilities": { "wis": { "dc": 13 } } }));
        let enriched = enricher.enrich("[[/save ability=dex dc=@abilities.wis.dc]]");
        assert_eq!(enriched.to_string(), "DC 13 Dexterity saving throw");
        assert_eq!(enriched.links().next().unwrap().dc, Some(13));
    }

    #[test]
    fn test_invalid_links_left_unchanged() {
        let cases = [
            "[[/skill skill=juggling]]",
            "[[/skill acr]]",
            "[[/save ability=con color=red]]",
            "[[/damage formula=2d6 type=chaos]]",
            "[[/dance]]",
            "[[/check dc=10]]",
        ];
        for case in cases {
            let text = format!("Before {} after", case);
            assert_eq!(enrich(&text), text);
        }
    }

    #[test]
    fn test_unterminated_link_is_text() {
        assert_eq!(enrich("broken [[/skill skill=acr"), "broken [[/skill skill=acr");
    }

    #[test]
    fn test_parse_errors_are_typed() {
        assert!(matches!(
            parse_link("/save ability=con color=red"),
            Err(RulesError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            parse_link("/damage formula=2d6 average=lots"),
            Err(RulesError::InvalidConfiguration(_))
        ));
        let roller = DiceRoller::new();
        let enricher = Enricher::new(&SRD, &roller);
        assert!(matches!(
            enricher.resolve_link("/skill skill=juggling", None, ""),
            Err(RulesError::NotFound { .. })
        ));
    }

    #[test]
    fn test_link_to_request() {
        let InlineLink::Check(config) = parse_link("/skill skill=acr dc=20").unwrap() else {
            panic!("expected a check link");
        };
        let character = Character::new("Vex", &SRD).with_ability("dex", 14);
        let request = config.to_request(&SRD, &character, Some(20)).unwrap();
        assert_eq!(request.target_value, Some(20));
        assert_eq!(request.data["mod"], 2);
    }
}
