//! Roll requests derived from a character.
//!
//! Each builder resolves the rules entry, picks the ability (a skill or tool
//! falls back to its default ability), and fills `@mod` / `@prof` from the
//! character's roll data. Unknown keys are blocking `NotFound` errors.

use crate::character::{Character, ProficiencyLevel};
use crate::error::RulesError;
use crate::roll_config::D20RollRequest;
use crate::rules_table::{AbilityDef, RulesTable};
use serde_json::json;

fn check_request(
    flavor: String,
    character: &Character,
    rules: &RulesTable,
    ability: &AbilityDef,
    proficiency: ProficiencyLevel,
) -> D20RollRequest {
    let modifier = character.ability_modifier(&ability.key).unwrap_or(0);
    let prof = proficiency.bonus(character.proficiency_bonus());

    let mut data = character.roll_data(rules);
    if let Some(root) = data.as_object_mut() {
        root.insert("mod".to_string(), json!(modifier));
        root.insert("prof".to_string(), json!(prof));
    }

    let mut request = D20RollRequest::new(flavor)
        .with_data(data)
        .with_part("@mod");
    if prof != 0 {
        request = request.with_part("@prof");
    }
    request.halfling_lucky = character.flag("halflingLucky");
    request
}

fn resolve_ability<'a>(
    rules: &'a RulesTable,
    explicit: Option<&str>,
    default: &str,
) -> Result<&'a AbilityDef, RulesError> {
    rules.require_ability(explicit.unwrap_or(default))
}

/// A raw ability check.
pub fn ability_check(
    rules: &RulesTable,
    character: &Character,
    ability: &str,
) -> Result<D20RollRequest, RulesError> {
    let ability = rules.require_ability(ability)?;
    Ok(check_request(
        format!("{} Ability Check", ability.name),
        character,
        rules,
        ability,
        ProficiencyLevel::None,
    ))
}

/// A skill check. Without an explicit ability the skill's default is used.
pub fn skill_check(
    rules: &RulesTable,
    character: &Character,
    skill: &str,
    ability: Option<&str>,
) -> Result<D20RollRequest, RulesError> {
    let skill = rules.require_skill(skill)?;
    let ability = resolve_ability(rules, ability, &skill.ability)?;
    let proficiency = character.skill_proficiency(&skill.key);

    let mut request = check_request(
        format!("{} ({}) Skill Check", skill.name, ability.abbreviation),
        character,
        rules,
        ability,
        proficiency,
    );
    request.reliable_talent = character.flag("reliableTalent")
        && matches!(
            proficiency,
            ProficiencyLevel::Proficient | ProficiencyLevel::Expertise
        );
    Ok(request)
}

/// A tool check. Without an explicit ability the tool's default is used.
pub fn tool_check(
    rules: &RulesTable,
    character: &Character,
    tool: &str,
    ability: Option<&str>,
) -> Result<D20RollRequest, RulesError> {
    let tool = rules.require_tool(tool)?;
    let ability = resolve_ability(rules, ability, &tool.ability)?;
    Ok(check_request(
        format!("{} ({}) Check", tool.name, ability.abbreviation),
        character,
        rules,
        ability,
        character.tool_proficiency(&tool.key),
    ))
}

/// A saving throw.
pub fn saving_throw(
    rules: &RulesTable,
    character: &Character,
    ability: &str,
) -> Result<D20RollRequest, RulesError> {
    let ability = rules.require_ability(ability)?;
    Ok(check_request(
        format!("{} Saving Throw", ability.name),
        character,
        rules,
        ability,
        character.save_proficiency(&ability.key),
    ))
}
