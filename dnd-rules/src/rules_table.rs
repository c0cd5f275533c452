//! Rules lookup tables: abilities, skills, tools and damage types.
//!
//! A [`RulesTable`] is immutable and passed explicitly to everything that
//! needs it. [`struct@SRD`] holds the built-in 5e table.

use crate::error::{LookupKind, RulesError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityDef {
    pub key: String,
    pub name: String,
    pub abbreviation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDef {
    pub key: String,
    pub name: String,
    /// Ability used when a check does not name one.
    pub ability: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDef {
    pub key: String,
    pub name: String,
    /// Ability used when a check does not name one.
    pub ability: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageTypeDef {
    pub key: String,
    pub name: String,
}

/// Immutable rules lookup table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesTable {
    pub abilities: Vec<AbilityDef>,
    pub skills: Vec<SkillDef>,
    pub tools: Vec<ToolDef>,
    pub damage_types: Vec<DamageTypeDef>,
}

/// Lowercase and strip everything but letters and digits, so "Sleight of
/// Hand" and "sleightofhand" compare equal.
fn slug(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn matches(key: &str, name: &str, query: &str) -> bool {
    key == query || slug(name) == slug(query)
}

impl RulesTable {
    /// Find an ability by key (`dex`) or name (`Dexterity`).
    pub fn ability(&self, query: &str) -> Option<&AbilityDef> {
        self.abilities.iter().find(|a| matches(&a.key, &a.name, query))
    }

    pub fn skill(&self, query: &str) -> Option<&SkillDef> {
        self.skills.iter().find(|s| matches(&s.key, &s.name, query))
    }

    pub fn tool(&self, query: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| matches(&t.key, &t.name, query))
    }

    pub fn damage_type(&self, query: &str) -> Option<&DamageTypeDef> {
        self.damage_types
            .iter()
            .find(|d| matches(&d.key, &d.name, query))
    }

    pub fn require_ability(&self, query: &str) -> Result<&AbilityDef, RulesError> {
        self.ability(query)
            .ok_or_else(|| RulesError::not_found(LookupKind::Ability, query))
    }

    pub fn require_skill(&self, query: &str) -> Result<&SkillDef, RulesError> {
        self.skill(query)
            .ok_or_else(|| RulesError::not_found(LookupKind::Skill, query))
    }

    pub fn require_tool(&self, query: &str) -> Result<&ToolDef, RulesError> {
        self.tool(query)
            .ok_or_else(|| RulesError::not_found(LookupKind::Tool, query))
    }

    pub fn require_damage_type(&self, query: &str) -> Result<&DamageTypeDef, RulesError> {
        self.damage_type(query)
            .ok_or_else(|| RulesError::not_found(LookupKind::DamageType, query))
    }

    /// The System Reference Document tables.
    pub fn srd() -> Self {
        let abilities = [
            ("str", "Strength", "STR"),
            ("dex", "Dexterity", "DEX"),
            ("con", "Constitution", "CON"),
            ("int", "Intelligence", "INT"),
            ("wis", "Wisdom", "WIS"),
            ("cha", "Charisma", "CHA"),
        ]
        .into_iter()
        .map(|(key, name, abbreviation)| AbilityDef {
            key: key.to_string(),
            name: name.to_string(),
            abbreviation: abbreviation.to_string(),
        })
        .collect();

        let skills = [
            ("acr", "Acrobatics", "dex"),
            ("ani", "Animal Handling", "wis"),
            ("arc", "Arcana", "int"),
            ("ath", "Athletics", "str"),
            ("dec", "Deception", "cha"),
            ("his", "History", "int"),
            ("ins", "Insight", "wis"),
            ("itm", "Intimidation", "cha"),
            ("inv", "Investigation", "int"),
            ("med", "Medicine", "wis"),
            ("nat", "Nature", "int"),
            ("prc", "Perception", "wis"),
            ("prf", "Performance", "cha"),
            ("per", "Persuasion", "cha"),
            ("rel", "Religion", "int"),
            ("slt", "Sleight of Hand", "dex"),
            ("ste", "Stealth", "dex"),
            ("sur", "Survival", "wis"),
        ]
        .into_iter()
        .map(|(key, name, ability)| SkillDef {
            key: key.to_string(),
            name: name.to_string(),
            ability: ability.to_string(),
        })
        .collect();

        let tools = [
            ("alchemist", "Alchemist's Supplies", "int"),
            ("brewer", "Brewer's Supplies", "int"),
            ("calligrapher", "Calligrapher's Supplies", "dex"),
            ("carpenter", "Carpenter's Tools", "str"),
            ("cook", "Cook's Utensils", "wis"),
            ("disg", "Disguise Kit", "cha"),
            ("forg", "Forgery Kit", "dex"),
            ("herb", "Herbalism Kit", "int"),
            ("navg", "Navigator's Tools", "wis"),
            ("pois", "Poisoner's Kit", "int"),
            ("smith", "Smith's Tools", "str"),
            ("thief", "Thieves' Tools", "dex"),
            ("tinker", "Tinker's Tools", "dex"),
        ]
        .into_iter()
        .map(|(key, name, ability)| ToolDef {
            key: key.to_string(),
            name: name.to_string(),
            ability: ability.to_string(),
        })
        .collect();

        let damage_types = [
            ("acid", "Acid"),
            ("bludgeoning", "Bludgeoning"),
            ("cold", "Cold"),
            ("fire", "Fire"),
            ("force", "Force"),
            ("lightning", "Lightning"),
            ("necrotic", "Necrotic"),
            ("piercing", "Piercing"),
            ("poison", "Poison"),
            ("psychic", "Psychic"),
            ("radiant", "Radiant"),
            ("slashing", "Slashing"),
            ("thunder", "Thunder"),
        ]
        .into_iter()
        .map(|(key, name)| DamageTypeDef {
            key: key.to_string(),
            name: name.to_string(),
        })
        .collect();

        Self {
            abilities,
            skills,
            tools,
            damage_types,
        }
    }
}

lazy_static::lazy_static! {
    /// Built-in 5e System Reference Document tables.
    pub static ref SRD: RulesTable = RulesTable::srd();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_key_or_name() {
        assert_eq!(SRD.ability("dex").unwrap().name, "Dexterity");
        assert_eq!(SRD.ability("Dexterity").unwrap().key, "dex");
        assert_eq!(SRD.skill("sleight-of-hand").unwrap().key, "slt");
        assert_eq!(SRD.tool("thief").unwrap().ability, "dex");
    }

    #[test]
    fn test_skill_default_ability() {
        assert_eq!(SRD.skill("acr").unwrap().ability, "dex");
        assert_eq!(SRD.skill("ath").unwrap().ability, "str");
    }

    #[test]
    fn test_require_reports_not_found() {
        let err = SRD.require_skill("juggling").unwrap_err();
        assert!(matches!(
            err,
            RulesError::NotFound { kind: LookupKind::Skill, ref key } if key == "juggling"
        ));
    }
}
