//! Advancement flow tests against the in-memory store.
//!
//! These tests verify:
//! - Apply then reverse restores the stored character exactly
//! - Level up and level down are all-or-nothing
//! - Failed item creation rolls back everything it touched
//! - Reversing one node leaves sibling nodes' changes in place
//! - A failed reverse leaves the node applied and the stats untouched
//! - Level order and cancellation rules

use dnd_rules::advancement::{
    Advancement, AdvancementEngine, AdvancementId, AdvancementKind, AdvancementStatus,
    AdvancementValue, HitPointsChoice, NodeKey, RulesItem,
};
use dnd_rules::character::CharacterId;
use dnd_rules::config::AdvancementSettings;
use dnd_rules::dice::DiceRoller;
use dnd_rules::error::{Outcome, RulesError};
use dnd_rules::rules_table::SRD;
use dnd_rules::dice::DieType;
use dnd_rules::store::{DocumentStore, StoreError};
use dnd_rules::testing::{
    sample_fighter, sample_fighter_class, sample_store, MemoryStore, ScriptedPrompt,
};
use serde_json::json;

struct Fixture {
    store: MemoryStore,
    roller: DiceRoller,
    settings: AdvancementSettings,
    class: RulesItem,
    id: CharacterId,
}

impl Fixture {
    fn new() -> Self {
        Self::with_store(|store| store)
    }

    fn with_store(configure: impl FnOnce(MemoryStore) -> MemoryStore) -> Self {
        let character = sample_fighter(&SRD);
        let id = character.id;
        Self {
            store: configure(sample_store(character)),
            roller: DiceRoller::seeded(42),
            settings: AdvancementSettings::default(),
            class: sample_fighter_class().unwrap(),
            id,
        }
    }

    fn engine(&self) -> AdvancementEngine<'_> {
        AdvancementEngine::new(&self.store, &self.roller, &SRD, &self.settings)
    }

    async fn snapshot(&self) -> Vec<u8> {
        self.store.snapshot(self.id).await.unwrap()
    }
}

fn adv(id: &str) -> AdvancementId {
    AdvancementId::new(id)
}

fn language(id: &str, grant: &str) -> Advancement {
    Advancement::new(
        id,
        "Languages",
        AdvancementKind::Trait {
            level: 1,
            grants: vec![grant.to_string()],
            choices: Vec::new(),
            choose: 0,
        },
    )
}

fn wizard_class() -> RulesItem {
    RulesItem::new(
        "wizard",
        "Wizard",
        vec![Advancement::new(
            "hit-points",
            "Hit Points",
            AdvancementKind::HitPoints {
                hit_die: DieType::D6,
            },
        )],
    )
    .unwrap()
}

/// A level 1 feat raising constitution by one plus two chosen points.
fn feat() -> RulesItem {
    RulesItem::new(
        "tough",
        "Tough",
        vec![Advancement::new(
            "asi",
            "Ability Score Improvement",
            AdvancementKind::AbilityScoreImprovement {
                level: 1,
                points: 2,
                cap: 17,
                fixed: [("con".to_string(), 1)].into(),
            },
        )],
    )
    .unwrap()
}

fn scores(pairs: &[(&str, i64)]) -> Outcome<AdvancementValue> {
    Outcome::Completed(AdvancementValue::AbilityScores(
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
    ))
}

// =============================================================================
// APPLY / REVERSE
// =============================================================================

#[tokio::test]
async fn test_apply_then_reverse_is_byte_equal() {
    let fx = Fixture::new();
    let before = fx.snapshot().await;

    let applied = fx
        .engine()
        .apply(fx.id, &fx.class, &adv("hit-points"), 1)
        .await
        .unwrap()
        .completed()
        .unwrap();
    // d10 maximum plus the +2 constitution modifier.
    assert_eq!(applied.get("attributes.hp.max"), Some(&json!(12)));
    assert_ne!(fx.snapshot().await, before);

    fx.engine()
        .reverse(fx.id, &fx.class, &adv("hit-points"), 1)
        .await
        .unwrap();
    assert_eq!(fx.snapshot().await, before);

    let progression = fx.store.progression(fx.id).await.unwrap();
    let key = NodeKey::new(fx.class.id, adv("hit-points"), 1);
    assert_eq!(progression.status(&key), AdvancementStatus::Reversed);
}

#[tokio::test]
async fn test_item_grant_reverse_deletes_only_recorded_items() {
    let fx = Fixture::new();
    let before = fx.snapshot().await;

    let character = fx
        .engine()
        .apply(fx.id, &fx.class, &adv("features-1"), 1)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(character.items.len(), 2);

    let character = fx
        .engine()
        .reverse(fx.id, &fx.class, &adv("features-1"), 1)
        .await
        .unwrap();
    assert!(character.items.is_empty());
    assert_eq!(fx.snapshot().await, before);
}

#[tokio::test]
async fn test_reversed_node_can_be_reapplied() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine
        .apply(fx.id, &fx.class, &adv("saves"), 1)
        .await
        .unwrap();
    engine
        .reverse(fx.id, &fx.class, &adv("saves"), 1)
        .await
        .unwrap();
    let character = engine
        .apply(fx.id, &fx.class, &adv("saves"), 1)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(character.get("abilities.con.proficient"), Some(&json!(1)));
}

#[tokio::test]
async fn test_apply_twice_is_rejected() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine
        .apply(fx.id, &fx.class, &adv("hit-points"), 1)
        .await
        .unwrap();
    let result = engine.apply(fx.id, &fx.class, &adv("hit-points"), 1).await;
    assert!(matches!(result, Err(RulesError::InvalidConfiguration(_))));

    let reconfigure = engine
        .configure_stored(
            fx.id,
            &fx.class,
            &adv("hit-points"),
            1,
            AdvancementValue::HitPoints(HitPointsChoice::Average),
        )
        .await;
    assert!(matches!(reconfigure, Err(RulesError::InvalidConfiguration(_))));
}

#[tokio::test]
async fn test_unknown_advancement_is_not_found() {
    let fx = Fixture::new();
    let result = fx.engine().apply(fx.id, &fx.class, &adv("rage"), 1).await;
    assert!(matches!(result, Err(RulesError::NotFound { .. })));
}

// =============================================================================
// LEVEL UP / LEVEL DOWN
// =============================================================================

#[tokio::test]
async fn test_level_up_applies_every_node() {
    let fx = Fixture::new();
    let character = fx
        .engine()
        .level_up(fx.id, &fx.class)
        .await
        .unwrap()
        .completed()
        .unwrap();

    assert_eq!(character.level(), 1);
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(12)));
    assert_eq!(character.get("abilities.str.proficient"), Some(&json!(1)));
    assert_eq!(
        character.get("scale.fighter.second-wind"),
        Some(&json!("1d10"))
    );
    let names: Vec<&str> = character.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["Fighting Style", "Second Wind"]);
}

#[tokio::test]
async fn test_level_up_then_down_is_byte_equal() {
    let fx = Fixture::new();
    let before = fx.snapshot().await;

    fx.engine().level_up(fx.id, &fx.class).await.unwrap();
    let character = fx.engine().level_down(fx.id, &fx.class).await.unwrap();

    assert_eq!(character.level(), 0);
    assert_eq!(fx.snapshot().await, before);
}

#[tokio::test]
async fn test_second_level_prompts_for_hit_points() {
    let fx = Fixture::new();
    let prompt = ScriptedPrompt::new().then(Outcome::Completed(AdvancementValue::HitPoints(
        HitPointsChoice::Average,
    )));
    let engine = fx.engine().with_prompt(&prompt);

    engine.level_up(fx.id, &fx.class).await.unwrap();
    assert_eq!(prompt.asked(), 0);

    let character = engine
        .level_up(fx.id, &fx.class)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(prompt.asked(), 1);
    assert_eq!(character.level(), 2);
    // 12 at first level, then the d10 average of 6 plus 2.
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(20)));
    assert_eq!(
        character.get("scale.fighter.second-wind"),
        Some(&json!("1d10 + 1"))
    );
    assert_eq!(character.items.len(), 3);

    let character = engine.level_down(fx.id, &fx.class).await.unwrap();
    assert_eq!(character.level(), 1);
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(12)));
    assert_eq!(
        character.get("scale.fighter.second-wind"),
        Some(&json!("1d10"))
    );
    assert_eq!(character.items.len(), 2);
}

#[tokio::test]
async fn test_cancelled_prompt_changes_nothing() {
    let fx = Fixture::new();
    let prompt = ScriptedPrompt::new();
    let engine = fx.engine().with_prompt(&prompt);
    engine.level_up(fx.id, &fx.class).await.unwrap();
    let before = fx.snapshot().await;

    let outcome = engine.level_up(fx.id, &fx.class).await.unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(prompt.asked(), 1);
    assert_eq!(fx.snapshot().await, before);
}

#[tokio::test]
async fn test_missing_prompt_is_invalid() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine.level_up(fx.id, &fx.class).await.unwrap();
    let result = engine.level_up(fx.id, &fx.class).await;
    assert!(matches!(result, Err(RulesError::InvalidConfiguration(_))));
}

#[tokio::test]
async fn test_configured_roll_is_recorded() {
    let fx = Fixture::new();
    let engine = fx.engine();
    engine.level_up(fx.id, &fx.class).await.unwrap();
    engine
        .configure_stored(
            fx.id,
            &fx.class,
            &adv("hit-points"),
            2,
            AdvancementValue::HitPoints(HitPointsChoice::Roll),
        )
        .await
        .unwrap();

    let character = engine
        .apply(fx.id, &fx.class, &adv("hit-points"), 2)
        .await
        .unwrap()
        .completed()
        .unwrap();

    let progression = fx.store.progression(fx.id).await.unwrap();
    let key = NodeKey::new(fx.class.id, adv("hit-points"), 2);
    let Some(AdvancementValue::HitPoints(HitPointsChoice::Rolled(rolled))) =
        progression.value(&key).cloned()
    else {
        panic!("expected a rolled value");
    };
    assert!((1..=10).contains(&rolled));
    assert_eq!(
        character.get("attributes.hp.max"),
        Some(&json!(12 + rolled as i64 + 2))
    );
}

#[tokio::test]
async fn test_level_up_stops_at_max_level() {
    let mut fx = Fixture::new();
    fx.settings.max_level = 1;
    fx.engine().level_up(fx.id, &fx.class).await.unwrap();
    let result = fx.engine().level_up(fx.id, &fx.class).await;
    assert!(matches!(result, Err(RulesError::InvalidConfiguration(_))));
}

// =============================================================================
// ORDERING
// =============================================================================

#[tokio::test]
async fn test_apply_out_of_order_is_rejected() {
    let fx = Fixture::new();
    let result = fx
        .engine()
        .apply(fx.id, &fx.class, &adv("features-2"), 2)
        .await;
    assert!(matches!(result, Err(RulesError::LevelOrder { level: 2, .. })));
}

#[tokio::test]
async fn test_reverse_below_applied_level_is_rejected() {
    let fx = Fixture::new();
    let prompt = ScriptedPrompt::new().then(Outcome::Completed(AdvancementValue::HitPoints(
        HitPointsChoice::Max,
    )));
    let engine = fx.engine().with_prompt(&prompt);
    engine.level_up(fx.id, &fx.class).await.unwrap();
    engine.level_up(fx.id, &fx.class).await.unwrap();

    let result = engine
        .reverse(fx.id, &fx.class, &adv("hit-points"), 1)
        .await;
    assert!(matches!(result, Err(RulesError::LevelOrder { level: 1, .. })));

    let result = engine
        .reverse(fx.id, &fx.class, &adv("hit-points"), 2)
        .await;
    assert!(result.is_ok());
}

// =============================================================================
// FAILURE ROLLBACK
// =============================================================================

#[tokio::test]
async fn test_partial_item_creation_rolls_back() {
    let fx = Fixture::with_store(|store| store.fail_item_creation_after(1));
    let before = fx.snapshot().await;

    let result = fx
        .engine()
        .apply(fx.id, &fx.class, &adv("features-1"), 1)
        .await;
    assert!(matches!(
        result,
        Err(RulesError::PartialApplyFailure { level: 1, .. })
    ));

    assert_eq!(fx.snapshot().await, before);
    let progression = fx.store.progression(fx.id).await.unwrap();
    assert!(progression.is_empty());
}

#[tokio::test]
async fn test_failed_level_up_unwinds_earlier_nodes() {
    let fx = Fixture::with_store(|store| store.fail_item_creation_after(1));
    let before = fx.snapshot().await;

    let result = fx.engine().level_up(fx.id, &fx.class).await;
    assert!(matches!(result, Err(RulesError::PartialApplyFailure { .. })));

    assert_eq!(fx.snapshot().await, before);
    let progression = fx.store.progression(fx.id).await.unwrap();
    assert_eq!(progression.applied(fx.class.id).count(), 0);
}

#[tokio::test]
async fn test_rejected_update_rolls_back_items() {
    let fx = Fixture::new();
    fx.store.reject_updates(true).await;

    let result = fx
        .engine()
        .apply(fx.id, &fx.class, &adv("hit-points"), 1)
        .await;
    assert!(matches!(result, Err(RulesError::PartialApplyFailure { .. })));

    fx.store.reject_updates(false).await;
    let character = fx.store.character(fx.id).await.unwrap();
    assert!(character.items.is_empty());
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(0)));
}

// =============================================================================
// SIBLING NODES
// =============================================================================

#[tokio::test]
async fn test_reversing_one_trait_keeps_sibling_grants() {
    let fx = Fixture::new();
    let background = RulesItem::new(
        "sage",
        "Sage",
        vec![
            language("common", "languages:common"),
            language("elvish", "languages:elvish"),
        ],
    )
    .unwrap();
    let before = fx.snapshot().await;
    let engine = fx.engine();

    engine.apply(fx.id, &background, &adv("common"), 1).await.unwrap();
    engine.apply(fx.id, &background, &adv("elvish"), 1).await.unwrap();

    let character = engine
        .reverse(fx.id, &background, &adv("common"), 1)
        .await
        .unwrap();
    assert_eq!(character.get("traits.languages"), Some(&json!(["elvish"])));
    let progression = fx.store.progression(fx.id).await.unwrap();
    let elvish = NodeKey::new(background.id, adv("elvish"), 1);
    assert_eq!(progression.status(&elvish), AdvancementStatus::Applied);

    let character = engine
        .reverse(fx.id, &background, &adv("elvish"), 1)
        .await
        .unwrap();
    assert_eq!(character.get("traits.languages"), Some(&json!([])));
    assert_eq!(fx.snapshot().await, before);
}

#[tokio::test]
async fn test_hit_points_of_two_classes_reverse_independently() {
    let fx = Fixture::new();
    let wizard = wizard_class();
    let before = fx.snapshot().await;
    let engine = fx.engine();

    engine.apply(fx.id, &fx.class, &adv("hit-points"), 1).await.unwrap();
    let character = engine
        .apply(fx.id, &wizard, &adv("hit-points"), 1)
        .await
        .unwrap()
        .completed()
        .unwrap();
    // 10 + 2 for the fighter, 6 + 2 for the wizard.
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(20)));

    let character = engine
        .reverse(fx.id, &fx.class, &adv("hit-points"), 1)
        .await
        .unwrap();
    assert_eq!(character.get("attributes.hp.max"), Some(&json!(8)));
    assert_eq!(character.get("attributes.hp.value"), Some(&json!(8)));

    engine.reverse(fx.id, &wizard, &adv("hit-points"), 1).await.unwrap();
    assert_eq!(fx.snapshot().await, before);
}

// =============================================================================
// ABILITY SCORE IMPROVEMENT
// =============================================================================

#[tokio::test]
async fn test_ability_score_improvement_round_trip() {
    let fx = Fixture::new();
    let feat = feat();
    let prompt = ScriptedPrompt::new().then(scores(&[("str", 1), ("dex", 1)]));
    let engine = fx.engine().with_prompt(&prompt);
    let before = fx.snapshot().await;

    let character = engine
        .apply(fx.id, &feat, &adv("asi"), 1)
        .await
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(character.ability_score("str"), Some(17));
    assert_eq!(character.ability_score("dex"), Some(15));
    // The fixed increase applies on top of the choice.
    assert_eq!(character.ability_score("con"), Some(16));

    engine.reverse(fx.id, &feat, &adv("asi"), 1).await.unwrap();
    assert_eq!(fx.snapshot().await, before);
}

#[tokio::test]
async fn test_ability_score_above_cap_is_rejected() {
    let fx = Fixture::new();
    let feat = feat();
    let prompt = ScriptedPrompt::new().then(scores(&[("str", 2)]));
    let engine = fx.engine().with_prompt(&prompt);
    let before = fx.snapshot().await;

    let result = engine.apply(fx.id, &feat, &adv("asi"), 1).await;
    assert!(matches!(result, Err(RulesError::InvalidConfiguration(_))));
    assert_eq!(fx.snapshot().await, before);
    let progression = fx.store.progression(fx.id).await.unwrap();
    assert_eq!(progression.applied(feat.id).count(), 0);
}

// =============================================================================
// FAILED REVERSE
// =============================================================================

#[tokio::test]
async fn test_failed_item_deletion_keeps_node_applied() {
    let fx = Fixture::new();
    fx.engine().level_up(fx.id, &fx.class).await.unwrap();
    let applied = fx.snapshot().await;

    fx.store.reject_deletes(true).await;
    let result = fx.engine().level_down(fx.id, &fx.class).await;
    assert!(matches!(
        result,
        Err(RulesError::Store(StoreError::Rejected(_)))
    ));
    assert_eq!(fx.snapshot().await, applied);

    let progression = fx.store.progression(fx.id).await.unwrap();
    for id in ["hit-points", "saves", "features-1", "second-wind"] {
        let key = NodeKey::new(fx.class.id, adv(id), 1);
        assert_eq!(progression.status(&key), AdvancementStatus::Applied, "{id}");
    }

    fx.store.reject_deletes(false).await;
    let character = fx.engine().level_down(fx.id, &fx.class).await.unwrap();
    assert_eq!(character.level(), 0);
    assert!(character.items.is_empty());
}

#[tokio::test]
async fn test_failed_progression_save_restores_stats() {
    let fx = Fixture::new();
    fx.engine()
        .apply(fx.id, &fx.class, &adv("saves"), 1)
        .await
        .unwrap();
    let applied = fx.snapshot().await;

    fx.store.reject_progression_saves(true).await;
    let result = fx
        .engine()
        .reverse(fx.id, &fx.class, &adv("saves"), 1)
        .await;
    assert!(matches!(
        result,
        Err(RulesError::Store(StoreError::Rejected(_)))
    ));
    assert_eq!(fx.snapshot().await, applied);

    fx.store.reject_progression_saves(false).await;
    let progression = fx.store.progression(fx.id).await.unwrap();
    let key = NodeKey::new(fx.class.id, adv("saves"), 1);
    assert_eq!(progression.status(&key), AdvancementStatus::Applied);
}
