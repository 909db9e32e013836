//! Tests for storage module.

use super::*;
use crate::domain::{
    Actor, ClosureOutcome, HistoryAction, PositionClosure, RiskMode, SystemLevel, TriggerKind,
    UserLevel,
};
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use tempfile::TempDir;

fn at(hour: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()
}

async fn sqlite_store(dir: &TempDir) -> SqliteStore {
    let path = dir.path().join("state.db");
    SqliteStore::new(SqliteStoreConfig {
        path: path.to_string_lossy().into_owned(),
        max_connections: 1,
    })
    .await
    .unwrap()
}

fn system_event(event_id: u64, level: SystemLevel) -> SystemEmergency {
    SystemEmergency {
        event_id,
        active: true,
        level,
        kind: TriggerKind::Manual,
        actor: Actor::admin("root"),
        reason: "exchange outage".into(),
        triggered_at: at(9),
        auto_recover_at: None,
        closures: vec![PositionClosure {
            position_id: "p-1".into(),
            user_id: "u1".into(),
            symbol: "EURUSD".into(),
            outcome: ClosureOutcome::Failed {
                error: "timeout".into(),
            },
        }],
        closure_error: None,
        recovered_at: None,
    }
}

async fn exercise_profiles(store: &dyn StateStore) {
    assert!(store.load_profile("u1").await.unwrap().is_none());

    let mut profile = RiskProfile::new("u1", "basic", at(8));
    profile.mode = RiskMode::Boosted;
    profile.loss_today = dec!(125.50);
    profile.push_high_risk_loss(dec!(60));
    store.save_profile(&profile).await.unwrap();

    profile.trades_today = 3;
    store.save_profile(&profile).await.unwrap();

    let loaded = store.load_profile("u1").await.unwrap().unwrap();
    assert_eq!(loaded, profile);
}

async fn exercise_cooldowns(store: &dyn StateStore) {
    let record = CooldownRecord {
        user_id: "u2".into(),
        activated_at: at(10),
        expires_at: at(10) + chrono::Duration::hours(24),
        reason: "2 consecutive high-risk losses".into(),
        loss_count: 2,
        loss_amounts: vec![dec!(50), dec!(75)],
        max_trades_per_day: 2,
        risk_percent: dec!(0.5),
    };
    store.save_cooldown(&record).await.unwrap();
    store
        .save_cooldown(&CooldownRecord {
            user_id: "u1".into(),
            ..record.clone()
        })
        .await
        .unwrap();

    assert_eq!(store.load_cooldown("u2").await.unwrap(), Some(record));
    let listed: Vec<String> = store
        .list_cooldowns()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.user_id)
        .collect();
    assert_eq!(listed, vec!["u1".to_string(), "u2".to_string()]);

    assert!(store.delete_cooldown("u2").await.unwrap());
    assert!(!store.delete_cooldown("u2").await.unwrap());
    assert!(store.load_cooldown("u2").await.unwrap().is_none());
}

async fn exercise_emergencies(store: &dyn StateStore) {
    let user = UserEmergency {
        user_id: "u1".into(),
        active: true,
        level: UserLevel::CloseAll,
        reason: "tilted".into(),
        activated_at: at(11),
        auto_recover_at: Some(at(11) + chrono::Duration::hours(24)),
        closures: vec![],
        closure_error: None,
        recovered_at: None,
    };
    store.save_user_emergency(&user).await.unwrap();
    assert_eq!(store.load_user_emergency("u1").await.unwrap(), Some(user));
    assert_eq!(store.list_user_emergencies().await.unwrap().len(), 1);

    assert!(store.load_system_emergency().await.unwrap().is_none());

    let soft = system_event(1, SystemLevel::Soft);
    let panic = system_event(2, SystemLevel::Panic);
    store.save_system_emergency(&soft).await.unwrap();
    store
        .append_system_history(&HistoryEntry {
            action: HistoryAction::Activated,
            event: soft.clone(),
            recorded_at: at(9),
        })
        .await
        .unwrap();
    store.save_system_emergency(&panic).await.unwrap();
    store
        .append_system_history(&HistoryEntry {
            action: HistoryAction::Escalated,
            event: panic.clone(),
            recorded_at: at(10),
        })
        .await
        .unwrap();

    assert_eq!(store.load_system_emergency().await.unwrap(), Some(panic));

    let history = store.system_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, HistoryAction::Activated);
    assert_eq!(history[0].event.level, SystemLevel::Soft);
    assert_eq!(history[1].action, HistoryAction::Escalated);
    assert_eq!(history[1].event.level, SystemLevel::Panic);
    assert_eq!(history[1].recorded_at, at(10));
}

#[tokio::test]
async fn test_memory_store_profiles() {
    exercise_profiles(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_memory_store_cooldowns() {
    exercise_cooldowns(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_memory_store_emergencies() {
    exercise_emergencies(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_store_profiles() {
    let dir = TempDir::new().unwrap();
    exercise_profiles(&sqlite_store(&dir).await).await;
}

#[tokio::test]
async fn test_sqlite_store_cooldowns() {
    let dir = TempDir::new().unwrap();
    exercise_cooldowns(&sqlite_store(&dir).await).await;
}

#[tokio::test]
async fn test_sqlite_store_emergencies() {
    let dir = TempDir::new().unwrap();
    exercise_emergencies(&sqlite_store(&dir).await).await;
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let store = sqlite_store(&dir).await;
    store
        .save_profile(&RiskProfile::new("u9", "pro", at(7)))
        .await
        .unwrap();
    store
        .save_system_emergency(&system_event(4, SystemLevel::Hard))
        .await
        .unwrap();
    store.close().await.unwrap();

    let reopened = sqlite_store(&dir).await;
    let profile = reopened.load_profile("u9").await.unwrap().unwrap();
    assert_eq!(profile.tier, "pro");
    let system = reopened.load_system_emergency().await.unwrap().unwrap();
    assert_eq!(system.event_id, 4);
    assert_eq!(system.closures[0].position_id, "p-1");
}
