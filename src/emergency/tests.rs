//! Tests for the emergency controller.

use super::*;
use crate::backend::mock::MockBackend;
use crate::clock::ManualClock;
use crate::confirm::ConfirmError;
use crate::domain::HistoryAction;
use crate::storage::MemoryStore;
use chrono::{Duration, TimeZone};
use rust_decimal_macros::dec;

struct Fixture {
    controller: EmergencyController,
    clock: Arc<ManualClock>,
    backend: Arc<MockBackend>,
    store: Arc<MemoryStore>,
}

async fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
    ));
    let backend = Arc::new(MockBackend::new(dec!(1000)));
    let store = Arc::new(MemoryStore::new());
    let controller = EmergencyController::load(
        store.clone(),
        clock.clone(),
        EmergencyConfig::default(),
        backend.clone(),
        std::time::Duration::from_secs(60),
    )
    .await
    .unwrap();

    Fixture {
        controller,
        clock,
        backend,
        store,
    }
}

fn ops() -> Actor {
    Actor::operator("ops")
}

#[tokio::test]
async fn test_soft_then_panic_supersedes() {
    let f = fixture().await;
    f.backend.add_position("p1", "u1");
    f.backend.add_position("p2", "u2");

    let soft = f
        .controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Soft, &ops(), "volatility")
        .await
        .unwrap();
    assert!(soft.closures.is_empty());
    assert_eq!(f.backend.close_calls(), 0);

    let panic = f
        .controller
        .system()
        .trigger(TriggerKind::AutomatedPanic, SystemLevel::Panic, &ops(), "feed down")
        .await
        .unwrap();
    assert_eq!(panic.event_id, soft.event_id + 1);
    assert_eq!(panic.closures.len(), 2);
    assert!(f.backend.is_closed("p1"));
    assert!(f.backend.is_closed("p2"));

    let status = f.controller.system().status();
    assert!(status.blocking);
    assert_eq!(status.state.unwrap().level, SystemLevel::Panic);
    assert_eq!(status.recovers_in_minutes, None);

    let history = f.controller.system().history().await.unwrap();
    let actions: Vec<_> = history.iter().map(|h| (h.action, h.event.level)).collect();
    assert_eq!(
        actions,
        vec![
            (HistoryAction::Activated, SystemLevel::Soft),
            (HistoryAction::Escalated, SystemLevel::Panic),
        ]
    );
}

#[tokio::test]
async fn test_non_stricter_trigger_is_rejected() {
    let f = fixture().await;
    let system = f.controller.system();
    system
        .trigger(TriggerKind::Manual, SystemLevel::Hard, &ops(), "first")
        .await
        .unwrap();

    let err = system
        .trigger(TriggerKind::Manual, SystemLevel::Soft, &ops(), "second")
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::NotStricter { .. }));

    let err = system
        .trigger(TriggerKind::Manual, SystemLevel::Hard, &ops(), "again")
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::NotStricter { .. }));
    assert_eq!(system.status().state.unwrap().reason, "first");
}

#[tokio::test]
async fn test_trigger_requires_privilege() {
    let f = fixture().await;
    let err = f
        .controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Soft, &Actor::user("u1"), "x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EmergencyError::InsufficientPrivilege {
            required: Privilege::Operator
        }
    ));

    let err = f
        .controller
        .system()
        .trigger(TriggerKind::AdminOverride, SystemLevel::Soft, &ops(), "x")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EmergencyError::InsufficientPrivilege {
            required: Privilege::Admin
        }
    ));
}

#[tokio::test]
async fn test_hard_stop_records_failed_closures() {
    let f = fixture().await;
    f.backend.add_position("p1", "u1");
    f.backend.add_position("p2", "u1");
    f.backend.fail_close("p2");

    let state = f
        .controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Hard, &ops(), "broker issue")
        .await
        .unwrap();

    assert_eq!(state.closures.len(), 2);
    let failed: Vec<_> = state.failed_closures().map(|c| c.position_id.as_str()).collect();
    assert_eq!(failed, vec!["p2"]);
    // the stop stays active despite the failure
    assert!(f.controller.system().status().blocking);
}

#[tokio::test]
async fn test_listing_failure_keeps_stop_active() {
    let f = fixture().await;
    f.backend.set_listing_fails(true);

    let state = f
        .controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Hard, &ops(), "x")
        .await
        .unwrap();
    assert!(state.closures.is_empty());
    assert!(state.closure_error.is_some());
    assert!(f.controller.system().blocking().is_some());
}

#[tokio::test]
async fn test_system_recovery_rules() {
    let f = fixture().await;
    let system = f.controller.system();
    system
        .trigger(TriggerKind::AutomatedPanic, SystemLevel::Soft, &ops(), "spike")
        .await
        .unwrap();

    let err = system.recover(&ops(), false).await.unwrap_err();
    assert!(matches!(err, EmergencyError::RecoveryNotDue { .. }));

    // automated soft stop may be forced by an operator
    let recovered = system.recover(&ops(), true).await.unwrap();
    assert!(!recovered.active);
    assert!(system.blocking().is_none());

    system
        .trigger(TriggerKind::Manual, SystemLevel::Panic, &ops(), "manual panic")
        .await
        .unwrap();
    let err = system.recover(&ops(), false).await.unwrap_err();
    assert!(matches!(err, EmergencyError::ManualRecoveryRequired));
    let err = system.recover(&ops(), true).await.unwrap_err();
    assert!(matches!(
        err,
        EmergencyError::InsufficientPrivilege {
            required: Privilege::Admin
        }
    ));
    system.recover(&Actor::admin("root"), true).await.unwrap();

    let err = system.recover(&Actor::admin("root"), true).await.unwrap_err();
    assert!(matches!(err, EmergencyError::NotActive));

    let history = system.history().await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[3].action, HistoryAction::Recovered);
}

#[tokio::test]
async fn test_lapsed_system_stop_stops_blocking_then_sweep_recovers() {
    let f = fixture().await;
    f.controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Soft, &ops(), "x")
        .await
        .unwrap();

    f.clock.advance(Duration::minutes(30));
    assert_eq!(f.controller.system().status().recovers_in_minutes, Some(30));

    f.clock.advance(Duration::minutes(31));
    let status = f.controller.system().status();
    assert!(!status.blocking);
    // still recorded as active until the sweep
    assert!(status.state.unwrap().active);
    assert!(f.controller.check("u1", Surface::Signal).await.unwrap().is_none());

    let sweep = f.controller.sweep().await.unwrap();
    assert!(sweep.system_recovered.is_some());
    assert!(!f.controller.system().status().state.unwrap().active);

    let again = f.controller.sweep().await.unwrap();
    assert!(again.system_recovered.is_none());
}

#[tokio::test]
async fn test_system_stop_is_restored_on_load() {
    let f = fixture().await;
    f.controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Hard, &ops(), "persisted")
        .await
        .unwrap();

    let reloaded = EmergencyController::load(
        f.store.clone(),
        f.clock.clone(),
        EmergencyConfig::default(),
        f.backend.clone(),
        std::time::Duration::from_secs(60),
    )
    .await
    .unwrap();
    let state = reloaded.system().blocking().unwrap();
    assert_eq!(state.reason, "persisted");
}

#[tokio::test]
async fn test_system_stop_two_phase() {
    let f = fixture().await;
    f.backend.add_position("p1", "u1");

    let prompt = f
        .controller
        .request_system_stop(&ops(), SystemLevel::Hard, "maintenance")
        .await
        .unwrap();
    assert_eq!(prompt.positions_to_close, Some(1));
    assert!(f.controller.system().blocking().is_none());

    let state = f
        .controller
        .confirm_system_stop(&ops(), &prompt.token)
        .await
        .unwrap();
    assert_eq!(state.kind, TriggerKind::Manual);
    assert!(f.backend.is_closed("p1"));

    let err = f
        .controller
        .request_system_stop(&Actor::user("u1"), SystemLevel::Panic, "x")
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::InsufficientPrivilege { .. }));
}

#[tokio::test]
async fn test_unprivileged_confirm_keeps_pending_system_stop() {
    let f = fixture().await;

    let prompt = f
        .controller
        .request_system_stop(&ops(), SystemLevel::Soft, "maintenance")
        .await
        .unwrap();

    let err = f
        .controller
        .confirm_system_stop(&Actor::user("u1"), &ConfirmationToken::from("guess"))
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::InsufficientPrivilege { .. }));

    let state = f
        .controller
        .confirm_system_stop(&ops(), &prompt.token)
        .await
        .unwrap();
    assert_eq!(state.level, SystemLevel::Soft);
    assert!(f.controller.system().blocking().is_some());
}

#[tokio::test]
async fn test_user_stop_confirm_applies_requested_level() {
    let f = fixture().await;
    f.backend.add_position("p1", "u1");
    f.backend.add_position("p2", "u2");

    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::CloseAll, "tilted")
        .await
        .unwrap();
    assert_eq!(prompt.positions_to_close, Some(1));
    assert!(!prompt.blocks_manual);
    assert_eq!(prompt.auto_recover_after, Some(Duration::hours(24)));
    assert!(f.controller.users().blocking("u1", Surface::Signal).await.unwrap().is_none());

    let state = f
        .controller
        .confirm_user_stop("u1", &prompt.token)
        .await
        .unwrap();
    assert_eq!(state.level, UserLevel::CloseAll);
    assert!(f.backend.is_closed("p1"));
    assert!(!f.backend.is_closed("p2"));

    let rejection = f.controller.check("u1", Surface::Signal).await.unwrap().unwrap();
    assert_eq!(rejection.code, RejectCode::UserEmergencyStop);
    assert!(f.controller.check("u2", Surface::Signal).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_user_stop_never_activates() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::PauseNew, "x")
        .await
        .unwrap();

    f.clock.advance(Duration::seconds(61));
    let err = f
        .controller
        .confirm_user_stop("u1", &prompt.token)
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::Confirm(ConfirmError::Expired)));

    let status = f.controller.users().status("u1").await.unwrap();
    assert!(!status.blocking);
    assert!(status.state.is_none());
    assert!(status.pending_level.is_none());
}

#[tokio::test]
async fn test_user_stop_surfaces() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::PauseNew, "break")
        .await
        .unwrap();
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();

    assert!(f.controller.check("u1", Surface::Signal).await.unwrap().is_some());
    assert!(f.controller.check("u1", Surface::Manual).await.unwrap().is_none());

    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::AccountLock, "locked")
        .await
        .unwrap();
    assert!(prompt.blocks_manual);
    assert_eq!(prompt.auto_recover_after, None);
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();

    let rejection = f.controller.check("u1", Surface::Manual).await.unwrap().unwrap();
    assert_eq!(rejection.code, RejectCode::UserEmergencyStop);
}

#[tokio::test]
async fn test_system_stop_takes_precedence() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::AccountLock, "locked")
        .await
        .unwrap();
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();
    f.controller
        .system()
        .trigger(TriggerKind::Manual, SystemLevel::Soft, &ops(), "global")
        .await
        .unwrap();

    for surface in [Surface::Signal, Surface::Manual] {
        let rejection = f.controller.check("u1", surface).await.unwrap().unwrap();
        assert_eq!(rejection.code, RejectCode::SystemEmergencyStop);
    }
}

#[tokio::test]
async fn test_user_recovery_rules() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::AccountLock, "locked")
        .await
        .unwrap();
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();
    let users = f.controller.users();

    let err = users.recover("u1", &Actor::user("u1"), false).await.unwrap_err();
    assert!(matches!(err, EmergencyError::ManualRecoveryRequired));

    let err = users.recover("u1", &Actor::user("u1"), true).await.unwrap_err();
    assert!(matches!(
        err,
        EmergencyError::InsufficientPrivilege {
            required: Privilege::Admin
        }
    ));

    let err = users.recover("u1", &Actor::user("u2"), true).await.unwrap_err();
    assert!(matches!(err, EmergencyError::InsufficientPrivilege { .. }));

    users.recover("u1", &Actor::admin("root"), true).await.unwrap();
    assert!(f.controller.check("u1", Surface::Manual).await.unwrap().is_none());
}

#[tokio::test]
async fn test_user_may_force_own_pause() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::PauseNew, "break")
        .await
        .unwrap();
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();
    let users = f.controller.users();

    let err = users.recover("u1", &Actor::user("u1"), false).await.unwrap_err();
    assert!(matches!(err, EmergencyError::RecoveryNotDue { .. }));

    let state = users.recover("u1", &Actor::user("u1"), true).await.unwrap();
    assert!(!state.active);
    assert!(state.recovered_at.is_some());
}

#[tokio::test]
async fn test_user_stop_auto_recovers_on_sweep() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::PauseNew, "break")
        .await
        .unwrap();
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();

    f.clock.advance(Duration::hours(1));
    assert!(f.controller.check("u1", Surface::Signal).await.unwrap().is_none());

    let sweep = f.controller.sweep().await.unwrap();
    assert_eq!(sweep.users_recovered.len(), 1);
    assert_eq!(sweep.users_recovered[0].user_id, "u1");
}

#[tokio::test]
async fn test_status_is_idempotent() {
    let f = fixture().await;
    let prompt = f
        .controller
        .request_user_stop("u1", UserLevel::CloseAll, "x")
        .await
        .unwrap();

    let first = f.controller.users().status("u1").await.unwrap();
    let second = f.controller.users().status("u1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.pending_level, Some(UserLevel::CloseAll));
    assert_eq!(f.controller.system().status(), f.controller.system().status());

    // status never consumed the pending request
    f.controller.confirm_user_stop("u1", &prompt.token).await.unwrap();
}

#[tokio::test]
async fn test_cancel_finds_scope_by_token() {
    let f = fixture().await;
    let user_prompt = f
        .controller
        .request_user_stop("u1", UserLevel::PauseNew, "x")
        .await
        .unwrap();
    let system_prompt = f
        .controller
        .request_system_stop(&ops(), SystemLevel::Soft, "y")
        .await
        .unwrap();

    assert_eq!(
        f.controller.cancel(&user_prompt.token).await.unwrap(),
        Scope::User("u1".to_string())
    );
    assert_eq!(
        f.controller.cancel(&system_prompt.token).await.unwrap(),
        Scope::System
    );

    let err = f.controller.cancel(&user_prompt.token).await.unwrap_err();
    assert!(matches!(err, EmergencyError::Confirm(ConfirmError::NotFound)));

    let err = f
        .controller
        .confirm_user_stop("u1", &user_prompt.token)
        .await
        .unwrap_err();
    assert!(matches!(err, EmergencyError::Confirm(ConfirmError::NotFound)));
}

#[tokio::test]
async fn test_sweep_purges_lapsed_confirmations() {
    let f = fixture().await;
    f.controller
        .request_user_stop("u1", UserLevel::PauseNew, "x")
        .await
        .unwrap();
    f.controller
        .request_system_stop(&ops(), SystemLevel::Soft, "y")
        .await
        .unwrap();

    f.clock.advance(Duration::minutes(2));
    let sweep = f.controller.sweep().await.unwrap();
    assert_eq!(sweep.confirmations_lapsed, 2);
}
