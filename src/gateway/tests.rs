//! Tests for the fire gateway.

use super::*;
use crate::backend::mock::MockBackend;
use crate::clock::ManualClock;
use crate::config::{CooldownPolicy, EmergencyConfig, TierConfig};
use crate::domain::{Actor, Direction, SystemLevel, TriggerKind, UserLevel};
use crate::notification::EventType;
use crate::notification::recording::RecordingNotifier;
use crate::risk::{RiskSource, TierTable};
use crate::storage::MemoryStore;
use chrono::TimeZone;
use rust_decimal_macros::dec;
use std::collections::HashMap;

const IDLE_LIMIT: Duration = Duration::from_secs(3);

fn basic_tier() -> TierConfig {
    TierConfig {
        default_risk_percent: dec!(1),
        boosted_risk_percent: Some(dec!(2)),
        high_risk_percent: Some(dec!(3)),
        max_trades_per_day: 5,
        daily_drawdown_cap_percent: dec!(6),
        cooldown: CooldownPolicy {
            duration_hours: 24,
            max_trades_per_day: 4,
            risk_percent: dec!(0.5),
        },
    }
}

struct Fixture {
    gateway: Arc<FireGateway>,
    risk: Arc<RiskEngine>,
    emergency: Arc<EmergencyController>,
    backend: Arc<MockBackend>,
    signals: Arc<SignalBook>,
    notifier: Arc<RecordingNotifier>,
    stats: Arc<Mutex<Stats>>,
    clock: Arc<ManualClock>,
}

async fn fixture_with_timeout(result_timeout: Duration) -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MockBackend::new(dec!(1000)));
    let notifier = Arc::new(RecordingNotifier::new());
    let signals = Arc::new(SignalBook::new());
    let stats = Arc::new(Mutex::new(Stats::default()));

    let mut tiers = HashMap::new();
    tiers.insert("basic".to_string(), basic_tier());
    let risk = Arc::new(RiskEngine::new(
        TierTable::new(1, tiers).unwrap(),
        store.clone(),
        clock.clone(),
        Duration::from_secs(60),
    ));
    let emergency = Arc::new(
        EmergencyController::load(
            store.clone(),
            clock.clone(),
            EmergencyConfig::default(),
            backend.clone(),
            Duration::from_secs(60),
        )
        .await
        .unwrap(),
    );

    let gateway = Arc::new(FireGateway::new(
        risk.clone(),
        emergency.clone(),
        backend.clone(),
        signals.clone(),
        notifier.clone(),
        stats.clone(),
        clock.clone(),
        result_timeout,
    ));

    let fixture = Fixture {
        gateway,
        risk,
        emergency,
        backend,
        signals,
        notifier,
        stats,
        clock,
    };
    fixture.publish("sig-1").await;
    fixture
}

async fn fixture() -> Fixture {
    fixture_with_timeout(Duration::from_secs(30)).await
}

impl Fixture {
    async fn publish(&self, id: &str) {
        let now = self.clock.now();
        self.signals
            .publish(Signal {
                id: id.to_string(),
                symbol: "EURUSD".to_string(),
                direction: Direction::Long,
                entry_price: dec!(1.1000),
                stop_loss: dec!(1.0900),
                take_profit: Some(dec!(1.1200)),
                issued_at: now,
                valid_until: now + chrono::Duration::minutes(15),
            })
            .await;
    }

    async fn idle(&self) {
        assert!(self.gateway.monitors().wait_idle(IDLE_LIMIT).await);
    }
}

fn account() -> Account {
    Account::new("u1", "basic")
}

fn code(err: GatewayError) -> RejectCode {
    err.rejection().expect("expected a rejection").code
}

#[tokio::test]
async fn test_fire_sizes_from_effective_risk() {
    let f = fixture().await;

    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();

    assert_eq!(ack.risk.percent, dec!(1));
    assert_eq!(ack.risk.source, RiskSource::Mode(RiskMode::Default));
    assert_eq!(ack.risk_amount, dec!(10));
    assert_eq!(ack.size, dec!(1000));

    let submitted = f.backend.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].request_id, ack.request_id);
    assert_eq!(submitted[0].stop_loss, dec!(1.0900));

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.reserved_trades, 1);
    assert_eq!(status.trades_today, 0);
    assert_eq!(f.notifier.count(EventType::FireAdmitted), 1);
    assert_eq!(f.stats.lock().await.fires_admitted, 1);
}

#[tokio::test]
async fn test_requested_mode_sizes_the_trade() {
    let f = fixture().await;

    let ack = f
        .gateway
        .fire(&account(), "sig-1", Some(RiskMode::Boosted))
        .await
        .unwrap();

    assert_eq!(ack.risk.percent, dec!(2));
    assert_eq!(ack.size, dec!(2000));
}

#[tokio::test]
async fn test_settled_loss_is_recorded() {
    let f = fixture().await;
    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();

    assert!(f.backend.settle(&ack.request_id, true, dec!(-10)));
    f.idle().await;

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.trades_today, 1);
    assert_eq!(status.loss_today, dec!(10));
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(f.notifier.count(EventType::ExecutionSettled), 1);
    assert_eq!(f.notifier.count(EventType::ExecutionTimeout), 0);

    let stats = f.stats.lock().await;
    assert_eq!(stats.settled, 1);
    assert_eq!(stats.losses, 1);
    assert_eq!(stats.realized_pnl, dec!(-10));
}

#[tokio::test]
async fn test_failed_execution_frees_the_slot() {
    let f = fixture().await;
    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();

    assert!(f.backend.settle(&ack.request_id, false, Decimal::ZERO));
    f.idle().await;

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.trades_today, 0);
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(f.notifier.count(EventType::ExecutionFailed), 1);
}

#[tokio::test]
async fn test_timeout_notifies_once_and_records_no_loss() {
    let f = fixture_with_timeout(Duration::from_millis(100)).await;
    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();

    f.idle().await;

    // the late result finds nobody listening
    assert!(!f.backend.settle(&ack.request_id, true, dec!(-10)));

    assert_eq!(f.notifier.count(EventType::ExecutionTimeout), 1);
    assert_eq!(f.notifier.count(EventType::ExecutionSettled), 0);
    assert_eq!(f.notifier.count(EventType::ExecutionFailed), 0);

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.trades_today, 1);
    assert_eq!(status.loss_today, Decimal::ZERO);
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(f.stats.lock().await.timeouts, 1);
}

#[tokio::test]
async fn test_lost_result_stream_counts_as_timeout() {
    let f = fixture().await;
    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();

    assert!(f.backend.lose(&ack.request_id));
    f.idle().await;

    assert_eq!(f.notifier.count(EventType::ExecutionTimeout), 1);
    assert_eq!(f.risk.status(&account()).await.unwrap().trades_today, 1);
}

#[tokio::test]
async fn test_cancelled_monitor_commits_the_slot() {
    let f = fixture().await;
    f.gateway.fire(&account(), "sig-1", None).await.unwrap();
    assert_eq!(f.gateway.monitors().active_for("u1"), 1);

    assert_eq!(f.gateway.monitors().cancel_user("u1"), 1);
    f.idle().await;

    assert_eq!(f.notifier.count(EventType::MonitorCancelled), 1);
    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.trades_today, 1);
    assert_eq!(status.loss_today, Decimal::ZERO);
}

#[tokio::test]
async fn test_backend_unavailable_admits_nothing() {
    let f = fixture().await;
    f.backend.set_available(false);

    let err = f.gateway.fire(&account(), "sig-1", None).await.unwrap_err();
    let rejection = err.rejection().unwrap();
    assert_eq!(rejection.code, RejectCode::BackendUnavailable);
    assert_eq!(rejection.detail, "mock is not accepting orders");

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(status.trades_today, 0);
    assert!(f.backend.submitted().is_empty());
    assert_eq!(f.stats.lock().await.fires_rejected, 1);
}

#[tokio::test]
async fn test_signal_validation() {
    let f = fixture().await;

    let err = f.gateway.fire(&account(), "missing", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::SignalNotFound);

    f.clock.advance(chrono::Duration::minutes(15));
    let err = f.gateway.fire(&account(), "sig-1", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::SignalExpired);

    let now = f.clock.now();
    f.signals
        .publish(Signal {
            id: "bad".to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            entry_price: dec!(1.10),
            stop_loss: dec!(1.12),
            take_profit: None,
            issued_at: now,
            valid_until: now + chrono::Duration::minutes(5),
        })
        .await;
    let err = f.gateway.fire(&account(), "bad", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::InvalidSignal);
}

#[tokio::test]
async fn test_unrepresentable_size_is_rejected() {
    let f = fixture().await;
    let now = f.clock.now();
    f.signals
        .publish(Signal {
            id: "tight".to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Short,
            entry_price: dec!(1),
            stop_loss: dec!(1.0000000000000000000000000001),
            take_profit: None,
            issued_at: now,
            valid_until: now + chrono::Duration::minutes(5),
        })
        .await;

    let err = f.gateway.fire(&account(), "tight", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::InvalidSignal);

    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.reserved_trades, 0);
    assert!(f.backend.submitted().is_empty());
}

#[tokio::test]
async fn test_unknown_tier_is_rejected() {
    let f = fixture().await;
    let err = f
        .gateway
        .fire(&Account::new("u1", "platinum"), "sig-1", None)
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectCode::UnknownTier);
}

#[tokio::test]
async fn test_emergency_stops_block_fires() {
    let f = fixture().await;

    let prompt = f
        .emergency
        .request_user_stop("u1", UserLevel::PauseNew, "break")
        .await
        .unwrap();
    f.emergency.confirm_user_stop("u1", &prompt.token).await.unwrap();
    let err = f.gateway.fire(&account(), "sig-1", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::UserEmergencyStop);

    f.emergency
        .system()
        .trigger(
            TriggerKind::Manual,
            SystemLevel::Soft,
            &Actor::operator("ops"),
            "maintenance",
        )
        .await
        .unwrap();
    let err = f.gateway.fire(&account(), "sig-1", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::SystemEmergencyStop);

    assert!(f.backend.submitted().is_empty());
}

#[tokio::test]
async fn test_account_lock_during_checks_stops_the_fire() {
    let f = fixture().await;
    f.backend.hold_balance();

    let fire = {
        let gateway = f.gateway.clone();
        tokio::spawn(async move { gateway.fire(&account(), "sig-1", None).await })
    };
    f.backend.balance_entered().await;

    let prompt = f
        .emergency
        .request_user_stop("u1", UserLevel::AccountLock, "stepping away")
        .await
        .unwrap();
    f.emergency.confirm_user_stop("u1", &prompt.token).await.unwrap();
    f.backend.release_balance();

    let err = fire.await.unwrap().unwrap_err();
    assert_eq!(code(err), RejectCode::UserEmergencyStop);

    assert!(f.backend.submitted().is_empty());
    assert_eq!(f.gateway.monitors().active_for("u1"), 0);
    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(status.trades_today, 0);
}

#[tokio::test]
async fn test_system_stop_during_checks_stops_the_fire() {
    let f = fixture().await;
    f.backend.hold_balance();

    let fire = {
        let gateway = f.gateway.clone();
        tokio::spawn(async move { gateway.fire(&account(), "sig-1", None).await })
    };
    f.backend.balance_entered().await;

    f.emergency
        .system()
        .trigger(
            TriggerKind::Manual,
            SystemLevel::Soft,
            &Actor::operator("ops"),
            "maintenance",
        )
        .await
        .unwrap();
    f.backend.release_balance();

    let err = fire.await.unwrap().unwrap_err();
    assert_eq!(code(err), RejectCode::SystemEmergencyStop);

    assert!(f.backend.submitted().is_empty());
    assert_eq!(f.gateway.monitors().active_count(), 0);
    let status = f.risk.status(&account()).await.unwrap();
    assert_eq!(status.reserved_trades, 0);
    assert_eq!(f.stats.lock().await.fires_rejected, 1);
}

#[tokio::test]
async fn test_in_flight_fires_count_against_trade_limit() {
    let f = fixture().await;
    for _ in 0..5 {
        f.gateway.fire(&account(), "sig-1", None).await.unwrap();
    }

    let err = f.gateway.fire(&account(), "sig-1", None).await.unwrap_err();
    assert_eq!(code(err), RejectCode::DailyTradeLimit);
}

#[tokio::test]
async fn test_concurrent_fires_respect_trade_limit() {
    let f = fixture().await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let gateway = f.gateway.clone();
        handles.push(tokio::spawn(async move {
            gateway.fire(&account(), "sig-1", None).await
        }));
    }

    let mut admitted = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) if e.rejection().map(|r| r.code) == Some(RejectCode::DailyTradeLimit) => limited += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(limited, 15);
    assert_eq!(f.backend.submitted().len(), 5);
}

#[tokio::test]
async fn test_two_high_risk_losses_start_cooldown() {
    let f = fixture().await;

    for _ in 0..2 {
        let ack = f
            .gateway
            .fire(&account(), "sig-1", Some(RiskMode::HighRisk))
            .await
            .unwrap();
        assert!(f.backend.settle(&ack.request_id, true, dec!(-20)));
        f.idle().await;
    }

    assert_eq!(f.notifier.count(EventType::CooldownActivated), 1);
    assert_eq!(f.stats.lock().await.cooldowns_activated, 1);

    let err = f
        .gateway
        .fire(&account(), "sig-1", Some(RiskMode::HighRisk))
        .await
        .unwrap_err();
    assert_eq!(code(err), RejectCode::HighRiskBlockedInCooldown);

    let ack = f.gateway.fire(&account(), "sig-1", None).await.unwrap();
    assert_eq!(ack.risk.source, RiskSource::Cooldown);
    assert_eq!(ack.risk.percent, dec!(0.5));
}

#[tokio::test]
async fn test_signal_book_purges_expired() {
    let f = fixture().await;
    f.publish("sig-2").await;
    assert_eq!(f.signals.len().await, 2);

    f.clock.advance(chrono::Duration::minutes(16));
    assert_eq!(f.signals.purge_expired(f.clock.now()).await, 2);
    assert!(f.signals.get("sig-1").await.is_none());
}
