//! End-to-end runtime scenarios: the decision runner and the controller
//! state machine driven against the mock broker.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trendwarden::brokers::SimBrokerFactory;
use trendwarden::data::{DataSource, InMemoryDataSource};
use trendwarden::engine::{
    ControllerSettings, CycleOutcome, LiveDecisionRunner, Phase, RunnerConfig, RuntimeController,
};
use trendwarden::storage::{StateStore, DEFAULT_RETENTION};
use trendwarden::strategy::{PositionSizer, SignalConfig, SignalEngine};
use trendwarden::types::{EngineError, PriceSeries, SignalState};

use crate::mock_broker::MockBroker;

/// State directory removed on drop.
struct TempStore(StateStore);

impl TempStore {
    fn new() -> Self {
        let mut p = std::env::temp_dir();
        p.push(format!("trendwarden_it_{}", uuid::Uuid::new_v4()));
        Self(StateStore::new(p))
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.0.dir());
    }
}

/// 300 daily closes ending today, rising linearly from 100 to 200.
fn rising() -> PriceSeries {
    series(|i| 100.0 + 100.0 * i as f64 / 299.0)
}

fn flat() -> PriceSeries {
    series(|_| 200.0)
}

fn series(price: impl Fn(usize) -> f64) -> PriceSeries {
    let today = Utc::now().date_naive();
    let closes: Vec<_> = (0..300)
        .map(|i| (today - ChronoDuration::days(299 - i as i64), price(i)))
        .collect();
    PriceSeries::from_closes("QQQ", &closes)
}

fn runner() -> LiveDecisionRunner {
    LiveDecisionRunner::new(
        RunnerConfig::new("QQQ"),
        SignalEngine::new(SignalConfig::default()),
        PositionSizer::new(),
    )
}

fn controller(store: &StateStore, prices: PriceSeries) -> RuntimeController {
    let data: Arc<dyn DataSource> = Arc::new(InMemoryDataSource::with_series(prices));
    let factory = Arc::new(SimBrokerFactory::new(dec!(10000), Some(Arc::clone(&data))));
    RuntimeController::new(runner(), data, factory, store.clone(), ControllerSettings::default())
}

fn mock() -> Arc<MockBroker> {
    Arc::new(MockBroker::new("QQQ", dec!(10000), dec!(200)))
}

// ---------------------------------------------------------------------------
// Decision runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_second_run_has_zero_delta() {
    // 50 held @ 200 with 10000 cash sits exactly at the cash bound.
    let data = InMemoryDataSource::with_series(rising());
    let broker = MockBroker::new("QQQ", dec!(10000), dec!(200)).with_holding(dec!(50));
    let runner = runner();

    for _ in 0..2 {
        let result = runner.run_once(&broker, &data).await.unwrap();
        assert_eq!(result.signal_state, SignalState::Long);
        assert_eq!(result.target_qty, 50);
        assert_eq!(result.delta, 0);
        assert!(result.order.is_none());
    }
    assert!(broker.orders().is_empty());
}

#[tokio::test]
async fn test_negative_position_is_malformed() {
    let data = InMemoryDataSource::with_series(rising());
    let broker = MockBroker::new("QQQ", dec!(10000), dec!(200)).with_holding(dec!(-5));

    let err = runner().run_once(&broker, &data).await.unwrap_err();
    assert_eq!(err.phase, Phase::FetchAccount);
    assert!(matches!(err.source, EngineError::MalformedResponse { .. }));
    assert!(broker.orders().is_empty());
}

#[tokio::test]
async fn test_flat_signal_sells_existing_holding() {
    let data = InMemoryDataSource::with_series(flat());
    let broker = MockBroker::new("QQQ", dec!(0), dec!(200)).with_holding(dec!(10));

    let result = runner().run_once(&broker, &data).await.unwrap();
    assert_eq!(result.signal_state, SignalState::Flat);
    assert_eq!(result.target_qty, 0);
    assert_eq!(result.delta, -10);
    assert_eq!(broker.orders().len(), 1);
}

// ---------------------------------------------------------------------------
// Controller state machine
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_double_start_is_rejected() {
    let store = TempStore::new();
    let ctl = controller(&store.0, rising());
    ctl.attach_broker(mock()).await.unwrap();

    assert!(ctl.start().await.unwrap().is_completed());
    let err = ctl.start().await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert!(ctl.loop_running().await);

    assert!(ctl.stop().await);
}

#[tokio::test]
async fn test_concurrent_starts_exactly_one_wins() {
    let store = TempStore::new();
    let ctl = controller(&store.0, rising());
    let broker = mock();
    ctl.attach_broker(broker.clone()).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.start().await })
        })
        .collect();

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(matches!(e, EngineError::InvalidState(_))),
        }
    }
    assert_eq!(wins, 1);
    // Only the winning start ran a cycle.
    assert_eq!(broker.orders().len(), 1);

    ctl.stop().await;
}

#[tokio::test]
async fn test_stop_is_observed_within_a_second() {
    let store = TempStore::new();
    let ctl = controller(&store.0, rising());
    ctl.attach_broker(mock()).await.unwrap();
    ctl.start().await.unwrap();
    assert!(ctl.status().await.next_run_local.is_some() || ctl.loop_running().await);

    let started = Instant::now();
    assert!(ctl.stop().await);
    loop {
        let exited = ctl
            .logs(20)
            .await
            .iter()
            .any(|l| l.message == "Scheduler loop exited");
        if exited {
            break;
        }
        assert!(started.elapsed() < Duration::from_millis(1500), "loop did not exit");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = ctl.status().await;
    assert!(!status.engine_active);
    assert!(status.next_run_local.is_none());
    assert!(!store.0.load_engine_state("QQQ").engine_active);
}

#[tokio::test]
async fn test_in_flight_cycle_finishes_after_stop() {
    let store = TempStore::new();
    let ctl = controller(&store.0, rising());
    let broker = Arc::new(
        MockBroker::new("QQQ", dec!(10000), dec!(200)).with_latency(Duration::from_millis(400)),
    );
    ctl.attach_broker(broker.clone()).await.unwrap();
    ctl.start().await.unwrap();

    let in_flight = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.run_now().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(ctl.stop().await);
    assert!(started.elapsed() < Duration::from_millis(300));

    let outcome = in_flight.await.unwrap();
    assert!(outcome.is_completed(), "{}", outcome.message());
    assert!(!ctl.status().await.engine_active);
}

#[tokio::test]
async fn test_failed_cycle_keeps_engine_active() {
    let store = TempStore::new();
    let ctl = controller(&store.0, rising());
    let broker = mock();
    ctl.attach_broker(broker.clone()).await.unwrap();
    broker.set_error(EngineError::Connection("gateway down".into()));

    match ctl.start().await.unwrap() {
        CycleOutcome::Failed { phase, error } => {
            assert_eq!(phase, Phase::FetchAccount);
            assert!(error.contains("gateway down"));
        }
        other => panic!("unexpected outcome: {}", other.message()),
    }
    let status = ctl.status().await;
    assert!(status.engine_active);
    assert!(status.last_attempt.is_some());
    assert!(status.last_run_date.is_none());
    assert!(ctl.equity_curve().await.is_empty());

    broker.clear_error();
    assert!(ctl.run_now().await.is_completed());
    assert!(ctl.status().await.last_run_date.is_some());
    assert!(broker.account_calls() >= 3);

    ctl.stop().await;
}

#[tokio::test]
async fn test_same_day_equity_keeps_latest_value() {
    let store = TempStore::new();
    let ctl = controller(&store.0, flat());
    let broker = mock();
    ctl.attach_broker(broker.clone()).await.unwrap();

    assert!(ctl.run_now().await.is_completed());
    broker.set_cash(dec!(10500));
    assert!(ctl.run_now().await.is_completed());

    let curve = ctl.equity_curve().await;
    assert_eq!(curve.len(), 1);
    assert_eq!(curve[0].equity, dec!(10500));

    let persisted = store.0.load_equity_history(DEFAULT_RETENTION);
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted.last().unwrap().equity, dec!(10500));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let store = TempStore::new();
    {
        let ctl = controller(&store.0, rising());
        ctl.attach_broker(mock()).await.unwrap();
        assert!(ctl.start().await.unwrap().is_completed());
        ctl.stop().await;
    }

    let ctl = controller(&store.0, rising());
    let status = ctl.status().await;
    assert!(!status.engine_active);
    assert!(status.in_position);
    assert_eq!(status.last_run_date, Some(chrono::Local::now().date_naive()));
    assert!(status.last_target_weight > 0.9);
    assert_eq!(ctl.equity_curve().await.len(), 1);

    // Stopped cleanly, so there is nothing to resume.
    ctl.attach_broker(mock()).await.unwrap();
    assert!(ctl.resume().await.unwrap().is_none());
}

#[tokio::test]
async fn test_equity_metrics_in_status() {
    let store = TempStore::new();
    let ctl = controller(&store.0, flat());
    let broker = mock();
    ctl.attach_broker(broker.clone()).await.unwrap();
    ctl.run_now().await;

    // A single point has no return or drawdown yet.
    let status = ctl.status().await;
    assert!(status.live_return.is_none());
    assert!(status.max_drawdown.is_none());
    assert_eq!(status.account.map(|a| a.equity), Some(Decimal::from(10000)));
}
