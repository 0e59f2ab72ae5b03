//! Runtime controller.
//!
//! Owns the STOPPED/ACTIVE state machine, the broker connection, the
//! background scheduling loop and every operator-facing view. All shared
//! fields live in one `Shared` struct behind a single lock; readers get
//! cloned snapshots.
//!
//! Locks, always taken in this order when nested:
//! - `control`: the STOPPED→ACTIVE transition and the worker handle
//! - `cycle`: serializes decision cycles
//! - `shared`: state, history and views

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::runner::{LiveDecisionRunner, Phase};
use super::scheduler::{next_fire, wait_until, Clock, LocalClock, ScheduleTime};
use crate::brokers::{BrokerClient, BrokerConfig, BrokerFactory, BrokerMode};
use crate::data::DataSource;
use crate::storage::{EquityHistory, StateStore, DEFAULT_RETENTION};
use crate::types::{
    AccountSnapshot, Decision, DecisionResult, EngineError, EngineMode, EngineResult, EngineState,
    EquitySnapshot, Position, SignalState, TradeReceipt,
};

/// Lines kept in the in-memory operator log.
pub const LOG_CAPACITY: usize = 500;

/// Most recent broker fills kept for the trades view.
pub const TRADE_HISTORY: usize = 100;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub symbol: String,
    pub schedule: ScheduleTime,
    pub equity_retention: usize,
    /// Trip the kill switch once max drawdown is worse than this fraction.
    /// Zero disables it.
    pub kill_switch_drawdown: f64,
    /// Local wall clock used for scheduling and equity dates.
    pub clock: Arc<dyn Clock>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            symbol: "QQQ".to_string(),
            schedule: ScheduleTime::default(),
            equity_retention: DEFAULT_RETENTION,
            kill_switch_drawdown: 0.0,
            clock: Arc::new(LocalClock),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// What happened when a decision cycle was attempted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed { result: DecisionResult },
    Failed { phase: Phase, error: String },
    Skipped { reason: String },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }

    pub fn message(&self) -> String {
        match self {
            CycleOutcome::Completed { result } => result.message.clone(),
            CycleOutcome::Failed { phase, error } => format!("{phase} failed: {error}"),
            CycleOutcome::Skipped { reason } => reason.clone(),
        }
    }
}

/// Point-in-time view of the engine for operators.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub engine_mode: EngineMode,
    pub engine_active: bool,
    pub connection_status: ConnectionStatus,
    pub broker: Option<String>,
    pub broker_mode: BrokerMode,
    pub symbol: String,
    pub signal_state: Option<SignalState>,
    pub last_target_weight: f64,
    pub in_position: bool,
    pub last_run_date: Option<NaiveDate>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_run_local: Option<NaiveDateTime>,
    pub schedule: ScheduleTime,
    pub account: Option<AccountSnapshot>,
    pub live_return: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub kill_switch_triggered: bool,
    pub kill_switch_reason: String,
    pub last_decision: Option<Decision>,
}

struct Shared {
    state: EngineState,
    equity: EquityHistory,
    broker_config: BrokerConfig,
    broker: Option<Arc<dyn BrokerClient>>,
    account: Option<AccountSnapshot>,
    positions: Vec<Position>,
    trades: Vec<TradeReceipt>,
    schedule: ScheduleTime,
    logs: VecDeque<LogLine>,
}

impl Shared {
    fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(LogLine {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// Failed writes are logged; the in-memory state stays authoritative.
    fn persist_state(&mut self, store: &StateStore) {
        if let Err(e) = store.save_engine_state(&self.state) {
            self.push_log(LogLevel::Error, format!("Failed to save engine state: {e}"));
        }
    }

    fn persist_equity(&mut self, store: &StateStore) {
        if let Err(e) = store.save_equity_history(&self.equity) {
            self.push_log(LogLevel::Error, format!("Failed to save equity history: {e}"));
        }
    }
}

struct Worker {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    runner: LiveDecisionRunner,
    data: Arc<dyn DataSource>,
    factory: Arc<dyn BrokerFactory>,
    store: StateStore,
    settings: ControllerSettings,
    shared: RwLock<Shared>,
    control: Mutex<Option<Worker>>,
    cycle: Mutex<()>,
    /// Persisted state said ACTIVE at construction and `resume` has not run yet.
    resume_pending: AtomicBool,
}

/// Cloneable handle to the engine daemon.
#[derive(Clone)]
pub struct RuntimeController {
    inner: Arc<Inner>,
}

impl RuntimeController {
    /// Build a controller, restoring engine state, equity history and broker
    /// config from `store`. The engine always comes up STOPPED; see `resume`.
    pub fn new(
        runner: LiveDecisionRunner,
        data: Arc<dyn DataSource>,
        factory: Arc<dyn BrokerFactory>,
        store: StateStore,
        settings: ControllerSettings,
    ) -> Self {
        let mut state = store.load_engine_state(&settings.symbol);
        if !state.symbol.eq_ignore_ascii_case(&settings.symbol) {
            warn!(
                persisted = %state.symbol,
                configured = %settings.symbol,
                "Persisted state is for another symbol, switching"
            );
            state.symbol = settings.symbol.clone();
            state.in_position = false;
        }
        let resume_pending = state.engine_active;
        state.engine_active = false;
        state.next_run_local = None;

        let equity = store.load_equity_history(settings.equity_retention);
        let broker_config = store.load_broker_config();
        info!(
            symbol = %state.symbol,
            equity_points = equity.len(),
            broker_mode = %broker_config.mode,
            resume_pending,
            "Runtime controller initialised"
        );

        let shared = Shared {
            state,
            equity,
            broker_config,
            broker: None,
            account: None,
            positions: Vec::new(),
            trades: Vec::new(),
            schedule: settings.schedule,
            logs: VecDeque::with_capacity(LOG_CAPACITY),
        };

        Self {
            inner: Arc::new(Inner {
                runner,
                data,
                factory,
                store,
                settings,
                shared: RwLock::new(shared),
                control: Mutex::new(None),
                cycle: Mutex::new(()),
                resume_pending: AtomicBool::new(resume_pending),
            }),
        }
    }

    // -- Broker ----------------------------------------------------------

    pub async fn broker_config(&self) -> BrokerConfig {
        self.inner.shared.read().await.broker_config.clone()
    }

    /// Validate and persist new connection settings. Takes effect on the
    /// next `test_connection`.
    pub async fn save_broker_config(&self, config: BrokerConfig) -> EngineResult<()> {
        config.validate()?;
        let mut shared = self.inner.shared.write().await;
        shared.broker_config = config.clone();
        shared.push_log(
            LogLevel::Info,
            format!("Broker config saved: mode={} host={}:{}", config.mode, config.host, config.port),
        );
        if let Err(e) = self.inner.store.save_broker_config(&config) {
            shared.push_log(LogLevel::Error, format!("Failed to save broker config: {e}"));
            return Err(e);
        }
        Ok(())
    }

    /// Build a client from the saved config, connect, and adopt it as the
    /// engine's broker. On failure nothing changes.
    pub async fn test_connection(&self) -> EngineResult<AccountSnapshot> {
        let config = self.broker_config().await;
        match self.inner.factory.build(&config) {
            Ok(broker) => self.attach_broker(broker).await,
            Err(e) => {
                self.inner
                    .shared
                    .write()
                    .await
                    .push_log(LogLevel::Error, format!("Connection test failed: {e}"));
                Err(e)
            }
        }
    }

    /// Connect `broker`, pull its account, positions and trades, and adopt
    /// it as the engine's broker.
    pub async fn attach_broker(&self, broker: Arc<dyn BrokerClient>) -> EngineResult<AccountSnapshot> {
        let fetched = async {
            broker.connect().await?;
            let account = broker.get_account_info().await?;
            account.validate(broker.name())?;
            let positions = broker.get_positions().await?;
            let trades = broker.get_trades().await?;
            Ok::<_, EngineError>((account, positions, trades))
        }
        .await;

        let mut shared = self.inner.shared.write().await;
        match fetched {
            Ok((account, positions, trades)) => {
                shared.push_log(
                    LogLevel::Info,
                    format!("Connected to {} broker: {account}", broker.name()),
                );
                shared.account = Some(account.clone());
                shared.positions = positions;
                shared.trades = recent(trades, TRADE_HISTORY);
                shared.broker = Some(broker);
                Ok(account)
            }
            Err(e) => {
                shared.push_log(LogLevel::Error, format!("Connection test failed: {e}"));
                Err(e)
            }
        }
    }

    /// Close the broker session and drop the client. Returns `false` when
    /// no broker was attached.
    pub async fn disconnect(&self) -> bool {
        let broker = {
            let mut shared = self.inner.shared.write().await;
            let Some(broker) = shared.broker.take() else {
                return false;
            };
            shared.account = None;
            broker
        };
        let result = broker.disconnect().await;
        let mut shared = self.inner.shared.write().await;
        match result {
            Ok(()) => {
                let line = format!("Disconnected from {} broker", broker.name());
                shared.push_log(LogLevel::Info, line);
            }
            Err(e) => shared.push_log(LogLevel::Warn, format!("Broker disconnect failed: {e}")),
        }
        true
    }

    // -- State machine ---------------------------------------------------

    /// STOPPED → ACTIVE. Runs one decision cycle before returning, then
    /// hands over to the daily loop.
    pub async fn start(&self) -> EngineResult<CycleOutcome> {
        let mut control = self.inner.control.lock().await;
        if control.is_some() {
            return Err(EngineError::InvalidState("Engine is already active".into()));
        }

        {
            let mut shared = self.inner.shared.write().await;
            if shared.state.kill_switch_triggered {
                return Err(EngineError::InvalidState(format!(
                    "Kill switch triggered ({}); reset it before starting",
                    shared.state.kill_switch_reason
                )));
            }
            if shared.broker.is_none() {
                return Err(EngineError::Connection(
                    "No broker connection; run a connection test first".into(),
                ));
            }
            shared.state.engine_active = true;
            shared.push_log(LogLevel::Info, "Engine started");
            shared.persist_state(&self.inner.store);
        }
        self.inner.resume_pending.store(false, Ordering::SeqCst);

        let outcome = self.inner.run_cycle().await;

        let (cancel, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&self.inner).run_loop(rx));
        *control = Some(Worker { cancel, handle });

        Ok(outcome)
    }

    /// ACTIVE → STOPPED. Returns `false` when already stopped. An in-flight
    /// cycle finishes on its own; the loop exits within `POLL_INTERVAL`.
    pub async fn stop(&self) -> bool {
        let mut control = self.inner.control.lock().await;
        let Some(worker) = control.take() else {
            return false;
        };
        let _ = worker.cancel.send(true);

        let mut shared = self.inner.shared.write().await;
        shared.state.engine_active = false;
        shared.state.next_run_local = None;
        shared.push_log(LogLevel::Info, "Engine stopped");
        shared.persist_state(&self.inner.store);
        true
    }

    /// Restart the engine if it was ACTIVE when state was last persisted.
    /// A no-op (`Ok(None)`) otherwise. Without a broker the resume stays
    /// pending, so a later successful connection can still resume.
    pub async fn resume(&self) -> EngineResult<Option<CycleOutcome>> {
        if !self.inner.resume_pending.load(Ordering::SeqCst) {
            return Ok(None);
        }
        {
            let mut shared = self.inner.shared.write().await;
            if shared.broker.is_none() {
                shared.push_log(
                    LogLevel::Warn,
                    "Engine was active before shutdown but no broker is connected; staying stopped",
                );
                return Ok(None);
            }
            if !self.inner.resume_pending.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            shared.push_log(LogLevel::Info, "Resuming engine from persisted state");
        }
        self.start().await.map(Some)
    }

    /// Whether a persisted ACTIVE state is still waiting for `resume`.
    pub fn resume_pending(&self) -> bool {
        self.inner.resume_pending.load(Ordering::SeqCst)
    }

    /// Whether the background loop is running.
    pub async fn loop_running(&self) -> bool {
        self.inner
            .control
            .lock()
            .await
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Run one decision cycle now, outside the schedule. Serialized with
    /// the loop like any other cycle.
    pub async fn run_now(&self) -> CycleOutcome {
        self.inner.run_cycle().await
    }

    pub async fn set_schedule(&self, hour: u32, minute: u32) -> EngineResult<ScheduleTime> {
        let schedule = ScheduleTime::new(hour, minute)?;
        let mut shared = self.inner.shared.write().await;
        shared.schedule = schedule;
        shared.push_log(LogLevel::Info, format!("Daily decision time set to {schedule}"));
        Ok(schedule)
    }

    /// Clear a tripped kill switch. Returns `false` if it was not set.
    pub async fn reset_kill_switch(&self) -> bool {
        let mut shared = self.inner.shared.write().await;
        if !shared.state.kill_switch_triggered {
            return false;
        }
        shared.state.kill_switch_triggered = false;
        shared.state.kill_switch_reason.clear();
        shared.push_log(LogLevel::Warn, "Kill switch reset by operator");
        shared.persist_state(&self.inner.store);
        true
    }

    // -- Views -----------------------------------------------------------

    pub async fn status(&self) -> RuntimeStatus {
        let last_decision = self.inner.runner.last_decision();
        let shared = self.inner.shared.read().await;
        let state = &shared.state;
        RuntimeStatus {
            engine_mode: state.mode(),
            engine_active: state.engine_active,
            connection_status: if shared.broker.is_some() {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            },
            broker: shared.broker.as_ref().map(|b| b.name().to_string()),
            broker_mode: shared.broker_config.mode,
            symbol: state.symbol.clone(),
            signal_state: last_decision.as_ref().map(|d| d.signal_state),
            last_target_weight: state.last_target_weight,
            in_position: state.in_position,
            last_run_date: state.last_run_date,
            last_attempt: state.last_attempt,
            next_run_local: state.next_run_local,
            schedule: shared.schedule,
            account: shared.account.clone(),
            live_return: shared.equity.live_return(),
            max_drawdown: shared.equity.max_drawdown(),
            kill_switch_triggered: state.kill_switch_triggered,
            kill_switch_reason: state.kill_switch_reason.clone(),
            last_decision,
        }
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.inner.shared.read().await.positions.clone()
    }

    /// The latest `TRADE_HISTORY` fills, oldest first.
    pub async fn trades(&self) -> Vec<TradeReceipt> {
        self.inner.shared.read().await.trades.clone()
    }

    pub async fn equity_curve(&self) -> Vec<EquitySnapshot> {
        self.inner.shared.read().await.equity.points().to_vec()
    }

    /// Most recent `limit` log lines, oldest first.
    pub async fn logs(&self, limit: usize) -> Vec<LogLine> {
        let shared = self.inner.shared.read().await;
        let skip = shared.logs.len().saturating_sub(limit);
        shared.logs.iter().skip(skip).cloned().collect()
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.inner.runner.last_decision()
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        info!("Scheduler loop started");
        loop {
            let target = {
                let mut shared = self.shared.write().await;
                if *cancel.borrow() {
                    break;
                }
                let next = next_fire(self.settings.clock.now(), shared.schedule);
                shared.state.next_run_local = Some(next);
                shared.push_log(LogLevel::Info, format!("Next decision at {next}"));
                shared.persist_state(&self.store);
                next
            };

            if !wait_until(target, self.settings.clock.as_ref(), &mut cancel).await {
                break;
            }
            if *cancel.borrow() {
                break;
            }

            let outcome = self.run_cycle().await;
            debug!(completed = outcome.is_completed(), "Scheduled cycle finished");
        }
        self.shared
            .write()
            .await
            .push_log(LogLevel::Info, "Scheduler loop exited");
    }

    /// One guarded decision cycle. Never propagates a failure.
    async fn run_cycle(&self) -> CycleOutcome {
        let _cycle = self.cycle.lock().await;

        let broker = {
            let mut shared = self.shared.write().await;
            if shared.state.kill_switch_triggered {
                let reason = format!(
                    "Kill switch triggered ({}); cycle skipped",
                    shared.state.kill_switch_reason
                );
                shared.push_log(LogLevel::Warn, reason.clone());
                return CycleOutcome::Skipped { reason };
            }
            match shared.broker.clone() {
                Some(broker) => broker,
                None => {
                    let reason = "No broker connection; cycle skipped".to_string();
                    shared.push_log(LogLevel::Warn, reason.clone());
                    return CycleOutcome::Skipped { reason };
                }
            }
        };

        let attempt = Utc::now();
        match self.runner.run_once(broker.as_ref(), self.data.as_ref()).await {
            Ok(result) => {
                self.record_success(broker.as_ref(), &result, attempt).await;
                CycleOutcome::Completed { result }
            }
            Err(e) => {
                let mut shared = self.shared.write().await;
                shared.state.last_attempt = Some(attempt);
                shared.push_log(LogLevel::Error, format!("Decision cycle failed: {e}"));
                shared.persist_state(&self.store);
                CycleOutcome::Failed {
                    phase: e.phase,
                    error: e.source.to_string(),
                }
            }
        }
    }

    async fn record_success(&self, broker: &dyn BrokerClient, result: &DecisionResult, attempt: DateTime<Utc>) {
        let account = broker.get_account_info().await;
        let positions = broker.get_positions().await;
        let trades = broker.get_trades().await;

        let mut shared = self.shared.write().await;
        let equity = match account {
            Ok(account) => {
                let equity = account.equity;
                shared.account = Some(account);
                equity
            }
            Err(e) => {
                shared.push_log(LogLevel::Warn, format!("Account refresh failed: {e}"));
                result.equity
            }
        };
        match positions {
            Ok(positions) => shared.positions = positions,
            Err(e) => shared.push_log(LogLevel::Warn, format!("Position refresh failed: {e}")),
        }
        match trades {
            Ok(trades) => shared.trades = recent(trades, TRADE_HISTORY),
            Err(e) => shared.push_log(LogLevel::Warn, format!("Trade refresh failed: {e}")),
        }

        let today = self.settings.clock.now().date();
        shared.state.last_run_date = Some(today);
        shared.state.last_attempt = Some(attempt);
        shared.state.in_position = result.target_qty > 0;
        shared.state.last_target_weight = result.target_weight;
        shared.equity.upsert(
            EquitySnapshot {
                timestamp: Utc::now(),
                date: today,
                equity,
            },
            self.settings.equity_retention,
        );
        shared.push_log(LogLevel::Info, format!("Decision: {result}"));

        self.check_kill_switch(&mut shared);
        shared.persist_state(&self.store);
        shared.persist_equity(&self.store);
    }

    fn check_kill_switch(&self, shared: &mut Shared) {
        let limit = self.settings.kill_switch_drawdown;
        if limit <= 0.0 || shared.state.kill_switch_triggered {
            return;
        }
        if let Some(drawdown) = shared.equity.max_drawdown() {
            if drawdown < -limit {
                let reason = format!(
                    "max drawdown {:.2}% breached limit {:.2}%",
                    drawdown * 100.0,
                    limit * 100.0
                );
                shared.state.kill_switch_triggered = true;
                shared.state.kill_switch_reason = reason.clone();
                shared.push_log(LogLevel::Error, format!("Kill switch tripped: {reason}"));
            }
        }
    }
}

/// The last `keep` items, oldest first.
fn recent<T>(mut items: Vec<T>, keep: usize) -> Vec<T> {
    let excess = items.len().saturating_sub(keep);
    items.drain(..excess);
    items
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
