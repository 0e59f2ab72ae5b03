//! Control-surface route handlers.
//!
//! Views return JSON snapshots from the `RuntimeController`. Control
//! endpoints answer `{ok, message, ...}`: domain failures are `ok=false`
//! with 200, malformed requests are `ok=false` with 400.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::brokers::BrokerConfig;
use crate::engine::{CycleOutcome, LogLine, RuntimeController, RuntimeStatus};
use crate::types::{AccountSnapshot, EngineError, EquitySnapshot, Position, TradeReceipt};

pub type AppState = RuntimeController;

const DEFAULT_LOG_LINES: usize = 200;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<CycleOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RuntimeStatus>,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            account: None,
            cycle: None,
            status: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            ..Self::ok(message)
        }
    }
}

type ActionReply = (StatusCode, Json<ActionResponse>);

fn reply(response: ActionResponse) -> ActionReply {
    (StatusCode::OK, Json(response))
}

fn bad_request(message: impl Into<String>) -> ActionReply {
    (StatusCode::BAD_REQUEST, Json(ActionResponse::fail(message)))
}

/// Configuration errors come from caller input; everything else is a
/// domain failure.
fn from_error(e: EngineError) -> ActionReply {
    match e {
        EngineError::Configuration(_) => bad_request(e.to_string()),
        other => reply(ActionResponse::fail(other.to_string())),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EquityResponse {
    pub points: Vec<EquitySnapshot>,
    pub live_return: Option<f64>,
    pub max_drawdown: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub hour: u32,
    pub minute: u32,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/status
pub async fn get_status(State(ctl): State<AppState>) -> Json<RuntimeStatus> {
    Json(ctl.status().await)
}

/// GET /api/equity
pub async fn get_equity(State(ctl): State<AppState>) -> Json<EquityResponse> {
    let status = ctl.status().await;
    Json(EquityResponse {
        points: ctl.equity_curve().await,
        live_return: status.live_return,
        max_drawdown: status.max_drawdown,
    })
}

/// GET /api/logs?limit=N
pub async fn get_logs(State(ctl): State<AppState>, Query(q): Query<LogsQuery>) -> Json<Vec<LogLine>> {
    Json(ctl.logs(q.limit.unwrap_or(DEFAULT_LOG_LINES)).await)
}

/// GET /api/positions
pub async fn get_positions(State(ctl): State<AppState>) -> Json<Vec<Position>> {
    Json(ctl.positions().await)
}

/// GET /api/trades
pub async fn get_trades(State(ctl): State<AppState>) -> Json<Vec<TradeReceipt>> {
    Json(ctl.trades().await)
}

/// GET /api/broker-config
pub async fn get_broker_config(State(ctl): State<AppState>) -> Json<BrokerConfig> {
    Json(ctl.broker_config().await)
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// POST /api/broker-config
pub async fn post_broker_config(
    State(ctl): State<AppState>,
    body: Result<Json<BrokerConfig>, JsonRejection>,
) -> ActionReply {
    let Json(config) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(format!("Invalid broker config: {rejection}")),
    };
    let mode = config.mode;
    match ctl.save_broker_config(config).await {
        Ok(()) => reply(ActionResponse::ok(format!("Broker config saved (mode {mode})"))),
        Err(e) => from_error(e),
    }
}

/// POST /api/test-connection
pub async fn post_test_connection(State(ctl): State<AppState>) -> ActionReply {
    match ctl.test_connection().await {
        Ok(account) => reply(ActionResponse {
            account: Some(account),
            ..ActionResponse::ok("Connected")
        }),
        Err(EngineError::Configuration(msg)) => reply(ActionResponse::fail(format!("Configuration error: {msg}"))),
        Err(e) => from_error(e),
    }
}

/// POST /api/engine/start
pub async fn post_engine_start(State(ctl): State<AppState>) -> ActionReply {
    match ctl.start().await {
        Ok(outcome) => reply(ActionResponse {
            cycle: Some(outcome.clone()),
            status: Some(ctl.status().await),
            ..ActionResponse::ok(format!("Engine started. {}", outcome.message()))
        }),
        Err(e) => reply(ActionResponse::fail(e.to_string())),
    }
}

/// POST /api/engine/stop
pub async fn post_engine_stop(State(ctl): State<AppState>) -> ActionReply {
    let message = if ctl.stop().await {
        "Engine stopped"
    } else {
        "Engine already stopped"
    };
    reply(ActionResponse {
        status: Some(ctl.status().await),
        ..ActionResponse::ok(message)
    })
}

/// POST /api/scheduler
pub async fn post_scheduler(
    State(ctl): State<AppState>,
    body: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ActionReply {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(format!("Invalid schedule: {rejection}")),
    };
    match ctl.set_schedule(req.hour, req.minute).await {
        Ok(at) => reply(ActionResponse::ok(format!("Daily decision time set to {at}"))),
        Err(e) => from_error(e),
    }
}

/// POST /api/kill-switch/reset
pub async fn post_reset_kill_switch(State(ctl): State<AppState>) -> ActionReply {
    if ctl.reset_kill_switch().await {
        reply(ActionResponse::ok("Kill switch reset"))
    } else {
        reply(ActionResponse::ok("Kill switch was not triggered"))
    }
}
