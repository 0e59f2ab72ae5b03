//! Core engine: the decision cycle and the daemon that schedules it.

pub mod controller;
pub mod runner;
pub mod scheduler;

pub use controller::{
    ConnectionStatus, ControllerSettings, CycleOutcome, LogLevel, LogLine, RuntimeController,
    RuntimeStatus, TRADE_HISTORY,
};
pub use runner::{CycleError, LiveDecisionRunner, Phase, RunnerConfig};
pub use scheduler::{next_fire, Clock, LocalClock, ScheduleTime};
