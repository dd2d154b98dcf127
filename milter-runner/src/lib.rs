//! Concurrency core of the milter server: drives one MTA connection's event
//! stream through a set of independently-running filters and folds their
//! answers into a single verdict per event.

mod config;
mod connection;
mod session;
mod task;
mod task_runner;

pub use config::RunnerCfg;
pub use connection::{ConnectionRunner, RunnerError};
pub use task_runner::{Dispatch, TaskRunner};
